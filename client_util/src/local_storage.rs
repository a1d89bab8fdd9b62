// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::de::DeserializeOwned;
use serde::Serialize;
use wasm_bindgen::JsValue;
use web_sys::{window, Storage};

/// For interacting with the web local storage API.
pub struct LocalStorage {
    inner: Option<Storage>,
}

/// Errors that can occur with local storage.
pub enum Error {
    /// Javascript error.
    Js(JsValue),
    /// Serialization error.
    Serde(serde_json::Error),
    /// Local storage API is not available.
    Nonexistent,
}

impl LocalStorage {
    /// If the local storage API is unavailable, future calls return
    /// `Err(Error::Nonexistent)`.
    pub fn new() -> Self {
        Self {
            inner: window().and_then(|w| w.local_storage().ok()).flatten(),
        }
    }

    /// Gets a key, returning `None` if it doesn't exist or any error occurs.
    pub fn get<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
        self.try_get(key).ok().flatten()
    }

    /// Gets a key, returning `Ok(None)` if it doesn't exist.
    pub fn try_get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>, Error> {
        let inner = self.inner.as_ref().ok_or(Error::Nonexistent)?;

        let value: Option<String> = inner.get(key).map_err(Error::Js)?;

        match value {
            Some(value) => serde_json::from_str(&value).map_err(Error::Serde),
            None => Ok(None),
        }
    }

    /// Sets a key to a value; `None` deletes the key.
    pub fn set<V: Serialize>(&mut self, key: &str, value: Option<V>) -> Result<(), Error> {
        let inner = self.inner.as_ref().ok_or(Error::Nonexistent)?;

        match value {
            Some(ref value) => inner
                .set(key, &serde_json::to_string(value).map_err(Error::Serde)?)
                .map_err(Error::Js),
            None => inner.delete(key).map_err(Error::Js),
        }
    }
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self::new()
    }
}
