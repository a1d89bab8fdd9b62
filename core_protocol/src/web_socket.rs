// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};

/// Possible websocket wire formats.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebSocketProtocol {
    /// Serde bincode.
    Binary,
    /// Serde json.
    Json,
}

impl Default for WebSocketProtocol {
    fn default() -> Self {
        Self::Json
    }
}
