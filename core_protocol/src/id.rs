// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use arrayvec::ArrayString;
use rand::distributions::{Distribution, Standard};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::num::{NonZeroU32, NonZeroU64};
use std::str::FromStr;

#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct QuizId(pub NonZeroU64);

#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct SessionId(pub NonZeroU64);

#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub NonZeroU64);

#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct QuestionId(pub NonZeroU32);

#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct OptionId(pub NonZeroU32);

/// Monotonic per participant, assigned by the answer pipeline.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct AnswerId(pub NonZeroU64);

/// Opaque bearer credential, bound to one participant. Not a [`ParticipantId`];
/// knowing a participant's id must not allow acting as them.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SessionToken(pub NonZeroU64);

impl Distribution<SessionToken> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> SessionToken {
        SessionToken(NonZeroU64::new(rng.gen::<u64>().max(1)).unwrap())
    }
}

/// What a websocket is allowed to do.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Participant,
    Controller,
    Bigscreen,
}

impl Role {
    /// Read-only roles receive broadcasts but never submit answers.
    pub fn is_observer(self) -> bool {
        matches!(self, Self::Bigscreen)
    }
}

/// 6 uppercase alphanumerics, human-typable, unique among live sessions.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JoinCode(ArrayString<6>);

impl JoinCode {
    pub const LEN: usize = 6;
    const ALPHABET: &'static [u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

    /// Parses user input, tolerating lowercase. Returns `None` unless the
    /// result is exactly 6 of `[A-Z0-9]`.
    pub fn new(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.chars().count() != Self::LEN {
            return None;
        }
        let mut code = ArrayString::new();
        for c in raw.chars() {
            let c = c.to_ascii_uppercase();
            if !c.is_ascii_alphanumeric() {
                return None;
            }
            code.push(c);
        }
        Some(Self(code))
    }

    /// Uniformly random code. The caller is responsible for uniqueness among
    /// live sessions.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut code = ArrayString::new();
        for _ in 0..Self::LEN {
            code.push(Self::ALPHABET[rng.gen_range(0..Self::ALPHABET.len())] as char);
        }
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JoinCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JoinCode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s).ok_or("invalid join code")
    }
}

#[cfg(test)]
mod test {
    use crate::id::JoinCode;

    #[test]
    fn join_code() {
        assert_eq!(JoinCode::new("abc123").unwrap().as_str(), "ABC123");
        assert_eq!(JoinCode::new(" QX9PLM ").unwrap().as_str(), "QX9PLM");
        assert!(JoinCode::new("AB12").is_none());
        assert!(JoinCode::new("AB123!").is_none());
        assert!(JoinCode::new("ABC1234").is_none());
    }

    #[test]
    fn join_code_generate() {
        for _ in 0..100 {
            let code = JoinCode::generate();
            assert_eq!(code.as_str().len(), JoinCode::LEN);
            assert!(code
                .as_str()
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }
}
