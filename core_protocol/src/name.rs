// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};

/// A participant's display name within one session.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Nickname(ArrayString<24>);

/// Why a nickname was refused.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NicknameError {
    Empty,
    TooLong,
    InvalidCharacter,
    Inappropriate,
}

impl NicknameError {
    pub fn message(self) -> &'static str {
        match self {
            Self::Empty => "nickname is empty",
            Self::TooLong => "nickname is too long",
            Self::InvalidCharacter => "nickname may only contain letters, digits, and spaces",
            Self::Inappropriate => "nickname is not allowed",
        }
    }
}

impl Nickname {
    pub const MAX_VISIBLE: usize = 24;

    /// Validates raw user input: 1-24 visible characters, alphanumerics and
    /// single spaces. On the server, also runs the profanity filter.
    pub fn new(raw: &str) -> Result<Self, NicknameError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(NicknameError::Empty);
        }

        let mut string = ArrayString::<{ Self::MAX_VISIBLE }>::new();
        let mut last_space = false;
        for c in trimmed.chars() {
            if c == ' ' {
                // Collapse runs of whitespace.
                if last_space {
                    continue;
                }
                last_space = true;
            } else if c.is_ascii_alphanumeric() {
                last_space = false;
            } else {
                return Err(NicknameError::InvalidCharacter);
            }
            if string.try_push(c).is_err() {
                return Err(NicknameError::TooLong);
            }
        }

        #[cfg(feature = "server")]
        if rustrict::CensorStr::is(string.as_str(), rustrict::Type::INAPPROPRIATE) {
            return Err(NicknameError::Inappropriate);
        }

        Ok(Self(string))
    }

    /// Form used for case-insensitive uniqueness within a session.
    pub fn canonical(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Nickname {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod test {
    use crate::name::{Nickname, NicknameError};

    #[test]
    fn nickname() {
        assert_eq!(Nickname::new("Quiz Master 3").unwrap().as_str(), "Quiz Master 3");
        assert_eq!(Nickname::new("  spaced   out  ").unwrap().as_str(), "spaced out");
        assert_eq!(Nickname::new(""), Err(NicknameError::Empty));
        assert_eq!(Nickname::new("   "), Err(NicknameError::Empty));
        assert_eq!(Nickname::new("semi;colon"), Err(NicknameError::InvalidCharacter));
        assert_eq!(
            Nickname::new("abcdefghijklmnopqrstuvwxyz"),
            Err(NicknameError::TooLong)
        );
    }

    #[test]
    fn canonical_is_case_insensitive() {
        let a = Nickname::new("Alice").unwrap();
        let b = Nickname::new("aLiCe").unwrap();
        assert_eq!(a.canonical(), b.canonical());
        assert_ne!(a.as_str(), b.as_str());
    }
}
