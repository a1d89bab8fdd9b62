// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persisted session credentials so a refreshed or crashed tab can recover
//! its exact place in a live quiz.

use crate::local_storage::LocalStorage;
use core_protocol::id::{ParticipantId, QuestionId, SessionId, SessionToken};
use core_protocol::name::Nickname;
use core_protocol::UnixTime;
use serde::{Deserialize, Serialize};

const SESSION_KEY: &str = "quiz_session";
const LAST_QUESTION_KEY: &str = "quiz_last_question";

/// Entries older than this are treated as expired and cleared at startup.
pub const SESSION_BLOB_TTL_MS: u64 = 5 * 60 * 1000;

/// The credential blob. `timestamp` is refreshed on every save.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub session_token: SessionToken,
    pub nickname: Nickname,
    pub timestamp: UnixTime,
}

impl StoredSession {
    pub fn is_expired(&self, now: UnixTime) -> bool {
        now.saturating_sub(self.timestamp) > SESSION_BLOB_TTL_MS
    }
}

/// Two keys in durable browser storage: the session blob and the last
/// question the UI reached.
pub struct SessionStorage {
    storage: LocalStorage,
}

impl SessionStorage {
    pub fn new() -> Self {
        Self {
            storage: LocalStorage::new(),
        }
    }

    /// Loads stored credentials, clearing and returning `None` if expired.
    pub fn load(&mut self, now: UnixTime) -> Option<StoredSession> {
        let stored: StoredSession = self.storage.get(SESSION_KEY)?;
        if stored.is_expired(now) {
            self.clear();
            return None;
        }
        Some(stored)
    }

    pub fn save(&mut self, mut stored: StoredSession, now: UnixTime) {
        stored.timestamp = now;
        let _ = self.storage.set(SESSION_KEY, Some(stored));
    }

    /// Forgets everything, e.g. after a kick, ban, or expiry.
    pub fn clear(&mut self) {
        let _ = self.storage.set::<StoredSession>(SESSION_KEY, None);
        let _ = self.storage.set::<QuestionId>(LAST_QUESTION_KEY, None);
    }

    /// Updated whenever the UI transitions to a new question.
    pub fn set_last_known_question(&mut self, question_id: QuestionId) {
        let _ = self.storage.set(LAST_QUESTION_KEY, Some(question_id));
    }

    pub fn last_known_question(&self) -> Option<QuestionId> {
        self.storage.get(LAST_QUESTION_KEY)
    }
}

impl Default for SessionStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use crate::session_storage::{StoredSession, SESSION_BLOB_TTL_MS};
    use core_protocol::id::{ParticipantId, SessionId, SessionToken};
    use core_protocol::name::Nickname;
    use std::num::NonZeroU64;

    #[test]
    fn expiry_window() {
        let stored = StoredSession {
            session_id: SessionId(NonZeroU64::new(1).unwrap()),
            participant_id: ParticipantId(NonZeroU64::new(2).unwrap()),
            session_token: SessionToken(NonZeroU64::new(3).unwrap()),
            nickname: Nickname::new("quizzer").unwrap(),
            timestamp: 1_000_000,
        };
        assert!(!stored.is_expired(1_000_000));
        assert!(!stored.is_expired(1_000_000 + SESSION_BLOB_TTL_MS));
        assert!(stored.is_expired(1_000_000 + SESSION_BLOB_TTL_MS + 1));
        // Clock skew backwards never expires.
        assert!(!stored.is_expired(0));
    }
}
