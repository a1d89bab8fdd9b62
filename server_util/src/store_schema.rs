// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Records persisted by the session store. Session and participant records
//! live in Redis hashes (field-level writes must be atomic); answer records
//! are written whole and stored as json.

use core_protocol::dto::SessionState;
use core_protocol::id::{
    AnswerId, JoinCode, OptionId, ParticipantId, QuestionId, QuizId, SessionId, SessionToken,
};
use core_protocol::name::Nickname;
use core_protocol::UnixTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::{NonZeroU32, NonZeroU64};

#[derive(Clone, Debug, PartialEq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub quiz_id: QuizId,
    pub join_code: JoinCode,
    pub state: SessionState,
    /// -1 in the lobby; never decreases afterwards.
    pub current_question_index: i32,
    /// Set iff `state == ACTIVE_QUESTION` (or paused within one).
    pub question_started_at: Option<UnixTime>,
    /// Set while the current question's timer is paused.
    pub paused_remaining_ms: Option<u64>,
    pub created_at: UnixTime,
    pub ended_at: Option<UnixTime>,
    pub host_token: SessionToken,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParticipantRecord {
    pub participant_id: ParticipantId,
    pub session_id: SessionId,
    pub nickname: Nickname,
    pub session_token: SessionToken,
    pub is_active: bool,
    pub is_eliminated: bool,
    pub is_spectator: bool,
    pub is_banned: bool,
    pub total_score: u64,
    pub total_time_ms: u64,
    pub streak_count: u32,
    pub last_question_score: i64,
    /// Next answer id to mint; monotonic per participant.
    pub answer_seq: u64,
    pub joined_at: UnixTime,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub answer_id: AnswerId,
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub question_id: QuestionId,
    pub selected_option_ids: Vec<OptionId>,
    /// Server-assigned.
    pub submitted_at: UnixTime,
    /// Clamped to `[0, time_limit * 1000]`.
    pub response_time_ms: u64,
    /// The remaining fields are written by the scoring worker.
    pub scored: bool,
    pub is_correct: bool,
    pub points_awarded: i64,
    pub speed_bonus_applied: bool,
    pub streak_bonus_applied: bool,
    pub partial_credit_applied: bool,
}

fn parse_u64(map: &HashMap<String, String>, field: &str) -> Option<u64> {
    map.get(field)?.parse().ok()
}

fn parse_nonzero_u64(map: &HashMap<String, String>, field: &str) -> Option<NonZeroU64> {
    NonZeroU64::new(parse_u64(map, field)?)
}

fn parse_bool(map: &HashMap<String, String>, field: &str) -> Option<bool> {
    Some(map.get(field)? == "1")
}

/// Empty string encodes `None`, so overwrites clear stale values.
fn parse_opt_u64(map: &HashMap<String, String>, field: &str) -> Option<Option<u64>> {
    match map.get(field) {
        None => Some(None),
        Some(s) if s.is_empty() => Some(None),
        Some(s) => s.parse().ok().map(Some),
    }
}

fn encode_opt(value: Option<u64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn encode_bool(value: bool) -> String {
    if value { "1" } else { "0" }.to_owned()
}

impl SessionRecord {
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("session_id", self.session_id.0.to_string()),
            ("quiz_id", self.quiz_id.0.to_string()),
            ("join_code", self.join_code.as_str().to_owned()),
            ("state", self.state.as_str().to_owned()),
            (
                "current_question_index",
                self.current_question_index.to_string(),
            ),
            ("question_started_at", encode_opt(self.question_started_at)),
            ("paused_remaining_ms", encode_opt(self.paused_remaining_ms)),
            ("created_at", self.created_at.to_string()),
            ("ended_at", encode_opt(self.ended_at)),
            ("host_token", self.host_token.0.to_string()),
        ]
    }

    pub fn from_map(map: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            session_id: SessionId(parse_nonzero_u64(map, "session_id")?),
            quiz_id: QuizId(parse_nonzero_u64(map, "quiz_id")?),
            join_code: JoinCode::new(map.get("join_code")?)?,
            state: SessionState::parse(map.get("state")?)?,
            current_question_index: map.get("current_question_index")?.parse().ok()?,
            question_started_at: parse_opt_u64(map, "question_started_at")?,
            paused_remaining_ms: parse_opt_u64(map, "paused_remaining_ms")?,
            created_at: parse_u64(map, "created_at")?,
            ended_at: parse_opt_u64(map, "ended_at")?,
            host_token: SessionToken(parse_nonzero_u64(map, "host_token")?),
        })
    }
}

impl ParticipantRecord {
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("participant_id", self.participant_id.0.to_string()),
            ("session_id", self.session_id.0.to_string()),
            ("nickname", self.nickname.as_str().to_owned()),
            ("session_token", self.session_token.0.to_string()),
            ("is_active", encode_bool(self.is_active)),
            ("is_eliminated", encode_bool(self.is_eliminated)),
            ("is_spectator", encode_bool(self.is_spectator)),
            ("is_banned", encode_bool(self.is_banned)),
            ("total_score", self.total_score.to_string()),
            ("total_time_ms", self.total_time_ms.to_string()),
            ("streak_count", self.streak_count.to_string()),
            ("last_question_score", self.last_question_score.to_string()),
            ("answer_seq", self.answer_seq.to_string()),
            ("joined_at", self.joined_at.to_string()),
        ]
    }

    pub fn from_map(map: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            participant_id: ParticipantId(parse_nonzero_u64(map, "participant_id")?),
            session_id: SessionId(parse_nonzero_u64(map, "session_id")?),
            nickname: Nickname::new(map.get("nickname")?).ok()?,
            session_token: SessionToken(parse_nonzero_u64(map, "session_token")?),
            is_active: parse_bool(map, "is_active")?,
            is_eliminated: parse_bool(map, "is_eliminated")?,
            is_spectator: parse_bool(map, "is_spectator")?,
            is_banned: parse_bool(map, "is_banned")?,
            total_score: parse_u64(map, "total_score")?,
            total_time_ms: parse_u64(map, "total_time_ms")?,
            streak_count: parse_u64(map, "streak_count")? as u32,
            last_question_score: map.get("last_question_score")?.parse().ok()?,
            answer_seq: parse_u64(map, "answer_seq")?,
            joined_at: parse_u64(map, "joined_at")?,
        })
    }
}

impl AnswerRecord {
    pub fn answer_id_u64(&self) -> u64 {
        self.answer_id.0.get()
    }
}

/// Helper for parsing ids read back from Redis members.
pub fn parse_participant_id(raw: &str) -> Option<ParticipantId> {
    raw.parse::<u64>().ok().and_then(NonZeroU64::new).map(ParticipantId)
}

pub fn parse_answer_id(raw: &str) -> Option<AnswerId> {
    raw.parse::<u64>().ok().and_then(NonZeroU64::new).map(AnswerId)
}

pub fn parse_question_id(raw: &str) -> Option<QuestionId> {
    raw.parse::<u32>().ok().and_then(NonZeroU32::new).map(QuestionId)
}

#[cfg(test)]
mod test {
    use crate::store_schema::{ParticipantRecord, SessionRecord};
    use core_protocol::dto::SessionState;
    use core_protocol::id::{JoinCode, ParticipantId, QuizId, SessionId, SessionToken};
    use core_protocol::name::Nickname;
    use std::collections::HashMap;
    use std::num::NonZeroU64;

    fn to_map(pairs: Vec<(&'static str, String)>) -> HashMap<String, String> {
        pairs.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
    }

    #[test]
    fn session_round_trip() {
        let record = SessionRecord {
            session_id: SessionId(NonZeroU64::new(7).unwrap()),
            quiz_id: QuizId(NonZeroU64::new(9).unwrap()),
            join_code: JoinCode::new("AB12CD").unwrap(),
            state: SessionState::ActiveQuestion,
            current_question_index: 3,
            question_started_at: Some(1_700_000_000_000),
            paused_remaining_ms: None,
            created_at: 1_699_999_000_000,
            ended_at: None,
            host_token: SessionToken(NonZeroU64::new(42).unwrap()),
        };
        let map = to_map(record.to_pairs());
        assert_eq!(SessionRecord::from_map(&map).unwrap(), record);
    }

    #[test]
    fn participant_round_trip() {
        let record = ParticipantRecord {
            participant_id: ParticipantId(NonZeroU64::new(5).unwrap()),
            session_id: SessionId(NonZeroU64::new(7).unwrap()),
            nickname: Nickname::new("Quizzer").unwrap(),
            session_token: SessionToken(NonZeroU64::new(99).unwrap()),
            is_active: true,
            is_eliminated: false,
            is_spectator: false,
            is_banned: false,
            total_score: 1234,
            total_time_ms: 56_000,
            streak_count: 3,
            last_question_score: -25,
            answer_seq: 4,
            joined_at: 1_700_000_000_000,
        };
        let map = to_map(record.to_pairs());
        assert_eq!(ParticipantRecord::from_map(&map).unwrap(), record);
    }
}
