// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! All Redis key constructors in one place, so the keyspace is auditable.
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `session:{id}` | hash | session record fields |
//! | `session:{id}:owner` | string | owner lease (`SET NX PX`) |
//! | `session:{id}:participants` | hash | participant id → nickname |
//! | `session:{id}:nicknames` | hash | canonical nickname → participant id |
//! | `session:{id}:leaderboard` | zset | participant id scored by leaderboard score |
//! | `session:{id}:answers:{qid}` | hash | participant id → answer id (at-most-once claims) |
//! | `session:{id}:answer_log` | hash | answer id → answer record json (idempotent log) |
//! | `participant:{pid}:session` | hash | participant record fields |
//! | `scoring:{sid}:{qid}:buffer` | list | answer ids awaiting (re)scoring |
//! | `sessions:live` | set | ids of sessions not yet ENDED+evicted |
//! | `joincode:{code}` | string | session id owning a live join code |

use core_protocol::id::{JoinCode, ParticipantId, QuestionId, SessionId};

pub fn session_key(sid: SessionId) -> String {
    format!("session:{}", sid.0)
}

pub fn session_owner_key(sid: SessionId) -> String {
    format!("session:{}:owner", sid.0)
}

pub fn participants_key(sid: SessionId) -> String {
    format!("session:{}:participants", sid.0)
}

pub fn nicknames_key(sid: SessionId) -> String {
    format!("session:{}:nicknames", sid.0)
}

pub fn leaderboard_key(sid: SessionId) -> String {
    format!("session:{}:leaderboard", sid.0)
}

pub fn answer_claims_key(sid: SessionId, qid: QuestionId) -> String {
    format!("session:{}:answers:{}", sid.0, qid.0)
}

pub fn answer_log_key(sid: SessionId) -> String {
    format!("session:{}:answer_log", sid.0)
}

pub fn participant_key(pid: ParticipantId) -> String {
    format!("participant:{}:session", pid.0)
}

pub fn scoring_buffer_key(sid: SessionId, qid: QuestionId) -> String {
    format!("scoring:{}:{}:buffer", sid.0, qid.0)
}

pub fn live_sessions_key() -> String {
    "sessions:live".to_owned()
}

pub fn join_code_key(code: JoinCode) -> String {
    format!("joincode:{}", code)
}
