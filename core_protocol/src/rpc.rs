// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::dto::{
    AnswerAcceptedDto, AnswerStatsDto, LeaderboardEntryDto, ParticipantDto, QuestionDto,
    RecoveryDto, SessionState,
};
use crate::error::ErrorDto;
use crate::id::{OptionId, ParticipantId, QuestionId, Role, SessionId, SessionToken};
use crate::name::Nickname;
use crate::web_socket::WebSocketProtocol;
use serde::{Deserialize, Serialize};

/// Anything a websocket may send to the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    Participant(ParticipantRequest),
    Controller(ControllerRequest),
}

/// Requests from the participant channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ParticipantRequest {
    SubmitAnswer {
        question_id: QuestionId,
        selected_option_ids: Vec<OptionId>,
    },
    ReconnectSession {
        session_id: SessionId,
        participant_id: ParticipantId,
        session_token: SessionToken,
        last_known_question_id: Option<QuestionId>,
    },
    Heartbeat,
}

/// Requests from the controller channel. The transport has already proven the
/// sender holds the session's host credential.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ControllerRequest {
    StartSession,
    EndQuestion,
    NextQuestion,
    PauseQuestion,
    ResumeQuestion,
    EndSession,
    KickParticipant { participant_id: ParticipantId },
    BanParticipant { participant_id: ParticipantId },
}

/// Anything the server may send to a websocket.
#[cfg_attr(feature = "server", derive(actix::Message))]
#[cfg_attr(feature = "server", rtype(result = "()"))]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Update {
    Authenticated {
        session_id: SessionId,
        participant_id: Option<ParticipantId>,
        role: Role,
    },
    AuthError(ErrorDto),
    QuestionStarted {
        question_index: u32,
        question: QuestionDto,
    },
    TimerTick {
        remaining_seconds: u32,
    },
    TimerPaused {
        remaining_seconds: u32,
    },
    TimerResumed {
        remaining_seconds: u32,
    },
    AnswerAccepted(AnswerAcceptedDto),
    AnswerRejected {
        question_id: Option<QuestionId>,
        /// Stable error code, e.g. `DUPLICATE_ANSWER`.
        reason: String,
        message: String,
    },
    AnswerRevealed {
        question_id: QuestionId,
        correct_option_ids: Vec<OptionId>,
        stats: AnswerStatsDto,
        /// Set when scoring finalization timed out and `stats` may lag.
        stats_incomplete: bool,
    },
    LeaderboardUpdated {
        rankings: Vec<LeaderboardEntryDto>,
    },
    SessionRecovered(RecoveryDto),
    RecoveryFailed {
        reason: String,
        message: String,
    },
    ParticipantJoined(ParticipantDto),
    ParticipantLeft {
        participant_id: ParticipantId,
    },
    ParticipantEliminated {
        participant_ids: Vec<ParticipantId>,
    },
    SessionEnded,
    Kicked {
        message: String,
    },
    Banned {
        message: String,
    },
    Error(ErrorDto),
    RateLimitExceeded {
        retry_after_s: u32,
    },
}

/// Query string of the websocket upgrade.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebSocketQuery {
    pub session_id: SessionId,
    #[serde(default)]
    pub participant_id: Option<ParticipantId>,
    #[serde(default)]
    pub session_token: Option<SessionToken>,
    pub role: Role,
    #[serde(default)]
    pub protocol: Option<WebSocketProtocol>,
}

/// `POST /sessions` body (admin action; identity already verified upstream).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub quiz_id: crate::id::QuizId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
    pub join_code: crate::id::JoinCode,
    /// Credential for the controller channel.
    pub host_token: SessionToken,
}

/// `POST /sessions/join` body. Raw strings: validation happens server-side so
/// rejections map to the error taxonomy rather than a parse failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    pub join_code: String,
    pub nickname: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinResponse {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub session_token: SessionToken,
    pub nickname: Nickname,
}

/// `GET /status` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// `ok`, `degraded`, or `error` per dependency liveness.
    pub status: String,
    pub healthy: bool,
    pub uptime_s: u64,
    pub active_connections: u32,
    pub live_sessions: u32,
    pub cpu: f32,
    pub ram: f32,
    pub dependencies: Vec<DependencyStatus>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub name: String,
    pub up: bool,
    pub latency: crate::metrics::LatencySummary,
}

/// State transition broadcast on the session event topic, consumed by other
/// processes and by bigscreen feeds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionEventMessage {
    pub session_id: SessionId,
    pub state: SessionState,
    pub current_question_index: i32,
    pub at: crate::UnixTime,
}

/// Scoring work item published on `scoring:{sid}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoringMessage {
    pub answer_id: crate::id::AnswerId,
    pub participant_id: ParticipantId,
    pub question_id: QuestionId,
    pub session_id: SessionId,
    pub ts: crate::UnixTime,
}

/// Leaderboard delta published on `leaderboard:{sid}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaderboardMessage {
    pub session_id: SessionId,
    pub rankings: Vec<LeaderboardEntryDto>,
    pub updated_at: crate::UnixTime,
}
