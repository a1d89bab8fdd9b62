// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Structured error taxonomy shared by the server and its HTTP/websocket
//! surfaces. Every error carries a stable short code and a category; clients
//! only ever see the sanitized [`ErrorDto`] envelope.

use crate::{get_unix_time_now, UnixTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Database,
    Validation,
    Authentication,
    Authorization,
    RateLimit,
    Network,
    NotFound,
    Conflict,
    Internal,
    Timeout,
    ServiceUnavailable,
    Unknown,
}

impl ErrorCategory {
    /// Default HTTP status for the category; specific codes may override.
    pub fn http_status(self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Authentication => 401,
            Self::Authorization => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::RateLimit => 429,
            Self::Database | Self::Internal | Self::Unknown => 500,
            Self::Network | Self::ServiceUnavailable => 503,
            Self::Timeout => 504,
        }
    }
}

#[derive(Clone, Debug, Error)]
pub enum CoreError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("storage timed out: {0}")]
    StorageTimeout(String),
    #[error("authentication failed")]
    AuthFailed,
    #[error("not allowed")]
    Forbidden,
    #[error("rate limit exceeded")]
    RateLimited { retry_after_s: u32 },
    #[error("session not found")]
    SessionNotFound,
    #[error("session has ended")]
    SessionEnded,
    #[error("session expired")]
    SessionExpired,
    #[error("participant not found")]
    ParticipantNotFound,
    #[error("participant is banned")]
    ParticipantBanned,
    #[error("participant is eliminated")]
    Eliminated,
    #[error("spectators cannot answer")]
    Spectator,
    #[error("answer already recorded")]
    DuplicateAnswer,
    #[error("wrong state: {0}")]
    WrongState(&'static str),
    #[error("state changed concurrently")]
    StateConflict,
    #[error("invalid join code")]
    InvalidJoinCode,
    #[error("nickname already in use")]
    NicknameTaken,
    #[error("invalid nickname: {0}")]
    NicknameInvalid(&'static str),
    #[error("quiz not found")]
    QuizNotFound,
    #[error("scoring failed: {0}")]
    ScoringFailed(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out: {0}")]
    Timeout(&'static str),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::StorageUnavailable(_) => ErrorCategory::Database,
            Self::StorageTimeout(_) => ErrorCategory::Database,
            Self::AuthFailed => ErrorCategory::Authentication,
            Self::Forbidden | Self::ParticipantBanned | Self::Eliminated | Self::Spectator => {
                ErrorCategory::Authorization
            }
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::SessionNotFound | Self::ParticipantNotFound | Self::QuizNotFound
            | Self::InvalidJoinCode => ErrorCategory::NotFound,
            Self::SessionEnded | Self::SessionExpired => ErrorCategory::Validation,
            Self::DuplicateAnswer | Self::StateConflict | Self::NicknameTaken => {
                ErrorCategory::Conflict
            }
            Self::WrongState(_) | Self::NicknameInvalid(_) => ErrorCategory::Validation,
            Self::ScoringFailed(_) | Self::Internal(_) => ErrorCategory::Internal,
            Self::Network(_) => ErrorCategory::Network,
            Self::Timeout(_) => ErrorCategory::Timeout,
        }
    }

    /// Stable short code; the wire contract, never renamed.
    pub fn code(&self) -> &'static str {
        match self {
            Self::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            Self::StorageTimeout(_) => "DB_TIMEOUT",
            Self::AuthFailed => "AUTH_FAILED",
            Self::Forbidden => "FORBIDDEN",
            Self::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionEnded => "SESSION_ENDED",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::ParticipantNotFound => "PARTICIPANT_NOT_FOUND",
            Self::ParticipantBanned => "PARTICIPANT_BANNED",
            Self::Eliminated => "ELIMINATED",
            Self::Spectator => "SPECTATOR",
            Self::DuplicateAnswer => "DUPLICATE_ANSWER",
            Self::WrongState(_) => "WRONG_STATE",
            Self::StateConflict => "STATE_CONFLICT",
            Self::InvalidJoinCode => "INVALID_JOIN_CODE",
            Self::NicknameTaken => "NICKNAME_TAKEN",
            Self::NicknameInvalid(_) => "NICKNAME_INVALID",
            Self::QuizNotFound => "QUIZ_NOT_FOUND",
            Self::ScoringFailed(_) => "SCORING_FAILED",
            Self::Network(_) => "NETWORK_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Safe to show to end users; never includes internals.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::StorageUnavailable(_) | Self::StorageTimeout(_) | Self::Internal(_)
            | Self::ScoringFailed(_) => "something went wrong, please try again",
            Self::AuthFailed => "could not verify your session",
            Self::Forbidden => "you are not allowed to do that",
            Self::RateLimited { .. } => "too many requests, slow down",
            Self::SessionNotFound => "session not found",
            Self::SessionEnded => "this session has ended",
            Self::SessionExpired => "this session has expired, please rejoin",
            Self::ParticipantNotFound => "participant not found",
            Self::ParticipantBanned => "you have been removed from this session",
            Self::Eliminated => "you have been eliminated",
            Self::Spectator => "spectators cannot submit answers",
            Self::DuplicateAnswer => "you already answered this question",
            Self::WrongState(_) => "that action is not available right now",
            Self::StateConflict => "the session moved on, please refresh",
            Self::InvalidJoinCode => "no session with that code",
            Self::NicknameTaken => "that nickname is taken",
            Self::NicknameInvalid(reason) => reason,
            Self::QuizNotFound => "quiz not found",
            Self::Network(_) => "connection problem, please retry",
            Self::Timeout(_) => "the request timed out",
        }
    }

    /// Category default status, with code-specific overrides.
    pub fn http_status(&self) -> u16 {
        match self {
            // Validation category, but the session is genuinely gone.
            Self::SessionEnded | Self::SessionExpired => 410,
            _ => self.category().http_status(),
        }
    }

    /// Whether a retry with backoff has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Database
                | ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::ServiceUnavailable
        )
    }

    /// Builds the wire envelope. `production` strips developer details.
    pub fn to_dto(&self, request_id: Option<String>, production: bool) -> ErrorDto {
        ErrorDto {
            code: self.code().to_owned(),
            user_message: self.user_message().to_owned(),
            category: self.category(),
            request_id,
            timestamp: get_unix_time_now(),
            details: (!production).then(|| self.to_string()),
        }
    }
}

/// The wire envelope for errors. `details` is developer-only and absent in
/// production.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorDto {
    pub code: String,
    pub user_message: String,
    pub category: ErrorCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: UnixTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[cfg(test)]
mod test {
    use crate::error::{CoreError, ErrorCategory};

    #[test]
    fn category_statuses() {
        assert_eq!(CoreError::AuthFailed.http_status(), 401);
        assert_eq!(CoreError::Forbidden.http_status(), 403);
        assert_eq!(CoreError::SessionNotFound.http_status(), 404);
        assert_eq!(CoreError::DuplicateAnswer.http_status(), 409);
        assert_eq!(CoreError::RateLimited { retry_after_s: 1 }.http_status(), 429);
        assert_eq!(CoreError::Timeout("x").http_status(), 504);
        assert_eq!(CoreError::SessionExpired.http_status(), 410);
    }

    #[test]
    fn transient_classification() {
        assert!(CoreError::StorageUnavailable("conn refused".into()).is_transient());
        assert!(CoreError::Network("reset".into()).is_transient());
        assert!(!CoreError::DuplicateAnswer.is_transient());
        assert!(!CoreError::AuthFailed.is_transient());
    }

    #[test]
    fn production_envelope_hides_details() {
        let err = CoreError::Internal("sql broke".into());
        let dto = err.to_dto(Some("req-1".into()), true);
        assert_eq!(dto.code, "INTERNAL_ERROR");
        assert_eq!(dto.category, ErrorCategory::Internal);
        assert!(dto.details.is_none());
        assert!(!dto.user_message.contains("sql"));

        let dev = err.to_dto(None, false);
        assert!(dev.details.unwrap().contains("sql broke"));
    }
}
