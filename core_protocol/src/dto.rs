// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::id::{AnswerId, OptionId, ParticipantId, QuestionId, SessionId};
use crate::name::Nickname;
use crate::quiz::{Question, QuestionType};
use crate::UnixTime;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Lifecycle of one live session.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Lobby,
    ActiveQuestion,
    Reveal,
    Ended,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lobby => "LOBBY",
            Self::ActiveQuestion => "ACTIVE_QUESTION",
            Self::Reveal => "REVEAL",
            Self::Ended => "ENDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "LOBBY" => Self::Lobby,
            "ACTIVE_QUESTION" => Self::ActiveQuestion,
            "REVEAL" => Self::Reveal,
            "ENDED" => Self::Ended,
            _ => return None,
        })
    }
}

/// A question as participants see it: correct-answer flags stripped.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuestionDto {
    pub question_id: QuestionId,
    pub question_text: String,
    pub question_type: QuestionType,
    pub options: Vec<OptionDto>,
    /// Seconds.
    pub time_limit: u32,
    pub shuffle_options: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptionDto {
    pub option_id: OptionId,
    pub text: String,
}

impl From<&Question> for QuestionDto {
    fn from(question: &Question) -> Self {
        Self {
            question_id: question.question_id,
            question_text: question.question_text.clone(),
            question_type: question.question_type,
            options: question
                .options
                .iter()
                .map(|o| OptionDto {
                    option_id: o.option_id,
                    text: o.text.clone(),
                })
                .collect(),
            time_limit: question.time_limit,
            shuffle_options: question.shuffle_options,
        }
    }
}

/// One line on the leaderboard. `rank` is 1-based and dense.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderboardEntryDto {
    pub rank: u32,
    pub participant_id: ParticipantId,
    pub nickname: Nickname,
    pub total_score: u64,
    pub total_time_ms: u64,
}

impl LeaderboardEntryDto {
    /// Sort key combining points and accumulated response time; documented
    /// next to the store's ZSET encoding.
    pub fn leaderboard_score(&self) -> f64 {
        self.total_score as f64 - self.total_time_ms as f64 * 1e-9
    }
}

impl PartialOrd for LeaderboardEntryDto {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LeaderboardEntryDto {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher scores go first; equal scores break ties by lower total time.
        other
            .total_score
            .cmp(&self.total_score)
            .then_with(|| self.total_time_ms.cmp(&other.total_time_ms))
            .then_with(|| self.participant_id.cmp(&other.participant_id))
    }
}

/// Distribution of answers for one question, revealed after it closes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AnswerStatsDto {
    pub total_answers: u32,
    pub correct_answers: u32,
    pub option_counts: Vec<OptionCountDto>,
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct OptionCountDto {
    pub option_id: OptionId,
    pub count: u32,
}

/// Everything a reconnecting participant needs to rebuild their exact view.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryDto {
    pub session_id: SessionId,
    pub state: SessionState,
    /// Index of the current question, -1 in the lobby.
    pub current_question_index: i32,
    /// Stripped question, present outside the lobby.
    pub current_question: Option<QuestionDto>,
    /// Clamped at zero; only meaningful in `ACTIVE_QUESTION`.
    pub remaining_seconds: u32,
    pub total_score: u64,
    pub streak_count: u32,
    /// 1-based; absent until the participant has been scored.
    pub rank: Option<u32>,
    pub leaderboard: Vec<LeaderboardEntryDto>,
    pub is_eliminated: bool,
    pub is_spectator: bool,
}

/// Roster line for controller/bigscreen views.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParticipantDto {
    pub participant_id: ParticipantId,
    pub nickname: Nickname,
    pub is_active: bool,
    pub is_eliminated: bool,
    pub is_spectator: bool,
    pub total_score: u64,
    pub joined_at: UnixTime,
}

/// Acknowledgement for an accepted answer.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct AnswerAcceptedDto {
    pub answer_id: AnswerId,
    pub response_time_ms: u64,
}

#[cfg(test)]
mod test {
    use crate::dto::LeaderboardEntryDto;
    use crate::id::ParticipantId;
    use crate::name::Nickname;
    use std::num::NonZeroU64;

    fn entry(pid: u64, score: u64, time_ms: u64) -> LeaderboardEntryDto {
        LeaderboardEntryDto {
            rank: 0,
            participant_id: ParticipantId(NonZeroU64::new(pid).unwrap()),
            nickname: Nickname::new("p").unwrap(),
            total_score: score,
            total_time_ms: time_ms,
        }
    }

    #[test]
    fn tie_broken_by_lower_time() {
        let a = entry(1, 500, 45000);
        let b = entry(2, 500, 40000);
        let mut entries = vec![a.clone(), b.clone()];
        entries.sort();
        assert_eq!(entries[0].participant_id, b.participant_id);
        assert_eq!(entries[1].participant_id, a.participant_id);
        assert!(b.leaderboard_score() > a.leaderboard_score());
    }

    #[test]
    fn higher_score_first() {
        let mut entries = vec![entry(1, 100, 0), entry(2, 300, 99999), entry(3, 200, 0)];
        entries.sort();
        let scores: Vec<u64> = entries.iter().map(|e| e.total_score).collect();
        assert_eq!(scores, vec![300, 200, 100]);
    }
}
