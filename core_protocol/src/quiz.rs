// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The read-only quiz model. The runtime never mutates quiz definitions; it
//! reads them through the server's quiz store seam.

use crate::id::{OptionId, QuestionId, QuizId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Quiz {
    pub quiz_id: QuizId,
    pub title: String,
    pub quiz_type: QuizType,
    /// Quiz-level default; a question's own settings take precedence.
    pub exam_settings: Option<ExamSettings>,
    /// Presented in order; `current_question_index` indexes into this.
    pub questions: Arc<[Question]>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuizType {
    Standard,
    /// The bottom fraction of still-active participants is eliminated after
    /// every question.
    Elimination {
        /// Percent of active participants eliminated per reveal, in `[1, 99]`.
        elimination_percentage: u8,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Question {
    pub question_id: QuestionId,
    pub question_text: String,
    pub question_type: QuestionType,
    /// Seconds participants have to answer.
    pub time_limit: u32,
    pub options: Vec<AnswerOption>,
    pub scoring: ScoringSettings,
    /// Overrides the quiz-level exam settings when present.
    pub exam_settings: Option<ExamSettings>,
    pub shuffle_options: bool,
}

impl Question {
    pub fn time_limit_ms(&self) -> u64 {
        self.time_limit as u64 * 1000
    }

    pub fn correct_option_ids(&self) -> Vec<OptionId> {
        self.options
            .iter()
            .filter(|o| o.is_correct)
            .map(|o| o.option_id)
            .collect()
    }

    /// Effective exam settings: question-level overrides the quiz default.
    pub fn effective_exam_settings(&self, quiz: &Quiz) -> Option<ExamSettings> {
        self.exam_settings.or(quiz.exam_settings)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    /// Single-choice. Exactly one option is correct.
    Mc,
    /// Multiple-choice; several options may be correct.
    Multi,
    /// True/false.
    Tf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerOption {
    pub option_id: OptionId,
    pub text: String,
    pub is_correct: bool,
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct ScoringSettings {
    pub base_points: u32,
    /// Zero disables the speed bonus.
    pub speed_bonus_multiplier: f64,
    /// Only meaningful for [`QuestionType::Multi`].
    pub partial_credit_enabled: bool,
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct ExamSettings {
    pub negative_marking_enabled: bool,
    /// Percent of base points deducted for a wrong answer, in `[5, 100]`.
    pub negative_marking_percentage: u8,
}
