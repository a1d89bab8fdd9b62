// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The seam to durable quiz definitions. Authoring, import, and storage are
//! someone else's problem; the runtime only ever reads.

use async_trait::async_trait;
use core_protocol::error::CoreError;
use core_protocol::id::QuizId;
use core_protocol::quiz::Quiz;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[async_trait]
pub trait QuizStore: Send + Sync + 'static {
    async fn get_quiz(&self, quiz_id: QuizId) -> Result<Arc<Quiz>, CoreError>;
}

/// Quiz definitions held in memory; the default for development and tests.
#[derive(Default)]
pub struct InMemoryQuizStore {
    quizzes: Mutex<HashMap<QuizId, Arc<Quiz>>>,
}

impl InMemoryQuizStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, quiz: Quiz) {
        self.quizzes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(quiz.quiz_id, Arc::new(quiz));
    }
}

#[async_trait]
impl QuizStore for InMemoryQuizStore {
    async fn get_quiz(&self, quiz_id: QuizId) -> Result<Arc<Quiz>, CoreError> {
        self.quizzes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&quiz_id)
            .cloned()
            .ok_or(CoreError::QuizNotFound)
    }
}

/// Builders for tests and the demo seed.
pub mod fixture {
    use core_protocol::id::{OptionId, QuestionId, QuizId};
    use core_protocol::quiz::{
        AnswerOption, ExamSettings, Question, QuestionType, Quiz, QuizType, ScoringSettings,
    };
    use std::num::{NonZeroU32, NonZeroU64};

    pub fn quiz_id(n: u64) -> QuizId {
        QuizId(NonZeroU64::new(n).unwrap())
    }

    pub fn question_id(n: u32) -> QuestionId {
        QuestionId(NonZeroU32::new(n).unwrap())
    }

    pub fn option_id(n: u32) -> OptionId {
        OptionId(NonZeroU32::new(n).unwrap())
    }

    pub fn option(n: u32, correct: bool) -> AnswerOption {
        AnswerOption {
            option_id: option_id(n),
            text: format!("option {}", n),
            is_correct: correct,
        }
    }

    pub fn question(
        id: u32,
        question_type: QuestionType,
        time_limit: u32,
        options: Vec<AnswerOption>,
        scoring: ScoringSettings,
    ) -> Question {
        Question {
            question_id: question_id(id),
            question_text: format!("question {}", id),
            question_type,
            time_limit,
            options,
            scoring,
            exam_settings: None,
            shuffle_options: false,
        }
    }

    pub fn scoring(base_points: u32, speed_bonus_multiplier: f64, partial: bool) -> ScoringSettings {
        ScoringSettings {
            base_points,
            speed_bonus_multiplier,
            partial_credit_enabled: partial,
        }
    }

    pub fn exam(percentage: u8) -> ExamSettings {
        ExamSettings {
            negative_marking_enabled: true,
            negative_marking_percentage: percentage,
        }
    }

    pub fn quiz(id: u64, questions: Vec<Question>) -> Quiz {
        Quiz {
            quiz_id: quiz_id(id),
            title: format!("quiz {}", id),
            quiz_type: QuizType::Standard,
            exam_settings: None,
            questions: questions.into(),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::quiz_service::{fixture, InMemoryQuizStore, QuizStore};
    use core_protocol::error::CoreError;
    use core_protocol::quiz::QuestionType;

    #[tokio::test]
    async fn lookup() {
        let store = InMemoryQuizStore::new();
        store.insert(fixture::quiz(
            1,
            vec![fixture::question(
                1,
                QuestionType::Mc,
                30,
                vec![fixture::option(1, true), fixture::option(2, false)],
                fixture::scoring(100, 0.0, false),
            )],
        ));

        assert_eq!(
            store.get_quiz(fixture::quiz_id(1)).await.unwrap().questions.len(),
            1
        );
        assert!(matches!(
            store.get_quiz(fixture::quiz_id(2)).await,
            Err(CoreError::QuizNotFound)
        ));
    }
}
