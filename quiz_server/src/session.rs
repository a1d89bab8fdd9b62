// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-session state machine data and transition preparation.
//!
//! One process owns a session at a time (the Redis lease); the owner holds
//! the authoritative in-memory copy here and drives timers. Every transition
//! is still guarded by a compare-and-set on the stored `session.state`, so a
//! competing driver (second admin browser, adopted orphan) is detected and
//! the loser rereads instead of clobbering.

use core_protocol::dto::SessionState;
use core_protocol::error::CoreError;
use core_protocol::id::{ParticipantId, QuestionId, SessionId};
use core_protocol::quiz::{Question, Quiz, QuizType};
use core_protocol::UnixTime;
use server_util::store::SessionCasUpdate;
use server_util::store_schema::{ParticipantRecord, SessionRecord};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long the owner lease lives without refresh.
pub const LEASE_TTL: Duration = Duration::from_secs(15);
/// How often the owner refreshes it.
pub const LEASE_REFRESH: Duration = Duration::from_secs(5);
/// How long the state machine waits for scoring to finalize a question.
pub const FINALIZE_TIMEOUT: Duration = Duration::from_secs(3);

/// A participant as the owner process sees them.
pub struct ParticipantState {
    pub record: ParticipantRecord,
    /// Questions already answered; fast path of the at-most-once gate (the
    /// store claim is the cross-process authority).
    pub answered: HashSet<QuestionId>,
}

impl ParticipantState {
    pub fn new(record: ParticipantRecord) -> Self {
        Self {
            record,
            answered: HashSet::new(),
        }
    }
}

/// One owned live session.
pub struct LiveSession {
    pub record: SessionRecord,
    pub quiz: Arc<Quiz>,
    pub participants: HashMap<ParticipantId, ParticipantState>,
    /// Wall-clock ms at which the current question ends; `None` outside
    /// `ACTIVE_QUESTION` or while paused.
    pub deadline_ms: Option<UnixTime>,
    /// Deduplicates the 1 Hz timer broadcast.
    pub last_timer_broadcast_s: Option<u32>,
    /// Guards against overlapping CAS round-trips for the same session.
    pub transition_in_flight: bool,
    pub last_lease_refresh: Option<Instant>,
    /// Wall-clock ms at which an ENDED session is evicted.
    pub evict_at_ms: Option<UnixTime>,
}

impl LiveSession {
    pub fn new(record: SessionRecord, quiz: Arc<Quiz>) -> Self {
        Self {
            record,
            quiz,
            participants: HashMap::new(),
            deadline_ms: None,
            last_timer_broadcast_s: None,
            transition_in_flight: false,
            last_lease_refresh: None,
            evict_at_ms: None,
        }
    }

    /// Rebuilds a session adopted from the store after the previous owner's
    /// lease expired: the timer is re-armed from `question_started_at`.
    pub fn adopt(record: SessionRecord, quiz: Arc<Quiz>, participants: Vec<ParticipantState>) -> Self {
        let mut session = Self::new(record, quiz);
        for participant in participants {
            session
                .participants
                .insert(participant.record.participant_id, participant);
        }
        if session.record.state == SessionState::ActiveQuestion
            && session.record.paused_remaining_ms.is_none()
        {
            if let (Some(started_at), Some(question)) =
                (session.record.question_started_at, session.current_question())
            {
                session.deadline_ms = Some(started_at + question.time_limit_ms());
            }
        }
        session
    }

    pub fn state(&self) -> SessionState {
        self.record.state
    }

    pub fn current_question(&self) -> Option<&Question> {
        usize::try_from(self.record.current_question_index)
            .ok()
            .and_then(|i| self.quiz.questions.get(i))
    }

    pub fn current_question_id(&self) -> Option<QuestionId> {
        self.current_question().map(|q| q.question_id)
    }

    /// Remaining time of the current question, clamped at zero.
    pub fn remaining_ms(&self, now: UnixTime) -> u64 {
        if let Some(paused) = self.record.paused_remaining_ms {
            return paused;
        }
        self.deadline_ms.map(|d| d.saturating_sub(now)).unwrap_or(0)
    }

    pub fn is_last_question(&self) -> bool {
        self.record.current_question_index + 1 >= self.quiz.questions.len() as i32
    }

    pub fn participant(&self, pid: ParticipantId) -> Option<&ParticipantState> {
        self.participants.get(&pid)
    }

    pub fn participant_mut(&mut self, pid: ParticipantId) -> Option<&mut ParticipantState> {
        self.participants.get_mut(&pid)
    }
}

/// What the driver wants to do.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransitionIntent {
    StartSession,
    /// Manual (controller) or timer-driven.
    EndQuestion,
    NextQuestion,
    EndSession,
    PauseQuestion,
    ResumeQuestion,
}

/// A validated transition, ready for the CAS round-trip.
#[derive(Clone, Debug)]
pub struct PreparedTransition {
    pub intent: TransitionIntent,
    pub expected: SessionState,
    pub update: SessionCasUpdate,
    /// Question closing (EndQuestion), for finalization.
    pub closing_question: Option<QuestionId>,
}

/// The owned live sessions of this process.
pub struct SessionRepo {
    pub sessions: HashMap<SessionId, LiveSession>,
    /// Identifies this process in owner leases.
    pub owner_id: String,
}

impl SessionRepo {
    pub fn new(owner_id: String) -> Self {
        Self {
            sessions: HashMap::new(),
            owner_id,
        }
    }

    pub fn get(&self, sid: SessionId) -> Option<&LiveSession> {
        self.sessions.get(&sid)
    }

    pub fn get_mut(&mut self, sid: SessionId) -> Option<&mut LiveSession> {
        self.sessions.get_mut(&sid)
    }

    /// Validates an intent against the in-memory state and builds the CAS
    /// update. No side effects; the caller performs the store round-trip and
    /// then applies.
    pub fn prepare_transition(
        &self,
        sid: SessionId,
        intent: TransitionIntent,
        now: UnixTime,
    ) -> Result<PreparedTransition, CoreError> {
        let session = self.sessions.get(&sid).ok_or(CoreError::SessionNotFound)?;
        if session.transition_in_flight {
            return Err(CoreError::StateConflict);
        }
        let record = &session.record;

        let prepared = match intent {
            TransitionIntent::StartSession => {
                if record.state != SessionState::Lobby {
                    return Err(CoreError::WrongState("session already started"));
                }
                if session.quiz.questions.is_empty() {
                    return Err(CoreError::WrongState("quiz has no questions"));
                }
                PreparedTransition {
                    intent,
                    expected: SessionState::Lobby,
                    update: SessionCasUpdate {
                        state: SessionState::ActiveQuestion,
                        current_question_index: 0,
                        question_started_at: Some(now),
                        paused_remaining_ms: None,
                        ended_at: None,
                    },
                    closing_question: None,
                }
            }
            TransitionIntent::EndQuestion => {
                if record.state != SessionState::ActiveQuestion {
                    return Err(CoreError::WrongState("no question in progress"));
                }
                PreparedTransition {
                    intent,
                    expected: SessionState::ActiveQuestion,
                    update: SessionCasUpdate {
                        state: SessionState::Reveal,
                        current_question_index: record.current_question_index,
                        question_started_at: None,
                        paused_remaining_ms: None,
                        ended_at: None,
                    },
                    closing_question: session.current_question_id(),
                }
            }
            TransitionIntent::NextQuestion => {
                if record.state != SessionState::Reveal {
                    return Err(CoreError::WrongState("no reveal in progress"));
                }
                if session.is_last_question() {
                    PreparedTransition {
                        intent,
                        expected: SessionState::Reveal,
                        update: SessionCasUpdate {
                            state: SessionState::Ended,
                            current_question_index: record.current_question_index,
                            question_started_at: None,
                            paused_remaining_ms: None,
                            ended_at: Some(now),
                        },
                        closing_question: None,
                    }
                } else {
                    PreparedTransition {
                        intent,
                        expected: SessionState::Reveal,
                        update: SessionCasUpdate {
                            state: SessionState::ActiveQuestion,
                            current_question_index: record.current_question_index + 1,
                            question_started_at: Some(now),
                            paused_remaining_ms: None,
                            ended_at: None,
                        },
                        closing_question: None,
                    }
                }
            }
            TransitionIntent::EndSession => {
                if record.state == SessionState::Ended {
                    return Err(CoreError::WrongState("session already ended"));
                }
                PreparedTransition {
                    intent,
                    expected: record.state,
                    update: SessionCasUpdate {
                        state: SessionState::Ended,
                        current_question_index: record.current_question_index,
                        question_started_at: None,
                        paused_remaining_ms: None,
                        ended_at: Some(now),
                    },
                    // In-flight scoring is cancelled, not finalized.
                    closing_question: None,
                }
            }
            TransitionIntent::PauseQuestion => {
                if record.state != SessionState::ActiveQuestion {
                    return Err(CoreError::WrongState("no question in progress"));
                }
                if record.paused_remaining_ms.is_some() {
                    return Err(CoreError::WrongState("timer already paused"));
                }
                PreparedTransition {
                    intent,
                    expected: SessionState::ActiveQuestion,
                    update: SessionCasUpdate {
                        state: SessionState::ActiveQuestion,
                        current_question_index: record.current_question_index,
                        question_started_at: record.question_started_at,
                        paused_remaining_ms: Some(session.remaining_ms(now)),
                        ended_at: None,
                    },
                    closing_question: None,
                }
            }
            TransitionIntent::ResumeQuestion => {
                let remaining = record
                    .paused_remaining_ms
                    .ok_or(CoreError::WrongState("timer is not paused"))?;
                if record.state != SessionState::ActiveQuestion {
                    return Err(CoreError::WrongState("no question in progress"));
                }
                let question = session
                    .current_question()
                    .ok_or(CoreError::WrongState("no question in progress"))?;
                // Shift the epoch so `started_at + limit - now == remaining`.
                let started_at = (now + remaining).saturating_sub(question.time_limit_ms());
                PreparedTransition {
                    intent,
                    expected: SessionState::ActiveQuestion,
                    update: SessionCasUpdate {
                        state: SessionState::ActiveQuestion,
                        current_question_index: record.current_question_index,
                        question_started_at: Some(started_at),
                        paused_remaining_ms: None,
                        ended_at: None,
                    },
                    closing_question: None,
                }
            }
        };

        Ok(prepared)
    }

    /// Applies a successful CAS to the in-memory copy and re-arms the timer.
    /// Returns the new state.
    pub fn apply_transition(
        &mut self,
        sid: SessionId,
        prepared: &PreparedTransition,
        now: UnixTime,
        idle_ttl: Duration,
    ) -> Option<SessionState> {
        let session = self.sessions.get_mut(&sid)?;
        let update = &prepared.update;
        session.record.state = update.state;
        session.record.current_question_index = update.current_question_index;
        session.record.question_started_at = update.question_started_at;
        session.record.paused_remaining_ms = update.paused_remaining_ms;
        session.record.ended_at = update.ended_at;
        session.last_timer_broadcast_s = None;

        match update.state {
            SessionState::ActiveQuestion if update.paused_remaining_ms.is_none() => {
                if let (Some(started_at), Some(question)) =
                    (update.question_started_at, session.current_question())
                {
                    session.deadline_ms = Some(started_at + question.time_limit_ms());
                } else {
                    session.deadline_ms = None;
                }
            }
            SessionState::Ended => {
                session.deadline_ms = None;
                session.evict_at_ms = Some(now + idle_ttl.as_millis() as u64);
            }
            _ => session.deadline_ms = None,
        }

        Some(update.state)
    }
}

/// Picks the bottom `percentage` of still-active participants by current
/// leaderboard score. Spectators and the already-eliminated don't count.
pub fn select_eliminated(
    participants: &HashMap<ParticipantId, ParticipantState>,
    percentage: u8,
) -> Vec<ParticipantId> {
    let mut active: Vec<&ParticipantRecord> = participants
        .values()
        .map(|p| &p.record)
        .filter(|r| !r.is_eliminated && !r.is_spectator && !r.is_banned)
        .collect();
    if active.len() < 2 {
        return Vec::new();
    }
    // Worst first.
    active.sort_by(|a, b| {
        let score_a = a.total_score as f64 - a.total_time_ms as f64 * 1e-9;
        let score_b = b.total_score as f64 - b.total_time_ms as f64 * 1e-9;
        score_a
            .partial_cmp(&score_b)
            .unwrap()
            .then(b.participant_id.cmp(&a.participant_id))
    });
    let count = (active.len() * percentage as usize / 100).min(active.len() - 1);
    active[..count].iter().map(|r| r.participant_id).collect()
}

/// Whether `quiz_type` eliminates, and by how much.
pub fn elimination_percentage(quiz: &Quiz) -> Option<u8> {
    match quiz.quiz_type {
        QuizType::Elimination {
            elimination_percentage,
        } => Some(elimination_percentage.clamp(1, 99)),
        QuizType::Standard => None,
    }
}

#[cfg(test)]
mod test {
    use crate::quiz_service::fixture;
    use crate::session::{
        select_eliminated, LiveSession, ParticipantState, SessionRepo, TransitionIntent,
    };
    use core_protocol::dto::SessionState;
    use core_protocol::error::CoreError;
    use core_protocol::id::{JoinCode, ParticipantId, SessionId, SessionToken};
    use core_protocol::quiz::QuestionType;
    use server_util::store_schema::{ParticipantRecord, SessionRecord};
    use std::collections::HashMap;
    use std::num::NonZeroU64;
    use std::sync::Arc;
    use std::time::Duration;

    fn sid() -> SessionId {
        SessionId(NonZeroU64::new(1).unwrap())
    }

    fn pid(n: u64) -> ParticipantId {
        ParticipantId(NonZeroU64::new(n).unwrap())
    }

    fn repo_with_session() -> SessionRepo {
        let quiz = fixture::quiz(
            1,
            vec![
                fixture::question(
                    1,
                    QuestionType::Mc,
                    30,
                    vec![fixture::option(1, true), fixture::option(2, false)],
                    fixture::scoring(100, 0.0, false),
                ),
                fixture::question(
                    2,
                    QuestionType::Tf,
                    20,
                    vec![fixture::option(3, true), fixture::option(4, false)],
                    fixture::scoring(100, 0.0, false),
                ),
            ],
        );
        let record = SessionRecord {
            session_id: sid(),
            quiz_id: fixture::quiz_id(1),
            join_code: JoinCode::new("AAAAAA").unwrap(),
            state: SessionState::Lobby,
            current_question_index: -1,
            question_started_at: None,
            paused_remaining_ms: None,
            created_at: 0,
            ended_at: None,
            host_token: SessionToken(NonZeroU64::new(1).unwrap()),
        };
        let mut repo = SessionRepo::new("owner-1".to_owned());
        repo.sessions
            .insert(sid(), LiveSession::new(record, Arc::new(quiz)));
        repo
    }

    fn drive(repo: &mut SessionRepo, intent: TransitionIntent, now: u64) -> SessionState {
        let prepared = repo.prepare_transition(sid(), intent, now).unwrap();
        repo.apply_transition(sid(), &prepared, now, Duration::from_secs(600))
            .unwrap()
    }

    #[test]
    fn full_lifecycle() {
        let mut repo = repo_with_session();

        assert_eq!(drive(&mut repo, TransitionIntent::StartSession, 1000), SessionState::ActiveQuestion);
        {
            let session = repo.get(sid()).unwrap();
            assert_eq!(session.record.current_question_index, 0);
            assert_eq!(session.record.question_started_at, Some(1000));
            assert_eq!(session.deadline_ms, Some(31_000));
        }

        assert_eq!(drive(&mut repo, TransitionIntent::EndQuestion, 20_000), SessionState::Reveal);
        assert_eq!(repo.get(sid()).unwrap().deadline_ms, None);
        assert_eq!(repo.get(sid()).unwrap().record.question_started_at, None);

        assert_eq!(drive(&mut repo, TransitionIntent::NextQuestion, 25_000), SessionState::ActiveQuestion);
        assert_eq!(repo.get(sid()).unwrap().record.current_question_index, 1);
        // Second question has a 20 s limit.
        assert_eq!(repo.get(sid()).unwrap().deadline_ms, Some(45_000));

        assert_eq!(drive(&mut repo, TransitionIntent::EndQuestion, 45_000), SessionState::Reveal);
        // Last question: next ends the session.
        assert_eq!(drive(&mut repo, TransitionIntent::NextQuestion, 46_000), SessionState::Ended);
        let session = repo.get(sid()).unwrap();
        assert_eq!(session.record.ended_at, Some(46_000));
        assert_eq!(session.evict_at_ms, Some(46_000 + 600_000));
    }

    #[test]
    fn question_index_never_decreases() {
        let mut repo = repo_with_session();
        drive(&mut repo, TransitionIntent::StartSession, 1000);
        let before = repo.get(sid()).unwrap().record.current_question_index;
        drive(&mut repo, TransitionIntent::EndQuestion, 2000);
        drive(&mut repo, TransitionIntent::NextQuestion, 3000);
        assert!(repo.get(sid()).unwrap().record.current_question_index > before);
    }

    #[test]
    fn wrong_state_rejected() {
        let mut repo = repo_with_session();
        assert!(matches!(
            repo.prepare_transition(sid(), TransitionIntent::EndQuestion, 0),
            Err(CoreError::WrongState(_))
        ));
        assert!(matches!(
            repo.prepare_transition(sid(), TransitionIntent::NextQuestion, 0),
            Err(CoreError::WrongState(_))
        ));
        drive(&mut repo, TransitionIntent::StartSession, 1000);
        assert!(matches!(
            repo.prepare_transition(sid(), TransitionIntent::StartSession, 2000),
            Err(CoreError::WrongState(_))
        ));
    }

    #[test]
    fn end_session_from_any_state() {
        let mut repo = repo_with_session();
        drive(&mut repo, TransitionIntent::StartSession, 1000);
        assert_eq!(drive(&mut repo, TransitionIntent::EndSession, 5000), SessionState::Ended);
        assert!(matches!(
            repo.prepare_transition(sid(), TransitionIntent::EndSession, 6000),
            Err(CoreError::WrongState(_))
        ));
    }

    #[test]
    fn pause_and_resume_preserve_remaining() {
        let mut repo = repo_with_session();
        drive(&mut repo, TransitionIntent::StartSession, 1000);

        // 12 s in, 18 s remain.
        drive(&mut repo, TransitionIntent::PauseQuestion, 13_000);
        {
            let session = repo.get(sid()).unwrap();
            assert_eq!(session.record.paused_remaining_ms, Some(18_000));
            assert_eq!(session.deadline_ms, None);
            assert_eq!(session.remaining_ms(99_000), 18_000);
        }

        // Resume 60 s later; deadline re-arms for the remaining 18 s.
        drive(&mut repo, TransitionIntent::ResumeQuestion, 73_000);
        let session = repo.get(sid()).unwrap();
        assert_eq!(session.record.paused_remaining_ms, None);
        assert_eq!(session.deadline_ms, Some(91_000));
        // Recovery math agrees: started_at + limit == deadline.
        assert_eq!(
            session.record.question_started_at.unwrap() + 30_000,
            91_000
        );
    }

    #[test]
    fn in_flight_transition_blocks_others() {
        let mut repo = repo_with_session();
        repo.get_mut(sid()).unwrap().transition_in_flight = true;
        assert!(matches!(
            repo.prepare_transition(sid(), TransitionIntent::StartSession, 0),
            Err(CoreError::StateConflict)
        ));
    }

    fn participant(n: u64, score: u64, time_ms: u64) -> (ParticipantId, ParticipantState) {
        (
            pid(n),
            ParticipantState::new(ParticipantRecord {
                participant_id: pid(n),
                session_id: sid(),
                nickname: core_protocol::name::Nickname::new(&format!("p{}", n)).unwrap(),
                session_token: SessionToken(NonZeroU64::new(n + 50).unwrap()),
                is_active: true,
                is_eliminated: false,
                is_spectator: false,
                is_banned: false,
                total_score: score,
                total_time_ms: time_ms,
                streak_count: 0,
                last_question_score: 0,
                answer_seq: 1,
                joined_at: 0,
            }),
        )
    }

    #[test]
    fn elimination_takes_bottom_by_leaderboard_score() {
        let participants: HashMap<_, _> = vec![
            participant(1, 500, 10_000),
            participant(2, 300, 10_000),
            participant(3, 100, 10_000),
            participant(4, 700, 10_000),
        ]
        .into_iter()
        .collect();

        // Bottom 50% of 4 -> 2 participants, lowest scores first.
        let mut eliminated = select_eliminated(&participants, 50);
        eliminated.sort();
        assert_eq!(eliminated, vec![pid(2), pid(3)]);
    }

    #[test]
    fn elimination_never_removes_everyone() {
        let participants: HashMap<_, _> =
            vec![participant(1, 0, 0), participant(2, 10, 0)].into_iter().collect();
        assert_eq!(select_eliminated(&participants, 99).len(), 1);

        let single: HashMap<_, _> = vec![participant(1, 0, 0)].into_iter().collect();
        assert!(select_eliminated(&single, 99).is_empty());
    }

    #[test]
    fn elimination_tie_break_prefers_less_time() {
        let participants: HashMap<_, _> = vec![
            participant(1, 500, 45_000),
            participant(2, 500, 40_000),
        ]
        .into_iter()
        .collect();
        // Equal scores: the slower participant has the lower leaderboard
        // score and goes first.
        assert_eq!(select_eliminated(&participants, 50), vec![pid(1)]);
    }
}
