// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The answer ingest pipeline: gate checks, at-most-once claims, response
//! time assignment, reveal stats, and the durable-write batch accumulator.

use crate::session::LiveSession;
use core_protocol::dto::{AnswerStatsDto, OptionCountDto, SessionState};
use core_protocol::error::CoreError;
use core_protocol::id::{AnswerId, OptionId, ParticipantId, QuestionId, SessionId};
use core_protocol::quiz::Question;
use core_protocol::UnixTime;
use server_util::store_schema::AnswerRecord;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroU64;
use std::time::{Duration, Instant};

/// Answer ids pack the participant's sequence number into the high bits:
/// monotonic per participant, unique within a session.
pub fn compose_answer_id(pid: ParticipantId, seq: u64) -> AnswerId {
    debug_assert!(seq > 0);
    let low = pid.0.get() & ((1 << 48) - 1);
    AnswerId(NonZeroU64::new((seq << 48) | low).expect("seq is nonzero"))
}

#[derive(Default)]
struct QuestionStats {
    total: u32,
    correct: u32,
    counts: HashMap<OptionId, u32>,
}

/// Validates, buffers, and batches submitted answers.
pub struct AnswerRepo {
    /// Records whose durable write failed, awaiting the next flush.
    pending: Vec<AnswerRecord>,
    last_flush: Instant,
    stats: HashMap<(SessionId, QuestionId), QuestionStats>,
}

impl AnswerRepo {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            last_flush: Instant::now(),
            stats: HashMap::new(),
        }
    }

    /// Gate checks and record minting. Mutates the in-memory answered set and
    /// sequence, which is safe because the owner actor linearizes
    /// submissions; the store claim backs this up across processes.
    pub fn prepare_submission(
        session: &mut LiveSession,
        pid: ParticipantId,
        question_id: QuestionId,
        selected_option_ids: Vec<OptionId>,
        now: UnixTime,
    ) -> Result<AnswerRecord, CoreError> {
        if session.state() != SessionState::ActiveQuestion {
            return Err(CoreError::WrongState("answers are closed"));
        }
        if session.current_question_id() != Some(question_id) {
            return Err(CoreError::WrongState("not the current question"));
        }

        let question = session
            .current_question()
            .ok_or(CoreError::WrongState("no question in progress"))?;
        let known: HashSet<OptionId> = question.options.iter().map(|o| o.option_id).collect();
        if !selected_option_ids.iter().all(|o| known.contains(o)) {
            return Err(CoreError::WrongState("unknown option"));
        }
        let time_limit_ms = question.time_limit_ms();

        let session_id = session.record.session_id;
        let started_at = session
            .record
            .question_started_at
            .ok_or(CoreError::WrongState("no question in progress"))?;

        let participant = session
            .participant_mut(pid)
            .ok_or(CoreError::ParticipantNotFound)?;
        if participant.record.is_banned {
            return Err(CoreError::ParticipantBanned);
        }
        if participant.record.is_eliminated {
            return Err(CoreError::Eliminated);
        }
        if participant.record.is_spectator {
            return Err(CoreError::Spectator);
        }
        if participant.answered.contains(&question_id) {
            return Err(CoreError::DuplicateAnswer);
        }

        let seq = participant.record.answer_seq.max(1);
        participant.record.answer_seq = seq + 1;
        participant.answered.insert(question_id);

        let mut selected = selected_option_ids;
        selected.sort();
        selected.dedup();

        Ok(AnswerRecord {
            answer_id: compose_answer_id(pid, seq),
            session_id,
            participant_id: pid,
            question_id,
            selected_option_ids: selected,
            submitted_at: now,
            response_time_ms: now.saturating_sub(started_at).min(time_limit_ms),
            scored: false,
            is_correct: false,
            points_awarded: 0,
            speed_bonus_applied: false,
            streak_bonus_applied: false,
            partial_credit_applied: false,
        })
    }

    /// Tallies the answer into the reveal stats. Correctness here is a
    /// set-equality check for display; points remain the scoring worker's
    /// business.
    pub fn record_stats(&mut self, question: &Question, record: &AnswerRecord) {
        let stats = self
            .stats
            .entry((record.session_id, record.question_id))
            .or_default();
        stats.total += 1;
        let correct: HashSet<OptionId> = question
            .options
            .iter()
            .filter(|o| o.is_correct)
            .map(|o| o.option_id)
            .collect();
        let selected: HashSet<OptionId> = record.selected_option_ids.iter().copied().collect();
        if !selected.is_empty() && selected == correct {
            stats.correct += 1;
        }
        for &option in &record.selected_option_ids {
            *stats.counts.entry(option).or_default() += 1;
        }
    }

    pub fn stats_for(&self, sid: SessionId, qid: QuestionId) -> AnswerStatsDto {
        let Some(stats) = self.stats.get(&(sid, qid)) else {
            return AnswerStatsDto::default();
        };
        let mut option_counts: Vec<OptionCountDto> = stats
            .counts
            .iter()
            .map(|(&option_id, &count)| OptionCountDto { option_id, count })
            .collect();
        option_counts.sort_by_key(|c| c.option_id);
        AnswerStatsDto {
            total_answers: stats.total,
            correct_answers: stats.correct,
            option_counts,
        }
    }

    /// Failed durable writes come back here for the next flush; the client's
    /// `answer_accepted` is never rolled back.
    pub fn push_retry(&mut self, records: Vec<AnswerRecord>) {
        self.pending.extend(records);
    }

    /// Takes the accumulator when the interval elapsed or the batch is big
    /// enough.
    pub fn take_due(
        &mut self,
        now: Instant,
        interval: Duration,
        batch_size: usize,
    ) -> Option<Vec<AnswerRecord>> {
        if self.pending.is_empty() {
            return None;
        }
        if self.pending.len() < batch_size && now.duration_since(self.last_flush) < interval {
            return None;
        }
        self.last_flush = now;
        Some(std::mem::take(&mut self.pending))
    }

    pub fn forget_session(&mut self, sid: SessionId) {
        self.stats.retain(|(s, _), _| *s != sid);
        self.pending.retain(|r| r.session_id != sid);
    }
}

impl Default for AnswerRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use crate::answer::{compose_answer_id, AnswerRepo};
    use crate::quiz_service::fixture;
    use crate::session::{LiveSession, ParticipantState};
    use core_protocol::dto::SessionState;
    use core_protocol::error::CoreError;
    use core_protocol::id::{JoinCode, ParticipantId, SessionId, SessionToken};
    use core_protocol::quiz::QuestionType;
    use server_util::store_schema::{ParticipantRecord, SessionRecord};
    use std::num::NonZeroU64;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn sid() -> SessionId {
        SessionId(NonZeroU64::new(3).unwrap())
    }

    fn pid(n: u64) -> ParticipantId {
        ParticipantId(NonZeroU64::new(n).unwrap())
    }

    fn live_session() -> LiveSession {
        let quiz = fixture::quiz(
            1,
            vec![fixture::question(
                1,
                QuestionType::Mc,
                30,
                vec![fixture::option(1, true), fixture::option(2, false)],
                fixture::scoring(100, 0.0, false),
            )],
        );
        let record = SessionRecord {
            session_id: sid(),
            quiz_id: fixture::quiz_id(1),
            join_code: JoinCode::new("AAAAAA").unwrap(),
            state: SessionState::ActiveQuestion,
            current_question_index: 0,
            question_started_at: Some(10_000),
            paused_remaining_ms: None,
            created_at: 0,
            ended_at: None,
            host_token: SessionToken(NonZeroU64::new(9).unwrap()),
        };
        let mut session = LiveSession::new(record, Arc::new(quiz));
        session.participants.insert(
            pid(1),
            ParticipantState::new(ParticipantRecord {
                participant_id: pid(1),
                session_id: sid(),
                nickname: core_protocol::name::Nickname::new("p1").unwrap(),
                session_token: SessionToken(NonZeroU64::new(60).unwrap()),
                is_active: true,
                is_eliminated: false,
                is_spectator: false,
                is_banned: false,
                total_score: 0,
                total_time_ms: 0,
                streak_count: 0,
                last_question_score: 0,
                answer_seq: 1,
                joined_at: 0,
            }),
        );
        session
    }

    #[test]
    fn accepts_then_rejects_duplicate() {
        let mut session = live_session();
        let record = AnswerRepo::prepare_submission(
            &mut session,
            pid(1),
            fixture::question_id(1),
            vec![fixture::option_id(1)],
            15_000,
        )
        .unwrap();
        assert_eq!(record.response_time_ms, 5000);
        assert_eq!(record.answer_id, compose_answer_id(pid(1), 1));

        let duplicate = AnswerRepo::prepare_submission(
            &mut session,
            pid(1),
            fixture::question_id(1),
            vec![fixture::option_id(2)],
            16_000,
        );
        assert!(matches!(duplicate, Err(CoreError::DuplicateAnswer)));
    }

    #[test]
    fn state_gate() {
        let mut session = live_session();
        session.record.state = SessionState::Reveal;
        let rejected = AnswerRepo::prepare_submission(
            &mut session,
            pid(1),
            fixture::question_id(1),
            vec![fixture::option_id(1)],
            15_000,
        );
        assert!(matches!(rejected, Err(CoreError::WrongState(_))));

        // Wrong question id is also a state error, not an answer row.
        let mut session = live_session();
        let rejected = AnswerRepo::prepare_submission(
            &mut session,
            pid(1),
            fixture::question_id(2),
            vec![fixture::option_id(1)],
            15_000,
        );
        assert!(matches!(rejected, Err(CoreError::WrongState(_))));
        assert!(session.participants[&pid(1)].answered.is_empty());
    }

    #[test]
    fn response_time_clamped() {
        let mut session = live_session();
        // Clock skew: submitted "before" the question started.
        let early = AnswerRepo::prepare_submission(
            &mut session,
            pid(1),
            fixture::question_id(1),
            vec![fixture::option_id(1)],
            9_000,
        )
        .unwrap();
        assert_eq!(early.response_time_ms, 0);

        let mut session = live_session();
        // Way past the limit (timer transition raced): clamp to the limit.
        let late = AnswerRepo::prepare_submission(
            &mut session,
            pid(1),
            fixture::question_id(1),
            vec![fixture::option_id(1)],
            90_000,
        )
        .unwrap();
        assert_eq!(late.response_time_ms, 30_000);
    }

    #[test]
    fn eliminated_and_spectator_rejected() {
        let mut session = live_session();
        session
            .participant_mut(pid(1))
            .unwrap()
            .record
            .is_eliminated = true;
        let rejected = AnswerRepo::prepare_submission(
            &mut session,
            pid(1),
            fixture::question_id(1),
            vec![fixture::option_id(1)],
            15_000,
        );
        assert!(matches!(rejected, Err(CoreError::Eliminated)));

        let mut session = live_session();
        session.participant_mut(pid(1)).unwrap().record.is_spectator = true;
        let rejected = AnswerRepo::prepare_submission(
            &mut session,
            pid(1),
            fixture::question_id(1),
            vec![fixture::option_id(1)],
            15_000,
        );
        assert!(matches!(rejected, Err(CoreError::Spectator)));
    }

    #[test]
    fn stats_tally() {
        let mut repo = AnswerRepo::new();
        let mut session = live_session();
        session.participants.insert(
            pid(2),
            ParticipantState::new(ParticipantRecord {
                participant_id: pid(2),
                answer_seq: 1,
                ..session.participants[&pid(1)].record.clone()
            }),
        );

        let question = session.current_question().unwrap().clone();
        for (participant, option, at) in [(1u64, 1u32, 12_000u64), (2, 2, 14_000)] {
            let record = AnswerRepo::prepare_submission(
                &mut session,
                pid(participant),
                fixture::question_id(1),
                vec![fixture::option_id(option)],
                at,
            )
            .unwrap();
            repo.record_stats(&question, &record);
        }

        let stats = repo.stats_for(sid(), fixture::question_id(1));
        assert_eq!(stats.total_answers, 2);
        assert_eq!(stats.correct_answers, 1);
        assert_eq!(stats.option_counts.len(), 2);
        assert!(stats
            .option_counts
            .iter()
            .all(|c| c.count == 1));
    }

    #[test]
    fn batch_flush_due_by_size_or_interval() {
        let mut repo = AnswerRepo::new();
        let interval = Duration::from_millis(200);
        let t0 = Instant::now();
        let mut session = live_session();
        let record = AnswerRepo::prepare_submission(
            &mut session,
            pid(1),
            fixture::question_id(1),
            vec![fixture::option_id(1)],
            15_000,
        )
        .unwrap();

        repo.push_retry(vec![record.clone()]);
        // Not due yet: under the size threshold and inside the interval.
        assert!(repo.take_due(t0, interval, 50).is_none());
        // Due by size.
        assert_eq!(repo.take_due(t0, interval, 1).unwrap().len(), 1);

        // Due by interval; failed batches return for retry.
        repo.push_retry(vec![record]);
        let due = repo.take_due(t0 + Duration::from_millis(250), interval, 50);
        assert_eq!(due.unwrap().len(), 1);
    }
}
