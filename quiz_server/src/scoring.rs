// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scoring: a pure points computation plus the worker that consumes scoring
//! messages, updates participants atomically, and maintains the leaderboard.

use crate::metric::SharedScoringMetrics;
use crate::quiz_service::QuizStore;
use core_protocol::dto::LeaderboardEntryDto;
use core_protocol::error::CoreError;
use core_protocol::id::{AnswerId, OptionId, ParticipantId, QuestionId, SessionId};
use core_protocol::quiz::{ExamSettings, Question, QuestionType, Quiz};
use core_protocol::rpc::{LeaderboardMessage, ScoringMessage};
use log::{debug, error, warn};
use server_util::clock::Clock;
use server_util::pubsub::{PubSubBus, Topic, TopicPattern};
use server_util::store::SessionStore;
use server_util::store_schema::AnswerRecord;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Upper bound for one scoring work unit.
const SCORING_TIMEOUT: Duration = Duration::from_secs(5);
/// Scored answers are re-written to the durable log in batches.
const SCORED_BATCH_SIZE: usize = 50;
const SCORED_BATCH_INTERVAL: Duration = Duration::from_millis(500);

/// Everything the scoring formula produces. Deterministic: identical inputs
/// yield identical values bit for bit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreBreakdown {
    /// Rounded sum of all components; may be negative under negative marking.
    pub total: i64,
    pub is_correct: bool,
    pub new_streak: u32,
    /// Correctness points, including partial credit.
    pub base: f64,
    pub speed_bonus: f64,
    pub streak_bonus: f64,
    pub negative: f64,
    pub speed_bonus_applied: bool,
    pub streak_bonus_applied: bool,
    pub partial_credit_applied: bool,
}

/// Computes the points for one answer.
///
/// * MC/TF: set equality with the correct options.
/// * MULTI without partial credit: exact set equality.
/// * MULTI with partial credit: any incorrect pick voids the answer;
///   a strict subset earns `|S|/|C|` of the base, not counted correct.
/// * Speed bonus only on correct answers, linear in remaining time.
/// * Streak bonus from the second consecutive correct answer.
/// * Negative marking deducts a percentage of base on incorrect answers
///   (the caller clamps the participant's running total at zero).
pub fn score_answer(
    question: &Question,
    exam: Option<ExamSettings>,
    selected: &[OptionId],
    response_time_ms: u64,
    previous_streak: u32,
) -> ScoreBreakdown {
    let correct_set: HashSet<OptionId> = question
        .options
        .iter()
        .filter(|o| o.is_correct)
        .map(|o| o.option_id)
        .collect();
    let selected_set: HashSet<OptionId> = selected.iter().copied().collect();

    let scoring = question.scoring;
    let base_points = scoring.base_points as f64;

    let exact = !selected_set.is_empty() && selected_set == correct_set;
    let (base, is_correct, partial_credit_applied) = match question.question_type {
        QuestionType::Mc | QuestionType::Tf => (if exact { base_points } else { 0.0 }, exact, false),
        QuestionType::Multi if scoring.partial_credit_enabled => {
            if exact {
                (base_points, true, false)
            } else if selected_set.is_empty()
                || !selected_set.is_subset(&correct_set)
                || correct_set.is_empty()
            {
                (0.0, false, false)
            } else {
                let fraction = selected_set.len() as f64 / correct_set.len() as f64;
                (fraction * base_points, false, true)
            }
        }
        QuestionType::Multi => (if exact { base_points } else { 0.0 }, exact, false),
    };

    let (speed_bonus, speed_bonus_applied) = if is_correct && scoring.speed_bonus_multiplier > 0.0 {
        let time_factor = 1.0 - response_time_ms as f64 / question.time_limit_ms() as f64;
        let bonus = (base_points * scoring.speed_bonus_multiplier * time_factor).max(0.0);
        (bonus, bonus > 0.0)
    } else {
        (0.0, false)
    };

    let new_streak = if is_correct { previous_streak + 1 } else { 0 };
    let (streak_bonus, streak_bonus_applied) = if is_correct && new_streak >= 2 {
        (base_points * 0.1 * (new_streak - 1) as f64, true)
    } else {
        (0.0, false)
    };

    let negative = match exam {
        Some(settings) if settings.negative_marking_enabled && !is_correct => {
            base_points * settings.negative_marking_percentage as f64 / 100.0
        }
        _ => 0.0,
    };

    ScoreBreakdown {
        total: (base + speed_bonus + streak_bonus - negative).round() as i64,
        is_correct,
        new_streak,
        base,
        speed_bonus,
        streak_bonus,
        negative,
        speed_bonus_applied,
        streak_bonus_applied,
        partial_credit_applied,
    }
}

/// Commands from the state machine to the worker.
pub enum ScoringCommand {
    /// Drain the question's buffer, score stragglers, publish the final
    /// leaderboard, then ack.
    Finalize {
        session_id: SessionId,
        question_id: QuestionId,
        ack: oneshot::Sender<()>,
    },
    /// Stop scoring a session (admin ended it).
    Cancel { session_id: SessionId },
}

/// Cheap handle held by the infrastructure actor.
#[derive(Clone)]
pub struct ScoringHandle {
    sender: mpsc::UnboundedSender<ScoringCommand>,
}

impl ScoringHandle {
    /// Returns true when the worker acknowledged within `timeout`; false
    /// means the caller proceeds with the last known leaderboard and marks
    /// stats incomplete.
    pub async fn finalize(
        &self,
        session_id: SessionId,
        question_id: QuestionId,
        timeout: Duration,
    ) -> bool {
        let (ack, ack_rx) = oneshot::channel();
        if self
            .sender
            .send(ScoringCommand::Finalize {
                session_id,
                question_id,
                ack,
            })
            .is_err()
        {
            return false;
        }
        tokio::time::timeout(timeout, ack_rx).await.map(|r| r.is_ok()).unwrap_or(false)
    }

    pub fn cancel(&self, session_id: SessionId) {
        let _ = self.sender.send(ScoringCommand::Cancel { session_id });
    }
}

/// Consumes `scoring:*`, computes points, and maintains participant scores
/// and the leaderboard. One per process; safe to run more (the idempotence
/// marker serializes per `(participant, question)`).
pub struct ScoringWorker {
    store: Arc<dyn SessionStore>,
    quizzes: Arc<dyn QuizStore>,
    bus: Arc<dyn PubSubBus>,
    clock: Arc<dyn Clock>,
    metrics: Arc<SharedScoringMetrics>,
    leaderboard_size: usize,
    quiz_cache: HashMap<SessionId, Arc<Quiz>>,
    cancelled: HashSet<SessionId>,
    scored_batch: Vec<AnswerRecord>,
}

impl ScoringWorker {
    pub fn new(
        store: Arc<dyn SessionStore>,
        quizzes: Arc<dyn QuizStore>,
        bus: Arc<dyn PubSubBus>,
        clock: Arc<dyn Clock>,
        metrics: Arc<SharedScoringMetrics>,
        leaderboard_size: usize,
    ) -> Self {
        Self {
            store,
            quizzes,
            bus,
            clock,
            metrics,
            leaderboard_size,
            quiz_cache: HashMap::new(),
            cancelled: HashSet::new(),
            scored_batch: Vec::new(),
        }
    }

    /// Spawns the worker loop and returns its command handle.
    pub fn spawn(mut self) -> ScoringHandle {
        let (sender, mut commands) = mpsc::unbounded_channel();
        let handle = ScoringHandle { sender };

        tokio::spawn(async move {
            let mut messages = match self.bus.subscribe(TopicPattern::Scoring).await {
                Ok(messages) => messages,
                Err(e) => {
                    error!("scoring worker could not subscribe: {}", e);
                    return;
                }
            };
            let mut flush = tokio::time::interval(SCORED_BATCH_INTERVAL);
            flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    command = commands.recv() => {
                        match command {
                            Some(command) => self.handle_command(command).await,
                            None => break,
                        }
                    }
                    message = messages.recv() => {
                        let Some(message) = message else { break };
                        if let Ok(scoring) = serde_json::from_slice::<ScoringMessage>(&message.payload) {
                            self.handle_message(scoring).await;
                        } else {
                            warn!("undecodable scoring message on {}", message.topic);
                        }
                    }
                    _ = flush.tick() => {
                        self.flush_scored_batch().await;
                    }
                }
            }
            self.flush_scored_batch().await;
        });

        handle
    }

    async fn handle_command(&mut self, command: ScoringCommand) {
        match command {
            ScoringCommand::Finalize {
                session_id,
                question_id,
                ack,
            } => {
                self.finalize_question(session_id, question_id).await;
                let _ = ack.send(());
            }
            ScoringCommand::Cancel { session_id } => {
                self.cancelled.insert(session_id);
                self.quiz_cache.remove(&session_id);
                self.scored_batch.retain(|a| a.session_id != session_id);
                if self.cancelled.len() > 4096 {
                    self.cancelled.clear();
                }
            }
        }
    }

    pub(crate) async fn handle_message(&mut self, message: ScoringMessage) {
        if self.cancelled.contains(&message.session_id) {
            return;
        }
        let started = self.clock.now_ms();
        let work = self.score_one(
            message.session_id,
            message.question_id,
            message.answer_id,
            message.participant_id,
        );
        match tokio::time::timeout(SCORING_TIMEOUT, work).await {
            Ok(Ok(())) => {
                self.metrics.answers_scored.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .record_latency(self.clock.now_ms().saturating_sub(started) as f32);
                if let Err(e) = self.publish_leaderboard(message.session_id).await {
                    warn!("leaderboard publish failed for {:?}: {}", message.session_id, e);
                }
            }
            Ok(Err(e)) => {
                // Keep the participant's last valid snapshot and move on; the
                // answer row is stored and can be re-scored from the buffer.
                self.metrics.scoring_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    "scoring failed (session={:?} question={:?} answer={:?} participant={:?}): {}",
                    message.session_id,
                    message.question_id,
                    message.answer_id,
                    message.participant_id,
                    e
                );
            }
            Err(_) => {
                self.metrics.scoring_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    "scoring timed out (session={:?} answer={:?})",
                    message.session_id, message.answer_id
                );
            }
        }
    }

    /// Scores a single answer. Idempotent: re-processing a scored answer id
    /// is a no-op thanks to the per-question marker.
    pub(crate) async fn score_one(
        &mut self,
        session_id: SessionId,
        question_id: QuestionId,
        answer_id: AnswerId,
        participant_id: ParticipantId,
    ) -> Result<(), CoreError> {
        if let Some(marker) = self.store.get_scored_marker(participant_id, question_id).await? {
            if marker == answer_id {
                debug!("answer {:?} already scored, skipping", answer_id);
                return Ok(());
            }
        }

        let participant = self
            .store
            .get_participant(participant_id)
            .await?
            .ok_or(CoreError::ParticipantNotFound)?;
        let quiz = self.quiz(session_id).await?;
        let question = quiz
            .questions
            .iter()
            .find(|q| q.question_id == question_id)
            .ok_or_else(|| CoreError::ScoringFailed("question not in quiz".to_owned()))?;
        let mut answer = self
            .store
            .get_answer(session_id, answer_id)
            .await?
            .ok_or_else(|| CoreError::ScoringFailed("answer record missing".to_owned()))?;

        let breakdown = score_answer(
            question,
            question.effective_exam_settings(&quiz),
            &answer.selected_option_ids,
            answer.response_time_ms,
            participant.streak_count,
        );

        // Final total never goes below zero, even under negative marking.
        let new_total = (participant.total_score as i64 + breakdown.total).max(0) as u64;
        let new_time = participant.total_time_ms + answer.response_time_ms;

        self.store
            .update_participant_score(
                participant_id,
                new_total,
                new_time,
                breakdown.total,
                breakdown.new_streak,
            )
            .await?;
        // Marker written after the score so a crash in between re-scores
        // rather than silently skipping.
        self.store
            .set_scored_marker(participant_id, question_id, answer_id)
            .await?;

        let leaderboard_score = new_total as f64 - new_time as f64 * 1e-9;
        self.store
            .upsert_leaderboard(session_id, participant_id, leaderboard_score)
            .await?;

        answer.scored = true;
        answer.is_correct = breakdown.is_correct;
        answer.points_awarded = breakdown.total;
        answer.speed_bonus_applied = breakdown.speed_bonus_applied;
        answer.streak_bonus_applied = breakdown.streak_bonus_applied;
        answer.partial_credit_applied = breakdown.partial_credit_applied;
        self.scored_batch.push(answer);
        if self.scored_batch.len() >= SCORED_BATCH_SIZE {
            self.flush_scored_batch().await;
        }

        Ok(())
    }

    /// Drains the question's buffer, scoring anything the pub/sub path
    /// missed, then publishes the final leaderboard.
    pub(crate) async fn finalize_question(&mut self, session_id: SessionId, question_id: QuestionId) {
        match self.store.drain_answer_buffer(session_id, question_id).await {
            Ok(answer_ids) => {
                for answer_id in answer_ids {
                    let participant_id = match self.store.get_answer(session_id, answer_id).await {
                        Ok(Some(answer)) => answer.participant_id,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!("finalize could not load answer {:?}: {}", answer_id, e);
                            continue;
                        }
                    };
                    if let Err(e) = self
                        .score_one(session_id, question_id, answer_id, participant_id)
                        .await
                    {
                        self.metrics.scoring_failures.fetch_add(1, Ordering::Relaxed);
                        error!(
                            "finalize scoring failed (answer={:?} participant={:?}): {}",
                            answer_id, participant_id, e
                        );
                    }
                }
            }
            Err(e) => warn!("finalize could not drain buffer: {}", e),
        }
        self.flush_scored_batch().await;
        if let Err(e) = self.publish_leaderboard(session_id).await {
            warn!("final leaderboard publish failed: {}", e);
        }
    }

    async fn flush_scored_batch(&mut self) {
        if self.scored_batch.is_empty() {
            return;
        }
        // On failure the batch stays put for the next attempt.
        if let Err(e) = self.store.batch_insert_answers(&self.scored_batch).await {
            warn!("scored batch flush failed ({} answers): {}", self.scored_batch.len(), e);
            return;
        }
        self.scored_batch.clear();
    }

    async fn quiz(&mut self, session_id: SessionId) -> Result<Arc<Quiz>, CoreError> {
        if let Some(quiz) = self.quiz_cache.get(&session_id) {
            return Ok(Arc::clone(quiz));
        }
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(CoreError::SessionNotFound)?;
        let quiz = self.quizzes.get_quiz(session.quiz_id).await?;
        self.quiz_cache.insert(session_id, Arc::clone(&quiz));
        Ok(quiz)
    }

    pub(crate) async fn publish_leaderboard(&mut self, session_id: SessionId) -> Result<(), CoreError> {
        let top = self
            .store
            .get_leaderboard(session_id, self.leaderboard_size)
            .await?;
        let mut rankings = Vec::with_capacity(top.len());
        for (rank0, (participant_id, _score)) in top.into_iter().enumerate() {
            let Some(participant) = self.store.get_participant(participant_id).await? else {
                continue;
            };
            rankings.push(LeaderboardEntryDto {
                rank: rank0 as u32 + 1,
                participant_id,
                nickname: participant.nickname,
                total_score: participant.total_score,
                total_time_ms: participant.total_time_ms,
            });
        }
        let message = LeaderboardMessage {
            session_id,
            rankings,
            updated_at: self.clock.now_ms(),
        };
        let payload = serde_json::to_vec(&message)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        self.bus.publish(Topic::Leaderboard(session_id), payload).await
    }
}

#[cfg(test)]
mod test {
    use crate::metric::SharedScoringMetrics;
    use crate::quiz_service::{fixture, InMemoryQuizStore};
    use crate::scoring::{score_answer, ScoringWorker};
    use core_protocol::id::{AnswerId, OptionId, ParticipantId, QuestionId, SessionId};
    use core_protocol::quiz::QuestionType;
    use server_util::clock::ManualClock;
    use server_util::pubsub::LocalPubSub;
    use server_util::store::{MemorySessionStore, SessionStore};
    use server_util::store_schema::{AnswerRecord, ParticipantRecord, SessionRecord};
    use std::num::{NonZeroU32, NonZeroU64};
    use std::sync::Arc;

    fn oid(n: u32) -> OptionId {
        fixture::option_id(n)
    }

    fn mc_question(base: u32, multiplier: f64) -> core_protocol::quiz::Question {
        fixture::question(
            1,
            QuestionType::Mc,
            30,
            vec![fixture::option(1, true), fixture::option(2, false)],
            fixture::scoring(base, multiplier, false),
        )
    }

    fn multi_question(base: u32, partial: bool) -> core_protocol::quiz::Question {
        fixture::question(
            2,
            QuestionType::Multi,
            30,
            vec![
                fixture::option(1, true),
                fixture::option(2, true),
                fixture::option(3, true),
                fixture::option(4, false),
            ],
            fixture::scoring(base, 0.0, partial),
        )
    }

    #[test]
    fn base_correct() {
        // S1: no bonuses configured.
        let b = score_answer(&mc_question(100, 0.0), None, &[oid(1)], 5000, 0);
        assert_eq!(b.total, 100);
        assert!(b.is_correct);
        assert_eq!(b.new_streak, 1);
        assert!(!b.speed_bonus_applied && !b.streak_bonus_applied);
    }

    #[test]
    fn speed_bonus() {
        // S2: 100 + 100 * 0.5 * 0.9 = 145.
        let b = score_answer(&mc_question(100, 0.5), None, &[oid(1)], 3000, 0);
        assert_eq!(b.total, 145);
        assert!(b.speed_bonus_applied);
    }

    #[test]
    fn streak_bonus() {
        // S3: streak 2 -> 3 adds 100 * 0.1 * 2 = 20.
        let b = score_answer(&mc_question(100, 0.0), None, &[oid(1)], 5000, 2);
        assert_eq!(b.total, 120);
        assert_eq!(b.new_streak, 3);
        assert!(b.streak_bonus_applied);
    }

    #[test]
    fn multi_partial_subset() {
        // S4: {o1,o2} of {o1,o2,o3} at 150 base -> 100, not correct.
        let b = score_answer(&multi_question(150, true), None, &[oid(1), oid(2)], 5000, 0);
        assert_eq!(b.total, 100);
        assert!(!b.is_correct);
        assert!(b.partial_credit_applied);
        assert_eq!(b.new_streak, 0);
    }

    #[test]
    fn multi_partial_invalid_pick() {
        // S5: any incorrect option voids the answer and resets the streak.
        let b = score_answer(&multi_question(150, true), None, &[oid(1), oid(4)], 5000, 4);
        assert_eq!(b.total, 0);
        assert!(!b.is_correct);
        assert!(!b.partial_credit_applied);
        assert_eq!(b.new_streak, 0);
    }

    #[test]
    fn multi_exact_without_partial() {
        let question = multi_question(200, false);
        let exact = score_answer(&question, None, &[oid(1), oid(2), oid(3)], 1000, 0);
        assert_eq!(exact.total, 200);
        assert!(exact.is_correct);

        let subset = score_answer(&question, None, &[oid(1), oid(2)], 1000, 0);
        assert_eq!(subset.total, 0);
        assert!(!subset.is_correct);
    }

    #[test]
    fn negative_marking() {
        let exam = Some(fixture::exam(50));
        let wrong = score_answer(&mc_question(100, 0.0), exam, &[oid(2)], 5000, 1);
        assert_eq!(wrong.total, -50);
        assert_eq!(wrong.new_streak, 0);

        let empty = score_answer(&mc_question(100, 0.0), exam, &[], 5000, 1);
        assert_eq!(empty.total, -50);

        let right = score_answer(&mc_question(100, 0.0), exam, &[oid(1)], 5000, 0);
        assert_eq!(right.total, 100);
    }

    #[test]
    fn speed_bonus_clamped_at_zero() {
        // Response time equals the limit: factor 0, no bonus, still correct.
        let b = score_answer(&mc_question(100, 0.5), None, &[oid(1)], 30_000, 0);
        assert_eq!(b.total, 100);
        assert!(!b.speed_bonus_applied);
    }

    #[test]
    fn deterministic() {
        let question = multi_question(150, true);
        let exam = Some(fixture::exam(25));
        let a = score_answer(&question, exam, &[oid(1), oid(2)], 12_345, 7);
        let b = score_answer(&question, exam, &[oid(1), oid(2)], 12_345, 7);
        assert_eq!(a, b);
        assert_eq!(a.base.to_bits(), b.base.to_bits());
        assert_eq!(a.speed_bonus.to_bits(), b.speed_bonus.to_bits());
    }

    // Worker-level behavior against the in-memory store.

    fn sid() -> SessionId {
        SessionId(NonZeroU64::new(11).unwrap())
    }

    fn pid(n: u64) -> ParticipantId {
        ParticipantId(NonZeroU64::new(n).unwrap())
    }

    fn aid(n: u64) -> AnswerId {
        AnswerId(NonZeroU64::new(n).unwrap())
    }

    fn qid(n: u32) -> QuestionId {
        QuestionId(NonZeroU32::new(n).unwrap())
    }

    async fn worker_fixture() -> (ScoringWorker, Arc<MemorySessionStore>) {
        let clock = ManualClock::new(1_000_000);
        let store = Arc::new(MemorySessionStore::new(clock.clone()));
        let quizzes = InMemoryQuizStore::new();
        quizzes.insert(fixture::quiz(1, vec![mc_question(100, 0.0)]));

        let record = SessionRecord {
            session_id: sid(),
            quiz_id: fixture::quiz_id(1),
            join_code: core_protocol::id::JoinCode::new("ZZZZZZ").unwrap(),
            state: core_protocol::dto::SessionState::ActiveQuestion,
            current_question_index: 0,
            question_started_at: Some(1_000_000),
            paused_remaining_ms: None,
            created_at: 999_000,
            ended_at: None,
            host_token: core_protocol::id::SessionToken(NonZeroU64::new(1).unwrap()),
        };
        store.put_session(&record).await.unwrap();

        let worker = ScoringWorker::new(
            store.clone(),
            quizzes,
            LocalPubSub::new(),
            clock,
            Arc::new(SharedScoringMetrics::default()),
            10,
        );
        (worker, store)
    }

    async fn seed_participant(store: &MemorySessionStore, n: u64, streak: u32) {
        store
            .put_participant(&ParticipantRecord {
                participant_id: pid(n),
                session_id: sid(),
                nickname: core_protocol::name::Nickname::new(&format!("p{}", n)).unwrap(),
                session_token: core_protocol::id::SessionToken(NonZeroU64::new(n + 100).unwrap()),
                is_active: true,
                is_eliminated: false,
                is_spectator: false,
                is_banned: false,
                total_score: 0,
                total_time_ms: 0,
                streak_count: streak,
                last_question_score: 0,
                answer_seq: 1,
                joined_at: 999_500,
            })
            .await
            .unwrap();
    }

    async fn seed_answer(store: &MemorySessionStore, n: u64, participant: u64, selected: Vec<OptionId>) {
        store
            .append_answer(&AnswerRecord {
                answer_id: aid(n),
                session_id: sid(),
                participant_id: pid(participant),
                question_id: qid(1),
                selected_option_ids: selected,
                submitted_at: 1_005_000,
                response_time_ms: 5000,
                scored: false,
                is_correct: false,
                points_awarded: 0,
                speed_bonus_applied: false,
                streak_bonus_applied: false,
                partial_credit_applied: false,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn scoring_is_idempotent_per_answer() {
        let (mut worker, store) = worker_fixture().await;
        seed_participant(&store, 1, 0).await;
        seed_answer(&store, 1, 1, vec![oid(1)]).await;

        worker.score_one(sid(), qid(1), aid(1), pid(1)).await.unwrap();
        // Re-delivery of the same scoring message must not double count.
        worker.score_one(sid(), qid(1), aid(1), pid(1)).await.unwrap();

        let participant = store.get_participant(pid(1)).await.unwrap().unwrap();
        assert_eq!(participant.total_score, 100);
        assert_eq!(participant.total_time_ms, 5000);
        assert_eq!(participant.streak_count, 1);
        assert_eq!(participant.last_question_score, 100);
    }

    #[tokio::test]
    async fn negative_total_clamped_at_zero() {
        let (mut worker, store) = worker_fixture().await;
        seed_participant(&store, 1, 0).await;
        seed_answer(&store, 1, 1, vec![oid(2)]).await;

        // Rebuild the quiz with negative marking at the quiz level.
        let quizzes = InMemoryQuizStore::new();
        let mut quiz = fixture::quiz(1, vec![mc_question(100, 0.0)]);
        quiz.exam_settings = Some(fixture::exam(50));
        quizzes.insert(quiz);
        worker.quizzes = quizzes;

        worker.score_one(sid(), qid(1), aid(1), pid(1)).await.unwrap();
        let participant = store.get_participant(pid(1)).await.unwrap().unwrap();
        assert_eq!(participant.total_score, 0);
        assert_eq!(participant.last_question_score, -50);
    }

    #[tokio::test]
    async fn finalize_scores_buffered_answers() {
        let (mut worker, store) = worker_fixture().await;
        seed_participant(&store, 1, 0).await;
        seed_participant(&store, 2, 0).await;
        seed_answer(&store, 1, 1, vec![oid(1)]).await;
        seed_answer(&store, 2, 2, vec![oid(2)]).await;
        store.buffer_answer_for_scoring(sid(), qid(1), aid(1)).await.unwrap();
        store.buffer_answer_for_scoring(sid(), qid(1), aid(2)).await.unwrap();

        worker.finalize_question(sid(), qid(1)).await;

        assert_eq!(store.get_participant(pid(1)).await.unwrap().unwrap().total_score, 100);
        assert_eq!(store.get_participant(pid(2)).await.unwrap().unwrap().total_score, 0);
        // Scored answers were re-written durably.
        let answer = store.get_answer(sid(), aid(1)).await.unwrap().unwrap();
        assert!(answer.scored && answer.is_correct);
        assert_eq!(answer.points_awarded, 100);
    }
}
