// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The entire session runtime of one process: a single actor owning every
//! repo, ticking timers, and bridging the async store, bus, and scoring
//! worker.

use crate::answer::AnswerRepo;
use crate::client::{Audience, ClientRepo, ConnectionId};
use crate::liveboard::LiveboardRepo;
use crate::metric::{MetricRepo, SharedScoringMetrics};
use crate::options::RuntimeConfig;
use crate::quiz_service::QuizStore;
use crate::recovery;
use crate::scoring::ScoringHandle;
use crate::session::{
    elimination_percentage, select_eliminated, LiveSession, ParticipantState, PreparedTransition,
    SessionRepo, TransitionIntent, FINALIZE_TIMEOUT, LEASE_REFRESH, LEASE_TTL,
};
use actix::{
    Actor, ActorFutureExt, AsyncContext, Context as ActorContext, ContextFutureSpawner, Handler,
    Message, WrapFuture,
};
use core_protocol::dto::{ParticipantDto, QuestionDto, SessionState};
use core_protocol::error::CoreError;
use core_protocol::id::{ParticipantId, QuestionId, Role, SessionId};
use core_protocol::rpc::{
    ControllerRequest, LeaderboardMessage, ParticipantRequest, ScoringMessage,
    SessionEventMessage, Update,
};
use core_protocol::UnixTime;
use log::{debug, error, info, warn};
use server_util::clock::Clock;
use server_util::generate_id::generate_id_64;
use server_util::pubsub::{BusMessage, PubSubBus, Topic, TopicPattern, LAG_WATERMARK};
use server_util::rate_limiter::RateLimiter;
use server_util::retry::{predicate, retry_with_backoff, RetryOptions};
use server_util::store::SessionStore;
use server_util::store_schema::{ParticipantRecord, SessionRecord};
use std::collections::HashSet;
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Drives timers and housekeeping.
pub const TICK_PERIOD: Duration = Duration::from_millis(250);
/// Budget for the answer-ingest store writes.
const INGEST_TIMEOUT: Duration = Duration::from_secs(2);
/// Budget for assembling a recovery payload that needs the store.
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// The entire session runtime of one process.
pub struct Infrastructure {
    pub(crate) config: RuntimeConfig,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) quizzes: Arc<dyn QuizStore>,
    pub(crate) bus: Arc<dyn PubSubBus>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) sessions: SessionRepo,
    pub(crate) clients: ClientRepo,
    pub(crate) answers: AnswerRepo,
    pub(crate) liveboard: LiveboardRepo,
    pub(crate) metrics: MetricRepo,
    pub(crate) scoring_metrics: Arc<SharedScoringMetrics>,
    pub(crate) scoring: ScoringHandle,
    pub(crate) status: crate::status::StatusRepo,
    adopt_rate_limiter: RateLimiter,
    ping_rate_limiter: RateLimiter,
    last_update: Instant,
}

impl Actor for Infrastructure {
    type Context = ActorContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("infrastructure started (owner {})", self.sessions.owner_id);
        ctx.set_mailbox_capacity(64);
        ctx.run_interval(TICK_PERIOD, Self::update);

        // Leaderboard deltas arrive over the bus (possibly from a scoring
        // worker in another process) and fan out to rooms from here.
        let bus = self.bus.clone();
        let addr = ctx.address();
        tokio::spawn(async move {
            let mut receiver = match bus.subscribe(TopicPattern::Leaderboard).await {
                Ok(receiver) => receiver,
                Err(e) => {
                    error!("could not subscribe to leaderboard topic: {}", e);
                    return;
                }
            };
            while let Some(message) = receiver.recv().await {
                if receiver.len() > LAG_WATERMARK {
                    warn!("leaderboard subscriber lagging: {} queued", receiver.len());
                }
                addr.do_send(BusUpdate(message));
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        error!("infrastructure stopped");

        // A process without this actor running should be restarted.
        process::exit(1);
    }
}

impl Infrastructure {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeConfig,
        store: Arc<dyn SessionStore>,
        quizzes: Arc<dyn QuizStore>,
        bus: Arc<dyn PubSubBus>,
        clock: Arc<dyn Clock>,
        scoring: ScoringHandle,
        scoring_metrics: Arc<SharedScoringMetrics>,
        clients: ClientRepo,
        status: crate::status::StatusRepo,
    ) -> Self {
        let owner_id = format!("owner-{}", generate_id_64());
        Self {
            config,
            store,
            quizzes,
            bus,
            clock,
            sessions: SessionRepo::new(owner_id),
            clients,
            answers: AnswerRepo::new(),
            liveboard: LiveboardRepo::new(),
            metrics: MetricRepo::new(),
            scoring_metrics,
            scoring,
            status,
            adopt_rate_limiter: RateLimiter::new(LEASE_REFRESH, 0),
            ping_rate_limiter: RateLimiter::new(Duration::from_secs(5), 0),
            last_update: Instant::now(),
        }
    }

    /// Called once per tick.
    fn update(&mut self, ctx: &mut ActorContext<Self>) {
        let now = Instant::now();
        if now.duration_since(self.last_update) < TICK_PERIOD / 2 {
            return;
        }
        self.last_update = now;
        let now_ms = self.clock.now_ms();

        self.clients.prune();
        self.tick_sessions(now_ms, ctx);
        self.flush_answer_batch(now, ctx);
        self.broadcast_due_leaderboards(now);
        self.adopt_orphans(ctx);
        self.ping_dependencies(ctx);
    }

    fn tick_sessions(&mut self, now_ms: UnixTime, ctx: &mut ActorContext<Self>) {
        let mut expiring = Vec::new();
        let mut timer_ticks = Vec::new();
        let mut lease_due = Vec::new();
        let mut evictions = Vec::new();

        for (&sid, session) in self.sessions.sessions.iter_mut() {
            // Owner lease keep-alive.
            let refresh_due = session
                .last_lease_refresh
                .map(|at| at.elapsed() >= LEASE_REFRESH)
                .unwrap_or(true);
            if refresh_due {
                session.last_lease_refresh = Some(Instant::now());
                lease_due.push(sid);
            }

            if session.state() == SessionState::ActiveQuestion {
                if let Some(deadline) = session.deadline_ms {
                    if now_ms >= deadline {
                        expiring.push(sid);
                    } else {
                        // 1 Hz countdown, deduplicated per second.
                        let remaining_s = ((deadline - now_ms) + 999) as u32 / 1000;
                        if session.last_timer_broadcast_s != Some(remaining_s) {
                            session.last_timer_broadcast_s = Some(remaining_s);
                            timer_ticks.push((sid, remaining_s));
                        }
                    }
                }
            }

            if let Some(evict_at) = session.evict_at_ms {
                if now_ms >= evict_at {
                    let question_ids: Vec<QuestionId> = session
                        .quiz
                        .questions
                        .iter()
                        .map(|q| q.question_id)
                        .collect();
                    evictions.push((sid, session.record.join_code, question_ids));
                }
            }
        }

        for (sid, remaining_seconds) in timer_ticks {
            self.clients.broadcast(
                sid,
                Update::TimerTick { remaining_seconds },
                Audience::All,
                &mut self.metrics,
            );
        }

        for sid in expiring {
            self.initiate_transition(sid, TransitionIntent::EndQuestion, None, ctx);
        }

        for sid in lease_due {
            let store = self.store.clone();
            let owner = self.sessions.owner_id.clone();
            async move { store.refresh_owner_lease(sid, &owner, LEASE_TTL).await }
                .into_actor(self)
                .map(move |result, act, ctx| match result {
                    Ok(true) => {}
                    Ok(false) => act.lease_lost(sid, ctx),
                    Err(e) => warn!("lease refresh errored for {:?}: {}", sid, e),
                })
                .spawn(ctx);
        }

        for (sid, join_code, question_ids) in evictions {
            info!("evicting session {:?}", sid);
            self.sessions.sessions.remove(&sid);
            self.clients.close_room(sid);
            self.liveboard.forget(sid);
            self.answers.forget_session(sid);
            let store = self.store.clone();
            async move { store.evict_session(sid, join_code, &question_ids).await }
                .into_actor(self)
                .map(move |result, _act, _ctx| {
                    if let Err(e) = result {
                        warn!("eviction of {:?} failed: {}", sid, e);
                    }
                })
                .spawn(ctx);
        }
    }

    /// The owner lease could not be refreshed. Try to get it back; failing
    /// that, this process must not keep driving timers.
    fn lease_lost(&mut self, sid: SessionId, ctx: &mut ActorContext<Self>) {
        if !self.sessions.sessions.contains_key(&sid) {
            return;
        }
        warn!("lost owner lease for {:?}, attempting reacquisition", sid);
        let store = self.store.clone();
        let owner = self.sessions.owner_id.clone();
        async move {
            retry_with_backoff(
                || async {
                    match store.acquire_owner_lease(sid, &owner, LEASE_TTL).await {
                        Ok(true) => Ok(()),
                        Ok(false) => Err(CoreError::StateConflict),
                        Err(e) => Err(e),
                    }
                },
                RetryOptions::new("lease reacquisition").max_retries(3),
                predicate::always(),
            )
            .await
        }
        .into_actor(self)
        .map(move |result, act, _ctx| {
            if result.is_err() {
                error!(
                    "unable to reacquire owner lease for {:?}; aborting to avoid split brain",
                    sid
                );
                process::exit(1);
            }
            if let Some(session) = act.sessions.get_mut(sid) {
                session.last_lease_refresh = Some(Instant::now());
            }
        })
        .spawn(ctx);
    }

    fn flush_answer_batch(&mut self, now: Instant, ctx: &mut ActorContext<Self>) {
        let Some(batch) =
            self.answers
                .take_due(now, self.config.batch_interval, self.config.batch_size)
        else {
            return;
        };
        let store = self.store.clone();
        async move {
            match tokio::time::timeout(INGEST_TIMEOUT, store.batch_insert_answers(&batch)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err((batch, e)),
                Err(_) => Err((batch, CoreError::StorageTimeout("batch insert".to_owned()))),
            }
        }
        .into_actor(self)
        .map(|result, act, _ctx| {
            if let Err((batch, e)) = result {
                warn!("answer batch flush failed ({} rows): {}", batch.len(), e);
                act.answers.push_retry(batch);
            }
        })
        .spawn(ctx);
    }

    fn broadcast_due_leaderboards(&mut self, now: Instant) {
        for (sid, rankings) in self.liveboard.take_due(now) {
            self.clients.broadcast(
                sid,
                Update::LeaderboardUpdated { rankings },
                Audience::All,
                &mut self.metrics,
            );
        }
    }

    /// Scans for live sessions whose owner lease lapsed (crashed process)
    /// and takes them over, restoring timers from the stored record.
    fn adopt_orphans(&mut self, ctx: &mut ActorContext<Self>) {
        if self.adopt_rate_limiter.should_limit_rate() {
            return;
        }
        let store = self.store.clone();
        let quizzes = self.quizzes.clone();
        let owner = self.sessions.owner_id.clone();
        let owned: HashSet<SessionId> = self.sessions.sessions.keys().copied().collect();

        async move { scan_orphans(store, quizzes, owner, owned).await }
            .into_actor(self)
            .map(|bundles, act, _ctx| {
                for bundle in bundles {
                    act.adopt_session(bundle);
                }
            })
            .spawn(ctx);
    }

    fn adopt_session(&mut self, bundle: AdoptedSession) {
        let sid = bundle.record.session_id;
        info!(
            "adopting session {:?} in state {:?}",
            sid, bundle.record.state
        );
        let mut participants = Vec::with_capacity(bundle.participants.len());
        for record in bundle.participants {
            let mut state = ParticipantState::new(record);
            if bundle.answered.contains(&state.record.participant_id) {
                if let Some(qid) = bundle.current_question {
                    state.answered.insert(qid);
                }
            }
            participants.push(state);
        }
        let mut session = LiveSession::adopt(bundle.record, bundle.quiz, participants);
        session.last_lease_refresh = Some(Instant::now());
        if session.state() == SessionState::Ended {
            // Resume the eviction countdown.
            session.evict_at_ms = Some(
                session.record.ended_at.unwrap_or(self.clock.now_ms())
                    + self.config.session_idle_ttl.as_millis() as u64,
            );
        }
        self.sessions.sessions.insert(sid, session);
    }

    fn ping_dependencies(&mut self, ctx: &mut ActorContext<Self>) {
        if self.ping_rate_limiter.should_limit_rate() {
            return;
        }
        let store = self.store.clone();
        async move {
            let started = Instant::now();
            let result = store.ping().await;
            (result, started.elapsed())
        }
        .into_actor(self)
        .map(|(result, elapsed), act, _ctx| {
            if let Some(dependency) = act.status.health.dependency_mut("redis") {
                dependency.record_ping(result.map(|_| elapsed).map_err(|_| ()));
            }
        })
        .spawn(ctx);
    }

    // ---- Participant lifecycle ----

    /// A joined participant (HTTP) becomes part of the owned session.
    pub(crate) fn participant_joined(&mut self, record: ParticipantRecord) {
        let sid = record.session_id;
        let dto = participant_dto(&record);
        if let Some(session) = self.sessions.get_mut(sid) {
            session
                .participants
                .insert(record.participant_id, ParticipantState::new(record));
        }
        self.clients
            .broadcast(sid, Update::ParticipantJoined(dto), Audience::All, &mut self.metrics);
    }

    pub(crate) fn participant_connected(&mut self, sid: SessionId, pid: ParticipantId) {
        let Some(session) = self.sessions.get_mut(sid) else { return };
        let Some(participant) = session.participant_mut(pid) else { return };
        let was_active = participant.record.is_active;
        participant.record.is_active = true;
        let dto = participant_dto(&participant.record);

        if !was_active {
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(e) = store.set_participant_active(pid, true).await {
                    warn!("could not persist active flag for {:?}: {}", pid, e);
                }
            });
            self.clients.broadcast(
                sid,
                Update::ParticipantJoined(dto),
                Audience::Observers,
                &mut self.metrics,
            );
        }
    }

    pub(crate) fn participant_disconnected(&mut self, sid: SessionId, pid: ParticipantId) {
        let Some(session) = self.sessions.get_mut(sid) else { return };
        let Some(participant) = session.participant_mut(pid) else { return };
        participant.record.is_active = false;

        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.set_participant_active(pid, false).await {
                warn!("could not persist active flag for {:?}: {}", pid, e);
            }
        });
        self.clients.broadcast(
            sid,
            Update::ParticipantLeft {
                participant_id: pid,
            },
            Audience::Observers,
            &mut self.metrics,
        );
    }

    // ---- Requests from websockets ----

    pub(crate) fn handle_participant_request(
        &mut self,
        key: ConnectionId,
        request: ParticipantRequest,
        ctx: &mut ActorContext<Self>,
    ) {
        match request {
            ParticipantRequest::SubmitAnswer {
                question_id,
                selected_option_ids,
            } => self.submit_answer(key, question_id, selected_option_ids, ctx),
            ParticipantRequest::ReconnectSession {
                session_id,
                participant_id,
                session_token,
                last_known_question_id: _,
            } => self.recover_participant(key, session_id, participant_id, session_token, ctx),
            ParticipantRequest::Heartbeat => {}
        }
    }

    fn submit_answer(
        &mut self,
        key: ConnectionId,
        question_id: QuestionId,
        selected_option_ids: Vec<core_protocol::id::OptionId>,
        ctx: &mut ActorContext<Self>,
    ) {
        let Some(connection) = self.clients.connection(key) else { return };
        let sid = connection.session_id;
        let Some(pid) = connection.participant_id else {
            self.reject_answer(key, Some(question_id), &CoreError::Forbidden);
            return;
        };

        let now_ms = self.clock.now_ms();
        let Some(session) = self.sessions.get_mut(sid) else {
            self.reject_answer(key, Some(question_id), &CoreError::SessionNotFound);
            return;
        };

        let record = match AnswerRepo::prepare_submission(
            session,
            pid,
            question_id,
            selected_option_ids,
            now_ms,
        ) {
            Ok(record) => record,
            Err(e) => {
                self.reject_answer(key, Some(question_id), &e);
                return;
            }
        };

        let question = session
            .current_question()
            .cloned()
            .expect("validated by prepare_submission");
        let seq = record.answer_id.0.get() >> 48;
        self.answers.record_stats(&question, &record);
        self.metrics.answers_accepted.increment();

        // Ack right away; the buffered copy is authoritative from here on.
        self.clients.send_to(
            key,
            Update::AnswerAccepted(core_protocol::dto::AnswerAcceptedDto {
                answer_id: record.answer_id,
                response_time_ms: record.response_time_ms,
            }),
            &mut self.metrics,
        );

        let store = self.store.clone();
        let bus = self.bus.clone();
        let retry_record = record.clone();
        let scoring_message = ScoringMessage {
            answer_id: record.answer_id,
            participant_id: pid,
            question_id,
            session_id: sid,
            ts: now_ms,
        };
        async move {
            let work = async {
                if !store
                    .claim_answer(sid, question_id, pid, record.answer_id)
                    .await?
                {
                    // Another process already holds a claim; the in-memory
                    // gate should have caught this, keep the first record.
                    warn!(
                        "store claim lost for {:?}/{:?}, dropping duplicate row",
                        pid, question_id
                    );
                    return Ok(None);
                }
                store.append_answer(&record).await?;
                store.bump_answer_seq(pid, seq + 1).await?;
                store
                    .buffer_answer_for_scoring(sid, question_id, record.answer_id)
                    .await?;
                let payload = serde_json::to_vec(&scoring_message)
                    .map_err(|e| CoreError::Internal(e.to_string()))?;
                bus.publish(Topic::Scoring(sid), payload).await?;
                Ok(Some(record))
            };
            match tokio::time::timeout(INGEST_TIMEOUT, work).await {
                Ok(result) => result,
                Err(_) => Err(CoreError::StorageTimeout("answer ingest".to_owned())),
            }
        }
        .into_actor(self)
        .map(move |result: Result<_, CoreError>, act, _ctx| {
            if let Err(e) = result {
                // The ack stands; the accumulator retries the durable row.
                // Scoring catches up from the buffer at finalization.
                error!("answer ingest write failed: {}", e);
                act.answers.push_retry(vec![retry_record]);
            }
        })
        .spawn(ctx);
    }

    fn reject_answer(&mut self, key: ConnectionId, question_id: Option<QuestionId>, e: &CoreError) {
        self.metrics.answers_rejected.increment();
        if matches!(e, CoreError::DuplicateAnswer) {
            self.metrics.duplicate_answers.increment();
        }
        self.clients.send_to(
            key,
            Update::AnswerRejected {
                question_id,
                reason: e.code().to_owned(),
                message: e.user_message().to_owned(),
            },
            &mut self.metrics,
        );
    }

    fn recover_participant(
        &mut self,
        key: ConnectionId,
        session_id: SessionId,
        participant_id: ParticipantId,
        session_token: core_protocol::id::SessionToken,
        ctx: &mut ActorContext<Self>,
    ) {
        let now_ms = self.clock.now_ms();
        match recovery::recover(
            &self.sessions,
            &self.liveboard,
            session_id,
            participant_id,
            session_token,
            now_ms,
        ) {
            Ok(dto) => {
                self.metrics.recoveries.increment();
                self.participant_connected(session_id, participant_id);
                self.clients
                    .send_to(key, Update::SessionRecovered(dto), &mut self.metrics);
            }
            Err(CoreError::SessionNotFound) => {
                // Not owned here; decide between gone and expired from the
                // store before failing the client.
                let store = self.store.clone();
                let idle_ttl = self.config.session_idle_ttl.as_millis() as u64;
                async move {
                    let work = async {
                        if let Some(record) = store.get_session(session_id).await? {
                            return Ok(if record.state == SessionState::Ended {
                                CoreError::SessionEnded
                            } else {
                                // Live but owned elsewhere; the client should
                                // reconnect through the right server.
                                CoreError::SessionNotFound
                            });
                        }
                        match store.get_participant(participant_id).await? {
                            Some(participant)
                                if participant.joined_at + idle_ttl < now_ms =>
                            {
                                Ok(CoreError::SessionExpired)
                            }
                            _ => Ok(CoreError::SessionNotFound),
                        }
                    };
                    match tokio::time::timeout(RECOVERY_TIMEOUT, work).await {
                        Ok(result) => result,
                        Err(_) => Err(CoreError::StorageTimeout("recovery".to_owned())),
                    }
                }
                .into_actor(self)
                .map(move |result: Result<CoreError, CoreError>, act, _ctx| {
                    let e = result.unwrap_or_else(|e| e);
                    act.fail_recovery(key, &e);
                })
                .spawn(ctx);
            }
            Err(e) => self.fail_recovery(key, &e),
        }
    }

    fn fail_recovery(&mut self, key: ConnectionId, e: &CoreError) {
        self.metrics.recovery_failures.increment();
        self.clients.send_to(
            key,
            Update::RecoveryFailed {
                reason: e.code().to_owned(),
                message: e.user_message().to_owned(),
            },
            &mut self.metrics,
        );
    }

    pub(crate) fn handle_controller_request(
        &mut self,
        key: ConnectionId,
        request: ControllerRequest,
        ctx: &mut ActorContext<Self>,
    ) {
        let Some((role, sid)) = self
            .clients
            .connection(key)
            .map(|c| (c.role, c.session_id))
        else {
            return;
        };
        if role != Role::Controller {
            self.send_error(key, &CoreError::Forbidden);
            return;
        }

        match request {
            ControllerRequest::StartSession => {
                self.initiate_transition(sid, TransitionIntent::StartSession, Some(key), ctx)
            }
            ControllerRequest::EndQuestion => {
                self.initiate_transition(sid, TransitionIntent::EndQuestion, Some(key), ctx)
            }
            ControllerRequest::NextQuestion => {
                self.initiate_transition(sid, TransitionIntent::NextQuestion, Some(key), ctx)
            }
            ControllerRequest::PauseQuestion => {
                self.initiate_transition(sid, TransitionIntent::PauseQuestion, Some(key), ctx)
            }
            ControllerRequest::ResumeQuestion => {
                self.initiate_transition(sid, TransitionIntent::ResumeQuestion, Some(key), ctx)
            }
            ControllerRequest::EndSession => {
                self.initiate_transition(sid, TransitionIntent::EndSession, Some(key), ctx)
            }
            ControllerRequest::KickParticipant { participant_id } => {
                self.remove_participant(sid, participant_id, false)
            }
            ControllerRequest::BanParticipant { participant_id } => {
                self.remove_participant(sid, participant_id, true)
            }
        }
    }

    fn send_error(&mut self, key: ConnectionId, e: &CoreError) {
        self.clients.send_to(
            key,
            Update::Error(e.to_dto(None, cfg!(not(debug_assertions)))),
            &mut self.metrics,
        );
    }

    fn remove_participant(&mut self, sid: SessionId, pid: ParticipantId, ban: bool) {
        let Some(session) = self.sessions.get_mut(sid) else { return };
        let Some(participant) = session.participant_mut(pid) else { return };

        let parting = if ban {
            participant.record.is_banned = true;
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(e) = store.set_participant_banned(pid).await {
                    warn!("could not persist ban for {:?}: {}", pid, e);
                }
            });
            Update::Banned {
                message: "you have been removed from this session".to_owned(),
            }
        } else {
            Update::Kicked {
                message: "you have been removed by the host".to_owned(),
            }
        };

        self.clients
            .disconnect_participant(sid, pid, parting, &mut self.metrics);
        self.clients.broadcast(
            sid,
            Update::ParticipantLeft {
                participant_id: pid,
            },
            Audience::Observers,
            &mut self.metrics,
        );
    }

    // ---- State machine orchestration ----

    pub(crate) fn initiate_transition(
        &mut self,
        sid: SessionId,
        intent: TransitionIntent,
        requester: Option<ConnectionId>,
        ctx: &mut ActorContext<Self>,
    ) {
        let now_ms = self.clock.now_ms();
        let prepared = match self.sessions.prepare_transition(sid, intent, now_ms) {
            Ok(prepared) => prepared,
            Err(e) => {
                if let Some(key) = requester {
                    self.send_error(key, &e);
                }
                return;
            }
        };

        if let Some(session) = self.sessions.get_mut(sid) {
            session.transition_in_flight = true;
        }

        let store = self.store.clone();
        let expected = prepared.expected;
        let update = prepared.update.clone();
        async move { store.cas_session_state(sid, expected, &update).await }
            .into_actor(self)
            .map(move |result, act, ctx| {
                if let Some(session) = act.sessions.get_mut(sid) {
                    session.transition_in_flight = false;
                }
                match result {
                    Ok(true) => act.finish_transition(sid, prepared, ctx),
                    Ok(false) => act.transition_conflict(sid, requester, ctx),
                    Err(e) => {
                        error!("transition CAS failed for {:?}: {}", sid, e);
                        if let Some(key) = requester {
                            act.send_error(key, &e);
                        }
                    }
                }
            })
            .spawn(ctx);
    }

    fn finish_transition(
        &mut self,
        sid: SessionId,
        prepared: PreparedTransition,
        ctx: &mut ActorContext<Self>,
    ) {
        let now_ms = self.clock.now_ms();
        let Some(new_state) =
            self.sessions
                .apply_transition(sid, &prepared, now_ms, self.config.session_idle_ttl)
        else {
            return;
        };
        debug!("session {:?} -> {:?}", sid, new_state);
        self.publish_session_event(sid, ctx);

        match prepared.intent {
            TransitionIntent::StartSession | TransitionIntent::NextQuestion
                if new_state == SessionState::ActiveQuestion =>
            {
                let Some(session) = self.sessions.get(sid) else { return };
                let Some(question) = session.current_question() else { return };
                let update = Update::QuestionStarted {
                    question_index: session.record.current_question_index as u32,
                    question: QuestionDto::from(question),
                };
                self.clients
                    .broadcast(sid, update, Audience::All, &mut self.metrics);
            }
            TransitionIntent::NextQuestion | TransitionIntent::EndSession => {
                // ENDED (next-after-last or admin stop).
                if prepared.intent == TransitionIntent::EndSession {
                    // Cancels pending timers (deadline cleared in apply) and
                    // in-flight scoring for the session.
                    self.scoring.cancel(sid);
                }
                self.clients
                    .broadcast(sid, Update::SessionEnded, Audience::All, &mut self.metrics);
            }
            TransitionIntent::EndQuestion => {
                let Some(qid) = prepared.closing_question else { return };
                self.request_finalize(sid, qid, ctx);
            }
            TransitionIntent::PauseQuestion => {
                let remaining = prepared.update.paused_remaining_ms.unwrap_or(0);
                self.clients.broadcast(
                    sid,
                    Update::TimerPaused {
                        remaining_seconds: ((remaining + 999) / 1000) as u32,
                    },
                    Audience::All,
                    &mut self.metrics,
                );
            }
            TransitionIntent::ResumeQuestion => {
                let remaining = self
                    .sessions
                    .get(sid)
                    .map(|s| s.remaining_ms(now_ms))
                    .unwrap_or(0);
                self.clients.broadcast(
                    sid,
                    Update::TimerResumed {
                        remaining_seconds: ((remaining + 999) / 1000) as u32,
                    },
                    Audience::All,
                    &mut self.metrics,
                );
            }
            TransitionIntent::StartSession => {}
        }
    }

    /// Asks the scoring worker to settle the question, then reveals it.
    fn request_finalize(&mut self, sid: SessionId, qid: QuestionId, ctx: &mut ActorContext<Self>) {
        // Get pending answers out the door before the drain.
        if let Some(batch) = self.answers.take_due(Instant::now(), Duration::ZERO, 1) {
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(e) = store.batch_insert_answers(&batch).await {
                    warn!("pre-finalize batch flush failed: {}", e);
                }
            });
        }

        let scoring = self.scoring.clone();
        async move { scoring.finalize(sid, qid, FINALIZE_TIMEOUT).await }
            .into_actor(self)
            .map(move |acked, act, _ctx| {
                if !acked {
                    warn!(
                        "scoring finalize timed out for {:?}/{:?}; revealing with stale stats",
                        sid, qid
                    );
                }
                act.reveal_question(sid, qid, !acked);
            })
            .spawn(ctx);
    }

    fn reveal_question(&mut self, sid: SessionId, qid: QuestionId, stats_incomplete: bool) {
        let Some(session) = self.sessions.get(sid) else { return };
        let percentage = elimination_percentage(&session.quiz);
        let Some(question) = session.quiz.questions.iter().find(|q| q.question_id == qid)
        else {
            return;
        };
        let update = Update::AnswerRevealed {
            question_id: qid,
            correct_option_ids: question.correct_option_ids(),
            stats: self.answers.stats_for(sid, qid),
            stats_incomplete,
        };
        self.clients
            .broadcast(sid, update, Audience::All, &mut self.metrics);
        self.liveboard.mark_urgent(sid);

        // Elimination quizzes cut the bottom of the field at every reveal.
        if let Some(percentage) = percentage {
            self.eliminate_bottom(sid, percentage);
        }
    }

    fn eliminate_bottom(&mut self, sid: SessionId, percentage: u8) {
        let Some(session) = self.sessions.get_mut(sid) else { return };
        let eliminated = select_eliminated(&session.participants, percentage);
        if eliminated.is_empty() {
            return;
        }
        for &pid in &eliminated {
            if let Some(participant) = session.participant_mut(pid) {
                participant.record.is_eliminated = true;
            }
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(e) = store.set_participant_eliminated(pid, true).await {
                    warn!("could not persist elimination for {:?}: {}", pid, e);
                }
            });
        }
        info!("session {:?}: eliminated {} participants", sid, eliminated.len());
        self.clients.broadcast(
            sid,
            Update::ParticipantEliminated {
                participant_ids: eliminated,
            },
            Audience::All,
            &mut self.metrics,
        );
    }

    /// A CAS was rejected: some other driver advanced the state. Reread and
    /// accept their version.
    fn transition_conflict(
        &mut self,
        sid: SessionId,
        requester: Option<ConnectionId>,
        ctx: &mut ActorContext<Self>,
    ) {
        self.metrics.state_conflicts.increment();
        if let Some(key) = requester {
            self.send_error(key, &CoreError::StateConflict);
        }
        let store = self.store.clone();
        async move { store.get_session(sid).await }
            .into_actor(self)
            .map(move |result, act, _ctx| match result {
                Ok(Some(record)) => act.resync_session(sid, record),
                Ok(None) => {
                    // Session vanished underneath us; drop it locally.
                    act.sessions.sessions.remove(&sid);
                    act.clients.close_room(sid);
                }
                Err(e) => warn!("conflict reread failed for {:?}: {}", sid, e),
            })
            .spawn(ctx);
    }

    fn resync_session(&mut self, sid: SessionId, record: SessionRecord) {
        let now_ms = self.clock.now_ms();
        let idle_ttl = self.config.session_idle_ttl;
        let Some(session) = self.sessions.get_mut(sid) else { return };
        session.record = record;
        session.last_timer_broadcast_s = None;
        session.deadline_ms = None;
        if session.record.state == SessionState::ActiveQuestion
            && session.record.paused_remaining_ms.is_none()
        {
            if let (Some(started_at), Some(question)) =
                (session.record.question_started_at, session.current_question())
            {
                session.deadline_ms = Some(started_at + question.time_limit_ms());
            }
        }
        if session.record.state == SessionState::Ended && session.evict_at_ms.is_none() {
            session.evict_at_ms =
                Some(session.record.ended_at.unwrap_or(now_ms) + idle_ttl.as_millis() as u64);
        }
    }

    fn publish_session_event(&mut self, sid: SessionId, ctx: &mut ActorContext<Self>) {
        let Some(session) = self.sessions.get(sid) else { return };
        let event = SessionEventMessage {
            session_id: sid,
            state: session.record.state,
            current_question_index: session.record.current_question_index,
            at: self.clock.now_ms(),
        };
        let bus = self.bus.clone();
        async move {
            if let Ok(payload) = serde_json::to_vec(&event) {
                if let Err(e) = bus.publish(Topic::SessionEvents(sid), payload).await {
                    debug!("session event publish failed: {}", e);
                }
            }
        }
        .into_actor(self)
        .map(|_, _, _| {})
        .spawn(ctx);
    }
}

fn participant_dto(record: &ParticipantRecord) -> ParticipantDto {
    ParticipantDto {
        participant_id: record.participant_id,
        nickname: record.nickname,
        is_active: record.is_active,
        is_eliminated: record.is_eliminated,
        is_spectator: record.is_spectator,
        total_score: record.total_score,
        joined_at: record.joined_at,
    }
}

/// One adopted session's worth of state, loaded off-actor.
pub struct AdoptedSession {
    pub record: SessionRecord,
    pub quiz: Arc<core_protocol::quiz::Quiz>,
    pub participants: Vec<ParticipantRecord>,
    pub current_question: Option<QuestionId>,
    /// Participants that already answered the current question.
    pub answered: Vec<ParticipantId>,
}

async fn scan_orphans(
    store: Arc<dyn SessionStore>,
    quizzes: Arc<dyn QuizStore>,
    owner: String,
    owned: HashSet<SessionId>,
) -> Vec<AdoptedSession> {
    let mut adopted = Vec::new();
    let live = match store.live_sessions().await {
        Ok(live) => live,
        Err(e) => {
            debug!("orphan scan skipped: {}", e);
            return adopted;
        }
    };
    for sid in live {
        if owned.contains(&sid) {
            continue;
        }
        match store.acquire_owner_lease(sid, &owner, LEASE_TTL).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                debug!("lease probe failed for {:?}: {}", sid, e);
                continue;
            }
        }
        match load_session(&store, &quizzes, sid).await {
            Ok(Some(bundle)) => adopted.push(bundle),
            Ok(None) => {
                let _ = store.release_owner_lease(sid, &owner).await;
            }
            Err(e) => {
                warn!("could not load orphaned session {:?}: {}", sid, e);
                let _ = store.release_owner_lease(sid, &owner).await;
            }
        }
    }
    adopted
}

async fn load_session(
    store: &Arc<dyn SessionStore>,
    quizzes: &Arc<dyn QuizStore>,
    sid: SessionId,
) -> Result<Option<AdoptedSession>, CoreError> {
    let Some(record) = store.get_session(sid).await? else {
        return Ok(None);
    };
    let quiz = quizzes.get_quiz(record.quiz_id).await?;
    let mut participants = Vec::new();
    for pid in store.session_participants(sid).await? {
        if let Some(participant) = store.get_participant(pid).await? {
            participants.push(participant);
        }
    }
    let current_question = usize::try_from(record.current_question_index)
        .ok()
        .and_then(|i| quiz.questions.get(i))
        .map(|q| q.question_id);
    let answered = match current_question {
        Some(qid) if record.state == SessionState::ActiveQuestion => {
            store.answer_claims(sid, qid).await?
        }
        _ => Vec::new(),
    };
    Ok(Some(AdoptedSession {
        record,
        quiz,
        participants,
        current_question,
        answered,
    }))
}

/// A message forwarded from the pub/sub bus.
#[derive(Message)]
#[rtype(result = "()")]
pub struct BusUpdate(pub BusMessage);

impl Handler<BusUpdate> for Infrastructure {
    type Result = ();

    fn handle(&mut self, msg: BusUpdate, _ctx: &mut ActorContext<Self>) {
        match msg.0.topic {
            Topic::Leaderboard(sid) => {
                match serde_json::from_slice::<LeaderboardMessage>(&msg.0.payload) {
                    Ok(message) => self.liveboard.put(sid, message.rankings),
                    Err(e) => warn!("undecodable leaderboard message: {}", e),
                }
            }
            other => debug!("ignoring bus message on {}", other),
        }
    }
}
