// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Keeps track of live client transports a.k.a. websockets, and the edge
//! handlers that mint sessions and participants.

use crate::infrastructure::Infrastructure;
use crate::metric::MetricRepo;
use crate::session::{LiveSession, SessionRepo, LEASE_TTL};
use actix::{
    ActorFutureExt, Context as ActorContext, Handler, Message, ResponseActFuture, WrapFuture,
};
use core_protocol::error::CoreError;
use core_protocol::id::{JoinCode, ParticipantId, QuizId, Role, SessionId};
use core_protocol::name::Nickname;
use core_protocol::rpc::{
    CreateSessionResponse, JoinResponse, Request, Update, WebSocketQuery,
};
use log::{info, warn};
use server_util::generate_id::{generate_id_64, generate_session_token};
use server_util::ip_rate_limiter::IpRateLimiter;
use server_util::observer::{ObserverAddr, ObserverMessage};
use server_util::rate_limiter::RateLimiterProps;
use server_util::store_schema::{ParticipantRecord, SessionRecord};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Identifies one websocket for its lifetime.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ConnectionId(pub u64);

/// Inbound/outbound message types of the participant and controller channels.
pub type ClientObserverMessage = ObserverMessage<ConnectionId, Request, Update>;

/// A transport that authenticated but has not finished its upgrade yet.
struct PendingConnection {
    session_id: SessionId,
    participant_id: Option<ParticipantId>,
    role: Role,
    expiry: Instant,
}

/// A live transport.
pub struct Connection {
    pub addr: ObserverAddr<Update>,
    pub session_id: SessionId,
    pub participant_id: Option<ParticipantId>,
    pub role: Role,
}

/// Who a broadcast is for.
#[derive(Copy, Clone, Debug)]
pub enum Audience {
    All,
    /// Controller and bigscreen channels only.
    Observers,
    Participants,
}

impl Audience {
    fn includes(self, role: Role) -> bool {
        match self {
            Self::All => true,
            Self::Observers => matches!(role, Role::Controller | Role::Bigscreen),
            Self::Participants => matches!(role, Role::Participant),
        }
    }
}

/// The connection registry. Every operation is invoked from the owning actor,
/// so interior state needs no further locking; sends are non-blocking and a
/// slow client only ever loses its own frames.
pub struct ClientRepo {
    next_connection_id: u64,
    pending: HashMap<ConnectionId, PendingConnection>,
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<SessionId, HashSet<ConnectionId>>,
    authenticate_rate_limiter: IpRateLimiter,
    join_rate_limiter: IpRateLimiter,
}

impl ClientRepo {
    const PENDING_TTL: Duration = Duration::from_secs(10);

    pub fn new(join_limit: RateLimiterProps) -> Self {
        Self {
            next_connection_id: 0,
            pending: HashMap::new(),
            connections: HashMap::new(),
            rooms: HashMap::new(),
            authenticate_rate_limiter: IpRateLimiter::new(Duration::from_millis(500), 16),
            join_rate_limiter: join_limit.into(),
        }
    }

    /// Validates websocket credentials against the owned sessions and
    /// reserves a connection id for the upgrade.
    pub fn authenticate(
        &mut self,
        sessions: &SessionRepo,
        ip: Option<IpAddr>,
        query: &WebSocketQuery,
    ) -> Result<ConnectionId, CoreError> {
        if let Some(ip) = ip {
            if self.authenticate_rate_limiter.should_limit_rate(ip) {
                warn!("authenticate rate limited {:?}", ip);
                return Err(CoreError::RateLimited { retry_after_s: 1 });
            }
        }

        let session = sessions
            .get(query.session_id)
            .ok_or(CoreError::SessionNotFound)?;

        let participant_id = match query.role {
            Role::Participant => {
                let pid = query.participant_id.ok_or(CoreError::AuthFailed)?;
                let token = query.session_token.ok_or(CoreError::AuthFailed)?;
                let participant = session.participant(pid).ok_or(CoreError::AuthFailed)?;
                if participant.record.session_token != token {
                    return Err(CoreError::AuthFailed);
                }
                if participant.record.is_banned {
                    return Err(CoreError::ParticipantBanned);
                }
                Some(pid)
            }
            Role::Controller | Role::Bigscreen => {
                let token = query.session_token.ok_or(CoreError::AuthFailed)?;
                if session.record.host_token != token {
                    return Err(CoreError::AuthFailed);
                }
                None
            }
        };

        self.next_connection_id += 1;
        let key = ConnectionId(self.next_connection_id);
        self.pending.insert(
            key,
            PendingConnection {
                session_id: query.session_id,
                participant_id,
                role: query.role,
                expiry: Instant::now() + Self::PENDING_TTL,
            },
        );
        Ok(key)
    }

    /// Websocket upgrade finished; attach the observer.
    /// Returns the participant that (re)connected, if any.
    pub fn register(
        &mut self,
        key: ConnectionId,
        observer: ObserverAddr<Update>,
        metrics: &mut MetricRepo,
    ) -> Option<(SessionId, Option<ParticipantId>, Role)> {
        let pending = self.pending.remove(&key)?;
        let connection = Connection {
            addr: observer,
            session_id: pending.session_id,
            participant_id: pending.participant_id,
            role: pending.role,
        };
        let result = (pending.session_id, pending.participant_id, pending.role);

        connection.addr.send(Update::Authenticated {
            session_id: pending.session_id,
            participant_id: pending.participant_id,
            role: pending.role,
        });
        self.rooms.entry(pending.session_id).or_default().insert(key);
        self.connections.insert(key, connection);
        metrics.connections_opened.increment();
        Some(result)
    }

    /// Websocket dropped. Returns the participant that went inactive, if this
    /// was their last connection.
    pub fn unregister(
        &mut self,
        key: ConnectionId,
        observer: &ObserverAddr<Update>,
        metrics: &mut MetricRepo,
    ) -> Option<(SessionId, ParticipantId)> {
        // Handle the race where a reconnect replaced this key already.
        let connection = self.connections.get(&key)?;
        if !connection.addr.same_channel(observer) {
            return None;
        }
        let connection = self.connections.remove(&key).unwrap();
        metrics.connections_closed.increment();
        metrics.sends_dropped.add_multiple(connection.addr.dropped());
        if let Some(room) = self.rooms.get_mut(&connection.session_id) {
            room.remove(&key);
            if room.is_empty() {
                self.rooms.remove(&connection.session_id);
            }
        }

        let participant_id = connection.participant_id?;
        let still_connected = self.connections.values().any(|c| {
            c.session_id == connection.session_id && c.participant_id == Some(participant_id)
        });
        (!still_connected).then_some((connection.session_id, participant_id))
    }

    pub fn connection(&self, key: ConnectionId) -> Option<&Connection> {
        self.connections.get(&key)
    }

    /// Non-blocking targeted send.
    pub fn send_to(&self, key: ConnectionId, update: Update, metrics: &mut MetricRepo) {
        if let Some(connection) = self.connections.get(&key) {
            if connection.addr.send(update) {
                metrics.messages_sent.increment();
            } else {
                metrics.sends_dropped.increment();
            }
        }
    }

    /// Every connection of one participant (they may have several tabs).
    pub fn send_to_participant(
        &self,
        sid: SessionId,
        pid: ParticipantId,
        update: Update,
        metrics: &mut MetricRepo,
    ) {
        let Some(room) = self.rooms.get(&sid) else { return };
        for key in room {
            if let Some(connection) = self.connections.get(key) {
                if connection.participant_id == Some(pid) {
                    if connection.addr.send(update.clone()) {
                        metrics.messages_sent.increment();
                    } else {
                        metrics.sends_dropped.increment();
                    }
                }
            }
        }
    }

    /// Room fan-out. Slow clients drop frames individually; nothing blocks.
    pub fn broadcast(
        &self,
        sid: SessionId,
        update: Update,
        audience: Audience,
        metrics: &mut MetricRepo,
    ) {
        let Some(room) = self.rooms.get(&sid) else { return };
        for key in room {
            if let Some(connection) = self.connections.get(key) {
                if !audience.includes(connection.role) {
                    continue;
                }
                if connection.addr.send(update.clone()) {
                    metrics.messages_sent.increment();
                } else {
                    metrics.sends_dropped.increment();
                }
            }
        }
    }

    pub fn count_by_room(&self, sid: SessionId) -> usize {
        self.rooms.get(&sid).map(|r| r.len()).unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Closes every transport of a room (session evicted).
    pub fn close_room(&mut self, sid: SessionId) {
        if let Some(room) = self.rooms.remove(&sid) {
            for key in room {
                if let Some(connection) = self.connections.remove(&key) {
                    connection.addr.close();
                }
            }
        }
    }

    /// Sends a final update to a participant's connections and closes them.
    pub fn disconnect_participant(
        &mut self,
        sid: SessionId,
        pid: ParticipantId,
        parting: Update,
        metrics: &mut MetricRepo,
    ) {
        let Some(room) = self.rooms.get_mut(&sid) else { return };
        let keys: Vec<ConnectionId> = room
            .iter()
            .copied()
            .filter(|key| {
                self.connections
                    .get(key)
                    .map(|c| c.participant_id == Some(pid))
                    .unwrap_or(false)
            })
            .collect();
        for key in keys {
            room.remove(&key);
            if let Some(connection) = self.connections.remove(&key) {
                if connection.addr.send(parting.clone()) {
                    metrics.messages_sent.increment();
                }
                connection.addr.close();
            }
        }
    }

    /// Expires stale pending upgrades.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.pending.retain(|_, pending| pending.expiry > now);
    }

    fn should_limit_join(&mut self, ip: Option<IpAddr>) -> bool {
        match ip {
            Some(ip) => self.join_rate_limiter.should_limit_rate(ip),
            None => false,
        }
    }
}

/// Websocket upgrade asks for credentials to be checked.
#[derive(Message)]
#[rtype(result = "Result<ConnectionId, CoreError>")]
pub struct Authenticate {
    pub ip: Option<IpAddr>,
    pub query: WebSocketQuery,
}

impl Handler<Authenticate> for Infrastructure {
    type Result = Result<ConnectionId, CoreError>;

    fn handle(&mut self, msg: Authenticate, _ctx: &mut ActorContext<Self>) -> Self::Result {
        self.clients.authenticate(&self.sessions, msg.ip, &msg.query)
    }
}

/// `POST /sessions`: admin creates a live session for a quiz.
#[derive(Message)]
#[rtype(result = "Result<CreateSessionResponse, CoreError>")]
pub struct CreateSession {
    pub quiz_id: QuizId,
}

impl Handler<CreateSession> for Infrastructure {
    type Result = ResponseActFuture<Self, Result<CreateSessionResponse, CoreError>>;

    fn handle(&mut self, msg: CreateSession, _ctx: &mut ActorContext<Self>) -> Self::Result {
        let store = self.store.clone();
        let quizzes = self.quizzes.clone();
        let clock = self.clock.clone();
        let owner_id = self.sessions.owner_id.clone();

        Box::pin(
            async move {
                let quiz = quizzes.get_quiz(msg.quiz_id).await?;
                if quiz.questions.is_empty() {
                    return Err(CoreError::WrongState("quiz has no questions"));
                }

                let session_id = SessionId(generate_id_64());
                // Join codes are unique among live sessions; retry on the
                // rare collision.
                let join_code = loop {
                    let code = JoinCode::generate();
                    if store.claim_join_code(code, session_id).await? {
                        break code;
                    }
                };

                let record = SessionRecord {
                    session_id,
                    quiz_id: msg.quiz_id,
                    join_code,
                    state: core_protocol::dto::SessionState::Lobby,
                    current_question_index: -1,
                    question_started_at: None,
                    paused_remaining_ms: None,
                    created_at: clock.now_ms(),
                    ended_at: None,
                    host_token: generate_session_token(),
                };
                store.put_session(&record).await?;
                store.add_live_session(session_id).await?;
                if !store
                    .acquire_owner_lease(session_id, &owner_id, LEASE_TTL)
                    .await?
                {
                    // Freshly minted id; nobody else can hold it.
                    return Err(CoreError::Internal("could not lease new session".to_owned()));
                }

                Ok((record, quiz))
            }
            .into_actor(self)
            .map(|result, act, _ctx| {
                let (record, quiz) = result?;
                info!(
                    "session {:?} created with code {}",
                    record.session_id, record.join_code
                );
                let response = CreateSessionResponse {
                    session_id: record.session_id,
                    join_code: record.join_code,
                    host_token: record.host_token,
                };
                act.sessions
                    .sessions
                    .insert(record.session_id, LiveSession::new(record, quiz));
                Ok(response)
            }),
        )
    }
}

/// `POST /sessions/join`: a participant redeems a join code and nickname.
#[derive(Message)]
#[rtype(result = "Result<JoinResponse, CoreError>")]
pub struct Join {
    pub ip: Option<IpAddr>,
    pub join_code: String,
    pub nickname: String,
}

impl Handler<Join> for Infrastructure {
    type Result = ResponseActFuture<Self, Result<JoinResponse, CoreError>>;

    fn handle(&mut self, msg: Join, _ctx: &mut ActorContext<Self>) -> Self::Result {
        if self.clients.should_limit_join(msg.ip) {
            return Box::pin(actix::fut::ready(Err(CoreError::RateLimited {
                retry_after_s: 2,
            })));
        }
        let join_code = match JoinCode::new(&msg.join_code) {
            Some(code) => code,
            None => return Box::pin(actix::fut::ready(Err(CoreError::InvalidJoinCode))),
        };
        let nickname = match Nickname::new(&msg.nickname) {
            Ok(nickname) => nickname,
            Err(e) => {
                return Box::pin(actix::fut::ready(Err(CoreError::NicknameInvalid(
                    e.message(),
                ))))
            }
        };

        // Joins are routed to the session owner, so the code resolves against
        // the owned sessions; the store is only consulted to distinguish a
        // dead code from a session living on another server.
        let local = self
            .sessions
            .sessions
            .values()
            .find(|s| s.record.join_code == join_code)
            .map(|s| (s.record.session_id, s.state()));

        let Some((session_id, state)) = local else {
            let store = self.store.clone();
            return Box::pin(
                async move {
                    match store.lookup_join_code(join_code).await? {
                        None => Err(CoreError::InvalidJoinCode),
                        Some(sid) => match store.get_session(sid).await? {
                            Some(record)
                                if record.state == core_protocol::dto::SessionState::Ended =>
                            {
                                Err(CoreError::SessionEnded)
                            }
                            // Live, but owned by another server.
                            Some(_) => Err(CoreError::SessionNotFound),
                            None => Err(CoreError::InvalidJoinCode),
                        },
                    }
                }
                .into_actor(self)
                .map(|result: Result<JoinResponse, CoreError>, _act, _ctx| result),
            );
        };
        if state == core_protocol::dto::SessionState::Ended {
            return Box::pin(actix::fut::ready(Err(CoreError::SessionEnded)));
        }

        let record = ParticipantRecord {
            participant_id: ParticipantId(generate_id_64()),
            session_id,
            nickname,
            session_token: generate_session_token(),
            is_active: false,
            is_eliminated: false,
            is_spectator: false,
            is_banned: false,
            total_score: 0,
            total_time_ms: 0,
            streak_count: 0,
            last_question_score: 0,
            answer_seq: 1,
            joined_at: self.clock.now_ms(),
        };
        let store = self.store.clone();

        Box::pin(
            async move {
                if !store
                    .claim_nickname(
                        session_id,
                        &record.nickname.canonical(),
                        record.participant_id,
                    )
                    .await?
                {
                    return Err(CoreError::NicknameTaken);
                }
                store.put_participant(&record).await?;
                store
                    .add_participant_to_session(
                        session_id,
                        record.participant_id,
                        record.nickname.as_str(),
                    )
                    .await?;
                Ok(record)
            }
            .into_actor(self)
            .map(|result: Result<ParticipantRecord, CoreError>, act, _ctx| {
                let record = result?;
                act.metrics.joins.increment();
                let response = JoinResponse {
                    session_id: record.session_id,
                    participant_id: record.participant_id,
                    session_token: record.session_token,
                    nickname: record.nickname,
                };
                act.participant_joined(record);
                Ok(response)
            }),
        )
    }
}

/// Handle client websocket traffic.
impl Handler<ClientObserverMessage> for Infrastructure {
    type Result = ();

    fn handle(&mut self, msg: ClientObserverMessage, ctx: &mut ActorContext<Self>) {
        match msg {
            ObserverMessage::Register { key, observer } => {
                if let Some((session_id, Some(participant_id), Role::Participant)) =
                    self.clients.register(key, observer, &mut self.metrics)
                {
                    self.participant_connected(session_id, participant_id);
                }
            }
            ObserverMessage::Unregister { key, observer } => {
                if let Some((session_id, participant_id)) =
                    self.clients.unregister(key, &observer, &mut self.metrics)
                {
                    self.participant_disconnected(session_id, participant_id);
                }
            }
            ObserverMessage::Request { key, request } => match request {
                Request::Participant(request) => {
                    self.handle_participant_request(key, request, ctx)
                }
                Request::Controller(request) => {
                    self.handle_controller_request(key, request, ctx)
                }
            },
            ObserverMessage::RoundTripTime { key: _, rtt } => {
                self.metrics.rtt.push(rtt as f32);
            }
        }
    }
}
