// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The HTTP/websocket edge. Sessions are joined over HTTP; everything live
//! happens on the websocket, which bridges into the infrastructure actor via
//! observer channels.

use crate::client::{Authenticate, ClientObserverMessage, ClientRepo, CreateSession, Join};
use crate::infrastructure::Infrastructure;
use crate::metric::SharedScoringMetrics;
use crate::options::{Options, RuntimeConfig};
use crate::quiz_service::{fixture, InMemoryQuizStore, QuizStore};
use crate::scoring::ScoringWorker;
use crate::status::{StatusRepo, StatusRequest};
use actix::{Actor, Addr};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bincode::Options as _;
use core_protocol::error::CoreError;
use core_protocol::get_unix_time_now;
use core_protocol::id::QuizId;
use core_protocol::quiz::QuestionType;
use core_protocol::rpc::{
    CreateSessionRequest, JoinRequest, Request, Update, WebSocketQuery,
};
use core_protocol::web_socket::WebSocketProtocol;
use core_protocol::UnixTime;
use futures::pin_mut;
use log::{debug, error, info, warn};
use server_util::clock::{Clock, SystemClock};
use server_util::health::Dependency;
use server_util::observer::{ObserverAddr, ObserverUpdate};
use server_util::pubsub::{LocalPubSub, PubSubBus, RedisPubSub};
use server_util::rate_limiter::{RateLimiterProps, RateLimiterState};
use server_util::store::{MemorySessionStore, RedisSessionStore, SessionStore};
use std::net::SocketAddr;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::{Duration, Instant};
use structopt::StructOpt;

const MAX_MESSAGE_SIZE: usize = 32 * 1024;

#[derive(Clone)]
struct AppState {
    srv: Addr<Infrastructure>,
    heartbeat: Duration,
}

pub fn entry_point() {
    let options = Options::from_args();

    let mut logger = env_logger::builder();
    logger.format_timestamp(None);
    logger.filter_module("quiz_server", options.debug_core);
    logger.filter_module("server_util", options.debug_core);
    logger.filter_module("quiz_server::entry_point", options.debug_sockets);
    logger.init();

    let config = RuntimeConfig::from(&options);

    let system = actix::System::new();
    system.block_on(async move {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let (store, bus): (Arc<dyn SessionStore>, Arc<dyn PubSubBus>) = if options.memory_store {
            info!("running on the in-memory store (single process)");
            (
                Arc::new(MemorySessionStore::new(clock.clone())),
                LocalPubSub::new(),
            )
        } else {
            let store = RedisSessionStore::new(&options.redis_url)
                .unwrap_or_else(|e| panic!("invalid redis url: {}", e));
            let bus = RedisPubSub::new(&options.redis_url)
                .unwrap_or_else(|e| panic!("invalid redis url: {}", e));
            (Arc::new(store), Arc::new(bus))
        };

        // Out of scope for the runtime: quiz definitions come from an
        // external authoring system through the QuizStore seam. Seed a demo
        // quiz so a fresh checkout can run end to end.
        let quizzes = InMemoryQuizStore::new();
        seed_demo_quiz(&quizzes);
        let quizzes: Arc<dyn QuizStore> = quizzes;

        let scoring_metrics = Arc::new(SharedScoringMetrics::default());
        let scoring = ScoringWorker::new(
            store.clone(),
            quizzes.clone(),
            bus.clone(),
            clock.clone(),
            scoring_metrics.clone(),
            config.leaderboard_size,
        )
        .spawn();

        let clients = ClientRepo::new(RateLimiterProps::new(
            Duration::from_secs(options.join_rate_limit_s.max(1)),
            options.join_burst,
        ));
        let status = StatusRepo::new(vec![Dependency::new("redis", true)]);

        let srv = Infrastructure::new(
            config.clone(),
            store,
            quizzes,
            bus,
            clock,
            scoring,
            scoring_metrics,
            clients,
            status,
        )
        .start();

        let state = AppState {
            srv,
            heartbeat: config.heartbeat_interval,
        };

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .route("/sessions", post(create_session_handler))
            .route("/sessions/join", post(join_handler))
            .route("/status", get(status_handler))
            .with_state(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], options.port));
        info!("listening on {}", addr);
        let server = axum::Server::bind(&addr)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>());

        if let Err(e) = server.await {
            error!("server stopped: {}", e);
        }
    });
}

fn seed_demo_quiz(quizzes: &InMemoryQuizStore) {
    let quiz = core_protocol::quiz::Quiz {
        quiz_id: QuizId(NonZeroU64::new(1).unwrap()),
        title: "Demo quiz".to_owned(),
        quiz_type: core_protocol::quiz::QuizType::Standard,
        exam_settings: None,
        questions: vec![
            fixture::question(
                1,
                QuestionType::Mc,
                30,
                vec![
                    fixture::option(1, false),
                    fixture::option(2, true),
                    fixture::option(3, false),
                ],
                fixture::scoring(100, 0.5, false),
            ),
            fixture::question(
                2,
                QuestionType::Tf,
                20,
                vec![fixture::option(4, true), fixture::option(5, false)],
                fixture::scoring(100, 0.0, false),
            ),
        ]
        .into(),
    };
    quizzes.insert(quiz);
}

fn error_response(e: &CoreError) -> Response {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let dto = e.to_dto(None, cfg!(not(debug_assertions)));
    (status, Json(dto)).into_response()
}

async fn join_handler(
    State(state): State<AppState>,
    addr: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<JoinRequest>,
) -> Response {
    let join = Join {
        ip: addr.map(|a| a.0.ip()),
        join_code: request.join_code,
        nickname: request.nickname,
    };
    match state.srv.send(join).await {
        Ok(Ok(response)) => Json(response).into_response(),
        Ok(Err(e)) => error_response(&e),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn create_session_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Response {
    match state
        .srv
        .send(CreateSession {
            quiz_id: request.quiz_id,
        })
        .await
    {
        Ok(Ok(response)) => Json(response).into_response(),
        Ok(Err(e)) => error_response(&e),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn status_handler(State(state): State<AppState>) -> Response {
    match state.srv.send(StatusRequest).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn ws_handler(
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
    addr: Option<ConnectInfo<SocketAddr>>,
    Query(query): Query<WebSocketQuery>,
) -> Response {
    let protocol = query.protocol.unwrap_or_default();
    let authenticate = Authenticate {
        ip: addr.map(|a| a.0.ip()),
        query,
    };

    match state.srv.send(authenticate).await {
        Ok(Ok(key)) => upgrade
            .max_frame_size(MAX_MESSAGE_SIZE)
            .max_message_size(MAX_MESSAGE_SIZE)
            .max_send_queue(32)
            .on_upgrade(move |web_socket| {
                handle_socket(web_socket, state, key, protocol)
            }),
        Ok(Err(e)) => error_response(&e),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn handle_socket(
    mut web_socket: WebSocket,
    state: AppState,
    key: crate::client::ConnectionId,
    mut protocol: WebSocketProtocol,
) {
    let heartbeat = state.heartbeat;
    let hard_timeout = heartbeat * 2;

    let (observer, mut receiver) = ObserverAddr::<Update>::channel();
    state.srv.do_send(ClientObserverMessage::Register {
        key,
        observer: observer.clone(),
    });

    let keep_alive = tokio::time::sleep(heartbeat);
    let mut last_activity = Instant::now();
    let mut rate_limiter = RateLimiterState::default();
    const RATE: RateLimiterProps = RateLimiterProps::const_new(Duration::from_millis(80), 5);

    pin_mut!(keep_alive);

    // What kind of close frame to send, if any.
    const NORMAL_CLOSURE: Option<u16> = Some(1000);
    const PROTOCOL_ERROR: Option<u16> = Some(1002);
    const SILENT_CLOSURE: Option<u16> = None;

    let closure = loop {
        tokio::select! {
            web_socket_update = web_socket.recv() => {
                match web_socket_update {
                    Some(Ok(message)) => {
                        last_activity = Instant::now();
                        keep_alive.as_mut().reset((last_activity + heartbeat).into());

                        match message {
                            Message::Binary(binary) => {
                                if rate_limiter.should_limit_rate_with_now(&RATE, last_activity) {
                                    observer.send(Update::RateLimitExceeded { retry_after_s: 1 });
                                    continue;
                                }
                                match bincode::DefaultOptions::new()
                                    .with_limit(MAX_MESSAGE_SIZE as u64)
                                    .with_fixint_encoding()
                                    .allow_trailing_bytes()
                                    .deserialize::<Request>(&binary)
                                {
                                    Ok(request) => {
                                        protocol = WebSocketProtocol::Binary;
                                        state.srv.do_send(ClientObserverMessage::Request { key, request });
                                    }
                                    Err(e) => {
                                        warn!("deserialize binary err ignored {}", e);
                                    }
                                }
                            }
                            Message::Text(text) => {
                                if rate_limiter.should_limit_rate_with_now(&RATE, last_activity) {
                                    observer.send(Update::RateLimitExceeded { retry_after_s: 1 });
                                    continue;
                                }
                                match serde_json::from_str::<Request>(&text) {
                                    Ok(request) => {
                                        protocol = WebSocketProtocol::Json;
                                        state.srv.do_send(ClientObserverMessage::Request { key, request });
                                    }
                                    Err(e) => {
                                        warn!("parse err ignored {}", e);
                                    }
                                }
                            }
                            Message::Ping(_) => {
                                // Axum sends the pong automatically.
                            }
                            Message::Pong(pong_data) => {
                                if let Ok(bytes) = pong_data.try_into() {
                                    let now = get_unix_time_now();
                                    let timestamp = UnixTime::from_ne_bytes(bytes);
                                    let rtt = now.saturating_sub(timestamp);
                                    if rtt < u16::MAX as UnixTime {
                                        state.srv.do_send(ClientObserverMessage::RoundTripTime {
                                            key,
                                            rtt: rtt as u16,
                                        });
                                    }
                                } else {
                                    debug!("received invalid pong data");
                                }
                            }
                            Message::Close(_) => {
                                debug!("received close from client");
                                // tungstenite echoes the close frame if necessary.
                                break SILENT_CLOSURE;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        debug!("web socket error: {:?}", e);
                        break PROTOCOL_ERROR;
                    }
                    None => {
                        // Web socket closed already.
                        break SILENT_CLOSURE;
                    }
                }
            },
            observer_update = receiver.recv() => {
                let Some(observer_update) = observer_update else {
                    // Infrastructure wants the websocket closed.
                    break NORMAL_CLOSURE;
                };
                match observer_update {
                    ObserverUpdate::Send { message } => {
                        let web_socket_message = match protocol {
                            WebSocketProtocol::Binary => {
                                match bincode::serialize(&message) {
                                    Ok(bytes) => Message::Binary(bytes),
                                    Err(e) => {
                                        error!("serialize err {}", e);
                                        continue;
                                    }
                                }
                            }
                            WebSocketProtocol::Json => {
                                match serde_json::to_string(&message) {
                                    Ok(text) => Message::Text(text),
                                    Err(e) => {
                                        error!("serialize err {}", e);
                                        continue;
                                    }
                                }
                            }
                        };
                        if web_socket.send(web_socket_message).await.is_err() {
                            break NORMAL_CLOSURE;
                        }
                    }
                    ObserverUpdate::Close => {
                        break NORMAL_CLOSURE;
                    }
                }
            },
            _ = keep_alive.as_mut() => {
                if last_activity.elapsed() < hard_timeout {
                    if web_socket
                        .send(Message::Ping(get_unix_time_now().to_ne_bytes().into()))
                        .await
                        .is_err()
                    {
                        break NORMAL_CLOSURE;
                    }
                    keep_alive.as_mut().reset((Instant::now() + heartbeat).into());
                } else {
                    debug!("closing unresponsive websocket");
                    break PROTOCOL_ERROR;
                }
            }
        }
    };

    state.srv.do_send(ClientObserverMessage::Unregister { key, observer });

    if let Some(code) = closure {
        let _ = web_socket
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: "".into(),
            })))
            .await;
    }
}
