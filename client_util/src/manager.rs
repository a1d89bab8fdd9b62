// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The assembled reconnection manager: a reconnecting websocket bound to the
//! quiz protocol plus the persisted credential blob. UIs subscribe to status
//! changes and poll [`ReconnectionManager::update`] from their frame loop.

use crate::apply::Apply;
use crate::reconn_web_socket::{ConnectionStatus, ReconnWebSocket};
use crate::session_storage::{SessionStorage, StoredSession};
use crate::subscriber::SubscriptionHandle;
use core_protocol::rpc::{ParticipantRequest, Request, Update};
use core_protocol::web_socket::WebSocketProtocol;
use core_protocol::UnixTime;

/// Recovery failures after which rejoining is the only option; stored
/// credentials are cleared so the join screen comes back.
const TERMINAL_RECOVERY_REASONS: [&str; 2] = ["SESSION_EXPIRED", "SESSION_ENDED"];

pub struct ReconnectionManager<S: Apply<Update>> {
    socket: ReconnWebSocket<Update, Request, S>,
    storage: SessionStorage,
    credentials: StoredSession,
}

impl<S: Apply<Update>> ReconnectionManager<S> {
    /// Opens the participant channel with saved credentials. The preamble is
    /// a `reconnect_session`, sent on every fresh transport connection, so
    /// the server rebuilds this client's exact view.
    pub fn new(server_url: &str, credentials: StoredSession) -> Self {
        let storage = SessionStorage::new();
        let host = Self::web_socket_url(server_url, &credentials);
        let preamble = Self::preamble(&credentials, &storage);
        Self {
            socket: ReconnWebSocket::new(&host, WebSocketProtocol::Json, Some(preamble)),
            storage,
            credentials,
        }
    }

    fn web_socket_url(server_url: &str, credentials: &StoredSession) -> String {
        format!(
            "{}/ws?session_id={}&participant_id={}&session_token={}&role=participant",
            server_url.trim_end_matches('/'),
            credentials.session_id.0,
            credentials.participant_id.0,
            credentials.session_token.0,
        )
    }

    fn preamble(credentials: &StoredSession, storage: &SessionStorage) -> Request {
        Request::Participant(ParticipantRequest::ReconnectSession {
            session_id: credentials.session_id,
            participant_id: credentials.participant_id,
            session_token: credentials.session_token,
            last_known_question_id: storage.last_known_question(),
        })
    }

    /// Drives reconnection and returns the updates to apply. Housekeeping
    /// happens here: credential refresh while connected, question tracking,
    /// and clearing stored data when the server says goodbye for good.
    pub fn update(&mut self, now_ms: UnixTime) -> Vec<Update> {
        let updates = self.socket.update(now_ms);

        for update in &updates {
            match update {
                Update::QuestionStarted { question, .. } => {
                    self.storage.set_last_known_question(question.question_id);
                    // Reflect progress in the next reconnect request.
                    let preamble = Self::preamble(&self.credentials, &self.storage);
                    self.socket.reset_preamble(preamble);
                }
                Update::Kicked { .. } | Update::Banned { .. } | Update::SessionEnded => {
                    self.storage.clear();
                }
                Update::RecoveryFailed { reason, .. }
                    if TERMINAL_RECOVERY_REASONS.contains(&reason.as_str()) =>
                {
                    self.storage.clear();
                }
                _ => {}
            }
        }

        match self.socket.status() {
            ConnectionStatus::Connected => {
                // Keep the blob's five-minute window rolling while live.
                self.storage.save(self.credentials.clone(), now_ms);
            }
            ConnectionStatus::Disconnected => {
                // Server-initiated close: don't come back uninvited.
                self.storage.clear();
            }
            _ => {}
        }

        updates
    }

    pub fn status(&self) -> ConnectionStatus {
        self.socket.status()
    }

    pub fn on_status_change(
        &self,
        callback: impl FnMut(&ConnectionStatus) + 'static,
    ) -> SubscriptionHandle<ConnectionStatus> {
        self.socket.on_status_change(callback)
    }

    /// Manual retry from the failure screen; restarts the backoff schedule.
    pub fn retry(&mut self, now_ms: UnixTime) {
        self.socket.retry(now_ms);
    }

    pub fn send(&mut self, request: Request) {
        self.socket.send(request);
    }

    pub fn state(&self) -> &S {
        self.socket.state()
    }

    pub fn state_mut(&mut self) -> &mut S {
        self.socket.state_mut()
    }
}
