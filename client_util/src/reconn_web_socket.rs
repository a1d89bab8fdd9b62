// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::apply::Apply;
use crate::backoff::Backoff;
use crate::subscriber::{Subscribers, SubscriptionHandle};
use crate::web_socket::ProtoWebSocket;
use core_protocol::web_socket::WebSocketProtocol;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Observable status of the reconnecting socket.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {
    Connected,
    /// Closed on purpose by the server (kick, ban, session over); no
    /// automatic reconnect. The UI should clear stored credentials.
    Disconnected,
    Reconnecting,
    /// Attempts exhausted; only a manual retry restarts the schedule.
    Failed,
}

/// Reconnectable websocket (generic over inbound, outbound, and state).
/// Transport-level drops reconnect with exponential backoff; on every fresh
/// connection the preamble (normally `reconnect_session`) is sent first so
/// the server can rebuild this client's view. Old state is preserved after
/// closing, but reset when a new connection delivers updates.
pub struct ReconnWebSocket<I, O, S> {
    inner: ProtoWebSocket<I, O>,
    state: S,
    host: String,
    /// Sent when opening a new socket, before anything else.
    preamble: Option<O>,
    backoff: Backoff,
    /// Time (ms) of the next reconnect attempt, if one is scheduled.
    next_try_ms: Option<u64>,
    status: ConnectionStatus,
    status_subscribers: Subscribers<ConnectionStatus>,
    /// Tracks whether the socket was closed, so state resets on reopen.
    was_closed: bool,
}

impl<I, O, S> ReconnWebSocket<I, O, S>
where
    I: 'static + DeserializeOwned,
    O: 'static + Serialize + Clone,
    S: Apply<I>,
{
    pub fn new(host: &str, protocol: WebSocketProtocol, preamble: Option<O>) -> Self {
        let mut inner = ProtoWebSocket::new(host, protocol);

        if let Some(preamble) = preamble.as_ref() {
            inner.send(preamble.clone());
        }

        Self {
            inner,
            state: S::default(),
            host: String::from(host),
            preamble,
            backoff: Backoff::default(),
            next_try_ms: None,
            status: ConnectionStatus::Reconnecting,
            status_subscribers: Subscribers::new(),
            was_closed: false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Whether reconnection attempts have been exhausted.
    pub fn is_terminated(&self) -> bool {
        matches!(self.status, ConnectionStatus::Failed)
    }

    /// Whether the server hung up on purpose (stored credentials should be
    /// cleared by the caller).
    pub fn is_server_disconnected(&self) -> bool {
        matches!(self.status, ConnectionStatus::Disconnected)
    }

    /// Notifies on every status change. Dropping the handle unsubscribes.
    pub fn on_status_change(
        &self,
        callback: impl FnMut(&ConnectionStatus) + 'static,
    ) -> SubscriptionHandle<ConnectionStatus> {
        self.status_subscribers.subscribe(callback)
    }

    /// Takes the current time in milliseconds and returns updates to apply.
    /// Automatically reconnects per the backoff schedule, and resets state
    /// when a new connection starts delivering.
    pub fn update(&mut self, time_ms: u64) -> Vec<I> {
        if self.inner.is_closed() {
            self.was_closed = true;
        } else if self.was_closed && self.inner.is_open() && self.inner.has_updates() {
            self.was_closed = false;
            // A new connection is live; stale state must not leak into it.
            self.state.reset();
        }

        self.step_status(time_ms);
        self.inner.receive_updates()
    }

    fn step_status(&mut self, time_ms: u64) {
        if self.inner.is_open() {
            self.backoff.reset();
            self.next_try_ms = None;
            self.set_status(ConnectionStatus::Connected);
        } else if self.inner.is_server_closed() {
            // Kick/ban/session over: don't fight the server.
            self.next_try_ms = None;
            self.set_status(ConnectionStatus::Disconnected);
        } else if self.inner.is_error() {
            match self.next_try_ms {
                None => match self.backoff.next_delay_ms() {
                    Some(delay) => {
                        self.next_try_ms = Some(time_ms + delay);
                        self.set_status(ConnectionStatus::Reconnecting);
                    }
                    None => self.set_status(ConnectionStatus::Failed),
                },
                Some(next_try) if time_ms >= next_try => {
                    self.next_try_ms = None;
                    self.reopen();
                }
                Some(_) => {}
            }
        }
    }

    fn reopen(&mut self) {
        self.inner = ProtoWebSocket::new(&self.host, self.inner.protocol());
        if let Some(preamble) = self.preamble.as_ref() {
            self.inner.send(preamble.clone());
        }
    }

    /// Manual retry: restarts the schedule even after `Failed` or a server
    /// disconnect.
    pub fn retry(&mut self, _time_ms: u64) {
        self.backoff.reset();
        self.next_try_ms = None;
        if self.inner.is_closed() {
            self.reopen();
            self.set_status(ConnectionStatus::Reconnecting);
        }
    }

    /// Replace the preamble, e.g. after fresh credentials were issued.
    pub fn reset_preamble(&mut self, preamble: O) {
        self.preamble = Some(preamble);
    }

    pub fn set_protocol(&mut self, protocol: WebSocketProtocol) {
        self.inner.set_protocol(protocol);
    }

    /// Sends a message, or queues it for sending when the connection opens.
    pub fn send(&mut self, msg: O) {
        self.inner.send(msg);
    }

    /// Immutable reference to the state built from updates.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Mutable reference to the state built from updates.
    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            self.status = status;
            self.status_subscribers.emit(&status);
        }
    }

    /// Drop the transport, leaving auto-reconnect armed (useful for testing).
    pub fn simulate_drop(&mut self) {
        self.inner.close();
    }
}

impl<I, O, S> Drop for ReconnWebSocket<I, O, S> {
    fn drop(&mut self) {
        self.inner.close();
    }
}
