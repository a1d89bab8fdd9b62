// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Channel plumbing between websocket tasks and the infrastructure actor.
//!
//! Outbound buffers are bounded; a send to a full buffer drops the message
//! and increments a counter instead of blocking the sender (back-pressure is
//! the slow client's problem, not the session's).

use actix::Message;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Frames buffered per connection before drops begin.
pub const OUTBOUND_BUFFER: usize = 64;

/// Inbound traffic from a websocket to the actor. `K` identifies the
/// connection, `I` is the request type, `O` the update type.
#[derive(Message)]
#[rtype(result = "()")]
pub enum ObserverMessage<K, I, O> {
    Register {
        key: K,
        observer: ObserverAddr<O>,
    },
    Unregister {
        key: K,
        observer: ObserverAddr<O>,
    },
    Request {
        key: K,
        request: I,
    },
    RoundTripTime {
        key: K,
        rtt: u16,
    },
}

/// Outbound traffic from the actor to one websocket.
#[derive(Debug)]
pub enum ObserverUpdate<O> {
    /// Politely close the websocket.
    Close,
    Send { message: O },
}

/// Sending half of a connection's outbound buffer.
#[derive(Debug)]
pub struct ObserverAddr<O> {
    sender: mpsc::Sender<ObserverUpdate<O>>,
    dropped: Arc<AtomicU64>,
}

impl<O> Clone for ObserverAddr<O> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<O> ObserverAddr<O> {
    pub fn channel() -> (Self, mpsc::Receiver<ObserverUpdate<O>>) {
        Self::channel_with_capacity(OUTBOUND_BUFFER)
    }

    pub fn channel_with_capacity(capacity: usize) -> (Self, mpsc::Receiver<ObserverUpdate<O>>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }

    /// Non-blocking send. Returns false if the message was dropped, either
    /// because the buffer was full or the connection is gone.
    pub fn send(&self, message: O) -> bool {
        match self.sender.try_send(ObserverUpdate::Send { message }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the websocket task to close. Never blocks.
    pub fn close(&self) {
        let _ = self.sender.try_send(ObserverUpdate::Close);
    }

    /// Two addresses are the same if they drain into the same buffer. Used to
    /// disambiguate register/unregister races.
    pub fn same_channel(&self, other: &Self) -> bool {
        self.sender.same_channel(&other.sender)
    }

    /// Messages dropped due to a full buffer, over the connection's lifetime.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use crate::observer::ObserverAddr;

    #[tokio::test]
    async fn drops_when_full() {
        let (addr, mut rx) = ObserverAddr::<u32>::channel_with_capacity(2);
        assert!(addr.send(1));
        assert!(addr.send(2));
        assert!(!addr.send(3));
        assert_eq!(addr.dropped(), 1);

        // Drain one slot; sends work again.
        let _ = rx.recv().await;
        assert!(addr.send(4));
    }

    #[tokio::test]
    async fn send_after_close_is_dropped_silently() {
        let (addr, rx) = ObserverAddr::<u32>::channel();
        drop(rx);
        assert!(!addr.send(1));
        // A closed connection is not a "drop" for metrics purposes.
        assert_eq!(addr.dropped(), 0);
    }
}
