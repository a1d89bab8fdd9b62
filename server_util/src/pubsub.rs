// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Named-topic pub/sub bus.
//!
//! The Redis implementation publishes through the shared pool and runs one
//! bridge task per subscription: a dedicated connection issues `PSUBSCRIBE`
//! and forwards messages into a local channel, reconnecting with a delay on
//! error. Publishers never block on subscribers. Raw pub/sub drops messages
//! for absent subscribers; the scoring worker compensates by draining the
//! per-question answer buffer on finalization, which restores the
//! at-least-once contract for the one topic where it matters.

use async_trait::async_trait;
use core_protocol::error::CoreError;
use core_protocol::id::SessionId;
use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::{Config, Pool, Runtime};
use futures::StreamExt;
use log::{debug, warn};
use std::fmt::{self, Display, Formatter};
use std::num::NonZeroU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Delay before a broken subscriber connection is reopened.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Subscriber lag above this should be logged by consumers (via
/// `UnboundedReceiver::len`); the bus itself never drops messages.
pub const LAG_WATERMARK: usize = 1024;

/// A concrete topic.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Topic {
    /// Answer submitted; scoring work item.
    Scoring(SessionId),
    /// Scoring completed; leaderboard delta.
    Leaderboard(SessionId),
    /// State machine transitions.
    SessionEvents(SessionId),
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scoring(sid) => write!(f, "scoring:{}", sid.0),
            Self::Leaderboard(sid) => write!(f, "leaderboard:{}", sid.0),
            Self::SessionEvents(sid) => write!(f, "session:{}:events", sid.0),
        }
    }
}

impl Topic {
    pub fn parse(channel: &str) -> Option<Self> {
        let parse_sid = |raw: &str| raw.parse::<u64>().ok().and_then(NonZeroU64::new).map(SessionId);
        if let Some(raw) = channel.strip_prefix("scoring:") {
            return parse_sid(raw).map(Self::Scoring);
        }
        if let Some(raw) = channel.strip_prefix("leaderboard:") {
            return parse_sid(raw).map(Self::Leaderboard);
        }
        if let Some(raw) = channel.strip_prefix("session:") {
            if let Some(raw) = raw.strip_suffix(":events") {
                return parse_sid(raw).map(Self::SessionEvents);
            }
        }
        None
    }
}

/// A subscription pattern covering every session.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TopicPattern {
    Scoring,
    Leaderboard,
    SessionEvents,
}

impl TopicPattern {
    pub fn pattern(self) -> &'static str {
        match self {
            Self::Scoring => "scoring:*",
            Self::Leaderboard => "leaderboard:*",
            Self::SessionEvents => "session:*:events",
        }
    }

    pub fn matches(self, topic: Topic) -> bool {
        matches!(
            (self, topic),
            (Self::Scoring, Topic::Scoring(_))
                | (Self::Leaderboard, Topic::Leaderboard(_))
                | (Self::SessionEvents, Topic::SessionEvents(_))
        )
    }
}

/// One delivered message. Payloads are serde_json bytes.
#[derive(Clone, Debug)]
pub struct BusMessage {
    pub topic: Topic,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait PubSubBus: Send + Sync + 'static {
    /// Fire and forget; never blocks on subscribers.
    async fn publish(&self, topic: Topic, payload: Vec<u8>) -> Result<(), CoreError>;

    /// Each call returns an independent stream of every message matching the
    /// pattern, starting now.
    async fn subscribe(
        &self,
        pattern: TopicPattern,
    ) -> Result<mpsc::UnboundedReceiver<BusMessage>, CoreError>;
}

/// Redis pub/sub.
pub struct RedisPubSub {
    pool: Pool,
    /// Dedicated connections for `PSUBSCRIBE` come from here, not the pool.
    client: redis::Client,
}

impl RedisPubSub {
    pub fn new(redis_url: &str) -> Result<Self, CoreError> {
        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
        let client = redis::Client::open(redis_url)
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
        Ok(Self { pool, client })
    }
}

#[async_trait]
impl PubSubBus for RedisPubSub {
    async fn publish(&self, topic: Topic, payload: Vec<u8>) -> Result<(), CoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
        conn.publish::<_, _, ()>(topic.to_string(), payload)
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))
    }

    async fn subscribe(
        &self,
        pattern: TopicPattern,
    ) -> Result<mpsc::UnboundedReceiver<BusMessage>, CoreError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let client = self.client.clone();

        tokio::spawn(async move {
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(e) => {
                        warn!("pubsub connect failed: {}", e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                };
                if let Err(e) = pubsub.psubscribe(pattern.pattern()).await {
                    warn!("psubscribe {} failed: {}", pattern.pattern(), e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
                debug!("subscribed to {}", pattern.pattern());

                let mut stream = pubsub.on_message();
                while let Some(message) = stream.next().await {
                    let channel = message.get_channel_name().to_owned();
                    let Some(topic) = Topic::parse(&channel) else {
                        continue;
                    };
                    let payload: Vec<u8> = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!("bad payload on {}: {}", channel, e);
                            continue;
                        }
                    };
                    if sender.send(BusMessage { topic, payload }).is_err() {
                        // Subscriber gone; stop the bridge.
                        return;
                    }
                }

                warn!("pubsub stream for {} ended, reconnecting", pattern.pattern());
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });

        Ok(receiver)
    }
}

/// In-process bus for tests and single-process deployments.
#[derive(Default)]
pub struct LocalPubSub {
    subscribers: Mutex<Vec<(TopicPattern, mpsc::UnboundedSender<BusMessage>)>>,
}

impl LocalPubSub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl PubSubBus for LocalPubSub {
    async fn publish(&self, topic: Topic, payload: Vec<u8>) -> Result<(), CoreError> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subscribers.retain(|(pattern, sender)| {
            if pattern.matches(topic) {
                sender
                    .send(BusMessage {
                        topic,
                        payload: payload.clone(),
                    })
                    .is_ok()
            } else {
                !sender.is_closed()
            }
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: TopicPattern,
    ) -> Result<mpsc::UnboundedReceiver<BusMessage>, CoreError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((pattern, sender));
        Ok(receiver)
    }
}

#[cfg(test)]
mod test {
    use crate::pubsub::{LocalPubSub, PubSubBus, Topic, TopicPattern};
    use core_protocol::id::SessionId;
    use std::num::NonZeroU64;

    fn sid(n: u64) -> SessionId {
        SessionId(NonZeroU64::new(n).unwrap())
    }

    #[test]
    fn topic_round_trip() {
        for topic in [
            Topic::Scoring(sid(7)),
            Topic::Leaderboard(sid(7)),
            Topic::SessionEvents(sid(7)),
        ] {
            assert_eq!(Topic::parse(&topic.to_string()), Some(topic));
        }
        assert_eq!(Topic::parse("scoring:"), None);
        assert_eq!(Topic::parse("unrelated:1"), None);
    }

    #[tokio::test]
    async fn local_bus_routes_by_pattern() {
        let bus = LocalPubSub::new();
        let mut scoring = bus.subscribe(TopicPattern::Scoring).await.unwrap();
        let mut leaderboard = bus.subscribe(TopicPattern::Leaderboard).await.unwrap();

        bus.publish(Topic::Scoring(sid(1)), b"a".to_vec()).await.unwrap();
        bus.publish(Topic::Leaderboard(sid(1)), b"b".to_vec()).await.unwrap();
        bus.publish(Topic::Scoring(sid(2)), b"c".to_vec()).await.unwrap();

        assert_eq!(scoring.recv().await.unwrap().payload, b"a");
        assert_eq!(scoring.recv().await.unwrap().payload, b"c");
        let message = leaderboard.recv().await.unwrap();
        assert_eq!(message.topic, Topic::Leaderboard(sid(1)));
        assert_eq!(message.payload, b"b");
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let bus = LocalPubSub::new();
        let receiver = bus.subscribe(TopicPattern::Scoring).await.unwrap();
        drop(receiver);
        bus.publish(Topic::Scoring(sid(1)), b"x".to_vec()).await.unwrap();
        bus.publish(Topic::Scoring(sid(1)), b"y".to_vec()).await.unwrap();
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }
}
