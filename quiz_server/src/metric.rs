// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::metrics::{DiscreteMetric, LatencySummary, LatencyWindow};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Counters shared with the scoring worker task (the worker runs outside the
/// actor, so these are atomics).
#[derive(Default)]
pub struct SharedScoringMetrics {
    pub answers_scored: AtomicU64,
    pub scoring_failures: AtomicU64,
    latency: Mutex<LatencyWindow>,
}

impl SharedScoringMetrics {
    pub fn record_latency(&self, millis: f32) {
        self.latency
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(millis);
    }

    pub fn latency_summary(&self) -> LatencySummary {
        self.latency
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .summarize()
    }
}

/// Stores and updates runtime counters to increase observability.
#[derive(Default)]
pub struct MetricRepo {
    /// Round-trip times reported by websocket pongs.
    pub rtt: LatencyWindow,
    /// Websockets accepted over the process lifetime.
    pub connections_opened: DiscreteMetric,
    pub connections_closed: DiscreteMetric,
    pub messages_sent: DiscreteMetric,
    /// Frames dropped because a connection's outbound buffer was full.
    pub sends_dropped: DiscreteMetric,
    pub answers_accepted: DiscreteMetric,
    pub answers_rejected: DiscreteMetric,
    pub duplicate_answers: DiscreteMetric,
    pub recoveries: DiscreteMetric,
    pub recovery_failures: DiscreteMetric,
    pub joins: DiscreteMetric,
    pub state_conflicts: DiscreteMetric,
}

impl MetricRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod test {
    use crate::metric::SharedScoringMetrics;
    use std::sync::atomic::Ordering;

    #[test]
    fn shared_metrics() {
        let metrics = SharedScoringMetrics::default();
        metrics.answers_scored.fetch_add(3, Ordering::Relaxed);
        metrics.record_latency(5.0);
        metrics.record_latency(15.0);
        let summary = metrics.latency_summary();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.max_ms, 15.0);
        assert_eq!(metrics.answers_scored.load(Ordering::Relaxed), 3);
    }
}
