// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};
use std::ops::Add;

/// A metric representing something countable.
#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscreteMetric {
    #[serde(rename = "t")]
    pub total: u64,
}

impl DiscreteMetric {
    pub fn increment(&mut self) {
        self.add_multiple(1);
    }

    pub fn add_multiple(&mut self, amount: u64) {
        self.total = self.total.saturating_add(amount)
    }

    pub fn add_length(&mut self, amount: usize) {
        self.add_multiple(amount as u64)
    }
}

impl Add for DiscreteMetric {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            total: self.total.saturating_add(rhs.total),
        }
    }
}

/// A metric tracking the ratio of data satisfying a condition to all data.
#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatioMetric {
    /// Total population size.
    #[serde(rename = "t")]
    pub total: u32,
    /// Number meeting the condition.
    #[serde(rename = "c")]
    pub count: u32,
}

impl RatioMetric {
    pub fn push(&mut self, condition: bool) {
        debug_assert!(self.count <= self.total);
        if self.total < u32::MAX {
            self.total += 1;
            if condition {
                self.count += 1;
            }
        }
    }

    /// Returns 0 if there are no data.
    pub fn ratio(&self) -> f32 {
        (self.count as f64 / self.total.max(1) as f64) as f32
    }
}

impl Add for RatioMetric {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        let max = u32::MAX - rhs.total;
        Self {
            total: self.total + rhs.total.min(max),
            count: self.count + rhs.count.min(max),
        }
    }
}

/// A metric tracking a continuous value's count, extrema, and mean.
#[derive(Debug, Default, Copy, Clone, Serialize, Deserialize)]
pub struct ContinuousExtremaMetric {
    #[serde(rename = "c")]
    pub count: u32,
    #[serde(rename = "l")]
    pub min: f32,
    #[serde(rename = "h")]
    pub max: f32,
    #[serde(rename = "s")]
    pub total: f64,
}

impl ContinuousExtremaMetric {
    pub fn push(&mut self, sample: f32) {
        if self.count == 0 {
            self.min = sample;
            self.max = sample;
        } else if self.count < u32::MAX {
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        }
        self.total += sample as f64;
        self.count = self.count.saturating_add(1);
    }

    pub fn average(&self) -> f32 {
        (self.total / self.count.max(1) as f64) as f32
    }
}

impl Add for ContinuousExtremaMetric {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        if self.count == 0 {
            rhs
        } else if rhs.count == 0 {
            self
        } else {
            Self {
                count: self.count.saturating_add(rhs.count),
                min: self.min.min(rhs.min),
                max: self.max.max(rhs.max),
                total: self.total + rhs.total,
            }
        }
    }
}

/// Bounded rolling window of the most recent latency samples, in
/// milliseconds. Overwrites the oldest sample once full.
#[derive(Clone, Debug)]
pub struct LatencyWindow {
    samples: Vec<f32>,
    next: usize,
    capacity: usize,
}

/// Summary of a [`LatencyWindow`], suitable for a status endpoint.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u32,
    pub min_ms: f32,
    pub max_ms: f32,
    pub avg_ms: f32,
}

impl LatencyWindow {
    pub const DEFAULT_CAPACITY: usize = 100;

    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        Self {
            samples: Vec::with_capacity(capacity),
            next: 0,
            capacity,
        }
    }

    pub fn push(&mut self, millis: f32) {
        if self.samples.len() < self.capacity {
            self.samples.push(millis);
        } else {
            self.samples[self.next] = millis;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn summarize(&self) -> LatencySummary {
        if self.samples.is_empty() {
            return LatencySummary::default();
        }
        let mut min = f32::MAX;
        let mut max = f32::MIN;
        let mut total = 0f64;
        for &s in &self.samples {
            min = min.min(s);
            max = max.max(s);
            total += s as f64;
        }
        LatencySummary {
            count: self.samples.len() as u32,
            min_ms: min,
            max_ms: max,
            avg_ms: (total / self.samples.len() as f64) as f32,
        }
    }
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod test {
    use crate::metrics::{ContinuousExtremaMetric, DiscreteMetric, LatencyWindow, RatioMetric};

    #[test]
    fn discrete() {
        let mut m = DiscreteMetric::default();
        m.increment();
        m.add_multiple(2);
        assert_eq!(m.total, 3);
    }

    #[test]
    fn ratio() {
        let mut m = RatioMetric::default();
        m.push(true);
        m.push(false);
        m.push(true);
        m.push(true);
        assert!((m.ratio() - 0.75).abs() < f32::EPSILON);
    }

    #[test]
    fn continuous_extrema() {
        let mut m = ContinuousExtremaMetric::default();
        for sample in [3.0, 1.0, 2.0] {
            m.push(sample);
        }
        assert_eq!(m.count, 3);
        assert_eq!(m.min, 1.0);
        assert_eq!(m.max, 3.0);
        assert!((m.average() - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn latency_window_bounded() {
        let mut w = LatencyWindow::new(4);
        for i in 0..10 {
            w.push(i as f32);
        }
        assert_eq!(w.len(), 4);
        let summary = w.summarize();
        // Only the last 4 samples remain.
        assert_eq!(summary.min_ms, 6.0);
        assert_eq!(summary.max_ms, 9.0);
    }
}
