// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::metrics::{LatencySummary, LatencyWindow};
use log::error;
use simple_server_status::SimpleServerStatus;
use std::time::{Duration, Instant};

/// Rolled-up health of the process and its dependencies.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HealthStatus {
    /// Every dependency is up.
    Ok,
    /// At least one dependency is down.
    Degraded,
    /// Every persistent dependency is down.
    Error,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Degraded => "degraded",
            Self::Error => "error",
        }
    }
}

/// One monitored dependency (Redis, durable store), pinged periodically by
/// the infrastructure tick.
pub struct Dependency {
    pub name: &'static str,
    up: bool,
    /// Whether losing this alone justifies `Error` (all persistent deps down).
    persistent: bool,
    latency: LatencyWindow,
    last_ping: Option<Instant>,
}

impl Dependency {
    pub fn new(name: &'static str, persistent: bool) -> Self {
        Self {
            name,
            up: true,
            persistent,
            latency: LatencyWindow::default(),
            last_ping: None,
        }
    }

    pub fn record_ping(&mut self, result: Result<Duration, ()>) {
        self.last_ping = Some(Instant::now());
        match result {
            Ok(elapsed) => {
                self.up = true;
                self.latency.push(elapsed.as_secs_f32() * 1000.0);
            }
            Err(()) => self.up = false,
        }
    }

    pub fn is_up(&self) -> bool {
        self.up
    }

    pub fn latency_summary(&self) -> LatencySummary {
        self.latency.summarize()
    }
}

/// Keeps track of the "health" of the server: cached OS snapshot plus
/// dependency liveness.
pub struct Health {
    system: SimpleServerStatus,
    last: Instant,
    /// Cached CPU fraction.
    cpu: f32,
    /// Cached RAM fraction.
    ram: f32,
    healthy: bool,
    dependencies: Vec<Dependency>,
}

impl Health {
    /// How long to cache OS data for (getting data is relatively expensive).
    const CACHE: Duration = Duration::from_secs(30);

    pub fn new(dependencies: Vec<Dependency>) -> Self {
        Self {
            system: SimpleServerStatus::new(),
            last: Instant::now() - Self::CACHE * 2,
            cpu: 0.0,
            ram: 0.0,
            healthy: true,
            dependencies,
        }
    }

    /// Get (possibly cached) cpu usage from 0 to 1.
    pub fn cpu(&mut self) -> f32 {
        self.refresh_if_necessary();
        self.cpu
    }

    /// Get (possibly cached) ram usage from 0 to 1.
    pub fn ram(&mut self) -> f32 {
        self.refresh_if_necessary();
        self.ram
    }

    /// Gets a binary "healthy" status, false if the machine isn't doing well.
    pub fn healthy(&mut self) -> bool {
        self.refresh_if_necessary();
        self.healthy && !matches!(self.status(), HealthStatus::Error)
    }

    pub fn dependency_mut(&mut self, name: &str) -> Option<&mut Dependency> {
        self.dependencies.iter_mut().find(|d| d.name == name)
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// `ok` if all deps are up, `degraded` if any is down, `error` only if
    /// all persistent deps are down.
    pub fn status(&self) -> HealthStatus {
        if self.dependencies.iter().all(Dependency::is_up) {
            return HealthStatus::Ok;
        }
        let persistent: Vec<_> = self.dependencies.iter().filter(|d| d.persistent).collect();
        if !persistent.is_empty() && persistent.iter().all(|d| !d.is_up()) {
            HealthStatus::Error
        } else {
            HealthStatus::Degraded
        }
    }

    fn refresh_if_necessary(&mut self) {
        if self.last.elapsed() <= Self::CACHE {
            return;
        }
        self.last = Instant::now();
        if let Err(e) = self.system.update() {
            error!("error updating health: {:?}", e);
        }

        self.cpu = self.system.cpu_usage().unwrap_or(0.0);
        self.ram = self.system.ram_usage().unwrap_or(0.0);

        // NaN must not result in unhealthy.
        self.healthy = !(self.cpu.max(self.ram) > 0.8);
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod test {
    use crate::health::{Dependency, Health, HealthStatus};
    use std::time::Duration;

    #[test]
    fn rollup() {
        let mut health = Health::new(vec![
            Dependency::new("redis", true),
            Dependency::new("durable_store", true),
        ]);
        assert_eq!(health.status(), HealthStatus::Ok);

        health
            .dependency_mut("redis")
            .unwrap()
            .record_ping(Err(()));
        assert_eq!(health.status(), HealthStatus::Degraded);

        health
            .dependency_mut("durable_store")
            .unwrap()
            .record_ping(Err(()));
        assert_eq!(health.status(), HealthStatus::Error);

        health
            .dependency_mut("redis")
            .unwrap()
            .record_ping(Ok(Duration::from_millis(2)));
        assert_eq!(health.status(), HealthStatus::Degraded);
    }

    #[test]
    fn latency_window_tracks_pings() {
        let mut dep = Dependency::new("redis", true);
        for i in 1..=150u64 {
            dep.record_ping(Ok(Duration::from_millis(i)));
        }
        let summary = dep.latency_summary();
        // Bounded at the window size; only recent samples remain.
        assert_eq!(summary.count, 100);
        assert_eq!(summary.min_ms, 51.0);
        assert_eq!(summary.max_ms, 150.0);
    }
}
