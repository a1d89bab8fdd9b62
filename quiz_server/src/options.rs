// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use log::LevelFilter;
use std::time::Duration;
use structopt::StructOpt;

/// Server options; every knob also reads from the environment so deployments
/// can configure without flags.
#[derive(Debug, StructOpt)]
pub struct Options {
    /// Redis connection string.
    #[structopt(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,
    /// Run on the in-memory store and bus, no Redis required. Single process
    /// only; the owner lease degenerates to a local lock.
    #[structopt(long)]
    pub memory_store: bool,
    /// HTTP/websocket port.
    #[structopt(long, env = "PORT", default_value = "8000")]
    pub port: u16,
    /// Minutes an ENDED session lingers before eviction.
    #[structopt(long, env = "SESSION_IDLE_TTL", default_value = "10")]
    pub session_idle_ttl: u64,
    /// Answer batch flush interval.
    #[structopt(long, env = "BATCH_INTERVAL_MS", default_value = "200")]
    pub batch_interval_ms: u64,
    /// Answer batch flush size.
    #[structopt(long, env = "BATCH_SIZE", default_value = "50")]
    pub batch_size: usize,
    /// Keep-alive ping period for websockets.
    #[structopt(long, env = "HEARTBEAT_INTERVAL_S", default_value = "10")]
    pub heartbeat_interval_s: u64,
    /// Leaderboard entries sent to clients.
    #[structopt(long, default_value = "10")]
    pub leaderboard_size: usize,
    /// Join requests allowed per IP per this many seconds.
    #[structopt(long, default_value = "2")]
    pub join_rate_limit_s: u64,
    #[structopt(long, default_value = "8")]
    pub join_burst: u32,
    /// Log runtime diagnostics
    #[cfg_attr(debug_assertions, structopt(long, default_value = "info"))]
    #[cfg_attr(not(debug_assertions), structopt(long, default_value = "warn"))]
    pub debug_core: LevelFilter,
    /// Log socket diagnostics
    #[cfg_attr(debug_assertions, structopt(long, default_value = "warn"))]
    #[cfg_attr(not(debug_assertions), structopt(long, default_value = "error"))]
    pub debug_sockets: LevelFilter,
}

/// The subset of options threaded into the runtime, in useful units.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub session_idle_ttl: Duration,
    pub batch_interval: Duration,
    pub batch_size: usize,
    pub leaderboard_size: usize,
    pub heartbeat_interval: Duration,
    /// Set when running without Redis; some logs change tone.
    pub memory_store: bool,
}

impl From<&Options> for RuntimeConfig {
    fn from(options: &Options) -> Self {
        Self {
            session_idle_ttl: Duration::from_secs(options.session_idle_ttl * 60),
            batch_interval: Duration::from_millis(options.batch_interval_ms),
            batch_size: options.batch_size.max(1),
            leaderboard_size: options.leaderboard_size.max(1),
            heartbeat_interval: Duration::from_secs(options.heartbeat_interval_s.max(1)),
            memory_store: options.memory_store,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            session_idle_ttl: Duration::from_secs(600),
            batch_interval: Duration::from_millis(200),
            batch_size: 50,
            leaderboard_size: 10,
            heartbeat_interval: Duration::from_secs(10),
            memory_store: true,
        }
    }
}
