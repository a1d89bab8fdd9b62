// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::infrastructure::Infrastructure;
use actix::{Context as ActorContext, Handler, Message, MessageResult};
use core_protocol::rpc::{DependencyStatus, StatusResponse};
use server_util::health::{Dependency, Health};
use std::time::{Duration, Instant};

/// Manages updating and reporting of server status.
pub struct StatusRepo {
    pub health: Health,
    uptime: Instant,
}

impl StatusRepo {
    pub fn new(dependencies: Vec<Dependency>) -> Self {
        Self {
            health: Health::new(dependencies),
            uptime: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.uptime.elapsed()
    }
}

/// Asks the server whether it and its dependencies are healthy.
#[derive(Message)]
#[rtype(result = "StatusResponse")]
pub struct StatusRequest;

impl Handler<StatusRequest> for Infrastructure {
    type Result = MessageResult<StatusRequest>;

    fn handle(&mut self, _request: StatusRequest, _: &mut ActorContext<Self>) -> Self::Result {
        let dependencies = self
            .status
            .health
            .dependencies()
            .iter()
            .map(|dependency| DependencyStatus {
                name: dependency.name.to_owned(),
                up: dependency.is_up(),
                latency: dependency.latency_summary(),
            })
            .collect();

        MessageResult(StatusResponse {
            status: self.status.health.status().as_str().to_owned(),
            healthy: self.status.health.healthy(),
            uptime_s: self.status.uptime().as_secs(),
            active_connections: self.clients.connection_count() as u32,
            live_sessions: self.sessions.sessions.len() as u32,
            cpu: self.status.health.cpu(),
            ram: self.status.health.ram(),
            dependencies,
        })
    }
}
