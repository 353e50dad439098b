// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Host liveness
//!
//! The monitor keeps the time each host was last heard from. Records are
//! created on connect, refreshed by any ping flowing through command
//! processing and dropped on disconnect. Each check disconnects hosts that
//! have been silent for longer than the ping timeout, and moves hosts that
//! finished draining into maintenance.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use agent_protocol::{Answer, Command};
use host_types::{Host, HostEvent, HostId, HostStatus, ResourceState};

use crate::listener::{ConnectError, Listener};
use crate::manager::AgentManager;

#[derive(Default)]
pub struct AgentMonitor {
    pings: DashMap<HostId, Instant>,
}

impl AgentMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(AgentMonitor::default())
    }

    /// Register with `mgr` ahead of other listeners.
    pub fn attach(self: &Arc<Self>, mgr: &AgentManager) {
        mgr.register_for_host_events(self.clone(), true, true, true);
    }

    pub fn last_seen(&self, host_id: HostId) -> Option<Instant> {
        self.pings.get(&host_id).map(|e| *e.value())
    }

    pub fn tracked(&self) -> usize {
        self.pings.len()
    }

    pub fn ping_received(&self, host_id: HostId) {
        self.pings.insert(host_id, Instant::now());
    }

    /// Run one liveness check. Returns the hosts found silent.
    pub async fn check_once(&self, mgr: &Arc<AgentManager>) -> Vec<HostId> {
        let timeout = mgr.config().ping_timeout();
        let now = Instant::now();

        let silent: Vec<HostId> = self
            .pings
            .iter()
            .filter(|e| now.saturating_duration_since(*e.value()) > timeout)
            .map(|e| *e.key())
            .collect();

        let mut disconnects = JoinSet::new();
        for &host_id in &silent {
            // Restart the clock so the host is not handled again every cycle.
            self.pings.insert(host_id, now);

            let host = match mgr.catalog().find_by_id(host_id).await {
                Ok(Some(host)) => host,
                Ok(None) => {
                    self.pings.remove(&host_id);
                    continue;
                }
                Err(e) => {
                    warn!(host_id, error = %e, "Host lookup failed");
                    continue;
                }
            };

            let mgr = mgr.clone();
            if host.resource_state.is_out_of_service() {
                info!(
                    host_id,
                    resource_state = %host.resource_state,
                    "Silent host is out of service"
                );
                disconnects.spawn(async move {
                    mgr.handle_disconnect_without_investigation(
                        host_id,
                        HostEvent::ShutdownRequested,
                    )
                    .await
                });
            } else {
                info!(host_id, status = %host.status, "Host missed its pings");
                disconnects.spawn(async move {
                    mgr.handle_disconnect_with_investigation(host_id, HostEvent::PingTimeout)
                        .await
                });
            }
        }

        while let Some(joined) = disconnects.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Ping timeout disconnect failed"),
                Err(e) => warn!(error = %e, "Ping timeout task failed"),
            }
        }

        self.advance_maintenance(mgr).await;
        silent
    }

    /// Move drained hosts from preparing-for-maintenance to maintenance.
    async fn advance_maintenance(&self, mgr: &Arc<AgentManager>) {
        let catalog = mgr.catalog();
        let preparing = match catalog
            .list_by_resource_state(ResourceState::PrepareForMaintenance)
            .await
        {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(error = %e, "Failed to list hosts preparing for maintenance");
                return;
            }
        };

        for host in preparing {
            match catalog.count_active_workloads(host.id).await {
                Ok(0) => {}
                Ok(n) => {
                    debug!(host_id = host.id, workloads = n, "Host still draining");
                    continue;
                }
                Err(e) => {
                    warn!(host_id = host.id, error = %e, "Failed to count workloads");
                    continue;
                }
            }
            match catalog
                .update_resource_state(host.id, ResourceState::Maintenance)
                .await
            {
                Ok(()) => info!(host_id = host.id, "Host is ready for maintenance"),
                Err(e) => warn!(host_id = host.id, error = %e, "Failed to enter maintenance"),
            }
        }
    }

    /// Check every ping interval until shutdown.
    pub async fn run(self: Arc<Self>, mgr: Arc<AgentManager>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let interval = mgr.config().ping_interval();
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Agent monitor shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    self.check_once(&mgr).await;
                }
            }
        }
    }
}

impl Listener for AgentMonitor {
    fn process_command(&self, host_id: HostId, _seq: u64, cmd: &Command) -> Option<Answer> {
        if cmd.is_ping() {
            self.ping_received(host_id);
        }
        None
    }

    fn process_connect(
        &self,
        host: &Host,
        _startup: &[Command],
        _forced_reconnect: bool,
    ) -> Result<(), ConnectError> {
        self.ping_received(host.id);
        Ok(())
    }

    fn process_disconnect(&self, host_id: HostId, _status: HostStatus) -> bool {
        self.pings.remove(&host_id);
        true
    }

    fn is_recurring(&self) -> bool {
        true
    }
}
