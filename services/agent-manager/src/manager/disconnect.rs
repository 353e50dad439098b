// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Disconnects, investigation and host status transitions

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use agent_protocol::Command;
use host_types::{HostEvent, HostId, HostStatus};

use super::AgentManager;
use crate::attache::Attache;
use crate::catalog::CatalogError;
use crate::error::AgentError;
use crate::ha::AlertKind;
use crate::metrics;

/// Compare-and-set attempts before a status update is given up.
const TRANSIT_ATTEMPTS: usize = 3;

impl AgentManager {
    /// Apply `event` to the stored status of `host_id`.
    ///
    /// The update is a compare-and-set against the status the transition was
    /// computed from and is retried if another writer got there first. An
    /// undefined transition is an error and leaves the status untouched.
    pub async fn transit(&self, host_id: HostId, event: HostEvent) -> Result<HostStatus, AgentError> {
        for _ in 0..TRANSIT_ATTEMPTS {
            let host = self
                .catalog
                .find_by_id(host_id)
                .await?
                .ok_or(CatalogError::NotFound(host_id))?;

            let next = host.status.next_status(event).inspect_err(|e| {
                error!(host_id, error = %e, "Undefined host status transition");
            })?;

            let owner = match next {
                HostStatus::Disconnected | HostStatus::Down | HostStatus::Removed => None,
                _ => Some(self.ms_id),
            };

            if !self
                .catalog
                .update_status(host_id, host.status, next, owner)
                .await?
            {
                debug!(host_id, event = %event, "Host status changed underneath, retrying");
                continue;
            }

            if next != host.status {
                info!(
                    host_id,
                    from = %host.status,
                    to = %next,
                    event = %event,
                    "Host status changed"
                );
                match next {
                    HostStatus::Alert => self.alerts.send_alert(
                        &host,
                        AlertKind::HostAlert,
                        &format!("host {} is not responding", host.name),
                    ),
                    HostStatus::Down => self.alerts.send_alert(
                        &host,
                        AlertKind::HostDown,
                        &format!("host {} is down", host.name),
                    ),
                    HostStatus::Disconnected if event != HostEvent::ShutdownRequested => {
                        self.alerts.send_alert(
                            &host,
                            AlertKind::HostDisconnected,
                            &format!("host {} disconnected", host.name),
                        )
                    }
                    _ => {}
                }
            }
            return Ok(next);
        }

        Err(CatalogError::Backend(format!(
            "status of host {host_id} kept changing while applying {event}"
        ))
        .into())
    }

    /// Disconnect the host, probing it first when the event would put it in
    /// `Alert`.
    pub async fn handle_disconnect_with_investigation(
        self: &Arc<Self>,
        host_id: HostId,
        event: HostEvent,
    ) -> Result<(), AgentError> {
        match self.find_attache(host_id) {
            Some(attache) => self.investigate_and_disconnect(attache, event).await,
            None => {
                debug!(host_id, event = %event, "No attache to disconnect");
                Ok(())
            }
        }
    }

    /// Disconnect the host and apply `event` to its status.
    pub async fn handle_disconnect_without_investigation(
        self: &Arc<Self>,
        host_id: HostId,
        event: HostEvent,
    ) -> Result<(), AgentError> {
        match self.find_attache(host_id) {
            Some(attache) => self.disconnect_attache(attache, event).await,
            None => self.transit(host_id, event).await.map(|_| ()),
        }
    }

    /// Spawn [`Self::handle_disconnect_with_investigation`].
    pub fn disconnect_with_investigation(
        self: &Arc<Self>,
        host_id: HostId,
        event: HostEvent,
    ) -> JoinHandle<()> {
        let mgr = self.clone();
        tokio::spawn(async move {
            if let Err(e) = mgr.handle_disconnect_with_investigation(host_id, event).await {
                warn!(host_id, event = %event, error = %e, "Disconnect failed");
            }
        })
    }

    /// Spawn [`Self::handle_disconnect_without_investigation`].
    pub fn disconnect_without_investigation(
        self: &Arc<Self>,
        host_id: HostId,
        event: HostEvent,
    ) -> JoinHandle<()> {
        let mgr = self.clone();
        tokio::spawn(async move {
            if let Err(e) = mgr
                .handle_disconnect_without_investigation(host_id, event)
                .await
            {
                warn!(host_id, event = %event, error = %e, "Disconnect failed");
            }
        })
    }

    pub(crate) async fn investigate_and_disconnect(
        self: &Arc<Self>,
        attache: Arc<Attache>,
        event: HostEvent,
    ) -> Result<(), AgentError> {
        let host_id = attache.host_id();

        if !self.is_current(&attache) {
            debug!(host_id, "Disconnecting a retired attache");
            attache.disconnect(HostStatus::Disconnected);
            return Ok(());
        }
        if attache.is_forwarding() {
            return self.disconnect_attache(attache, event).await;
        }

        let Some(host) = self.catalog.find_by_id(host_id).await? else {
            return self.disconnect_attache(attache, event).await;
        };

        if event == HostEvent::PingTimeout && host.resource_state.is_out_of_service() {
            info!(
                host_id,
                resource_state = %host.resource_state,
                "Host is out of service, disconnecting without investigation"
            );
            return self
                .disconnect_attache(attache, HostEvent::ShutdownRequested)
                .await;
        }

        let next = host.status.next_status(event).inspect_err(|e| {
            error!(host_id, error = %e, "Undefined host status transition");
        })?;

        let mut event = event;
        if next == HostStatus::Alert {
            let wait = self.config().ping_interval();
            if let Some(answer) = self.try_send(host_id, Command::check_health(), Some(wait)).await
                && answer.result
            {
                info!(host_id, event = %event, "Host answered the health check");
                self.transit(host_id, HostEvent::Ping).await?;
                return Ok(());
            }

            match self.investigator.investigate(&host).await {
                None => {
                    info!(
                        host_id,
                        event = %event,
                        "Could not determine host state, leaving it alone"
                    );
                    return Ok(());
                }
                Some(HostStatus::Up) => {
                    info!(host_id, "Investigation found the host up");
                    self.transit(host_id, HostEvent::Ping).await?;
                    return Ok(());
                }
                Some(HostStatus::Down) => {
                    warn!(host_id, "Investigation found the host down");
                    event = HostEvent::HostDown;
                }
                Some(HostStatus::Disconnected) => {
                    event = HostEvent::AgentDisconnected;
                }
                Some(other) => {
                    debug!(host_id, status = %other, "Investigation verdict not acted on");
                }
            }
        }

        self.disconnect_attache(attache, event).await?;

        if event == HostEvent::HostDown {
            self.ha.schedule_restart(&host, true);
        }
        Ok(())
    }

    /// Retire the attache, notify listeners, move the host's status and tell
    /// the rest of the cluster.
    pub(crate) async fn disconnect_attache(
        self: &Arc<Self>,
        attache: Arc<Attache>,
        event: HostEvent,
    ) -> Result<(), AgentError> {
        let host_id = attache.host_id();

        if attache.is_forwarding() {
            // The owner of the connection is responsible for the status.
            self.remove_agent(&attache, HostStatus::Disconnected);
            return Ok(());
        }

        let next = match self.catalog.find_by_id(host_id).await? {
            Some(host) => host.status.next_status(event),
            None => Ok(HostStatus::Removed),
        };

        let removed = self.remove_agent(&attache, next.unwrap_or(HostStatus::Disconnected));
        let next = next.inspect_err(|e| {
            error!(host_id, error = %e, "Undefined host status transition");
        })?;

        if !removed {
            return Ok(());
        }

        info!(host_id, event = %event, status = %next, "Host disconnected");
        metrics::record_disconnect(&event.to_string());

        if next != HostStatus::Removed {
            self.transit(host_id, event).await?;
        }

        if let Some(cluster) = self.cluster.clone() {
            tokio::spawn(async move {
                cluster.notify_host_event(host_id, event).await;
            });
        }
        Ok(())
    }
}
