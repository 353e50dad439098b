// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! The agent manager
//!
//! Owns the host -> attache table and is the single entry point for sending
//! commands to hosts. Connection handshakes live in [`connect`], disconnect
//! handling and the host status machine in [`disconnect`], and processing of
//! frames read from agent connections in [`dispatch`].
//!
//! The table is only changed through [`AgentManager::add_attache`] and
//! [`AgentManager::remove_agent`]; both are atomic per host id, so of two
//! racing attaches for one host exactly one stays registered.
//!
//! Callers of [`AgentManager::send`] must not hold an open catalog
//! transaction: the call suspends until the host answers.

mod connect;
mod disconnect;
mod dispatch;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, info, warn};

use agent_protocol::{Answer, Command, Commands};
use host_types::{HostEvent, HostId, HostStatus, MsId};

use crate::attache::{Attache, DirectEvent, NoResources, ResourceFactory};
use crate::catalog::HostCatalog;
use crate::cluster::ClusterRouter;
use crate::config::ManagerConfig;
use crate::error::AgentError;
use crate::ha::{
    AlertSink, HaScheduler, Investigator, LoggingAlertSink, LoggingHaScheduler,
    UndeterminedInvestigator,
};
use crate::listener::{CommandSender, HostCreator, Listener, ListenerRegistry, MonitorId};
use crate::metrics;

/// Services the manager consumes but does not own.
pub struct Collaborators {
    pub catalog: Arc<dyn HostCatalog>,
    pub investigator: Arc<dyn Investigator>,
    pub ha: Arc<dyn HaScheduler>,
    pub alerts: Arc<dyn AlertSink>,
    pub resources: Arc<dyn ResourceFactory>,
}

impl Collaborators {
    /// Collaborators with logging-only HA and alerting, an investigator that
    /// never reaches a verdict, and no in-process resources.
    pub fn new(catalog: Arc<dyn HostCatalog>) -> Self {
        Collaborators {
            catalog,
            investigator: Arc::new(UndeterminedInvestigator),
            ha: Arc::new(LoggingHaScheduler),
            alerts: Arc::new(LoggingAlertSink),
            resources: Arc::new(NoResources),
        }
    }

    pub fn with_investigator(mut self, investigator: Arc<dyn Investigator>) -> Self {
        self.investigator = investigator;
        self
    }

    pub fn with_ha(mut self, ha: Arc<dyn HaScheduler>) -> Self {
        self.ha = ha;
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_resources(mut self, resources: Arc<dyn ResourceFactory>) -> Self {
        self.resources = resources;
        self
    }
}

pub struct AgentManager {
    ms_id: MsId,
    config: watch::Receiver<ManagerConfig>,
    agents: DashMap<HostId, Arc<Attache>>,
    registry: ListenerRegistry,
    catalog: Arc<dyn HostCatalog>,
    investigator: Arc<dyn Investigator>,
    ha: Arc<dyn HaScheduler>,
    alerts: Arc<dyn AlertSink>,
    resources: Arc<dyn ResourceFactory>,
    cluster: Option<Arc<ClusterRouter>>,
    /// Request processing
    workers: Arc<Semaphore>,
    /// Connection handshakes
    connect_workers: Arc<Semaphore>,
    /// Pings of in-process hosts
    direct_pool: Arc<Semaphore>,
    direct_tx: mpsc::UnboundedSender<DirectEvent>,
    direct_rx: Mutex<Option<mpsc::UnboundedReceiver<DirectEvent>>>,
}

impl AgentManager {
    pub fn new(
        config: watch::Receiver<ManagerConfig>,
        collaborators: Collaborators,
        cluster: Option<Arc<ClusterRouter>>,
    ) -> Arc<Self> {
        let (ms_id, workers, connect_workers, direct_pool) = {
            let c = config.borrow();
            (
                c.ms_id,
                c.workers,
                c.connect_workers,
                c.direct_agent_pool_size,
            )
        };
        let (direct_tx, direct_rx) = mpsc::unbounded_channel();

        Arc::new(AgentManager {
            ms_id,
            config,
            agents: DashMap::new(),
            registry: ListenerRegistry::new(),
            catalog: collaborators.catalog,
            investigator: collaborators.investigator,
            ha: collaborators.ha,
            alerts: collaborators.alerts,
            resources: collaborators.resources,
            cluster,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            connect_workers: Arc::new(Semaphore::new(connect_workers.max(1))),
            direct_pool: Arc::new(Semaphore::new(direct_pool.max(1))),
            direct_tx,
            direct_rx: Mutex::new(Some(direct_rx)),
        })
    }

    pub fn ms_id(&self) -> MsId {
        self.ms_id
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> ManagerConfig {
        self.config.borrow().clone()
    }

    pub fn catalog(&self) -> &Arc<dyn HostCatalog> {
        &self.catalog
    }

    pub fn cluster(&self) -> Option<&Arc<ClusterRouter>> {
        self.cluster.as_ref()
    }

    pub fn register_for_host_events(
        &self,
        listener: Arc<dyn Listener>,
        connections: bool,
        commands: bool,
        priority: bool,
    ) -> MonitorId {
        self.registry
            .register(listener, connections, commands, priority)
    }

    pub fn unregister_for_host_events(&self, id: MonitorId) -> bool {
        self.registry.unregister(id)
    }

    /// Add a party consulted, in order, to produce the host record for a
    /// new connection. The catalog is consulted after all of them.
    pub fn register_for_initial_connects(
        &self,
        creator: Arc<dyn HostCreator>,
        priority: bool,
    ) -> MonitorId {
        self.registry.register_creator(creator, priority)
    }

    pub fn find_attache(&self, host_id: HostId) -> Option<Arc<Attache>> {
        self.agents.get(&host_id).map(|a| a.value().clone())
    }

    /// Every registered attache.
    pub fn attaches(&self) -> Vec<Arc<Attache>> {
        self.agents.iter().map(|a| a.value().clone()).collect()
    }

    fn is_current(&self, attache: &Arc<Attache>) -> bool {
        self.agents
            .get(&attache.host_id())
            .is_some_and(|a| Arc::ptr_eq(a.value(), attache))
    }

    /// Resolve the attache for `host_id`, creating a forwarding attache when
    /// the host is up and connected to another management server.
    pub async fn get_attache(&self, host_id: HostId) -> Result<Arc<Attache>, AgentError> {
        if let Some(attache) = self.find_attache(host_id) {
            return Ok(attache);
        }

        let Some(cluster) = &self.cluster else {
            return Err(AgentError::unavailable(host_id, "no attache"));
        };

        let host = match self.catalog.find_by_id(host_id).await {
            Ok(Some(host)) => host,
            Ok(None) => return Err(AgentError::unavailable(host_id, "unknown host")),
            Err(e) => {
                return Err(AgentError::unavailable(
                    host_id,
                    format!("lookup failed: {e}"),
                ));
            }
        };

        let owner = match host.ms_id {
            Some(owner) if host.status == HostStatus::Up && owner != self.ms_id => owner,
            _ => return Err(AgentError::unavailable(host_id, "no attache")),
        };

        let attache = match self.agents.entry(host_id) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => e
                .insert(cluster.create_forwarding_attache(&host, owner))
                .clone(),
        };
        metrics::set_attaches(self.agents.len());
        Ok(attache)
    }

    /// Register `attache`, disconnecting any attache it replaces.
    pub fn add_attache(&self, attache: Arc<Attache>) -> Option<Arc<Attache>> {
        let previous = self.agents.insert(attache.host_id(), attache.clone());
        metrics::set_attaches(self.agents.len());

        match previous {
            Some(old) if !Arc::ptr_eq(&old, &attache) => {
                info!(
                    host_id = attache.host_id(),
                    old = %old.kind(),
                    new = %attache.kind(),
                    "Replacing attache"
                );
                old.disconnect(HostStatus::Disconnected);
                Some(old)
            }
            _ => None,
        }
    }

    /// Retire `attache`. The table entry is removed only if it still holds
    /// this attache; a newer one that replaced it stays registered. The
    /// retiring attache is disconnected either way, but host listeners are
    /// only notified when it was the registered one.
    pub fn remove_agent(&self, attache: &Arc<Attache>, next: HostStatus) -> bool {
        let host_id = attache.host_id();
        let removed = self
            .agents
            .remove_if(&host_id, |_, current| Arc::ptr_eq(current, attache))
            .is_some();

        attache.disconnect(next);

        if !removed {
            debug!(host_id, "Attache already replaced");
            return false;
        }

        metrics::set_attaches(self.agents.len());
        for listener in self.registry.host_listeners() {
            listener.process_disconnect(host_id, next);
        }
        true
    }

    /// Send `cmds` and wait for the answers.
    ///
    /// `timeout` defaults to the configured command wait. Fails with
    /// `AgentUnavailable` when the host cannot be reached and with
    /// `OperationTimedOut` when no answer arrives in time.
    pub async fn send(
        &self,
        host_id: HostId,
        cmds: Commands,
        timeout: Option<Duration>,
    ) -> Result<Commands, AgentError> {
        let attache = self.get_attache(host_id).await?;
        let wait = timeout.unwrap_or_else(|| self.config().command_wait());

        let answers = attache
            .send_and_wait(cmds.clone(), wait)
            .await
            .map_err(AgentError::into_public)?;

        let mut cmds = cmds;
        cmds.set_answers(answers)?;
        Ok(cmds)
    }

    /// Send `cmds` and return once they are on their way. `listener`
    /// receives the answers, or a timeout if it asks for one.
    pub async fn send_async(
        &self,
        host_id: HostId,
        cmds: Commands,
        listener: Arc<dyn Listener>,
    ) -> Result<u64, AgentError> {
        let attache = self.get_attache(host_id).await?;
        let req = attache.request(cmds);
        let seq = req.seq;

        attache
            .send(req, Some(listener.clone()))
            .await
            .map_err(AgentError::into_public)?;

        if let Some(timeout) = listener.timeout() {
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if attache.cancel(seq).await {
                    debug!(host_id, seq, "Asynchronous send timed out");
                    listener.process_timeout(host_id, seq);
                }
            });
        }

        Ok(seq)
    }

    /// Best-effort single command. Returns `None` when the host is unknown
    /// or inactive, or on any failure.
    pub async fn easy_send(&self, host_id: HostId, cmd: Command) -> Option<Answer> {
        self.try_send(host_id, cmd, None).await
    }

    async fn try_send(
        &self,
        host_id: HostId,
        cmd: Command,
        timeout: Option<Duration>,
    ) -> Option<Answer> {
        let host = match self.catalog.find_by_id(host_id).await {
            Ok(Some(host)) => host,
            Ok(None) => return None,
            Err(e) => {
                warn!(host_id, error = %e, "Host lookup failed");
                return None;
            }
        };
        if !host.status.is_active() {
            debug!(host_id, status = %host.status, "Host is not active");
            return None;
        }

        let name = cmd.name.clone();
        match self.send(host_id, Commands::single(cmd), timeout).await {
            Ok(cmds) => cmds.answers().and_then(|a| a.first().cloned()),
            Err(e) => {
                warn!(host_id, command = %name, error = %e, "Command failed");
                None
            }
        }
    }

    /// Force the host to reconnect: connected agents re-handshake and direct
    /// hosts are picked up by the next scan.
    pub async fn reconnect(self: &Arc<Self>, host_id: HostId) -> Result<(), AgentError> {
        let host = self
            .catalog
            .find_by_id(host_id)
            .await
            .map_err(|e| AgentError::unavailable(host_id, format!("lookup failed: {e}")))?
            .ok_or_else(|| AgentError::unavailable(host_id, "unknown host"))?;

        if host.status.is_terminal() {
            return Err(AgentError::unavailable(
                host_id,
                format!("cannot reconnect a host in status {}", host.status),
            ));
        }

        info!(host_id, "Reconnecting host");
        self.handle_disconnect_without_investigation(
            host_id,
            HostEvent::ShutdownRequested,
        )
        .await
    }

    /// Stop sending anything but maintenance commands to the host and
    /// cancel what is outstanding.
    pub async fn pull_agent_to_maintenance(&self, host_id: HostId) -> Result<(), AgentError> {
        let attache = self
            .find_attache(host_id)
            .ok_or_else(|| AgentError::unavailable(host_id, "no attache"))?;
        info!(host_id, "Pulling agent into maintenance");
        attache.set_maintenance(true).await;
        Ok(())
    }

    pub async fn pull_agent_out_maintenance(&self, host_id: HostId) -> Result<(), AgentError> {
        let attache = self
            .find_attache(host_id)
            .ok_or_else(|| AgentError::unavailable(host_id, "no attache"))?;
        info!(host_id, "Pulling agent out of maintenance");
        attache.set_maintenance(false).await;
        Ok(())
    }
}

#[async_trait]
impl CommandSender for AgentManager {
    async fn send(
        &self,
        host_id: HostId,
        cmds: Commands,
        timeout: Option<Duration>,
    ) -> Result<Commands, AgentError> {
        AgentManager::send(self, host_id, cmds, timeout).await
    }

    async fn send_async(
        &self,
        host_id: HostId,
        cmds: Commands,
        listener: Arc<dyn Listener>,
    ) -> Result<u64, AgentError> {
        AgentManager::send_async(self, host_id, cmds, listener).await
    }

    async fn easy_send(&self, host_id: HostId, cmd: Command) -> Option<Answer> {
        AgentManager::easy_send(self, host_id, cmd).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use host_types::Host;

    fn manager(catalog: Arc<MemoryCatalog>) -> Arc<AgentManager> {
        let config = ManagerConfig {
            ms_id: 1,
            ..Default::default()
        };
        let (_tx, rx) = watch::channel(config);
        AgentManager::new(rx, Collaborators::new(catalog), None)
    }

    #[tokio::test]
    async fn replacing_an_attache_disconnects_the_old_one() {
        let mgr = manager(Arc::new(MemoryCatalog::new()));
        let first = Attache::inert(3, "h3", 1);
        let second = Attache::inert(3, "h3", 1);

        assert!(mgr.add_attache(first.clone()).is_none());
        let replaced = mgr.add_attache(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(first.is_closed());
        assert!(!second.is_closed());

        // Retiring the stale attache leaves the new one in place.
        assert!(!mgr.remove_agent(&first, HostStatus::Disconnected));
        assert!(Arc::ptr_eq(&mgr.find_attache(3).unwrap(), &second));

        assert!(mgr.remove_agent(&second, HostStatus::Disconnected));
        assert!(mgr.find_attache(3).is_none());
        assert!(second.is_closed());
    }

    #[tokio::test]
    async fn easy_send_skips_inactive_hosts() {
        let catalog = Arc::new(MemoryCatalog::new());
        let mut host = Host::new(4, "h4", "g4");
        host.status = HostStatus::Alert;
        catalog.insert(host);
        let mgr = manager(catalog);
        mgr.add_attache(Attache::inert(4, "h4", 1));

        assert!(mgr.easy_send(4, Command::check_health()).await.is_none());
        assert!(mgr.easy_send(99, Command::check_health()).await.is_none());
    }

    #[tokio::test]
    async fn maintenance_pull_requires_an_attache() {
        let mgr = manager(Arc::new(MemoryCatalog::new()));
        assert!(mgr.pull_agent_to_maintenance(5).await.is_err());

        let attache = Attache::inert(5, "h5", 1);
        mgr.add_attache(attache.clone());
        mgr.pull_agent_to_maintenance(5).await.unwrap();
        assert!(attache.in_maintenance());
        mgr.pull_agent_out_maintenance(5).await.unwrap();
        assert!(!attache.in_maintenance());
    }
}
