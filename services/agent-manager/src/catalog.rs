// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Host catalog
//!
//! The persistent record of hosts lives outside the agent manager. This module
//! defines the narrow set of lookups and updates the manager needs, plus an
//! in-memory implementation used by the binary and by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use agent_protocol::Command;
use host_types::{ClusterId, Host, HostId, HostStatus, HostType, MsId, ResourceState, ZoneId};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("host {0} not found")]
    NotFound(HostId),

    #[error("startup command is missing host identity: {0}")]
    InvalidStartup(String),

    #[error("catalog backend error: {0}")]
    Backend(String),
}

/// Host identity reported by an agent in its startup command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupInfo {
    pub guid: String,
    pub name: String,
    #[serde(default)]
    pub host_type: HostType,
    #[serde(default)]
    pub zone_id: ZoneId,
    #[serde(default)]
    pub cluster_id: Option<ClusterId>,
}

impl StartupInfo {
    pub fn from_command(cmd: &Command) -> Result<Self, CatalogError> {
        if !cmd.is_startup() {
            return Err(CatalogError::InvalidStartup(format!(
                "{} is not a startup command",
                cmd.name
            )));
        }
        serde_json::from_value(cmd.payload.clone())
            .map_err(|e| CatalogError::InvalidStartup(e.to_string()))
    }
}

#[async_trait]
pub trait HostCatalog: Send + Sync {
    async fn find_by_id(&self, host_id: HostId) -> Result<Option<Host>, CatalogError>;

    /// Look a host up by guid, registering it if it is new.
    async fn find_or_create(&self, info: &StartupInfo) -> Result<Host, CatalogError>;

    /// Move a host from `expected` to `next` and record its owner.
    ///
    /// Returns `false` without writing if the stored status is no longer
    /// `expected`.
    async fn update_status(
        &self,
        host_id: HostId,
        expected: HostStatus,
        next: HostStatus,
        owner: Option<MsId>,
    ) -> Result<bool, CatalogError>;

    async fn update_last_pinged(
        &self,
        host_id: HostId,
        at: DateTime<Utc>,
    ) -> Result<(), CatalogError>;

    /// Release every host owned by `ms_id`, marking connected ones
    /// disconnected. Returns the affected host ids.
    async fn mark_disconnected_by_node(&self, ms_id: MsId) -> Result<Vec<HostId>, CatalogError>;

    /// Claim up to `limit` in-process hosts that nobody has loaded and that
    /// have not pinged since `cutoff`. Claimed hosts are owned by `ms_id`.
    async fn claim_hosts_to_load(
        &self,
        ms_id: MsId,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Host>, CatalogError>;

    async fn list_by_resource_state(
        &self,
        state: ResourceState,
    ) -> Result<Vec<Host>, CatalogError>;

    /// Number of running or migrating workloads on the host.
    async fn count_active_workloads(&self, host_id: HostId) -> Result<usize, CatalogError>;

    async fn update_resource_state(
        &self,
        host_id: HostId,
        state: ResourceState,
    ) -> Result<(), CatalogError>;
}

/// An in-memory host catalog.
#[derive(Default)]
pub struct MemoryCatalog {
    hosts: RwLock<HashMap<HostId, Host>>,
    workloads: RwLock<HashMap<HostId, usize>>,
    next_id: AtomicU64,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        MemoryCatalog {
            next_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    /// Insert or replace a host record.
    pub fn insert(&self, host: Host) {
        self.next_id.fetch_max(host.id + 1, Ordering::SeqCst);
        self.hosts.write().insert(host.id, host);
    }

    pub fn get(&self, host_id: HostId) -> Option<Host> {
        self.hosts.read().get(&host_id).cloned()
    }

    pub fn set_workloads(&self, host_id: HostId, count: usize) {
        self.workloads.write().insert(host_id, count);
    }
}

#[async_trait]
impl HostCatalog for MemoryCatalog {
    async fn find_by_id(&self, host_id: HostId) -> Result<Option<Host>, CatalogError> {
        Ok(self.get(host_id))
    }

    async fn find_or_create(&self, info: &StartupInfo) -> Result<Host, CatalogError> {
        let mut hosts = self.hosts.write();
        if let Some(host) = hosts
            .values()
            .find(|h| h.guid == info.guid && h.removed.is_none())
        {
            return Ok(host.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut host = Host::new(id, info.name.clone(), info.guid.clone());
        host.host_type = info.host_type;
        host.zone_id = info.zone_id;
        host.cluster_id = info.cluster_id;
        hosts.insert(id, host.clone());
        Ok(host)
    }

    async fn update_status(
        &self,
        host_id: HostId,
        expected: HostStatus,
        next: HostStatus,
        owner: Option<MsId>,
    ) -> Result<bool, CatalogError> {
        let mut hosts = self.hosts.write();
        let host = hosts
            .get_mut(&host_id)
            .ok_or(CatalogError::NotFound(host_id))?;
        if host.status != expected {
            return Ok(false);
        }
        host.status = next;
        host.ms_id = owner;
        if next == HostStatus::Removed {
            host.removed = Some(Utc::now());
        }
        Ok(true)
    }

    async fn update_last_pinged(
        &self,
        host_id: HostId,
        at: DateTime<Utc>,
    ) -> Result<(), CatalogError> {
        let mut hosts = self.hosts.write();
        let host = hosts
            .get_mut(&host_id)
            .ok_or(CatalogError::NotFound(host_id))?;
        host.last_pinged = at;
        Ok(())
    }

    async fn mark_disconnected_by_node(&self, ms_id: MsId) -> Result<Vec<HostId>, CatalogError> {
        let mut hosts = self.hosts.write();
        let mut affected = Vec::new();
        for host in hosts.values_mut().filter(|h| h.ms_id == Some(ms_id)) {
            host.ms_id = None;
            if host.status.is_active() {
                host.status = HostStatus::Disconnected;
            }
            affected.push(host.id);
        }
        Ok(affected)
    }

    async fn claim_hosts_to_load(
        &self,
        ms_id: MsId,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Host>, CatalogError> {
        let mut hosts = self.hosts.write();
        let mut claimed = Vec::new();
        for host in hosts.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            let loadable = host.host_type == HostType::ExternalDevice
                && host.removed.is_none()
                && !host.status.is_terminal()
                && host.last_pinged < cutoff
                && host.ms_id.is_none_or(|owner| owner == ms_id);
            if loadable {
                host.ms_id = Some(ms_id);
                claimed.push(host.clone());
            }
        }
        Ok(claimed)
    }

    async fn list_by_resource_state(
        &self,
        state: ResourceState,
    ) -> Result<Vec<Host>, CatalogError> {
        Ok(self
            .hosts
            .read()
            .values()
            .filter(|h| h.resource_state == state && h.removed.is_none())
            .cloned()
            .collect())
    }

    async fn count_active_workloads(&self, host_id: HostId) -> Result<usize, CatalogError> {
        Ok(self.workloads.read().get(&host_id).copied().unwrap_or(0))
    }

    async fn update_resource_state(
        &self,
        host_id: HostId,
        state: ResourceState,
    ) -> Result<(), CatalogError> {
        let mut hosts = self.hosts.write();
        let host = hosts
            .get_mut(&host_id)
            .ok_or(CatalogError::NotFound(host_id))?;
        host.resource_state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_protocol::command::names;
    use serde_json::json;

    fn startup(guid: &str) -> StartupInfo {
        StartupInfo {
            guid: guid.to_string(),
            name: format!("host-{guid}"),
            host_type: HostType::Routing,
            zone_id: 1,
            cluster_id: None,
        }
    }

    #[tokio::test]
    async fn find_or_create_is_idempotent_by_guid() {
        let catalog = MemoryCatalog::new();
        let a = catalog.find_or_create(&startup("g1")).await.unwrap();
        let b = catalog.find_or_create(&startup("g1")).await.unwrap();
        let c = catalog.find_or_create(&startup("g2")).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.status, HostStatus::Creating);
    }

    #[tokio::test]
    async fn update_status_is_compare_and_set() {
        let catalog = MemoryCatalog::new();
        let host = catalog.find_or_create(&startup("g1")).await.unwrap();

        let moved = catalog
            .update_status(host.id, HostStatus::Creating, HostStatus::Connecting, Some(3))
            .await
            .unwrap();
        assert!(moved);

        let stale = catalog
            .update_status(host.id, HostStatus::Creating, HostStatus::Up, Some(3))
            .await
            .unwrap();
        assert!(!stale);
        assert_eq!(catalog.get(host.id).unwrap().status, HostStatus::Connecting);
        assert_eq!(catalog.get(host.id).unwrap().ms_id, Some(3));
    }

    #[tokio::test]
    async fn claim_skips_hosts_owned_elsewhere() {
        let catalog = MemoryCatalog::new();
        let past = Utc::now() - chrono::Duration::minutes(10);

        let mut mine = Host::new(1, "d1", "g-d1");
        mine.host_type = HostType::ExternalDevice;
        mine.status = HostStatus::Disconnected;
        mine.last_pinged = past;

        let mut theirs = mine.clone();
        theirs.id = 2;
        theirs.guid = "g-d2".to_string();
        theirs.ms_id = Some(9);

        catalog.insert(mine);
        catalog.insert(theirs);

        let claimed = catalog
            .claim_hosts_to_load(1, Utc::now(), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, 1);
        assert_eq!(catalog.get(1).unwrap().ms_id, Some(1));
    }

    #[tokio::test]
    async fn mark_disconnected_by_node_releases_ownership() {
        let catalog = MemoryCatalog::new();
        let mut host = Host::new(5, "h5", "g5");
        host.status = HostStatus::Up;
        host.ms_id = Some(2);
        catalog.insert(host);

        let affected = catalog.mark_disconnected_by_node(2).await.unwrap();
        assert_eq!(affected, vec![5]);
        let host = catalog.get(5).unwrap();
        assert_eq!(host.status, HostStatus::Disconnected);
        assert_eq!(host.ms_id, None);
    }

    #[test]
    fn startup_info_requires_startup_command() {
        let ok = Command::new(
            names::STARTUP_ROUTING,
            json!({ "guid": "abc", "name": "hv1" }),
        );
        let info = StartupInfo::from_command(&ok).unwrap();
        assert_eq!(info.guid, "abc");
        assert_eq!(info.host_type, HostType::Routing);

        let ping = Command::ping(1);
        assert!(StartupInfo::from_command(&ping).is_err());
    }
}
