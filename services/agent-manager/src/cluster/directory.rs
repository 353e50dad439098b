// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Cluster membership and the cluster-wide scan lock

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use host_types::MsId;

/// A management server other than this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub ms_id: MsId,
    pub name: String,
    /// `host:port` of the peer's agent listener
    pub addr: String,
}

/// Resolves peer management servers.
pub trait ClusterDirectory: Send + Sync {
    fn peer(&self, ms_id: MsId) -> Option<PeerInfo>;

    /// Every known peer, excluding this node.
    fn peers(&self) -> Vec<PeerInfo>;
}

/// Directory backed by a fixed list, adjusted on node join/leave.
#[derive(Default)]
pub struct StaticDirectory {
    peers: RwLock<BTreeMap<MsId, PeerInfo>>,
}

impl StaticDirectory {
    pub fn new(peers: impl IntoIterator<Item = PeerInfo>) -> Self {
        StaticDirectory {
            peers: RwLock::new(peers.into_iter().map(|p| (p.ms_id, p)).collect()),
        }
    }

    pub fn add(&self, peer: PeerInfo) {
        self.peers.write().insert(peer.ms_id, peer);
    }

    pub fn remove(&self, ms_id: MsId) -> Option<PeerInfo> {
        self.peers.write().remove(&ms_id)
    }

    /// Swap in a new peer list, leaving out `local`, and report what changed.
    pub fn replace(
        &self,
        peers: impl IntoIterator<Item = PeerInfo>,
        local: MsId,
    ) -> MembershipChange {
        let next: BTreeMap<MsId, PeerInfo> = peers
            .into_iter()
            .filter(|p| p.ms_id != local)
            .map(|p| (p.ms_id, p))
            .collect();

        let mut current = self.peers.write();
        let mut change = MembershipChange::default();
        for (id, peer) in &next {
            match current.get(id) {
                None => change.joined.push(*id),
                Some(old) if old != peer => change.moved.push(*id),
                Some(_) => {}
            }
        }
        change.left = current
            .keys()
            .filter(|id| !next.contains_key(id))
            .copied()
            .collect();
        *current = next;
        change
    }
}

/// Difference between two peer lists.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub joined: Vec<MsId>,
    pub left: Vec<MsId>,
    /// Still members, but with a new name or address
    pub moved: Vec<MsId>,
}

impl MembershipChange {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty() && self.moved.is_empty()
    }
}

impl ClusterDirectory for StaticDirectory {
    fn peer(&self, ms_id: MsId) -> Option<PeerInfo> {
        self.peers.read().get(&ms_id).cloned()
    }

    fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().values().cloned().collect()
    }
}

/// Held while a cluster-wide lock is owned. Dropping it releases the lock.
pub struct ClusterLockGuard(#[allow(dead_code)] Box<dyn Send>);

impl ClusterLockGuard {
    pub fn new(inner: impl Send + 'static) -> Self {
        ClusterLockGuard(Box::new(inner))
    }
}

/// Cooperative mutual exclusion across management servers.
#[async_trait]
pub trait ClusterLock: Send + Sync {
    /// Try to take `name`, giving up after `timeout`.
    async fn try_lock(&self, name: &str, timeout: Duration) -> Option<ClusterLockGuard>;
}

/// Lock for a single-node deployment.
#[derive(Default)]
pub struct LocalLock {
    locks: parking_lot::Mutex<BTreeMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalLock {
    pub fn new() -> Self {
        LocalLock::default()
    }
}

#[async_trait]
impl ClusterLock for LocalLock {
    async fn try_lock(&self, name: &str, timeout: Duration) -> Option<ClusterLockGuard> {
        let lock = self
            .locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone();
        let guard = tokio::time::timeout(timeout, lock.lock_owned()).await.ok()?;
        Some(ClusterLockGuard::new(guard))
    }
}
