// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Cluster membership driven by the configured peer list
//!
//! A config reload that changes `cluster_peers` is diffed against the
//! directory. Servers that joined are announced, servers that left have
//! their hosts released, and cached sockets to servers that moved are dropped.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use super::{ClusterRouter, MembershipChange, StaticDirectory};
use crate::config::ManagerConfig;
use crate::manager::AgentManager;

impl ClusterRouter {
    pub async fn apply_membership(&self, mgr: &Arc<AgentManager>, change: &MembershipChange) {
        for ms_id in &change.joined {
            self.on_node_joined(*ms_id);
        }
        for ms_id in &change.moved {
            info!(ms_id, "Peer address changed, dropping its socket");
            self.peers.evict(*ms_id);
        }
        for ms_id in &change.left {
            self.on_node_left(mgr, *ms_id).await;
        }
    }
}

/// Follow the configured peer list until shutdown.
pub async fn run_membership_loop(
    mgr: Arc<AgentManager>,
    router: Arc<ClusterRouter>,
    directory: Arc<StaticDirectory>,
    mut config: watch::Receiver<ManagerConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = config.changed() => {
                if changed.is_err() {
                    break;
                }
                let peers = config.borrow_and_update().cluster_peers.clone();
                let change = directory.replace(peers, router.ms_id());
                if change.is_empty() {
                    continue;
                }
                info!(
                    joined = ?change.joined,
                    left = ?change.left,
                    moved = ?change.moved,
                    "Cluster membership changed"
                );
                router.apply_membership(&mgr, &change).await;
            }
        }
    }
    debug!("Membership loop finished");
}
