// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Periodic scan for in-process hosts nobody has loaded
//!
//! Only one server scans at a time. A server that cannot take the cluster
//! lock within the configured timeout skips the cycle.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::manager::AgentManager;

use super::ClusterRouter;

/// Run one scan. Returns the number of hosts a load was started for.
pub async fn scan_once(mgr: &Arc<AgentManager>, router: &Arc<ClusterRouter>) -> usize {
    let config = mgr.config();

    let Some(guard) = router.try_scan_lock(config.scan_lock_timeout()).await else {
        debug!("Another server holds the scan lock, skipping");
        return 0;
    };

    let silent_for = chrono::Duration::from_std(config.ping_timeout())
        .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
    let cutoff = Utc::now() - silent_for;

    let hosts = match mgr
        .catalog()
        .claim_hosts_to_load(router.ms_id(), cutoff, config.scan_batch_size)
        .await
    {
        Ok(hosts) => hosts,
        Err(e) => {
            warn!(error = %e, "Failed to list hosts to load");
            return 0;
        }
    };

    // Claimed hosts now carry our id, so the lock is no longer needed.
    drop(guard);

    let mut loads = JoinSet::new();
    for host in hosts {
        if mgr.find_attache(host.id).is_some() || !router.begin_load(host.id) {
            debug!(host_id = host.id, "Host already loaded or loading");
            continue;
        }

        let mgr = mgr.clone();
        let router = router.clone();
        loads.spawn(async move {
            let host_id = host.id;
            if let Err(e) = mgr.load_direct_host(host).await {
                warn!(host_id, error = %e, "Failed to load direct host");
            }
            router.end_load(host_id);
        });
    }

    let started = loads.len();
    if started > 0 {
        info!(started, "Loading direct hosts");
    }
    while loads.join_next().await.is_some() {}
    started
}

/// Scan every `scan_interval` until shutdown.
pub async fn run_scan_loop(
    mgr: Arc<AgentManager>,
    router: Arc<ClusterRouter>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let interval = mgr.config().scan_interval();
        tokio::select! {
            _ = shutdown.changed() => {
                info!("Direct host scan shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                scan_once(&mgr, &router).await;
            }
        }
    }
}
