// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::link;
use crate::manager::AgentManager;

/// Accept agent and peer connections until shutdown.
pub async fn serve(
    mgr: Arc<AgentManager>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Accepting agent connections");
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("Listener shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    link::spawn_link(mgr.clone(), stream, peer);
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
        }
    }
}
