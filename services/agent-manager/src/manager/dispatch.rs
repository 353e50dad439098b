// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Frames read from agent connections, and traffic from in-process hosts

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use agent_protocol::{Answer, Commands, Frame, RawFrame, Request, Response, command::execute_batch};
use host_types::{HostEvent, HostId, HostStatus};

use super::AgentManager;
use crate::attache::{Attache, DirectEvent};
use crate::error::AgentError;
use crate::link::LinkHandle;

impl AgentManager {
    /// Handle one frame read from `link`.
    pub(crate) async fn handle_frame(
        self: &Arc<Self>,
        link: &Arc<LinkHandle>,
        raw: RawFrame,
    ) -> Result<(), AgentError> {
        if raw.header.from_server() {
            let Some(cluster) = self.cluster.clone() else {
                warn!(peer = %link.peer(), "Peer frame received but clustering is off");
                return Ok(());
            };
            let queue = link.peer_queue(|| cluster.spawn_peer_worker(self));
            if queue.send(raw).await.is_err() {
                debug!(peer = %link.peer(), "Peer frame queue closed, dropping frame");
            }
            return Ok(());
        }

        match raw.decode()? {
            Frame::Response(resp) => match link.attache() {
                Some(attache) => attache.process_answers(resp).await,
                None => warn!(peer = %link.peer(), seq = resp.seq, "Answers before startup"),
            },
            Frame::Request(req) => match link.attache() {
                None if req.is_startup() => {
                    let mgr = self.clone();
                    let link = link.clone();
                    tokio::spawn(async move {
                        if let Err(e) = mgr.handle_connect(link, req).await {
                            warn!(error = %e, "Startup handshake failed");
                        }
                    });
                }
                None => {
                    warn!(
                        peer = %link.peer(),
                        seq = req.seq,
                        "First request on a connection is not a startup, closing"
                    );
                    link.close();
                }
                Some(attache) => {
                    let mgr = self.clone();
                    let link = link.clone();
                    let permit = self.workers.clone().acquire_owned().await.map_err(|_| {
                        AgentError::unavailable(attache.host_id(), "worker pool closed")
                    })?;
                    tokio::spawn(async move {
                        mgr.process_request(&link, attache, req).await;
                        drop(permit);
                    });
                }
            },
        }
        Ok(())
    }

    async fn process_request(self: &Arc<Self>, link: &LinkHandle, attache: Arc<Attache>, req: Request) {
        let host_id = attache.host_id();
        let (answers, shutdown) = self.process_commands(host_id, req.seq, &req.commands).await;

        if let Err(e) = link
            .send_frame(Frame::Response(Response::for_request(&req, answers)))
            .await
        {
            debug!(host_id, seq = req.seq, error = %e, "Could not answer agent");
        }

        if shutdown {
            info!(host_id, "Agent is shutting down");
            if let Err(e) = self
                .disconnect_attache(attache, HostEvent::ShutdownRequested)
                .await
            {
                warn!(host_id, error = %e, "Disconnect after agent shutdown failed");
            }
        }
    }

    /// Answer commands sent by a host. Command listeners get the first say;
    /// pings and shutdowns nobody claimed are acknowledged, anything else is
    /// reported as unsupported. The flag is set when the host announced it is
    /// shutting down.
    pub(crate) async fn process_commands(
        self: &Arc<Self>,
        host_id: HostId,
        seq: u64,
        cmds: &Commands,
    ) -> (Vec<Answer>, bool) {
        let listeners = self.registry.command_listeners();
        let mut pinged = false;
        let mut shutdown = false;

        let answers = execute_batch(cmds.to_commands(), cmds.stop_on_error(), |cmd| {
            pinged |= cmd.is_ping();
            shutdown |= cmd.is_shutdown();
            listeners
                .iter()
                .find_map(|l| l.process_command(host_id, seq, cmd))
                .unwrap_or_else(|| {
                    if cmd.is_ping() || cmd.is_shutdown() {
                        Answer::success(cmd, Value::Null)
                    } else {
                        debug!(host_id, command = %cmd.name, "No listener for command");
                        Answer::unsupported(cmd)
                    }
                })
        });

        if pinged {
            self.record_ping(host_id).await;
        }
        (answers, shutdown)
    }

    async fn record_ping(self: &Arc<Self>, host_id: HostId) {
        if let Err(e) = self.catalog.update_last_pinged(host_id, Utc::now()).await {
            warn!(host_id, error = %e, "Failed to record ping");
            return;
        }

        let status = match self.catalog.find_by_id(host_id).await {
            Ok(Some(host)) => host.status,
            Ok(None) => return,
            Err(e) => {
                warn!(host_id, error = %e, "Host lookup failed");
                return;
            }
        };
        if matches!(status, HostStatus::Alert | HostStatus::Disconnected)
            && let Err(e) = self.transit(host_id, HostEvent::Ping).await
        {
            warn!(host_id, error = %e, "Failed to bring host back up");
        }
    }

    /// Consume pings and losses reported by in-process hosts until shutdown.
    /// Returns `None` if the loop was already started.
    pub fn run_direct_events(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        let mut events = self.direct_rx.lock().take()?;
        let mgr = self.clone();

        Some(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => event,
                };
                match event {
                    Some(DirectEvent::Ping { host_id, cmd }) => {
                        let cmds = Commands::single(cmd);
                        mgr.process_commands(host_id, 0, &cmds).await;
                    }
                    Some(DirectEvent::Lost { host_id }) => {
                        mgr.disconnect_with_investigation(host_id, HostEvent::AgentDisconnected);
                    }
                    None => break,
                }
            }
            debug!("Direct event loop finished");
        }))
    }
}
