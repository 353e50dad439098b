// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Clustered routing
//!
//! A host's live connection is held by exactly one management server. Other
//! servers reach it through a forwarding attache that writes requests to the
//! owner over a peer socket. The owner resends them on the local attache
//! under a fresh sequence and relays the answers back keyed by the
//! originating sequence.
//!
//! Frames between servers carry the `FROM_SERVER` flag and are handled by
//! [`ClusterRouter::handle_peer_frame`]. Control frames carry cancellations
//! and the disconnect broadcast.

mod directory;
mod membership;
mod peer;
pub mod scan;

pub use directory::{
    ClusterDirectory, ClusterLock, ClusterLockGuard, LocalLock, MembershipChange, PeerInfo,
    StaticDirectory,
};
pub use membership::run_membership_loop;
pub use peer::{PeerConnections, PeerError, PeerSender};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use agent_protocol::frame::CURRENT_VERSION;
use agent_protocol::{Answer, Command, Frame, RawFrame, Request, Response};
use host_types::{Host, HostEvent, HostId, HostStatus, MsId};

use crate::attache::{Attache, ForwardingTransport};
use crate::listener::Listener;
use crate::manager::AgentManager;
use crate::metrics;

/// Name of the cluster lock serializing the direct-agent scan.
pub const SCAN_LOCK: &str = "agent-manager.direct-scan";

/// Frames from one peer link queued before its reader has to wait.
const PEER_QUEUE_DEPTH: usize = 256;

/// Relayed call: originating server and sequence, mapped to the host and the
/// sequence used on the local attache.
type RelayKey = (MsId, u64);

pub struct ClusterRouter {
    ms_id: MsId,
    directory: Arc<dyn ClusterDirectory>,
    lock: Arc<dyn ClusterLock>,
    peers: Arc<dyn PeerSender>,
    relays: Arc<DashMap<RelayKey, (HostId, u64)>>,
    /// Hosts a scan is currently loading
    loading: Mutex<HashSet<HostId>>,
}

impl ClusterRouter {
    pub fn new(
        ms_id: MsId,
        directory: Arc<dyn ClusterDirectory>,
        lock: Arc<dyn ClusterLock>,
        peers: Arc<dyn PeerSender>,
    ) -> Self {
        ClusterRouter {
            ms_id,
            directory,
            lock,
            peers,
            relays: Arc::new(DashMap::new()),
            loading: Mutex::new(HashSet::new()),
        }
    }

    pub fn ms_id(&self) -> MsId {
        self.ms_id
    }

    pub fn directory(&self) -> &Arc<dyn ClusterDirectory> {
        &self.directory
    }

    /// Calls relayed on behalf of other servers that are still outstanding.
    pub fn relayed_calls(&self) -> usize {
        self.relays.len()
    }

    pub(crate) async fn try_scan_lock(&self, timeout: Duration) -> Option<ClusterLockGuard> {
        self.lock.try_lock(SCAN_LOCK, timeout).await
    }

    /// Mark `host_id` as being loaded. Returns `false` if a load is already
    /// in progress.
    pub(crate) fn begin_load(&self, host_id: HostId) -> bool {
        self.loading.lock().insert(host_id)
    }

    pub(crate) fn end_load(&self, host_id: HostId) {
        self.loading.lock().remove(&host_id);
    }

    /// Build the stub used to reach `host` through the server that owns it.
    pub fn create_forwarding_attache(&self, host: &Host, owner: MsId) -> Arc<Attache> {
        debug!(host_id = host.id, owner, "Creating forwarding attache");
        Attache::new(
            host.id,
            host.name.clone(),
            self.ms_id,
            CURRENT_VERSION,
            Box::new(ForwardingTransport::new(
                host.id,
                self.ms_id,
                owner,
                self.peers.clone(),
            )),
        )
    }

    /// Start the consumer for frames read from one peer link. Frames are
    /// handled one at a time in arrival order; the task ends once the link
    /// drops its sender.
    pub(crate) fn spawn_peer_worker(
        self: &Arc<Self>,
        mgr: &Arc<AgentManager>,
    ) -> mpsc::Sender<RawFrame> {
        let (tx, mut rx) = mpsc::channel::<RawFrame>(PEER_QUEUE_DEPTH);
        let router = self.clone();
        let mgr = mgr.clone();
        tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                router.handle_peer_frame(&mgr, raw).await;
            }
            debug!("Peer link closed, frame queue drained");
        });
        tx
    }

    /// Handle a frame received from another management server.
    pub async fn handle_peer_frame(&self, mgr: &Arc<AgentManager>, raw: RawFrame) {
        let host_id = raw.host_id();
        let seq = raw.seq();

        if !raw.header.is_request() {
            match raw.decode() {
                Ok(Frame::Response(resp)) => match mgr.find_attache(host_id) {
                    Some(attache) => attache.process_answers(resp).await,
                    None => {
                        warn!(host_id, seq, "Relayed answers for a host with no attache");
                    }
                },
                Ok(Frame::Request(_)) => {}
                Err(e) => warn!(host_id, seq, error = %e, "Undecodable peer response"),
            }
            return;
        }

        if raw.header.is_control() {
            match raw.decode() {
                Ok(Frame::Request(req)) => self.handle_control(mgr, req).await,
                Ok(Frame::Response(_)) => {}
                Err(e) => warn!(host_id, seq, error = %e, "Undecodable control frame"),
            }
            return;
        }

        if let Some(attache) = mgr.find_attache(host_id).filter(|a| !a.is_forwarding()) {
            match raw.decode() {
                Ok(Frame::Request(req)) => self.relay_to_local(attache, req).await,
                Ok(Frame::Response(_)) => {}
                Err(e) => warn!(host_id, seq, error = %e, "Undecodable peer request"),
            }
            return;
        }

        self.reroute(mgr, raw).await;
    }

    async fn handle_control(&self, mgr: &Arc<AgentManager>, req: Request) {
        let host_id = req.host_id;
        for cmd in req.commands.to_commands() {
            if let Some(target) = cmd.cancelled_seq() {
                let Some((_, (host, local_seq))) = self.relays.remove(&(req.ms_id, target)) else {
                    // Only the first hop passes a cancel on, so stale
                    // ownership cannot bounce it between servers.
                    if req.via == req.ms_id {
                        self.pass_cancel_on(mgr, &req, cmd, target).await;
                    } else {
                        debug!(host_id, seq = target, origin = req.ms_id, "Nothing to cancel");
                    }
                    continue;
                };
                if let Some(attache) = mgr.find_attache(host) {
                    info!(host_id = host, seq = target, local_seq, "Cancelling relayed call");
                    attache.cancel(local_seq).await;
                }
            } else if let Some((changed, event)) = cmd.change_agent_event() {
                let Some(attache) = mgr.find_attache(changed).filter(|a| a.is_forwarding()) else {
                    continue;
                };
                info!(
                    host_id = changed,
                    origin = req.ms_id,
                    event = %event,
                    "Dropping forwarding attache after remote disconnect"
                );
                mgr.remove_agent(&attache, HostStatus::Disconnected);
            } else {
                warn!(host_id, command = %cmd.name, "Unexpected control command from peer");
            }
        }
    }

    /// The call being cancelled was passed on rather than relayed here:
    /// send the cancel after it.
    async fn pass_cancel_on(
        &self,
        mgr: &Arc<AgentManager>,
        req: &Request,
        cmd: &Command,
        target: u64,
    ) {
        let host_id = req.host_id;
        let Some(owner) = self.owner_elsewhere(mgr, host_id, req.ms_id).await else {
            debug!(host_id, seq = target, origin = req.ms_id, "Nothing to cancel");
            return;
        };

        let ctl =
            Request::control(req.seq, req.ms_id, host_id, cmd.clone()).relayed_by(self.ms_id);
        let bytes = match Frame::Request(ctl).to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(host_id, error = %e, "Failed to encode cancel");
                return;
            }
        };
        match self.peers.send_to_peer(owner, bytes).await {
            Ok(()) => {
                metrics::record_frame_forwarded();
                info!(host_id, seq = target, owner, "Cancel passed on to owner");
            }
            Err(e) => warn!(host_id, seq = target, owner, error = %e, "Failed to pass cancel on"),
        }
    }

    /// Server the catalog says holds `host_id`, unless that is this server
    /// or the one the frame came from.
    async fn owner_elsewhere(
        &self,
        mgr: &Arc<AgentManager>,
        host_id: HostId,
        origin: MsId,
    ) -> Option<MsId> {
        let owner = match mgr.catalog().find_by_id(host_id).await {
            Ok(Some(host)) => host.ms_id,
            Ok(None) => None,
            Err(e) => {
                warn!(host_id, error = %e, "Catalog lookup failed while routing");
                None
            }
        };
        owner.filter(|o| *o != self.ms_id && *o != origin)
    }

    async fn relay_to_local(&self, attache: Arc<Attache>, req: Request) {
        let origin = req.ms_id;
        let origin_seq = req.seq;
        let local = attache.request(req.commands.clone());
        let local_seq = local.seq;

        self.relays
            .insert((origin, origin_seq), (attache.host_id(), local_seq));

        let listener = Arc::new(RelayListener {
            ms_id: self.ms_id,
            origin: req.clone(),
            peers: self.peers.clone(),
            relays: self.relays.clone(),
        });

        debug!(
            host_id = attache.host_id(),
            origin,
            seq = origin_seq,
            local_seq,
            "Relaying request to local attache"
        );

        if let Err(e) = attache.send(local, Some(listener)).await {
            self.relays.remove(&(origin, origin_seq));
            self.reply_failure(&req, &e.to_string()).await;
        }
    }

    /// No local attache: pass the frame to the owner, or fail it back.
    async fn reroute(&self, mgr: &Arc<AgentManager>, raw: RawFrame) {
        let host_id = raw.host_id();
        let origin = raw.header.ms_id;

        if let Some(owner) = self.owner_elsewhere(mgr, host_id, origin).await {
            let forwarded = match raw.mark_forwarded(self.ms_id) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(host_id, error = %e, "Cannot relay frame");
                    return;
                }
            };
            match self.peers.send_to_peer(owner, forwarded).await {
                Ok(()) => {
                    metrics::record_frame_forwarded();
                    debug!(host_id, owner, seq = raw.seq(), "Frame passed on to owner");
                    return;
                }
                Err(e) => warn!(host_id, owner, error = %e, "Failed to pass frame on"),
            }
        }

        match raw.decode() {
            Ok(Frame::Request(req)) => {
                self.reply_failure(&req, "host is not connected to this management server")
                    .await
            }
            Ok(Frame::Response(_)) => {}
            Err(e) => warn!(host_id, error = %e, "Undecodable peer request"),
        }
    }

    async fn reply_failure(&self, req: &Request, reason: &str) {
        let answers = req
            .commands
            .to_commands()
            .iter()
            .map(|cmd| Answer::failure(cmd, reason))
            .collect();
        let resp = Response::for_request(req, answers).relayed_by(self.ms_id);
        send_response(self.peers.as_ref(), req.ms_id, resp).await;
    }

    /// Tell every peer that the connection to `host_id` was lost here.
    pub async fn notify_host_event(&self, host_id: HostId, event: HostEvent) {
        let req = Request::control(0, self.ms_id, host_id, Command::change_agent(host_id, event))
            .relayed_by(self.ms_id);
        let bytes = match Frame::Request(req).to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(host_id, error = %e, "Failed to encode host event");
                return;
            }
        };

        for peer in self.directory.peers() {
            if peer.ms_id == self.ms_id {
                continue;
            }
            if let Err(e) = self.peers.send_to_peer(peer.ms_id, bytes.clone()).await {
                warn!(host_id, peer = %peer.name, error = %e, "Failed to broadcast host event");
            }
        }
    }

    /// A peer left the cluster: forget how to reach it and release its hosts.
    pub async fn on_node_left(&self, mgr: &Arc<AgentManager>, ms_id: MsId) {
        info!(ms_id, "Management server left the cluster");
        self.peers.evict(ms_id);

        for attache in mgr.attaches() {
            if attache.forwarded_to() == Some(ms_id) {
                mgr.remove_agent(&attache, HostStatus::Disconnected);
            }
        }

        self.relays.retain(|(origin, _), _| *origin != ms_id);

        match mgr.catalog().mark_disconnected_by_node(ms_id).await {
            Ok(hosts) => info!(ms_id, hosts = hosts.len(), "Released hosts of departed server"),
            Err(e) => warn!(ms_id, error = %e, "Failed to release hosts of departed server"),
        }
    }

    pub fn on_node_joined(&self, ms_id: MsId) {
        match self.directory.peer(ms_id) {
            Some(peer) => info!(ms_id, peer = %peer.name, addr = %peer.addr, "Management server joined"),
            None => info!(ms_id, "Management server joined"),
        }
    }
}

async fn send_response(peers: &dyn PeerSender, to: MsId, resp: Response) {
    let host_id = resp.host_id;
    let seq = resp.seq;
    let bytes = match Frame::Response(resp).to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(host_id, seq, error = %e, "Failed to encode relayed answers");
            return;
        }
    };
    if let Err(e) = peers.send_to_peer(to, bytes).await {
        warn!(host_id, seq, origin = to, error = %e, "Failed to return relayed answers");
    }
}

/// Carries answers for a relayed call back to the server that asked.
struct RelayListener {
    ms_id: MsId,
    origin: Request,
    peers: Arc<dyn PeerSender>,
    relays: Arc<DashMap<RelayKey, (HostId, u64)>>,
}

impl RelayListener {
    fn reply(&self, answers: Vec<Answer>) {
        self.relays.remove(&(self.origin.ms_id, self.origin.seq));
        let resp = Response::for_request(&self.origin, answers).relayed_by(self.ms_id);
        let peers = self.peers.clone();
        let to = self.origin.ms_id;
        tokio::spawn(async move {
            send_response(peers.as_ref(), to, resp).await;
        });
    }
}

impl Listener for RelayListener {
    fn process_answers(&self, _host_id: HostId, _seq: u64, answers: &[Answer]) -> bool {
        self.reply(answers.to_vec());
        true
    }

    fn process_disconnect(&self, _host_id: HostId, status: HostStatus) -> bool {
        let reason = format!("host went {status} while the call was relayed");
        let answers = self
            .origin
            .commands
            .to_commands()
            .iter()
            .map(|cmd| Answer::failure(cmd, reason.as_str()))
            .collect();
        self.reply(answers);
        true
    }
}
