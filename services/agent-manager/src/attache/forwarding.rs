// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

use std::sync::Arc;

use async_trait::async_trait;

use agent_protocol::{Command, Frame, Request, Response};
use host_types::{HostId, MsId};

use super::{AttacheKind, Transport};
use crate::cluster::PeerSender;
use crate::error::AgentError;
use crate::metrics;

/// Stub for a host whose connection lives on another cluster node.
///
/// Requests are marked as coming from this node and written to the owner's
/// peer socket; the owner relays the answers back under the same sequence.
pub struct ForwardingTransport {
    host_id: HostId,
    ms_id: MsId,
    owner: MsId,
    peers: Arc<dyn PeerSender>,
}

impl ForwardingTransport {
    pub fn new(host_id: HostId, ms_id: MsId, owner: MsId, peers: Arc<dyn PeerSender>) -> Self {
        ForwardingTransport {
            host_id,
            ms_id,
            owner,
            peers,
        }
    }

    async fn forward(&self, req: Request) -> Result<(), AgentError> {
        let bytes = Frame::Request(req.relayed_by(self.ms_id)).to_bytes()?;
        self.peers
            .send_to_peer(self.owner, bytes)
            .await
            .map_err(|e| AgentError::unavailable(self.host_id, e.to_string()))?;
        metrics::record_frame_forwarded();
        Ok(())
    }
}

#[async_trait]
impl Transport for ForwardingTransport {
    fn kind(&self) -> AttacheKind {
        AttacheKind::Forwarding
    }

    async fn deliver(&self, req: Request) -> Result<Option<Response>, AgentError> {
        self.forward(req).await?;
        Ok(None)
    }

    async fn cancel_remote(&self, seq: u64) -> Result<(), AgentError> {
        let ctl = Request::control(
            seq,
            self.ms_id,
            self.host_id,
            Command::cancel(seq, "cancelled by originating node"),
        );
        self.forward(ctl).await
    }

    fn peer(&self) -> Option<MsId> {
        Some(self.owner)
    }

    fn close(&self) {}
}
