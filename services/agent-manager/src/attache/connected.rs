// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use agent_protocol::{Frame, Request, Response};
use host_types::HostId;

use super::{AttacheKind, Transport};
use crate::error::AgentError;

/// Transport over a live agent connection.
///
/// Frames are handed to the connection's writer task; closing signals both
/// halves of the connection to stop.
pub struct SocketTransport {
    host_id: HostId,
    writer: mpsc::Sender<Bytes>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SocketTransport {
    pub fn new(
        host_id: HostId,
        writer: mpsc::Sender<Bytes>,
        shutdown: Arc<watch::Sender<bool>>,
    ) -> Self {
        SocketTransport {
            host_id,
            writer,
            shutdown,
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> AttacheKind {
        AttacheKind::Connected
    }

    async fn deliver(&self, req: Request) -> Result<Option<Response>, AgentError> {
        let bytes = Frame::Request(req).to_bytes()?;
        self.writer
            .send(bytes)
            .await
            .map_err(|_| AgentError::ChannelClosed(self.host_id))?;
        Ok(None)
    }

    fn close(&self) {
        self.shutdown.send_replace(true);
    }
}
