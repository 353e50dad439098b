// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Sockets to peer management servers
//!
//! Peers connect to each other on the agent port. Connections are opened on
//! first use and cached per peer; they are write-only from this side, since
//! the peer answers on its own connection back to us.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, warn};

use agent_protocol::AgentCodec;
use host_types::MsId;

use super::directory::ClusterDirectory;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("management server {0} is not a known peer")]
    Unknown(MsId),

    #[error("failed to connect to management server {ms_id}: {source}")]
    Connect {
        ms_id: MsId,
        #[source]
        source: std::io::Error,
    },

    #[error("gave up sending to management server {ms_id} after {attempts} attempts")]
    Exhausted { ms_id: MsId, attempts: u32 },
}

/// Writes already-encoded frames to another management server.
#[async_trait]
pub trait PeerSender: Send + Sync {
    async fn send_to_peer(&self, ms_id: MsId, bytes: Bytes) -> Result<(), PeerError>;

    /// Forget any cached connection to `ms_id`.
    fn evict(&self, _ms_id: MsId) {}
}

type PeerWriter = Arc<tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, AgentCodec>>>;
type PeerTable = Arc<Mutex<HashMap<MsId, PeerWriter>>>;

/// Connection cache keyed by peer id.
pub struct PeerConnections {
    directory: Arc<dyn ClusterDirectory>,
    conns: PeerTable,
    retries: u32,
}

fn remove_if_same(table: &PeerTable, ms_id: MsId, writer: &PeerWriter) -> bool {
    let mut conns = table.lock();
    match conns.get(&ms_id) {
        Some(current) if Arc::ptr_eq(current, writer) => {
            conns.remove(&ms_id);
            true
        }
        _ => false,
    }
}

impl PeerConnections {
    pub fn new(directory: Arc<dyn ClusterDirectory>, retries: u32) -> Self {
        PeerConnections {
            directory,
            conns: Arc::new(Mutex::new(HashMap::new())),
            retries: retries.max(1),
        }
    }

    /// Number of cached peer sockets.
    pub fn connected(&self) -> usize {
        self.conns.lock().len()
    }

    async fn writer(&self, ms_id: MsId) -> Result<PeerWriter, PeerError> {
        if let Some(writer) = self.conns.lock().get(&ms_id) {
            return Ok(writer.clone());
        }

        // Resolve on every connect so a peer that moved is found again.
        let peer = self.directory.peer(ms_id).ok_or(PeerError::Unknown(ms_id))?;
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&peer.addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(PeerError::Connect { ms_id, source }),
            Err(_) => {
                return Err(PeerError::Connect {
                    ms_id,
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ),
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(ms_id, error = %e, "Failed to set TCP_NODELAY on peer socket");
        }
        info!(ms_id, peer = %peer.name, addr = %peer.addr, "Connected to peer");

        let (mut read_half, write_half) = stream.into_split();
        let writer: PeerWriter = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
            write_half,
            AgentCodec::new(),
        )));

        let writer = {
            let mut conns = self.conns.lock();
            conns.entry(ms_id).or_insert_with(|| writer.clone()).clone()
        };

        // Nothing is expected back on this socket; EOF means the peer went
        // away and the next send reconnects.
        let table = self.conns.clone();
        let watched = writer.clone();
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut read_half, &mut tokio::io::sink()).await;
            if remove_if_same(&table, ms_id, &watched) {
                debug!(ms_id, "Peer socket closed");
            }
        });

        Ok(writer)
    }
}

#[async_trait]
impl PeerSender for PeerConnections {
    async fn send_to_peer(&self, ms_id: MsId, bytes: Bytes) -> Result<(), PeerError> {
        for attempt in 1..=self.retries {
            let writer = match self.writer(ms_id).await {
                Ok(writer) => writer,
                Err(PeerError::Unknown(id)) => return Err(PeerError::Unknown(id)),
                Err(e) => {
                    warn!(ms_id, attempt, error = %e, "Peer connect failed");
                    continue;
                }
            };

            let result = writer.lock().await.send(bytes.clone()).await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(ms_id, attempt, error = %e, "Peer write failed, reconnecting");
                    remove_if_same(&self.conns, ms_id, &writer);
                }
            }
        }

        Err(PeerError::Exhausted {
            ms_id,
            attempts: self.retries,
        })
    }

    fn evict(&self, ms_id: MsId) {
        if self.conns.lock().remove(&ms_id).is_some() {
            debug!(ms_id, "Evicted peer socket");
        }
    }
}
