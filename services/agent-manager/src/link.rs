// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! One accepted TCP connection, from an agent or from a peer server
//!
//! Each link runs a reader task and a writer task. The writer drains a
//! bounded queue of encoded frames; everything that sends to the agent goes
//! through it, so frames reach the socket in the order they were queued.
//! Both tasks stop when the link's shutdown flag is raised.
//!
//! Frames from a peer management server are handed to a per-link queue with
//! a single consumer, so requests relayed on one socket reach the local
//! attache in the order they were written.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use agent_protocol::{AgentCodec, Frame, RawFrame};
use host_types::HostEvent;

use crate::attache::Attache;
use crate::error::AgentError;
use crate::manager::AgentManager;

/// Frames queued for the writer before senders have to wait.
const WRITE_QUEUE_DEPTH: usize = 128;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

pub struct LinkHandle {
    id: u64,
    peer: SocketAddr,
    tx: mpsc::Sender<Bytes>,
    shutdown: Arc<watch::Sender<bool>>,
    attache: Mutex<Option<Arc<Attache>>>,
    /// Frames from a peer server, handled in arrival order
    peer_frames: Mutex<Option<mpsc::Sender<RawFrame>>>,
}

impl LinkHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn attache(&self) -> Option<Arc<Attache>> {
        self.attache.lock().clone()
    }

    pub fn set_attache(&self, attache: Arc<Attache>) {
        *self.attache.lock() = Some(attache);
    }

    /// Queue for frames a peer server sends on this link, started by
    /// `start` on first use.
    pub fn peer_queue(
        &self,
        start: impl FnOnce() -> mpsc::Sender<RawFrame>,
    ) -> mpsc::Sender<RawFrame> {
        self.peer_frames.lock().get_or_insert_with(start).clone()
    }

    pub fn sender(&self) -> mpsc::Sender<Bytes> {
        self.tx.clone()
    }

    pub fn shutdown_handle(&self) -> Arc<watch::Sender<bool>> {
        self.shutdown.clone()
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<(), AgentError> {
        let bytes = frame.to_bytes()?;
        let host_id = self.attache().map(|a| a.host_id()).unwrap_or_default();
        self.tx
            .send(bytes)
            .await
            .map_err(|_| AgentError::ChannelClosed(host_id))
    }

    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Start the reader and writer tasks for an accepted connection.
pub fn spawn_link(mgr: Arc<AgentManager>, stream: TcpStream, peer: SocketAddr) -> Arc<LinkHandle> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);
    let (shutdown_tx, _) = watch::channel(false);
    let shutdown = Arc::new(shutdown_tx);

    let link = Arc::new(LinkHandle {
        id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
        peer,
        tx,
        shutdown: shutdown.clone(),
        attache: Mutex::new(None),
        peer_frames: Mutex::new(None),
    });
    debug!(link = link.id, peer = %peer, "Connection accepted");

    let (read_half, write_half) = stream.into_split();

    let mut writer_stop = shutdown.subscribe();
    let writer_link = link.clone();
    tokio::spawn(async move {
        let mut writer = FramedWrite::new(write_half, AgentCodec::new());
        loop {
            // Queued frames are flushed before a close takes effect.
            let bytes = tokio::select! {
                biased;
                bytes = rx.recv() => match bytes {
                    Some(bytes) => bytes,
                    None => break,
                },
                _ = writer_stop.changed() => break,
            };
            if let Err(e) = writer.send(bytes).await {
                warn!(peer = %writer_link.peer(), error = %e, "Write failed");
                writer_link.close();
                break;
            }
        }
    });

    let mut reader_stop = shutdown.subscribe();
    let reader_link = link.clone();
    tokio::spawn(async move {
        let link = reader_link;
        let mut reader = FramedRead::new(read_half, AgentCodec::new());
        loop {
            let next = tokio::select! {
                _ = reader_stop.changed() => break,
                next = reader.next() => next,
            };
            match next {
                Some(Ok(raw)) => match mgr.handle_frame(&link, raw).await {
                    Ok(()) => {}
                    Err(e @ AgentError::UnsupportedProtocolVersion(_)) => {
                        warn!(peer = %link.peer(), error = %e, "Dropping connection");
                        break;
                    }
                    Err(e) => warn!(peer = %link.peer(), error = %e, "Bad frame"),
                },
                Some(Err(e)) => {
                    warn!(peer = %link.peer(), error = %e, "Dropping connection");
                    break;
                }
                None => {
                    debug!(peer = %link.peer(), "Connection closed by peer");
                    break;
                }
            }
        }
        link.close();

        if let Some(attache) = link.attache()
            && !attache.is_closed()
        {
            let host_id = attache.host_id();
            info!(host_id, peer = %link.peer(), "Agent connection lost");
            if let Err(e) = mgr
                .investigate_and_disconnect(attache, HostEvent::AgentDisconnected)
                .await
            {
                warn!(host_id, error = %e, "Disconnect after connection loss failed");
            }
        }
    });

    link
}
