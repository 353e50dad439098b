// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Attaches
//!
//! An [`Attache`] is the handle through which the manager reaches one host.
//! The bookkeeping (sequence numbers, waiting listeners, the in-sequence
//! queue, maintenance mode, idempotent disconnect) is the same for every
//! host; only the [`Transport`] underneath differs:
//!
//! - [`SocketTransport`] writes frames to a live agent connection
//! - [`DirectTransport`] executes commands on an in-process resource
//! - [`ForwardingTransport`] relays frames to the cluster node owning the host
//! - [`InertTransport`] accepts everything and does nothing

mod connected;
mod direct;
mod forwarding;
mod inert;

pub use connected::SocketTransport;
pub use direct::{DirectEvent, DirectTransport, NoResources, ResourceFactory, ServerResource};
pub use forwarding::ForwardingTransport;
pub use inert::InertTransport;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use strum::Display;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use agent_protocol::frame::CURRENT_VERSION;
use agent_protocol::{Answer, Command, Commands, Request, Response};
use host_types::{HostId, HostStatus, MsId};

use crate::error::AgentError;
use crate::listener::Listener;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum AttacheKind {
    Connected,
    Direct,
    Forwarding,
    Inert,
}

/// How requests physically reach a host.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> AttacheKind;

    /// Put `req` on the channel. Transports that execute in-process return
    /// the response directly.
    async fn deliver(&self, req: Request) -> Result<Option<Response>, AgentError>;

    /// Tell whoever holds the live connection to abandon `seq`.
    async fn cancel_remote(&self, _seq: u64) -> Result<(), AgentError> {
        Ok(())
    }

    /// The startup handshake completed with the given ping interval.
    fn startup_confirmed(&self, _ping_interval: Duration) {}

    /// Management server the traffic is relayed to, for forwarding transports.
    fn peer(&self) -> Option<MsId> {
        None
    }

    /// Release the channel. Called at most once.
    fn close(&self);
}

struct Waiter {
    listener: Option<Arc<dyn Listener>>,
    maintenance_safe: bool,
}

#[derive(Default)]
struct SendQueue {
    /// Queue everything while the host is being relocated
    hold: bool,
    /// In-sequence request currently on the wire
    current: Option<u64>,
    pending: VecDeque<Request>,
}

impl SendQueue {
    fn pop_ready(&mut self) -> Option<Request> {
        if self.hold {
            return None;
        }
        let front = self.pending.front()?;
        if front.in_sequence() {
            if self.current.is_some() {
                return None;
            }
            self.current = Some(front.seq);
        }
        self.pending.pop_front()
    }
}

fn maintenance_safe(req: &Request) -> bool {
    req.commands
        .to_commands()
        .iter()
        .all(Command::allowed_in_maintenance)
}

pub struct Attache {
    host_id: HostId,
    name: String,
    ms_id: MsId,
    version: u8,
    transport: Box<dyn Transport>,
    next_seq: AtomicU64,
    waiters: Mutex<HashMap<u64, Waiter>>,
    queue: Mutex<SendQueue>,
    /// At most one physical send in flight
    send_lock: tokio::sync::Mutex<()>,
    maintenance: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for Attache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attache")
            .field("host_id", &self.host_id)
            .field("kind", &self.kind())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Attache {
    pub fn new(
        host_id: HostId,
        name: impl Into<String>,
        ms_id: MsId,
        version: u8,
        transport: Box<dyn Transport>,
    ) -> Arc<Self> {
        // Sequence numbers start at a random offset in the top 16 bits so a
        // replacement attache does not reuse its predecessor's numbers.
        let base = u64::from(rand::random::<u16>()) << 48;
        Arc::new(Attache {
            host_id,
            name: name.into(),
            ms_id,
            version,
            transport,
            next_seq: AtomicU64::new(base),
            waiters: Mutex::new(HashMap::new()),
            queue: Mutex::new(SendQueue::default()),
            send_lock: tokio::sync::Mutex::new(()),
            maintenance: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn inert(host_id: HostId, name: impl Into<String>, ms_id: MsId) -> Arc<Self> {
        Attache::new(
            host_id,
            name,
            ms_id,
            CURRENT_VERSION,
            Box::new(InertTransport::new(host_id)),
        )
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AttacheKind {
        self.transport.kind()
    }

    pub fn is_forwarding(&self) -> bool {
        self.kind() == AttacheKind::Forwarding
    }

    /// Owner of the live connection when this attache forwards to a peer.
    pub fn forwarded_to(&self) -> Option<MsId> {
        self.transport.peer()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn in_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of sequences still waiting for answers.
    pub fn outstanding(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Wrap a batch in a request carrying this attache's next sequence.
    pub fn request(&self, cmds: Commands) -> Request {
        Request::new(self.next_seq(), self.ms_id, self.host_id, cmds).with_version(self.version)
    }

    /// Send `req`, registering `listener` against its sequence.
    ///
    /// A request without a listener is still tracked so that its response is
    /// recognised rather than reported as unknown.
    pub async fn send(
        &self,
        req: Request,
        listener: Option<Arc<dyn Listener>>,
    ) -> Result<(), AgentError> {
        if self.is_closed() {
            return Err(AgentError::ChannelClosed(self.host_id));
        }

        let safe = maintenance_safe(&req);
        if self.in_maintenance() && !safe {
            return Err(AgentError::unavailable(
                self.host_id,
                "host is in maintenance mode",
            ));
        }

        let seq = req.seq;
        self.waiters.lock().insert(
            seq,
            Waiter {
                listener,
                maintenance_safe: safe,
            },
        );

        let Some(req) = self.admit(req) else {
            debug!(host_id = self.host_id, seq, "Request queued");
            return Ok(());
        };

        match self.transmit(req).await {
            Ok(Some(resp)) => {
                self.process_answers(resp).await;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.waiters.lock().remove(&seq);
                let next = self.release(seq);
                self.drain(next).await;
                Err(e)
            }
        }
    }

    /// Send and wait for the answers, giving up after `wait`.
    ///
    /// On timeout the sequence is cancelled before returning, so a late
    /// response is dropped instead of reaching a finished call.
    pub async fn send_and_wait(
        &self,
        cmds: Commands,
        wait: Duration,
    ) -> Result<Vec<Answer>, AgentError> {
        let req = self.request(cmds);
        let seq = req.seq;
        let host_id = self.host_id;
        let (listener, rx) = SyncListener::new();

        let outcome = tokio::time::timeout(wait, async {
            self.send(req, Some(listener)).await?;
            rx.await.map_err(|_| AgentError::ChannelClosed(host_id))
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                self.cancel(seq).await;
                metrics::record_send_timeout();
                warn!(host_id, seq, waited = ?wait, "Timed out waiting for answers");
                Err(AgentError::OperationTimedOut {
                    host_id,
                    seq,
                    waited: wait,
                })
            }
        }
    }

    /// Abandon `seq`. The listener is deregistered before this returns.
    pub async fn cancel(&self, seq: u64) -> bool {
        let removed = self.waiters.lock().remove(&seq).is_some();
        let was_queued = {
            let mut queue = self.queue.lock();
            let before = queue.pending.len();
            queue.pending.retain(|r| r.seq != seq);
            before != queue.pending.len()
        };

        if removed && !was_queued {
            debug!(host_id = self.host_id, seq, "Cancelling request");
            if let Err(e) = self.transport.cancel_remote(seq).await {
                warn!(host_id = self.host_id, seq, error = %e, "Failed to cancel remotely");
            }
        }

        let next = self.release(seq);
        self.drain(next).await;
        removed
    }

    /// Deliver a response to the listener waiting on its sequence.
    pub async fn process_answers(&self, resp: Response) {
        let next = self.complete(resp);
        self.drain(next).await;
    }

    /// Close the attache. Outstanding listeners are told the channel closed
    /// and queued requests are dropped. Only the first call has any effect.
    pub fn disconnect(&self, status: HostStatus) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(host_id = self.host_id, "Attache already disconnected");
            return false;
        }

        info!(
            host_id = self.host_id,
            kind = %self.kind(),
            status = %status,
            "Disconnecting attache"
        );

        let waiters: Vec<(u64, Waiter)> = self.waiters.lock().drain().collect();
        {
            let mut queue = self.queue.lock();
            queue.pending.clear();
            queue.current = None;
        }
        for (_, waiter) in waiters {
            if let Some(listener) = waiter.listener {
                listener.process_disconnect(self.host_id, status);
            }
        }

        self.transport.close();
        true
    }

    /// Enter or leave maintenance mode. Entering it cancels every outstanding
    /// command that is not allowed during maintenance.
    pub async fn set_maintenance(&self, on: bool) {
        self.maintenance.store(on, Ordering::SeqCst);
        if !on {
            return;
        }

        let cancelled: Vec<(u64, Waiter)> = {
            let mut waiters = self.waiters.lock();
            let seqs: Vec<u64> = waiters
                .iter()
                .filter(|(_, w)| !w.maintenance_safe)
                .map(|(seq, _)| *seq)
                .collect();
            seqs.into_iter()
                .filter_map(|seq| waiters.remove(&seq).map(|w| (seq, w)))
                .collect()
        };

        let released_current = {
            let mut queue = self.queue.lock();
            queue.pending.retain(maintenance_safe);
            match queue.current {
                Some(cur) if cancelled.iter().any(|(seq, _)| *seq == cur) => {
                    queue.current = None;
                    true
                }
                _ => false,
            }
        };

        for (seq, waiter) in cancelled {
            debug!(host_id = self.host_id, seq, "Cancelled by maintenance");
            if let Some(listener) = waiter.listener {
                listener.process_disconnect(self.host_id, HostStatus::Maintenance);
            }
        }

        if released_current {
            self.drain(None).await;
        }
    }

    /// Hold every request while the host is handed to another node, or
    /// release the hold and flush the queue in order.
    pub async fn set_transfer_hold(&self, hold: bool) {
        self.queue.lock().hold = hold;
        if !hold {
            self.drain(None).await;
        }
    }

    pub fn startup_confirmed(&self, ping_interval: Duration) {
        self.transport.startup_confirmed(ping_interval);
    }

    fn admit(&self, req: Request) -> Option<Request> {
        if req.is_control() {
            return Some(req);
        }
        let mut queue = self.queue.lock();
        if queue.hold || (req.in_sequence() && queue.current.is_some()) {
            queue.pending.push_back(req);
            return None;
        }
        if req.in_sequence() {
            queue.current = Some(req.seq);
        }
        Some(req)
    }

    fn release(&self, seq: u64) -> Option<Request> {
        let mut queue = self.queue.lock();
        if queue.current == Some(seq) {
            queue.current = None;
        }
        queue.pop_ready()
    }

    async fn transmit(&self, req: Request) -> Result<Option<Response>, AgentError> {
        let _guard = self.send_lock.lock().await;
        if self.is_closed() {
            return Err(AgentError::ChannelClosed(self.host_id));
        }
        debug!(
            host_id = self.host_id,
            seq = req.seq,
            commands = req.commands.len(),
            "Sending request"
        );
        let reply = self.transport.deliver(req).await?;
        metrics::record_command_sent();
        Ok(reply)
    }

    /// Hand answers to their listener and return the next request that may
    /// now be sent.
    fn complete(&self, resp: Response) -> Option<Request> {
        let seq = resp.seq;
        let waiter = {
            let mut waiters = self.waiters.lock();
            let recurring = waiters
                .get(&seq)
                .map(|w| w.listener.as_ref().is_some_and(|l| l.is_recurring()));
            match recurring {
                Some(true) => waiters.get(&seq).map(|w| w.listener.clone()),
                Some(false) => waiters.remove(&seq).map(|w| w.listener),
                None => None,
            }
        };

        match waiter {
            Some(Some(listener)) => {
                listener.process_answers(self.host_id, seq, &resp.answers);
            }
            Some(None) => {
                debug!(host_id = self.host_id, seq, "Answer for unattended request");
            }
            None => {
                warn!(
                    host_id = self.host_id,
                    seq,
                    "Dropping response for unknown sequence"
                );
                metrics::record_unknown_sequence();
            }
        }

        self.release(seq)
    }

    async fn drain(&self, mut next: Option<Request>) {
        loop {
            let req = match next.take() {
                Some(req) => req,
                None => match self.queue.lock().pop_ready() {
                    Some(req) => req,
                    None => break,
                },
            };

            let seq = req.seq;
            match self.transmit(req).await {
                Ok(Some(resp)) => next = self.complete(resp),
                Ok(None) => {}
                Err(e) => {
                    warn!(host_id = self.host_id, seq, error = %e, "Failed to send queued request");
                    let waiter = self.waiters.lock().remove(&seq);
                    if let Some(Waiter {
                        listener: Some(listener),
                        ..
                    }) = waiter
                    {
                        listener.process_disconnect(self.host_id, HostStatus::Disconnected);
                    }
                    next = self.release(seq);
                }
            }
        }
    }
}

/// One-shot listener backing a synchronous call.
pub struct SyncListener {
    tx: Mutex<Option<oneshot::Sender<Vec<Answer>>>>,
}

impl SyncListener {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<Vec<Answer>>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(SyncListener {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }
}

impl Listener for SyncListener {
    fn process_answers(&self, _host_id: HostId, _seq: u64, answers: &[Answer]) -> bool {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(answers.to_vec());
        }
        true
    }

    fn process_disconnect(&self, _host_id: HostId, _status: HostStatus) -> bool {
        // Dropping the sender fails the waiting call.
        self.tx.lock().take();
        true
    }

    fn process_timeout(&self, _host_id: HostId, _seq: u64) -> bool {
        self.tx.lock().take();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_protocol::OnError;
    use serde_json::Value;

    /// Records requests and optionally answers them in-process.
    struct Recorder {
        sent: Arc<Mutex<Vec<Request>>>,
        answer: bool,
        closes: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Transport for Recorder {
        fn kind(&self) -> AttacheKind {
            AttacheKind::Connected
        }

        async fn deliver(&self, req: Request) -> Result<Option<Response>, AgentError> {
            self.sent.lock().push(req.clone());
            if !self.answer {
                return Ok(None);
            }
            let answers = req
                .commands
                .to_commands()
                .iter()
                .map(|c| Answer::success(c, Value::Null))
                .collect();
            Ok(Some(Response::for_request(&req, answers)))
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn attache(answer: bool) -> (Arc<Attache>, Arc<Mutex<Vec<Request>>>, Arc<AtomicU64>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closes = Arc::new(AtomicU64::new(0));
        let a = Attache::new(
            1,
            "h1",
            10,
            CURRENT_VERSION,
            Box::new(Recorder {
                sent: sent.clone(),
                answer,
                closes: closes.clone(),
            }),
        );
        (a, sent, closes)
    }

    fn batch(name: &str) -> Commands {
        Commands::single(Command::new(name, Value::Null))
    }

    #[tokio::test]
    async fn in_process_answers_reach_the_waiter() {
        let (a, _, _) = attache(true);
        let answers = a
            .send_and_wait(batch("A"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(a.outstanding(), 0);
    }

    #[tokio::test]
    async fn sequence_numbers_increase() {
        let (a, _, _) = attache(false);
        let first = a.next_seq();
        let second = a.next_seq();
        assert_eq!(second, first + 1);
    }

    #[tokio::test]
    async fn in_sequence_requests_wait_for_previous_answer() {
        let (a, sent, _) = attache(false);
        let mut first = Commands::new(OnError::Stop);
        first.add(Command::new("A", Value::Null).in_sequence());
        let mut second = Commands::new(OnError::Stop);
        second.add(Command::new("B", Value::Null).in_sequence());

        let r1 = a.request(first);
        let r2 = a.request(second);
        let (s1, s2) = (r1.seq, r2.seq);
        a.send(r1.clone(), None).await.unwrap();
        a.send(r2, None).await.unwrap();
        assert_eq!(sent.lock().len(), 1);

        a.process_answers(Response::for_request(
            &r1,
            vec![Answer::success(&Command::new("A", Value::Null), Value::Null)],
        ))
        .await;
        let seqs: Vec<u64> = sent.lock().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![s1, s2]);
    }

    #[tokio::test]
    async fn transfer_hold_flushes_in_order() {
        let (a, sent, _) = attache(false);
        a.set_transfer_hold(true).await;
        let reqs: Vec<Request> = ["A", "B", "C"].iter().map(|n| a.request(batch(n))).collect();
        for req in &reqs {
            a.send(req.clone(), None).await.unwrap();
        }
        assert!(sent.lock().is_empty());

        a.set_transfer_hold(false).await;
        let seqs: Vec<u64> = sent.lock().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, reqs.iter().map(|r| r.seq).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn maintenance_rejects_ordinary_commands() {
        let (a, _, _) = attache(true);
        a.set_maintenance(true).await;
        let err = a
            .send_and_wait(batch("StartVmCommand"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());

        let ok = a
            .send_and_wait(Commands::single(Command::check_health()), Duration::from_secs(1))
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn entering_maintenance_cancels_pending_commands() {
        let (a, _, _) = attache(false);
        let (listener, rx) = SyncListener::new();
        let req = a.request(batch("StartVmCommand"));
        a.send(req, Some(listener)).await.unwrap();
        assert_eq!(a.outstanding(), 1);

        a.set_maintenance(true).await;
        assert_eq!(a.outstanding(), 0);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn disconnect_closes_transport_once() {
        let (a, _, closes) = attache(false);
        assert!(a.disconnect(HostStatus::Disconnected));
        assert!(!a.disconnect(HostStatus::Disconnected));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(a.is_closed());

        let err = a.send(a.request(batch("A")), None).await.unwrap_err();
        assert!(matches!(err, AgentError::ChannelClosed(1)));
    }
}
