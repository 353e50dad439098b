// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Listener contracts and the registry that orders them
//!
//! Listeners are notified synchronously from the task that observed the event,
//! so implementations must not block. Anything slow belongs on a spawned task.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use agent_protocol::{Answer, Command, Commands};
use host_types::{Host, HostId, HostStatus};

use crate::error::AgentError;

/// Identifier handed out on registration, used to unregister.
pub type MonitorId = u32;

/// Raised by a connect listener to refuse a new connection.
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    /// The handshake failed; the error is reported to the connecting party.
    #[error("connection setup failed: {0}")]
    Setup(String),
    /// The connection is abandoned without reporting an error.
    #[error("connection vetoed: {0}")]
    Veto(String),
}

pub trait Listener: Send + Sync {
    /// Answers for a sequence this listener was registered against.
    fn process_answers(&self, _host_id: HostId, _seq: u64, _answers: &[Answer]) -> bool {
        false
    }

    /// A command sent by an agent. Returning an answer claims the command;
    /// later listeners do not see it.
    fn process_command(&self, _host_id: HostId, _seq: u64, _cmd: &Command) -> Option<Answer> {
        None
    }

    fn process_connect(
        &self,
        _host: &Host,
        _startup: &[Command],
        _forced_reconnect: bool,
    ) -> Result<(), ConnectError> {
        Ok(())
    }

    fn process_disconnect(&self, _host_id: HostId, _status: HostStatus) -> bool {
        false
    }

    fn process_timeout(&self, _host_id: HostId, _seq: u64) -> bool {
        false
    }

    /// Recurring listeners stay registered against their sequence after
    /// receiving answers.
    fn is_recurring(&self) -> bool {
        false
    }

    /// Deadline for asynchronous sends; `None` waits until disconnect.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Produces the host record for a brand new connection.
#[async_trait]
pub trait HostCreator: Send + Sync {
    /// `Ok(None)` passes the connection on to the next creator.
    async fn create_host(&self, startup: &[Command]) -> Result<Option<Host>, AgentError>;
}

/// The part of the agent manager listeners may call back into.
#[async_trait]
pub trait CommandSender: Send + Sync {
    async fn send(
        &self,
        host_id: HostId,
        cmds: Commands,
        timeout: Option<Duration>,
    ) -> Result<Commands, AgentError>;

    async fn send_async(
        &self,
        host_id: HostId,
        cmds: Commands,
        listener: Arc<dyn Listener>,
    ) -> Result<u64, AgentError>;

    async fn easy_send(&self, host_id: HostId, cmd: Command) -> Option<Answer>;
}

type Entry<T> = (MonitorId, Arc<T>);

fn insert<T: ?Sized>(list: &RwLock<Vec<Entry<T>>>, entry: Entry<T>, priority: bool) {
    let mut list = list.write();
    if priority {
        list.insert(0, entry);
    } else {
        list.push(entry);
    }
}

fn remove<T: ?Sized>(list: &RwLock<Vec<Entry<T>>>, id: MonitorId) -> bool {
    let mut list = list.write();
    let before = list.len();
    list.retain(|(i, _)| *i != id);
    list.len() != before
}

/// Ordered lists of host listeners, command listeners and host creators.
pub struct ListenerRegistry {
    next_id: AtomicU32,
    host_listeners: RwLock<Vec<Entry<dyn Listener>>>,
    cmd_listeners: RwLock<Vec<Entry<dyn Listener>>>,
    creators: RwLock<Vec<Entry<dyn HostCreator>>>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        ListenerRegistry {
            next_id: AtomicU32::new(1),
            host_listeners: RwLock::new(Vec::new()),
            cmd_listeners: RwLock::new(Vec::new()),
            creators: RwLock::new(Vec::new()),
        }
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        ListenerRegistry::default()
    }

    /// Register a listener for connection events, agent commands or both.
    /// Priority listeners are placed ahead of everything registered so far.
    pub fn register(
        &self,
        listener: Arc<dyn Listener>,
        connections: bool,
        commands: bool,
        priority: bool,
    ) -> MonitorId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if connections {
            insert(&self.host_listeners, (id, listener.clone()), priority);
        }
        if commands {
            insert(&self.cmd_listeners, (id, listener), priority);
        }
        id
    }

    /// Remove a listener, or a host creator, registered under `id`.
    pub fn unregister(&self, id: MonitorId) -> bool {
        let mut removed = false;
        removed |= remove(&self.host_listeners, id);
        removed |= remove(&self.cmd_listeners, id);
        removed |= remove(&self.creators, id);
        removed
    }

    pub fn register_creator(&self, creator: Arc<dyn HostCreator>, priority: bool) -> MonitorId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        insert(&self.creators, (id, creator), priority);
        id
    }

    pub fn host_listeners(&self) -> Vec<Arc<dyn Listener>> {
        self.host_listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }

    pub fn command_listeners(&self) -> Vec<Arc<dyn Listener>> {
        self.cmd_listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }

    pub fn creators(&self) -> Vec<Arc<dyn HostCreator>> {
        self.creators.read().iter().map(|(_, c)| c.clone()).collect()
    }
}
