// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! In-process ("direct") hosts
//!
//! Some endpoints have no agent of their own; the manager drives them through
//! a resource object living in this process. Requests are executed inline and
//! liveness comes from a ping task started once the handshake has confirmed a
//! ping interval.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use agent_protocol::{Answer, Command, Request, Response};
use host_types::{Host, HostId};

use super::{AttacheKind, Transport};
use crate::error::AgentError;

/// A host driven from inside the manager process.
#[async_trait]
pub trait ServerResource: Send + Sync {
    /// Startup commands describing the resource; empty if it is unreachable.
    async fn initialize(&self) -> Vec<Command>;

    async fn execute(&self, cmd: &Command) -> Answer;

    /// Ping to report for this interval; `None` means the resource is gone.
    async fn ping(&self) -> Option<Command>;

    fn disconnected(&self) {}
}

/// Builds the resource for a host found by the direct-agent scan.
pub trait ResourceFactory: Send + Sync {
    fn create(&self, host: &Host) -> Option<Arc<dyn ServerResource>>;
}

/// Factory for deployments without in-process hosts.
pub struct NoResources;

impl ResourceFactory for NoResources {
    fn create(&self, _host: &Host) -> Option<Arc<dyn ServerResource>> {
        None
    }
}

/// Traffic produced by direct hosts, consumed by the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectEvent {
    Ping { host_id: HostId, cmd: Command },
    Lost { host_id: HostId },
}

pub struct DirectTransport {
    host_id: HostId,
    resource: Arc<dyn ServerResource>,
    events: mpsc::UnboundedSender<DirectEvent>,
    pool: Arc<Semaphore>,
    pinger: Mutex<Option<JoinHandle<()>>>,
}

impl DirectTransport {
    pub fn new(
        host_id: HostId,
        resource: Arc<dyn ServerResource>,
        events: mpsc::UnboundedSender<DirectEvent>,
        pool: Arc<Semaphore>,
    ) -> Self {
        DirectTransport {
            host_id,
            resource,
            events,
            pool,
            pinger: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn kind(&self) -> AttacheKind {
        AttacheKind::Direct
    }

    async fn deliver(&self, req: Request) -> Result<Option<Response>, AgentError> {
        let stop_on_error = req.stop_on_error();
        let mut answers = Vec::with_capacity(req.commands.len());
        let mut failed = false;

        for cmd in req.commands.to_commands() {
            if failed {
                answers.push(Answer::not_executed(cmd));
                continue;
            }
            let answer = self.resource.execute(cmd).await;
            failed = stop_on_error && !answer.result;
            answers.push(answer);
        }

        Ok(Some(Response::for_request(&req, answers)))
    }

    fn startup_confirmed(&self, ping_interval: Duration) {
        let host_id = self.host_id;
        let resource = self.resource.clone();
        let events = self.events.clone();
        let pool = self.pool.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(ping_interval).await;
                let Ok(_permit) = pool.acquire().await else {
                    break;
                };
                let event = match resource.ping().await {
                    Some(cmd) => DirectEvent::Ping { host_id, cmd },
                    None => {
                        warn!(host_id, "Direct resource stopped answering pings");
                        DirectEvent::Lost { host_id }
                    }
                };
                let lost = matches!(event, DirectEvent::Lost { .. });
                if events.send(event).is_err() || lost {
                    break;
                }
            }
            debug!(host_id, "Direct ping task finished");
        });

        if let Some(previous) = self.pinger.lock().replace(handle) {
            previous.abort();
        }
    }

    fn close(&self) {
        if let Some(handle) = self.pinger.lock().take() {
            handle.abort();
        }
        self.resource.disconnected();
    }
}
