// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Startup handshakes

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use agent_protocol::frame::CURRENT_VERSION;
use agent_protocol::{Answer, Command, Commands, Frame, Request, Response};
use host_types::{Host, HostEvent, HostStatus};

use super::AgentManager;
use crate::attache::{Attache, DirectTransport, SocketTransport, Transport};
use crate::catalog::{CatalogError, StartupInfo};
use crate::error::AgentError;
use crate::link::LinkHandle;
use crate::listener::ConnectError;

impl AgentManager {
    /// Produce the host record for a new connection: registered creators
    /// first, then the catalog.
    async fn create_host(&self, startup: &[Command]) -> Result<Host, AgentError> {
        for creator in self.registry.creators() {
            if let Some(host) = creator.create_host(startup).await? {
                return Ok(host);
            }
        }

        let first = startup
            .first()
            .ok_or_else(|| CatalogError::InvalidStartup("no startup command".to_string()))?;
        let info = StartupInfo::from_command(first)?;
        Ok(self.catalog.find_or_create(&info).await?)
    }

    /// Register a new attache for `host` and run the connect listeners.
    ///
    /// Returns `Ok(None)` if a listener vetoed the connection. In both the
    /// veto and the error case the attache has been torn down.
    async fn handshake(
        self: &Arc<Self>,
        host: &Host,
        startup: &[Command],
        version: u8,
        transport: Box<dyn Transport>,
    ) -> Result<Option<Arc<Attache>>, AgentError> {
        let host_id = host.id;
        let forced = self.find_attache(host_id).is_some();
        let attache = Attache::new(host_id, host.name.clone(), self.ms_id, version, transport);

        self.add_attache(attache.clone());
        if let Err(e) = self.transit(host_id, HostEvent::AgentConnected).await {
            self.remove_agent(&attache, HostStatus::Disconnected);
            return Err(e);
        }

        for listener in self.registry.host_listeners() {
            match listener.process_connect(host, startup, forced) {
                Ok(()) => {}
                Err(ConnectError::Setup(reason)) => {
                    error!(host_id, reason = %reason, "Connection setup failed");
                    self.tear_down(attache).await;
                    return Err(AgentError::ConnectionSetup { host_id, reason });
                }
                Err(ConnectError::Veto(reason)) => {
                    info!(host_id, reason = %reason, "Connection vetoed");
                    self.tear_down(attache).await;
                    return Ok(None);
                }
            }
        }

        Ok(Some(attache))
    }

    async fn tear_down(self: &Arc<Self>, attache: Arc<Attache>) {
        let host_id = attache.host_id();
        if let Err(e) = self
            .disconnect_attache(attache, HostEvent::ShutdownRequested)
            .await
        {
            warn!(host_id, error = %e, "Failed to tear down rejected connection");
        }
    }

    /// Mark the host up, tell it so and start whatever keeps it alive.
    async fn finish_connect(self: &Arc<Self>, attache: &Arc<Attache>) -> Result<(), AgentError> {
        let host_id = attache.host_id();
        let status = self.transit(host_id, HostEvent::Ready).await?;

        let ready = attache.request(Commands::single(Command::ready(host_id)));
        if let Err(e) = attache.send(ready, None).await {
            warn!(host_id, error = %e, "Failed to send ready command");
        }

        attache.startup_confirmed(self.config().ping_interval());
        info!(host_id, kind = %attache.kind(), status = %status, "Host connected");
        Ok(())
    }

    /// Handle the startup request that opened `link`.
    pub(crate) async fn handle_connect(
        self: &Arc<Self>,
        link: Arc<LinkHandle>,
        req: Request,
    ) -> Result<(), AgentError> {
        let _permit = self
            .connect_workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::unavailable(req.host_id, "connect pool closed"))?;

        let startup = req.commands.to_commands();
        let host = match self.create_host(startup).await {
            Ok(host) => host,
            Err(e) => {
                warn!(peer = %link.peer(), error = %e, "Could not identify connecting host");
                link.close();
                return Err(e);
            }
        };
        debug!(host_id = host.id, peer = %link.peer(), "Startup received");

        let transport = SocketTransport::new(host.id, link.sender(), link.shutdown_handle());
        let attache = match self
            .handshake(&host, startup, req.version, Box::new(transport))
            .await
        {
            Ok(Some(attache)) => attache,
            Ok(None) => {
                link.close();
                return Ok(());
            }
            Err(e) => {
                let answers = startup
                    .iter()
                    .map(|cmd| Answer::failure(cmd, e.to_string()))
                    .collect();
                if let Err(send_err) = link
                    .send_frame(Frame::Response(Response::for_request(&req, answers)))
                    .await
                {
                    debug!(
                        host_id = host.id,
                        error = %send_err,
                        "Could not report failed handshake"
                    );
                }
                link.close();
                return Err(e);
            }
        };
        link.set_attache(attache.clone());

        let interval = self.config().ping_interval_secs;
        let answers = startup
            .iter()
            .map(|cmd| Answer::startup(cmd, interval))
            .collect();
        link.send_frame(Frame::Response(Response::for_request(&req, answers)))
            .await?;

        self.finish_connect(&attache).await
    }

    /// Load an in-process host found by the direct-agent scan.
    pub async fn load_direct_host(self: &Arc<Self>, host: Host) -> Result<(), AgentError> {
        let host_id = host.id;
        if host.status == HostStatus::Removed {
            return Err(AgentError::unavailable(host_id, "host was removed"));
        }

        let resource = self
            .resources
            .create(&host)
            .ok_or_else(|| AgentError::unavailable(host_id, "no resource for host"))?;

        let _permit = self
            .connect_workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::unavailable(host_id, "connect pool closed"))?;

        let startup = resource.initialize().await;
        if startup.is_empty() {
            return Err(AgentError::ConnectionSetup {
                host_id,
                reason: "resource returned no startup commands".to_string(),
            });
        }

        let transport = DirectTransport::new(
            host_id,
            resource,
            self.direct_tx.clone(),
            self.direct_pool.clone(),
        );
        match self
            .handshake(&host, &startup, CURRENT_VERSION, Box::new(transport))
            .await?
        {
            Some(attache) => self.finish_connect(&attache).await,
            None => Ok(()),
        }
    }
}
