// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

use async_trait::async_trait;

use agent_protocol::{Request, Response};
use host_types::HostId;

use super::{AttacheKind, Transport};
use crate::error::AgentError;

/// Placeholder for hosts with nothing behind them.
pub struct InertTransport {
    host_id: HostId,
}

impl InertTransport {
    pub fn new(host_id: HostId) -> Self {
        InertTransport { host_id }
    }
}

#[async_trait]
impl Transport for InertTransport {
    fn kind(&self) -> AttacheKind {
        AttacheKind::Inert
    }

    async fn deliver(&self, req: Request) -> Result<Option<Response>, AgentError> {
        tracing::debug!(host_id = self.host_id, seq = req.seq, "Discarding request");
        Ok(None)
    }

    fn close(&self) {}
}
