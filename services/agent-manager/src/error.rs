// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Error types for the agent manager

use std::time::Duration;

use thiserror::Error;

use agent_protocol::ProtocolError;
use host_types::{HostId, TransitionError};

use crate::catalog::CatalogError;

/// Errors surfaced by attaches and the agent manager.
#[derive(Debug, Error)]
pub enum AgentError {
    /// No usable attache: none registered, closed, or forwarding failed after
    /// retries. The caller may retry later.
    #[error("host {host_id} is unavailable: {reason}")]
    AgentUnavailable { host_id: HostId, reason: String },

    /// No response arrived before the deadline.
    #[error("operation on host {host_id} (seq {seq}) timed out after {waited:?}")]
    OperationTimedOut {
        host_id: HostId,
        seq: u64,
        waited: Duration,
    },

    /// A connect listener rejected the handshake.
    #[error("connection setup failed for host {host_id}: {reason}")]
    ConnectionSetup { host_id: HostId, reason: String },

    #[error("unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u8),

    /// The channel underneath an attache went away while a call was pending.
    #[error("channel to host {0} is closed")]
    ChannelClosed(HostId),

    #[error(transparent)]
    UndefinedTransition(#[from] TransitionError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("protocol error: {0}")]
    Protocol(ProtocolError),
}

impl From<ProtocolError> for AgentError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::UnsupportedVersion(v) => AgentError::UnsupportedProtocolVersion(v),
            other => AgentError::Protocol(other),
        }
    }
}

impl AgentError {
    pub fn unavailable(host_id: HostId, reason: impl Into<String>) -> Self {
        AgentError::AgentUnavailable {
            host_id,
            reason: reason.into(),
        }
    }

    /// Transport-level failures are reported to callers as unavailability.
    pub fn into_public(self) -> Self {
        match self {
            AgentError::ChannelClosed(host_id) => {
                AgentError::unavailable(host_id, "channel closed")
            }
            other => other,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, AgentError::AgentUnavailable { .. })
    }
}
