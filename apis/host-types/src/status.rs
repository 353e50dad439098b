// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Host status transition table
//!
//! Every legal `(status, event)` pair is listed explicitly. A pair that is not
//! listed is a logic error in the caller and is reported as
//! [`TransitionError::Undefined`]; it is never coerced to a default status.

use thiserror::Error;

use crate::{HostEvent, HostStatus};

/// Raised when no transition is defined for a `(status, event)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("no transition defined from status '{status}' on event '{event}'")]
    Undefined {
        status: HostStatus,
        event: HostEvent,
    },
}

impl HostStatus {
    /// Compute the status reached from `self` when `event` happens.
    pub fn next_status(self, event: HostEvent) -> Result<HostStatus, TransitionError> {
        use HostEvent as E;
        use HostStatus as S;

        let next = match (self, event) {
            (S::Creating, E::AgentConnected) => S::Connecting,
            (S::Creating, E::Remove) => S::Removed,
            (S::Creating, E::ManagementServerDown) => S::Creating,

            (S::Connecting, E::AgentConnected) => S::Connecting,
            (S::Connecting, E::Ready) => S::Up,
            (S::Connecting, E::Ping) => S::Connecting,
            (S::Connecting, E::PingTimeout) => S::Alert,
            (S::Connecting, E::AgentDisconnected) => S::Alert,
            (S::Connecting, E::ShutdownRequested) => S::Disconnected,
            (S::Connecting, E::HostDown) => S::Down,
            (S::Connecting, E::WaitedTooLong) => S::Alert,
            (S::Connecting, E::ManagementServerDown) => S::Disconnected,
            (S::Connecting, E::Remove) => S::Removed,

            (S::Up, E::AgentConnected) => S::Connecting,
            (S::Up, E::Ping) => S::Up,
            (S::Up, E::PingTimeout) => S::Alert,
            (S::Up, E::AgentDisconnected) => S::Alert,
            (S::Up, E::ShutdownRequested) => S::Disconnected,
            (S::Up, E::HostDown) => S::Down,
            (S::Up, E::ManagementServerDown) => S::Disconnected,
            (S::Up, E::StartAgentRebalance) => S::Rebalancing,
            (S::Up, E::Remove) => S::Removed,

            (S::Disconnected, E::AgentConnected) => S::Connecting,
            (S::Disconnected, E::Ping) => S::Up,
            (S::Disconnected, E::PingTimeout) => S::Alert,
            (S::Disconnected, E::AgentDisconnected) => S::Disconnected,
            (S::Disconnected, E::ShutdownRequested) => S::Disconnected,
            (S::Disconnected, E::HostDown) => S::Down,
            (S::Disconnected, E::WaitedTooLong) => S::Alert,
            (S::Disconnected, E::ManagementServerDown) => S::Disconnected,
            (S::Disconnected, E::Remove) => S::Removed,

            (S::Alert, E::AgentConnected) => S::Connecting,
            (S::Alert, E::Ping) => S::Up,
            (S::Alert, E::PingTimeout) => S::Alert,
            (S::Alert, E::AgentDisconnected) => S::Alert,
            (S::Alert, E::ShutdownRequested) => S::Disconnected,
            (S::Alert, E::HostDown) => S::Down,
            (S::Alert, E::WaitedTooLong) => S::Alert,
            (S::Alert, E::ManagementServerDown) => S::Alert,
            (S::Alert, E::Remove) => S::Removed,

            (S::Down, E::AgentConnected) => S::Connecting,
            (S::Down, E::PingTimeout) => S::Down,
            (S::Down, E::AgentDisconnected) => S::Down,
            (S::Down, E::ShutdownRequested) => S::Down,
            (S::Down, E::HostDown) => S::Down,
            (S::Down, E::WaitedTooLong) => S::Down,
            (S::Down, E::ManagementServerDown) => S::Down,
            (S::Down, E::Remove) => S::Removed,

            (S::Rebalancing, E::AgentConnected) => S::Connecting,
            (S::Rebalancing, E::RebalanceCompleted) => S::Connecting,
            (S::Rebalancing, E::RebalanceFailed) => S::Disconnected,
            (S::Rebalancing, E::AgentDisconnected) => S::Rebalancing,
            (S::Rebalancing, E::PingTimeout) => S::Alert,
            (S::Rebalancing, E::ShutdownRequested) => S::Disconnected,
            (S::Rebalancing, E::ManagementServerDown) => S::Disconnected,
            (S::Rebalancing, E::Remove) => S::Removed,

            (S::PrepareForMaintenance, E::AgentConnected) => S::Connecting,
            (S::PrepareForMaintenance, E::Ping) => S::PrepareForMaintenance,
            (S::PrepareForMaintenance, E::PingTimeout) => S::Alert,
            (S::PrepareForMaintenance, E::AgentDisconnected) => S::Alert,
            (S::PrepareForMaintenance, E::ShutdownRequested) => S::Disconnected,
            (S::PrepareForMaintenance, E::HostDown) => S::Down,
            (S::PrepareForMaintenance, E::ManagementServerDown) => S::Disconnected,
            (S::PrepareForMaintenance, E::Remove) => S::Removed,

            (S::ErrorInMaintenance, E::AgentConnected) => S::Connecting,
            (S::ErrorInMaintenance, E::Ping) => S::ErrorInMaintenance,
            (S::ErrorInMaintenance, E::PingTimeout) => S::Alert,
            (S::ErrorInMaintenance, E::AgentDisconnected) => S::Alert,
            (S::ErrorInMaintenance, E::ShutdownRequested) => S::Disconnected,
            (S::ErrorInMaintenance, E::HostDown) => S::Down,
            (S::ErrorInMaintenance, E::ManagementServerDown) => S::Disconnected,
            (S::ErrorInMaintenance, E::Remove) => S::Removed,

            (S::Maintenance, E::AgentConnected) => S::Connecting,
            (S::Maintenance, E::Ping) => S::Maintenance,
            (S::Maintenance, E::PingTimeout) => S::Maintenance,
            (S::Maintenance, E::AgentDisconnected) => S::Maintenance,
            (S::Maintenance, E::ShutdownRequested) => S::Maintenance,
            (S::Maintenance, E::ManagementServerDown) => S::Maintenance,
            (S::Maintenance, E::Remove) => S::Removed,

            (S::Error, E::AgentConnected) => S::Connecting,
            (S::Error, E::PingTimeout) => S::Error,
            (S::Error, E::AgentDisconnected) => S::Error,
            (S::Error, E::ShutdownRequested) => S::Error,
            (S::Error, E::ManagementServerDown) => S::Error,
            (S::Error, E::Remove) => S::Removed,

            (S::Removed, E::AgentDisconnected) => S::Removed,
            (S::Removed, E::ShutdownRequested) => S::Removed,
            (S::Removed, E::PingTimeout) => S::Removed,
            (S::Removed, E::ManagementServerDown) => S::Removed,
            (S::Removed, E::Remove) => S::Removed,

            (status, event) => return Err(TransitionError::Undefined { status, event }),
        };

        Ok(next)
    }
}
