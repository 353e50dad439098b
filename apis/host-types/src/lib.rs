// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Shared types for the agent manager and the hosts it commands.
//!
//! This crate holds the host record as the agent manager sees it, the
//! administrative and connection status enums, and the status transition
//! table that drives every status change made by the manager.

mod status;

pub use status::TransitionError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, VariantNames};

// ============================================================================
// Type Aliases
// ============================================================================

/// Numeric host identifier assigned by the host catalog
pub type HostId = u64;

/// Management server (cluster node) identifier
pub type MsId = u64;

/// Cluster identifier
pub type ClusterId = u64;

/// Zone identifier
pub type ZoneId = u64;

// ============================================================================
// Host Types
// ============================================================================

/// Connection status of a host.
///
/// Transitions between these values are only ever made through
/// [`HostStatus::next_status`].
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    VariantNames,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    /// Host record exists but no agent has ever connected
    #[default]
    Creating,
    /// Agent connected and is going through the startup handshake
    Connecting,
    /// Agent is connected and healthy
    Up,
    /// Host is confirmed down
    Down,
    /// Agent is not connected
    Disconnected,
    /// Agent stopped answering and its real state is not known yet
    Alert,
    /// Host has been removed from management
    Removed,
    /// Host ran into an unrecoverable error
    Error,
    /// Host is being moved to a different management server
    Rebalancing,
    /// Host is draining before maintenance
    PrepareForMaintenance,
    /// Host failed while entering maintenance
    ErrorInMaintenance,
    /// Host is in maintenance
    Maintenance,
}

impl HostStatus {
    /// Statuses in which the host is expected to accept commands.
    pub fn is_active(self) -> bool {
        matches!(self, HostStatus::Up | HostStatus::Connecting)
    }

    /// Statuses from which a reconnect request is meaningless.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HostStatus::Removed | HostStatus::Down | HostStatus::Error
        )
    }
}

/// Events that move a host between [`HostStatus`] values.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    VariantNames,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HostEvent {
    /// An agent opened a session and sent its startup commands
    AgentConnected,
    /// Every connect listener accepted the handshake
    Ready,
    /// A ping was observed from the host
    Ping,
    /// No ping was observed within the timeout
    PingTimeout,
    /// The connection to the agent was lost
    AgentDisconnected,
    /// The host was shut down deliberately
    ShutdownRequested,
    /// Investigation determined that the host is down
    HostDown,
    /// The host stayed disconnected past the alert threshold
    WaitedTooLong,
    /// The management server owning the host went away
    ManagementServerDown,
    /// The host is being removed from management
    Remove,
    /// The host is being handed to a different management server
    StartAgentRebalance,
    /// Handing the host over finished
    RebalanceCompleted,
    /// Handing the host over failed
    RebalanceFailed,
}

/// Administrative (resource) state of a host, owned by operators.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    VariantNames,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Host is accepting work
    #[default]
    Enabled,
    /// Operator disabled the host
    Disabled,
    /// Host is draining workloads before maintenance
    PrepareForMaintenance,
    /// Draining failed
    ErrorInMaintenance,
    /// Host is in maintenance
    Maintenance,
}

impl ResourceState {
    /// Whether an operator has already taken this host out of service.
    ///
    /// Ping timeouts for such hosts are expected and never investigated.
    pub fn is_out_of_service(self) -> bool {
        matches!(
            self,
            ResourceState::Disabled
                | ResourceState::Maintenance
                | ResourceState::ErrorInMaintenance
        )
    }
}

/// The kind of endpoint a host represents.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    VariantNames,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HostType {
    /// Hypervisor host
    #[default]
    Routing,
    /// Storage agent
    Storage,
    /// Console proxy
    ConsoleProxy,
    /// Secondary storage VM
    SecondaryStorage,
    /// External network device reached through an in-process resource
    ExternalDevice,
}

/// A managed host as stored in the host catalog.
///
/// The agent manager only ever writes `status`, `ms_id` and `last_pinged`;
/// everything else belongs to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Catalog identifier
    pub id: HostId,
    /// Human readable name
    pub name: String,
    /// Globally unique identifier reported by the agent
    pub guid: String,
    /// What kind of endpoint this is
    pub host_type: HostType,
    /// Current connection status
    pub status: HostStatus,
    /// Administrative state
    pub resource_state: ResourceState,
    /// Management server currently owning the connection, if any
    pub ms_id: Option<MsId>,
    /// Last time a ping was recorded
    pub last_pinged: DateTime<Utc>,
    /// Cluster membership
    pub cluster_id: Option<ClusterId>,
    /// Zone membership
    pub zone_id: ZoneId,
    /// Set once the host has been removed
    pub removed: Option<DateTime<Utc>>,
}

impl Host {
    /// Create a new host record in the `Creating` status.
    pub fn new(id: HostId, name: impl Into<String>, guid: impl Into<String>) -> Self {
        Host {
            id,
            name: name.into(),
            guid: guid.into(),
            host_type: HostType::default(),
            status: HostStatus::Creating,
            resource_state: ResourceState::Enabled,
            ms_id: None,
            last_pinged: Utc::now(),
            cluster_id: None,
            zone_id: 0,
            removed: None,
        }
    }

    /// Whether the host is owned by a management server other than `ms_id`.
    pub fn is_owned_elsewhere(&self, ms_id: MsId) -> bool {
        matches!(self.ms_id, Some(owner) if owner != ms_id)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_display_round_trip() {
        assert_eq!(HostStatus::Up.to_string(), "up");
        assert_eq!(
            HostStatus::PrepareForMaintenance.to_string(),
            "prepare_for_maintenance"
        );
        assert_eq!(
            HostStatus::from_str("disconnected").expect("parse status"),
            HostStatus::Disconnected
        );
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&HostEvent::PingTimeout).expect("serialize event");
        assert_eq!(json, r#""ping_timeout""#);
    }

    #[test]
    fn test_active_statuses() {
        assert!(HostStatus::Up.is_active());
        assert!(HostStatus::Connecting.is_active());
        assert!(!HostStatus::Alert.is_active());
        assert!(!HostStatus::Disconnected.is_active());
    }

    #[test]
    fn test_out_of_service_resource_states() {
        assert!(ResourceState::Maintenance.is_out_of_service());
        assert!(ResourceState::Disabled.is_out_of_service());
        assert!(!ResourceState::Enabled.is_out_of_service());
        assert!(!ResourceState::PrepareForMaintenance.is_out_of_service());
    }

    #[test]
    fn test_owned_elsewhere() {
        let mut host = Host::new(7, "h7", "guid-7");
        assert!(!host.is_owned_elsewhere(1));
        host.ms_id = Some(1);
        assert!(!host.is_owned_elsewhere(1));
        assert!(host.is_owned_elsewhere(2));
    }
}
