// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Agent Manager Library
//!
//! The agent manager keeps a live handle (an attache) for every managed host
//! and is the only way the rest of the control plane talks to hosts. It
//! accepts agent connections, runs the startup handshake, moves hosts through
//! their status state machine and, in a cluster, forwards traffic for hosts
//! owned by another management server.
//!
//! # Modules
//!
//! - [`attache`] - Per-host handles and their transports
//! - [`catalog`] - Persistent host records
//! - [`cluster`] - Peer routing, host ownership and the direct-agent scan
//! - [`config`] - Service configuration (env, file reload)
//! - [`ha`] - Investigation, restart scheduling and alerts
//! - [`link`] - Reader and writer tasks for one TCP connection
//! - [`listener`] - Host event listeners and their registry
//! - [`manager`] - The attache table and host lifecycle operations
//! - [`monitor`] - Ping tracking and timeout handling
//! - [`server`] - TCP accept loop

pub mod attache;
pub mod catalog;
pub mod cluster;
pub mod config;
pub mod error;
pub mod ha;
pub mod link;
pub mod listener;
pub mod manager;
pub mod metrics;
pub mod monitor;
pub mod server;

pub use attache::{Attache, AttacheKind};
pub use config::ManagerConfig;
pub use error::AgentError;
pub use manager::{AgentManager, Collaborators};
pub use monitor::AgentMonitor;
