// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Configuration for the agent manager

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tokio::sync::watch;

use host_types::MsId;

use crate::cluster::PeerInfo;

/// Default address agents and peer nodes connect to.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8250";

const DEFAULT_PING_INTERVAL_SECS: u64 = 60;
const DEFAULT_PING_TIMEOUT_MULTIPLIER: f64 = 2.5;
const DEFAULT_COMMAND_WAIT_SECS: u64 = 1800;
const DEFAULT_WORKERS: usize = 5;
const DEFAULT_CONNECT_WORKERS: usize = 50;
const DEFAULT_DIRECT_AGENT_POOL_SIZE: usize = 50;
const DEFAULT_PEER_SEND_RETRIES: u32 = 3;
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 90;
const DEFAULT_SCAN_LOCK_TIMEOUT_MS: u64 = 500;
const DEFAULT_SCAN_BATCH_SIZE: usize = 16;

/// Manager configuration loaded from environment variables or JSON file
///
/// Configuration can be loaded from:
/// 1. Environment variables (primary method, see `from_env()`)
/// 2. JSON config file (for SIGUSR1-based reloading, see `from_file()`)
///
/// The JSON config file supports the subset of fields that are safe to change
/// at runtime: ping interval and multiplier, command wait, scan interval,
/// scan batch size and the cluster peer list. A file without peers leaves
/// cluster membership as it is.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Identifier of this management server within the cluster
    /// Note: This field is NOT reloadable - changes require restart
    #[serde(skip)]
    pub ms_id: MsId,

    #[serde(skip)]
    pub node_name: String,

    #[serde(skip)]
    pub bind_address: String,

    /// Other management servers, parsed from CLUSTER_PEERS
    /// (`id=name@host:port`, comma separated)
    pub cluster_peers: Vec<PeerInfo>,

    /// Size of the request processing pool
    #[serde(skip)]
    pub workers: usize,

    /// Size of the handshake pool; must exceed `workers`
    #[serde(skip)]
    pub connect_workers: usize,

    /// Concurrent pings of in-process hosts
    #[serde(skip)]
    pub direct_agent_pool_size: usize,

    #[serde(skip)]
    pub peer_send_retries: u32,

    #[serde(skip)]
    pub scan_lock_timeout_ms: u64,

    /// Interval agents are told to ping at
    pub ping_interval_secs: u64,

    /// A host is considered silent after `ping_interval * multiplier`
    pub ping_timeout_multiplier: f64,

    /// Default wait for synchronous sends
    pub command_wait_secs: u64,

    pub scan_interval_secs: u64,

    /// Hosts claimed per direct-agent scan
    pub scan_batch_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ms_id: 0,
            node_name: String::new(),
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            cluster_peers: Vec::new(),
            workers: DEFAULT_WORKERS,
            connect_workers: DEFAULT_CONNECT_WORKERS,
            direct_agent_pool_size: DEFAULT_DIRECT_AGENT_POOL_SIZE,
            peer_send_retries: DEFAULT_PEER_SEND_RETRIES,
            scan_lock_timeout_ms: DEFAULT_SCAN_LOCK_TIMEOUT_MS,
            ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
            ping_timeout_multiplier: DEFAULT_PING_TIMEOUT_MULTIPLIER,
            command_wait_secs: DEFAULT_COMMAND_WAIT_SECS,
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
        }
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}

/// Parse a CLUSTER_PEERS value.
///
/// Example: "2=ms-b@10.0.0.2:8250,3=ms-c@10.0.0.3:8250"
pub fn parse_peers(value: &str) -> Result<Vec<PeerInfo>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (id, rest) = entry
                .split_once('=')
                .with_context(|| format!("Peer '{}' is missing '='", entry))?;
            let (name, addr) = rest
                .split_once('@')
                .with_context(|| format!("Peer '{}' is missing '@'", entry))?;
            let ms_id = id
                .trim()
                .parse()
                .with_context(|| format!("Peer '{}' has an invalid id", entry))?;
            if name.is_empty() || addr.is_empty() {
                bail!("Peer '{}' needs both a name and an address", entry);
            }
            Ok(PeerInfo {
                ms_id,
                name: name.to_string(),
                addr: addr.to_string(),
            })
        })
        .collect()
}

impl ManagerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let ms_id: MsId = std::env::var("MS_ID")
            .context("MS_ID environment variable required")?
            .parse()
            .context("Invalid MS_ID")?;

        let node_name = std::env::var("NODE_NAME").unwrap_or_else(|_| format!("ms-{}", ms_id));

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());

        let cluster_peers = match std::env::var("CLUSTER_PEERS") {
            Ok(value) => parse_peers(&value).context("Invalid CLUSTER_PEERS")?,
            Err(_) => Vec::new(),
        };

        let config = Self {
            ms_id,
            node_name,
            bind_address,
            cluster_peers,
            workers: env_or("WORKERS", DEFAULT_WORKERS)?,
            connect_workers: env_or("CONNECT_WORKERS", DEFAULT_CONNECT_WORKERS)?,
            direct_agent_pool_size: env_or(
                "DIRECT_AGENT_POOL_SIZE",
                DEFAULT_DIRECT_AGENT_POOL_SIZE,
            )?,
            peer_send_retries: env_or("PEER_SEND_RETRIES", DEFAULT_PEER_SEND_RETRIES)?,
            scan_lock_timeout_ms: env_or("SCAN_LOCK_TIMEOUT_MS", DEFAULT_SCAN_LOCK_TIMEOUT_MS)?,
            ping_interval_secs: env_or("PING_INTERVAL_SECS", DEFAULT_PING_INTERVAL_SECS)?,
            ping_timeout_multiplier: env_or(
                "PING_TIMEOUT_MULTIPLIER",
                DEFAULT_PING_TIMEOUT_MULTIPLIER,
            )?,
            command_wait_secs: env_or("COMMAND_WAIT_SECS", DEFAULT_COMMAND_WAIT_SECS)?,
            scan_interval_secs: env_or("SCAN_INTERVAL_SECS", DEFAULT_SCAN_INTERVAL_SECS)?,
            scan_batch_size: env_or("SCAN_BATCH_SIZE", DEFAULT_SCAN_BATCH_SIZE)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the invariants between fields.
    pub fn validate(&self) -> Result<()> {
        if self.connect_workers <= self.workers {
            bail!(
                "CONNECT_WORKERS ({}) must be larger than WORKERS ({})",
                self.connect_workers,
                self.workers
            );
        }
        if self.ping_interval_secs == 0 {
            bail!("PING_INTERVAL_SECS must be positive");
        }
        if self.ping_timeout_multiplier < 1.0 {
            bail!("PING_TIMEOUT_MULTIPLIER must be at least 1.0");
        }
        if self.scan_batch_size == 0 {
            bail!("SCAN_BATCH_SIZE must be positive");
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// How long a host may stay silent before it is considered timed out.
    pub fn ping_timeout(&self) -> Duration {
        self.ping_interval().mul_f64(self.ping_timeout_multiplier)
    }

    pub fn command_wait(&self) -> Duration {
        Duration::from_secs(self.command_wait_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn scan_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_lock_timeout_ms)
    }

    /// Load configuration from a JSON file
    ///
    /// This is used for runtime configuration reloading via SIGUSR1.
    /// Non-reloadable fields keep their defaults and are ignored by
    /// `merge_reloadable`.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Merge runtime-reloadable fields from another config
    pub fn merge_reloadable(&mut self, other: &ManagerConfig) {
        self.ping_interval_secs = other.ping_interval_secs;
        self.ping_timeout_multiplier = other.ping_timeout_multiplier;
        self.command_wait_secs = other.command_wait_secs;
        self.scan_interval_secs = other.scan_interval_secs;
        self.scan_batch_size = other.scan_batch_size;
        if !other.cluster_peers.is_empty() {
            self.cluster_peers = other.cluster_peers.clone();
        }
    }

    /// Start watching for SIGUSR1 to reload config from file
    ///
    /// When SIGUSR1 is received, the config file is re-read and the new
    /// configuration is sent to subscribers via the watch channel. A file
    /// that fails validation after merging is rejected and the running
    /// configuration is kept.
    #[cfg(unix)]
    pub async fn start_config_watcher(
        config_file: std::path::PathBuf,
        current_config: Self,
        config_tx: watch::Sender<Self>,
    ) {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigusr1 = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to register SIGUSR1 handler");
                return;
            }
        };

        let mut config = current_config;

        loop {
            sigusr1.recv().await;
            tracing::info!(
                config_file = %config_file.display(),
                "Received SIGUSR1, reloading config"
            );

            let new_config = match Self::from_file(&config_file).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        config_file = %config_file.display(),
                        "Failed to reload config"
                    );
                    continue;
                }
            };

            let mut candidate = config.clone();
            candidate.merge_reloadable(&new_config);
            if let Err(e) = candidate.validate() {
                tracing::error!(error = %e, "Reloaded config is invalid, keeping current");
                continue;
            }
            config = candidate;

            if config_tx.send(config.clone()).is_err() {
                tracing::warn!("No config subscribers, reload had no effect");
            } else {
                tracing::info!(
                    ping_interval_secs = config.ping_interval_secs,
                    command_wait_secs = config.command_wait_secs,
                    scan_interval_secs = config.scan_interval_secs,
                    peers = config.cluster_peers.len(),
                    "Config reloaded successfully"
                );
            }
        }
    }
}
