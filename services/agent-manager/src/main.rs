// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Agent Manager Service
//!
//! Accepts connections from host agents, keeps their status current and
//! routes commands to them, forwarding through peer management servers when
//! a host is owned elsewhere in the cluster.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

use agent_manager::catalog::MemoryCatalog;
use agent_manager::cluster::{self, ClusterRouter, LocalLock, PeerConnections, StaticDirectory};
use agent_manager::config::DEFAULT_BIND_ADDRESS;
use agent_manager::{AgentManager, AgentMonitor, Collaborators, ManagerConfig, metrics, server};

fn print_version() {
    let version = env!("CARGO_PKG_VERSION");
    let name = env!("CARGO_PKG_NAME");
    let buildstamp = option_env!("STAMP").unwrap_or("no-STAMP");
    println!("{} {} ({})", name, version, buildstamp);
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --version and --help
    let args: Vec<String> = std::env::args().collect();
    #[allow(clippy::never_loop)] // Intentional: early return on first recognized arg
    for arg in &args[1..] {
        match arg.as_str() {
            "-V" | "--version" => {
                print_version();
                return Ok(());
            }
            "-h" | "--help" => {
                print_version();
                println!("Usage: {} [OPTIONS]", args[0]);
                println!();
                println!("Options:");
                println!("  -h, --help       Display this information");
                println!("  -V, --version    Display the program's version number");
                println!();
                println!("Environment variables:");
                println!("  MS_ID                 Management server id (required)");
                println!("  NODE_NAME             Node name (default: ms-<MS_ID>)");
                println!(
                    "  BIND_ADDRESS          Agent listener address (default: {})",
                    DEFAULT_BIND_ADDRESS
                );
                println!("  CLUSTER_PEERS         Peers as id=name@host:port, comma separated");
                println!("  WORKERS               Request workers");
                println!("  CONNECT_WORKERS       Handshake workers");
                println!("  PING_INTERVAL_SECS    Expected agent ping interval");
                println!("  COMMAND_WAIT_SECS     Default synchronous command wait");
                println!("  SCAN_INTERVAL_SECS    Direct-agent scan interval");
                println!(
                    "  CONFIG_FILE           Path to JSON config file for SIGUSR1 reloading (optional)"
                );
                println!("  RUST_LOG              Log filter (default: agent_manager=info)");
                return Ok(());
            }
            _ => {
                eprintln!("Unknown option: {}", arg);
                std::process::exit(1);
            }
        }
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "agent_manager=info".to_string()),
        ))
        .init();

    print_version();

    let config = ManagerConfig::from_env().context("Failed to load configuration")?;
    info!(
        ms_id = config.ms_id,
        node = %config.node_name,
        peers = config.cluster_peers.len(),
        "Configuration loaded"
    );

    metrics::register_metrics();

    let (config_tx, config_rx) = watch::channel(config.clone());

    // Start config file watcher if CONFIG_FILE is set (Unix only)
    #[cfg(unix)]
    if let Ok(config_file) = std::env::var("CONFIG_FILE") {
        use std::path::PathBuf;

        let config_path = PathBuf::from(&config_file);
        if tokio::fs::try_exists(&config_path).await.unwrap_or(false) {
            tokio::spawn(ManagerConfig::start_config_watcher(
                config_path,
                config.clone(),
                config_tx,
            ));
            info!(
                config_file = %config_file,
                "Config watcher started - send SIGUSR1 to reload"
            );
        } else {
            tracing::warn!(
                config_file = %config_file,
                "CONFIG_FILE specified but file does not exist, config reloading disabled"
            );
        }
    }

    let directory = Arc::new(StaticDirectory::new(
        config
            .cluster_peers
            .iter()
            .filter(|p| p.ms_id != config.ms_id)
            .cloned(),
    ));
    let peers = Arc::new(PeerConnections::new(
        directory.clone(),
        config.peer_send_retries,
    ));
    let router = Arc::new(ClusterRouter::new(
        config.ms_id,
        directory.clone(),
        Arc::new(LocalLock::new()),
        peers,
    ));

    let catalog = Arc::new(MemoryCatalog::new());
    let membership_rx = config_rx.clone();
    let mgr = AgentManager::new(
        config_rx,
        Collaborators::new(catalog),
        Some(router.clone()),
    );

    let monitor = AgentMonitor::new();
    monitor.attach(&mgr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let direct_events = mgr.run_direct_events(shutdown_rx.clone());
    let monitor_task = tokio::spawn(monitor.run(mgr.clone(), shutdown_rx.clone()));
    let scan_task = tokio::spawn(cluster::scan::run_scan_loop(
        mgr.clone(),
        router.clone(),
        shutdown_rx.clone(),
    ));
    let membership_task = tokio::spawn(cluster::run_membership_loop(
        mgr.clone(),
        router,
        directory,
        membership_rx,
        shutdown_rx.clone(),
    ));

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    info!("Agent manager listening on {}", config.bind_address);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            return;
        }
        info!("Shutdown requested");
        shutdown_tx.send_replace(true);
    });

    server::serve(mgr.clone(), listener, shutdown_rx).await;

    let _ = monitor_task.await;
    let _ = scan_task.await;
    let _ = membership_task.await;
    if let Some(handle) = direct_events {
        let _ = handle.await;
    }
    debug!(metrics = %metrics::gather_metrics(), "Final metrics");
    info!(attaches = mgr.attaches().len(), "Agent manager stopped");
    Ok(())
}
