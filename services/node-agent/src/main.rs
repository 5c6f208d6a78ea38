//! Fleet Node Agent
//!
//! Runs on each worker host and provisions service instances on request from
//! provisioners over the bus.
//!
//! ## Startup
//!
//! 1. Open the instance store under the data directory
//! 2. Connect to the bus
//! 3. Recover persisted instances (adopt, respawn or orphan)
//! 4. Subscribe to discover/provision/unprovision/bind/unbind
//! 5. Announce immediately, then on the announce interval

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_bus::NatsBus;
use fleet_node_agent::state::StateStore;
use fleet_node_agent::{Config, NodeAgent, ProcessBackend};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet node agent");
    info!(
        service = %config.service,
        bus_url = %config.bus_url,
        data_dir = %config.data_dir.display(),
        port_range = ?config.port_range,
        available_memory_mb = config.available_memory_mb,
        "Configuration loaded"
    );

    let binary = config
        .backend_binary
        .clone()
        .context("FLEET_BACKEND_BINARY must name the program started per instance")?;
    let backend = Arc::new(ProcessBackend::new(
        binary,
        config.backend_args.clone(),
        config.max_memory_mb,
    ));

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let store = StateStore::open(config.store_path())?;

    let bus = NatsBus::connect(&config.bus_url, "fleet-node-agent").await?;

    let agent = NodeAgent::new(config, Arc::new(bus), backend, store)?;
    info!(node_id = %agent.node_id(), "Node identity resolved");

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let running = agent.start(shutdown_rx).await?;
    if !running.recovery.orphaned.is_empty() {
        error!(
            orphaned = ?running.recovery.orphaned,
            "Some instances could not be restarted and need manual attention"
        );
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    for task in running.tasks {
        match tokio::time::timeout(Duration::from_secs(2), task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Worker task panicked"),
            Err(_) => warn!("Worker did not stop in time"),
        }
    }

    // Backing processes keep running; they are adopted on next start.
    info!("Node agent shutdown complete");
    Ok(())
}
