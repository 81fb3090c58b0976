//! cove Node Agent
//!
//! Standalone harness: runs one host listener against an in-process
//! coordination store with the mock container runtime. The control plane
//! binary embeds the same listener for its development hosts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cove_coord::MemoryStore;
use cove_node_agent::config::Config;
use cove_node_agent::{HostListener, MockRuntime};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        host_id = %config.host_id,
        pool_id = ?config.pool_id,
        "Starting cove node agent"
    );

    let store = MemoryStore::new();
    let conn = Arc::new(store.connect().await);
    let runtime = Arc::new(MockRuntime::new());

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = HostListener::new(
        Arc::clone(&conn),
        runtime,
        config.pool_id.clone(),
        config.host_id.clone(),
    );
    let mut listener_handle = tokio::spawn(async move { listener.run(shutdown_rx).await });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut listener_handle => {
            match result {
                Ok(Ok(())) => info!("Host listener exited normally"),
                Ok(Err(e)) => error!(error = %e, "Host listener error"),
                Err(e) => error!(error = %e, "Host listener task panicked"),
            }
            conn.close().await;
            return Ok(());
        }
    }

    // Signal shutdown to the listener
    let _ = shutdown_tx.send(true);

    info!("Waiting for instances to stop...");
    match tokio::time::timeout(Duration::from_secs(30), listener_handle).await {
        Ok(Ok(Err(e))) => error!(error = %e, "Host listener error"),
        Ok(Err(e)) => error!(error = %e, "Host listener task panicked"),
        Ok(Ok(Ok(()))) => {}
        Err(_) => warn!("Timed out waiting for host listener"),
    }

    conn.close().await;
    info!("Node agent shutdown complete");
    Ok(())
}
