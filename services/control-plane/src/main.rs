//! cove Control Plane
//!
//! Drives desired-state changes through the per-tenant batch scheduler and
//! keeps every service's instance records in line with its service node.
//!
//! The binary runs against an in-process coordination store. Development
//! hosts are node agents embedded in the same process, each on its own
//! store session, using the mock container runtime.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cove_control_plane::{
    config,
    facade::{Facade, StoreFacade},
    scheduler::BatchServiceStateManager,
    sync::{run_service_sync, RoundRobinSelector, ServiceSyncLoop},
};
use cove_coord::{MemoryConnection, MemoryStore};
use cove_id::HostId;
use cove_model::{DesiredState, Service};
use cove_node_agent::{HostListener, MockRuntime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to COVE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting cove control plane");
    info!(
        pool_id = ?config.pool_id,
        run_level_timeout_secs = config.run_level_timeout.as_secs(),
        dev_hosts = config.dev_hosts,
        "Configuration loaded"
    );

    let store = MemoryStore::new();
    let conn = Arc::new(store.connect().await);

    // Load the service catalog
    let facade = Arc::new(StoreFacade::new(Arc::clone(&conn), config.pool_id.clone()));
    if let Some(path) = &config.services_file {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("could not read {}", path.display()))?;
        let services: Vec<Service> =
            serde_json::from_slice(&raw).with_context(|| format!("invalid catalog {}", path.display()))?;
        info!(count = services.len(), "Loaded service catalog");
        for service in services {
            facade.put_service(service).await;
        }
    }

    // Host agents and the sync loops stop separately so no instance is
    // rescheduled while the hosts tear down.
    let (agents_tx, agents_rx) = watch::channel(false);
    let (sync_tx, sync_rx) = watch::channel(false);

    // Start development hosts
    let mut agents: Vec<(MemoryConnection, JoinHandle<()>)> = Vec::new();
    for _ in 0..config.dev_hosts {
        let host_conn = Arc::new(store.connect().await);
        let host_id = HostId::new();
        let listener = HostListener::new(
            Arc::clone(&host_conn),
            Arc::new(MockRuntime::new()),
            config.pool_id.clone(),
            host_id.clone(),
        );
        let shutdown_rx = agents_rx.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = listener.run(shutdown_rx).await {
                error!(host_id = %host_id, error = %e, "Host listener failed");
            }
        });
        agents.push((host_conn.as_ref().clone(), handle));
    }

    // Start the service sync supervisor
    let selector = Arc::new(RoundRobinSelector::new(Arc::clone(&conn), config.pool_id.clone()));
    let sync = Arc::new(ServiceSyncLoop::new(
        Arc::clone(&conn),
        config.pool_id.clone(),
        selector,
        config.sync_retry_interval,
    ));
    let sync_handle = tokio::spawn(run_service_sync(sync, sync_rx));

    // Start the batch scheduler and bring every service up
    let manager = BatchServiceStateManager::new(
        Arc::clone(&facade) as Arc<dyn Facade>,
        config.run_level_timeout,
    );
    manager.start().await?;
    let mut service_ids = Vec::new();
    for tenant_id in manager.tenant_ids().await {
        service_ids.extend(facade.tenant_services(&tenant_id).await.into_iter().map(|s| s.id));
    }
    if let Err(e) = manager.sync_current_states(&service_ids).await {
        warn!(error = %e, "Failed to sync service current states");
    }
    for tenant_id in manager.tenant_ids().await {
        let services = facade.tenant_services(&tenant_id).await;
        info!(tenant_id = %tenant_id, count = services.len(), "Scheduling tenant services");
        if let Err(e) = manager
            .schedule_services(&tenant_id, services, DesiredState::Run, false)
            .await
        {
            error!(tenant_id = %tenant_id, error = %e, "Failed to schedule tenant services");
        }
    }

    // Wait for shutdown signal (Ctrl+C)
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    // Drain the scheduler first, then the sync loops, then the hosts
    manager.shutdown().await;

    let shutdown_timeout = Duration::from_secs(10);
    let _ = sync_tx.send(true);
    if tokio::time::timeout(shutdown_timeout, sync_handle).await.is_err() {
        warn!("Service sync did not shut down in time");
    }

    info!("Waiting for hosts to shut down...");
    let _ = agents_tx.send(true);
    for (host_conn, handle) in agents {
        if tokio::time::timeout(shutdown_timeout, handle).await.is_err() {
            warn!("Host listener did not shut down in time");
        }
        host_conn.close().await;
    }

    conn.close().await;
    info!("Control plane shutdown complete");
    Ok(())
}
