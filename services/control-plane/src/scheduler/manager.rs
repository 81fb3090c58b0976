//! Tenant lifecycle and the public scheduling surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cove_id::{ServiceId, TenantId};
use cove_model::{DesiredState, Service, ServiceCurrentState};
use cove_reconcile::{ServiceStateChangeBatch, TenantQueue};
use futures_util::future::join_all;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::current::CurrentStates;
use super::executor::TenantLoop;
use super::SchedulerError;
use crate::facade::Facade;

struct TenantHandle {
    queue: Arc<Mutex<TenantQueue>>,
    wake: mpsc::Sender<()>,
    drained: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Tenants {
    running: bool,
    handles: HashMap<TenantId, TenantHandle>,
}

/// Owns one batch queue and executor loop per tenant.
pub struct BatchServiceStateManager {
    facade: Arc<dyn Facade>,
    run_level_timeout: Duration,
    tenants: RwLock<Tenants>,
    current: Arc<CurrentStates>,
}

impl BatchServiceStateManager {
    pub fn new(facade: Arc<dyn Facade>, run_level_timeout: Duration) -> Self {
        Self {
            current: Arc::new(CurrentStates::new(Arc::clone(&facade))),
            facade,
            run_level_timeout,
            tenants: RwLock::new(Tenants::default()),
        }
    }

    /// Start managing every tenant the facade reports.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), SchedulerError> {
        {
            let mut tenants = self.tenants.write().await;
            if tenants.running {
                return Err(SchedulerError::AlreadyStarted);
            }
            tenants.running = true;
        }

        let tenant_ids = self.facade.get_tenant_ids().await?;
        for tenant_id in tenant_ids {
            match self.add_tenant(tenant_id.clone()).await {
                Ok(()) | Err(SchedulerError::DuplicateTenant) => {}
                Err(err) => return Err(err),
            }
        }
        info!("Batch scheduler started");
        Ok(())
    }

    /// Stop every tenant loop and cancel all queued work.
    pub async fn shutdown(&self) {
        let handles: Vec<(TenantId, TenantHandle)> = {
            let mut tenants = self.tenants.write().await;
            tenants.running = false;
            tenants.handles.drain().collect()
        };
        for (tenant_id, handle) in handles {
            stop_tenant(&tenant_id, handle).await;
        }
        self.current.shutdown().await;
        info!("Batch scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.tenants.read().await.running
    }

    /// Begin managing a tenant and spawn its executor loop.
    pub async fn add_tenant(&self, tenant_id: TenantId) -> Result<(), SchedulerError> {
        let mut tenants = self.tenants.write().await;
        if !tenants.running {
            return Err(SchedulerError::NotRunning);
        }
        if tenants.handles.contains_key(&tenant_id) {
            return Err(SchedulerError::DuplicateTenant);
        }

        let queue = Arc::new(Mutex::new(TenantQueue::new()));
        let drained = Arc::new(Notify::new());
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tenant_loop = TenantLoop {
            tenant_id: tenant_id.clone(),
            facade: Arc::clone(&self.facade),
            queue: Arc::clone(&queue),
            current: Arc::clone(&self.current),
            drained: Arc::clone(&drained),
            run_level_timeout: self.run_level_timeout,
        };
        let task = tokio::spawn(tenant_loop.run(wake_rx, shutdown_rx));

        info!(tenant_id = %tenant_id, "Added tenant");
        tenants.handles.insert(
            tenant_id,
            TenantHandle {
                queue,
                wake: wake_tx,
                drained,
                shutdown: shutdown_tx,
                task,
            },
        );
        Ok(())
    }

    /// Stop a tenant's loop and cancel its queued and pending work.
    pub async fn remove_tenant(&self, tenant_id: &TenantId) -> Result<(), SchedulerError> {
        let handle = self
            .tenants
            .write()
            .await
            .handles
            .remove(tenant_id)
            .ok_or(SchedulerError::BadTenant)?;
        stop_tenant(tenant_id, handle).await;
        Ok(())
    }

    pub async fn tenant_ids(&self) -> Vec<TenantId> {
        let mut ids: Vec<TenantId> = self.tenants.read().await.handles.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Reconcile a desired-state request into the tenant's queue and wake its
    /// loop if anything was queued.
    ///
    /// Services already settled in a state that satisfies the request are
    /// dropped before queueing.
    #[instrument(skip(self, services), fields(count = services.len()))]
    pub async fn schedule_services(
        &self,
        tenant_id: &TenantId,
        services: Vec<Service>,
        desired_state: DesiredState,
        emergency: bool,
    ) -> Result<(), SchedulerError> {
        let tenants = self.tenants.read().await;
        let handle = tenants.handles.get(tenant_id).ok_or(SchedulerError::BadTenant)?;

        let mut wanted = Vec::with_capacity(services.len());
        for service in services {
            if self.current.satisfies(&service.id, desired_state, emergency).await {
                debug!(service_id = %service.id, desired_state = %desired_state, "Service already in desired state");
            } else {
                wanted.push(service);
            }
        }
        if wanted.is_empty() {
            debug!("Request was satisfied");
            return Ok(());
        }

        let batch = ServiceStateChangeBatch::from_services(wanted, desired_state, emergency);
        let requested = batch.service_ids();
        let queued = {
            let mut queue = handle.queue.lock().await;
            let queued = queue.schedule(batch)?;
            // Recorded under the queue lock so the loop cannot dequeue these
            // services and mark them transitioning first.
            let ids: Vec<ServiceId> = requested
                .into_iter()
                .filter(|id| queue.batches().any(|b| b.contains(id)))
                .collect();
            self.current
                .set(ServiceCurrentState::pending(desired_state, emergency), &ids)
                .await;
            queued
        };

        if queued {
            // A full channel already holds a wake-up.
            let _ = handle.wake.try_send(());
        } else {
            debug!("Request was redundant");
        }
        Ok(())
    }

    /// Refresh the current state of the given services.
    ///
    /// Queued services are marked pending and executing ones transitioning.
    /// The rest are settled in the background against the desired state the
    /// facade holds for them.
    #[instrument(skip(self, service_ids), fields(count = service_ids.len()))]
    pub async fn sync_current_states(&self, service_ids: &[ServiceId]) -> Result<(), SchedulerError> {
        let mut known: HashMap<ServiceId, ServiceCurrentState> = HashMap::new();
        {
            let tenants = self.tenants.read().await;
            for handle in tenants.handles.values() {
                let queue = handle.queue.lock().await;
                for batch in queue.batches() {
                    let state = ServiceCurrentState::pending(batch.desired_state, batch.emergency);
                    for id in batch.service_ids() {
                        known.insert(id, state);
                    }
                }
                if let Some(pending) = queue.pending() {
                    let state = ServiceCurrentState::transition(pending.desired_state, pending.emergency);
                    for id in pending.services.keys() {
                        known.insert(id.clone(), state);
                    }
                }
            }
        }

        let mut missing = Vec::new();
        for id in service_ids {
            match known.get(id) {
                Some(state) => self.current.set(*state, std::slice::from_ref(id)).await,
                None => missing.push(id.clone()),
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        for service in self.facade.get_services_for_scheduling(&missing).await? {
            self.current
                .start_wait(&service, service.desired_state, service.emergency_shutdown)
                .await;
        }
        Ok(())
    }

    /// Where the scheduler last saw a service.
    pub async fn current_state(&self, service_id: &ServiceId) -> ServiceCurrentState {
        self.current.get(service_id).await
    }

    /// Block until the tenant has nothing queued and nothing executing.
    pub async fn wait(&self, tenant_id: &TenantId) -> Result<(), SchedulerError> {
        let (queue, drained) = {
            let tenants = self.tenants.read().await;
            let handle = tenants.handles.get(tenant_id).ok_or(SchedulerError::BadTenant)?;
            (Arc::clone(&handle.queue), Arc::clone(&handle.drained))
        };

        loop {
            let notified = drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if queue.lock().await.is_drained() {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Block until each listed service that is currently queued or executing
    /// has been processed or cancelled.
    pub async fn wait_scheduled(
        &self,
        tenant_id: &TenantId,
        service_ids: &[ServiceId],
    ) -> Result<(), SchedulerError> {
        let signals = {
            let tenants = self.tenants.read().await;
            let handle = tenants.handles.get(tenant_id).ok_or(SchedulerError::BadTenant)?;
            let queue = handle.queue.lock().await;
            service_ids
                .iter()
                .filter_map(|id| match queue.find(id) {
                    Some(svc) => Some(svc.signal().clone()),
                    None => {
                        debug!(tenant_id = %tenant_id, service_id = %id, "Not waiting for service, could not find it");
                        None
                    }
                })
                .collect::<Vec<_>>()
        };

        join_all(signals.iter().map(|s| s.cancelled())).await;
        Ok(())
    }

}

async fn stop_tenant(tenant_id: &TenantId, handle: TenantHandle) {
    let TenantHandle {
        queue,
        wake,
        drained,
        shutdown,
        task,
    } = handle;

    shutdown.send_replace(true);
    drop(wake);
    queue.lock().await.cancel_all();
    drained.notify_waiters();

    if let Err(err) = task.await {
        warn!(tenant_id = %tenant_id, error = %err, "Tenant loop panicked");
    }
    info!(tenant_id = %tenant_id, "Removed tenant");
}
