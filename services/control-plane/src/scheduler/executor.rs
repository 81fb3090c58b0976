//! Per-tenant executor loop.

use std::sync::Arc;
use std::time::Duration;

use cove_id::TenantId;
use cove_model::{DesiredState, Service, ServiceCurrentState};
use cove_reconcile::{CancellableService, ServiceStateChangeBatch, TenantQueue};
use futures_util::future::join_all;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, error, info, instrument, warn};

use super::current::CurrentStates;
use super::SchedulerError;
use crate::facade::Facade;

pub(crate) struct TenantLoop {
    pub(crate) tenant_id: TenantId,
    pub(crate) facade: Arc<dyn Facade>,
    pub(crate) queue: Arc<Mutex<TenantQueue>>,
    pub(crate) current: Arc<CurrentStates>,
    /// Notified whenever the loop goes idle or finishes a batch.
    pub(crate) drained: Arc<Notify>,
    pub(crate) run_level_timeout: Duration,
}

impl TenantLoop {
    /// Run until `shutdown` is raised or every wake sender is dropped.
    #[instrument(skip_all, fields(tenant_id = %self.tenant_id))]
    pub(crate) async fn run(self, mut wake: mpsc::Receiver<()>, mut shutdown: watch::Receiver<bool>) {
        info!("Started tenant loop");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = self.queue.lock().await.next_batch();
            let Ok(batch) = next else {
                self.drained.notify_waiters();
                debug!("Waiting for change");
                tokio::select! {
                    msg = wake.recv() => {
                        if msg.is_none() {
                            break;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            };

            self.execute(batch).await;
            self.queue.lock().await.clear_pending();
            self.drained.notify_waiters();
        }

        info!("Tenant loop exited");
    }

    async fn execute(&self, batch: ServiceStateChangeBatch) {
        let desired_state = batch.desired_state;
        let emergency = batch.emergency;
        debug!(
            desired_state = %desired_state,
            emergency,
            batch_size = batch.len(),
            timeout_secs = self.run_level_timeout.as_secs(),
            "Got batch"
        );

        let mut services = self.refresh(batch).await;
        services.retain(|s| !s.is_cancelled());

        if emergency && desired_state == DesiredState::Stop {
            for svc in services.iter_mut() {
                svc.service.emergency_shutdown = true;
                svc.service.desired_state = desired_state;
                if let Err(err) = self.facade.update_service(&svc.service).await {
                    error!(
                        service_id = %svc.id(),
                        error = %err,
                        "Failed to persist emergency shutdown"
                    );
                }
            }
        }

        let ids: Vec<_> = services.iter().map(|s| s.id().clone()).collect();
        self.current
            .set(ServiceCurrentState::transition(desired_state, emergency), &ids)
            .await;

        let mut failed = false;
        if !services.is_empty() {
            let definitions: Vec<Service> = services.iter().map(|s| s.service.clone()).collect();
            match self
                .facade
                .schedule_service_batch(&definitions, &self.tenant_id, desired_state)
                .await
            {
                Ok(_) => {
                    for svc in &services {
                        self.current.start_wait(&svc.service, desired_state, emergency).await;
                    }
                }
                Err(err) => {
                    error!(error = %err, "Error scheduling services");
                    failed = true;
                    for svc in &services {
                        svc.cancel();
                    }
                }
            }
        }

        match self
            .wait_with_timeout(&services, desired_state.convergence_target())
            .await
        {
            Ok(()) => debug!(desired_state = %desired_state, "Batch converged"),
            Err(SchedulerError::WaitTimeout) => warn!(
                desired_state = %desired_state,
                "Timeout waiting for service batch to reach desired state"
            ),
            Err(err) => error!(error = %err, "Error waiting for service batch"),
        }

        // Releases anyone blocked in wait_scheduled.
        for svc in &services {
            svc.cancel();
        }

        // Nothing changed for services that could not be scheduled, so
        // settle them on what the facade still holds.
        if failed {
            for svc in &services {
                self.current
                    .start_wait(&svc.service, svc.service.desired_state, svc.service.emergency_shutdown)
                    .await;
            }
        }
    }

    /// Replace each member with its current definition. Members the facade
    /// no longer knows are cancelled and dropped.
    async fn refresh(&self, batch: ServiceStateChangeBatch) -> Vec<CancellableService> {
        let ids = batch.service_ids();
        let current = match self.facade.get_services_for_scheduling(&ids).await {
            Ok(current) => current,
            Err(err) => {
                warn!(error = %err, "Could not refresh batch, using queued definitions");
                return batch.into_services();
            }
        };

        batch
            .into_services()
            .into_iter()
            .filter_map(|mut svc| match current.iter().find(|s| &s.id == svc.id()) {
                Some(found) => {
                    svc.service = found.clone();
                    Some(svc)
                }
                None => {
                    debug!(service_id = %svc.id(), "Service no longer exists, dropping");
                    svc.cancel();
                    None
                }
            })
            .collect()
    }

    async fn wait_with_timeout(
        &self,
        services: &[CancellableService],
        desired_state: DesiredState,
    ) -> Result<(), SchedulerError> {
        let waits = services.iter().map(|svc| {
            let facade = Arc::clone(&self.facade);
            async move {
                let cancel = svc.signal().subscribe();
                if let Err(err) = facade
                    .wait_single_service(&svc.service, desired_state, cancel)
                    .await
                {
                    error!(
                        service_id = %svc.id(),
                        desired_state = %desired_state,
                        error = %err,
                        "Failed to wait for service"
                    );
                }
            }
        });

        match tokio::time::timeout(self.run_level_timeout, join_all(waits)).await {
            Ok(_) => Ok(()),
            Err(_) => {
                for svc in services {
                    svc.cancel();
                }
                Err(SchedulerError::WaitTimeout)
            }
        }
    }
}
