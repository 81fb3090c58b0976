//! Service current-state tracking.
//!
//! Every service the scheduler touches moves through a pending state while
//! queued, a transition state while its batch executes and a settled state
//! once it converges. Settled states let `schedule_services` drop requests
//! that would change nothing.

use std::collections::HashMap;
use std::sync::Arc;

use cove_id::ServiceId;
use cove_model::{DesiredState, Service, ServiceCurrentState};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::facade::Facade;

/// A background wait that settles one service once it converges.
struct SettleWait {
    desired_state: DesiredState,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SettleWait {
    fn cancel(self) {
        self.cancel.send_replace(true);
        drop(self.task);
    }
}

#[derive(Default)]
struct Tracked {
    states: HashMap<ServiceId, ServiceCurrentState>,
    waits: HashMap<ServiceId, SettleWait>,
}

impl Tracked {
    fn cancel_waits(&mut self, ids: &[ServiceId]) {
        for id in ids {
            if let Some(wait) = self.waits.remove(id) {
                wait.cancel();
            }
        }
    }
}

pub(crate) struct CurrentStates {
    facade: Arc<dyn Facade>,
    tracked: Mutex<Tracked>,
}

impl CurrentStates {
    pub(crate) fn new(facade: Arc<dyn Facade>) -> Self {
        Self {
            facade,
            tracked: Mutex::new(Tracked::default()),
        }
    }

    pub(crate) async fn get(&self, id: &ServiceId) -> ServiceCurrentState {
        self.tracked
            .lock()
            .await
            .states
            .get(id)
            .copied()
            .unwrap_or_default()
    }

    /// True when the service has settled in a state that already satisfies
    /// the request.
    pub(crate) async fn satisfies(
        &self,
        id: &ServiceId,
        desired_state: DesiredState,
        emergency: bool,
    ) -> bool {
        self.get(id).await.satisfies(desired_state, emergency)
    }

    /// Record `state` for each service, dropping any wait that would settle
    /// it later.
    pub(crate) async fn set(&self, state: ServiceCurrentState, ids: &[ServiceId]) {
        if ids.is_empty() {
            return;
        }
        let mut tracked = self.tracked.lock().await;
        tracked.cancel_waits(ids);
        self.record(&mut tracked, state, ids).await;
    }

    async fn record(&self, tracked: &mut Tracked, state: ServiceCurrentState, ids: &[ServiceId]) {
        for id in ids {
            tracked.states.insert(id.clone(), state);
        }
        if let Err(err) = self.facade.set_services_current_state(state, ids).await {
            warn!(current_state = %state, error = %err, "Could not record service current state");
        }
    }

    /// Mark the service as transitioning and settle it in the background
    /// once it reaches `desired_state`. An existing wait for the same state
    /// is kept.
    pub(crate) async fn start_wait(
        self: &Arc<Self>,
        service: &Service,
        desired_state: DesiredState,
        emergency: bool,
    ) {
        let mut tracked = self.tracked.lock().await;
        if let Some(existing) = tracked.waits.get(&service.id) {
            if existing.desired_state == desired_state {
                return;
            }
        }

        let ids = [service.id.clone()];
        tracked.cancel_waits(&ids);
        self.record(&mut tracked, ServiceCurrentState::transition(desired_state, emergency), &ids)
            .await;

        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(self).settle(service.clone(), desired_state, emergency, cancel_rx));
        tracked.waits.insert(
            service.id.clone(),
            SettleWait {
                desired_state,
                cancel,
                task,
            },
        );
    }

    async fn settle(
        self: Arc<Self>,
        service: Service,
        desired_state: DesiredState,
        emergency: bool,
        cancel: watch::Receiver<bool>,
    ) {
        let waited = self
            .facade
            .wait_single_service(&service, desired_state.convergence_target(), cancel.clone())
            .await;

        let mut tracked = self.tracked.lock().await;
        // Replaced or cancelled while waiting; the newer state stands.
        let cancelled = *cancel.borrow();
        if cancelled {
            return;
        }
        tracked.waits.remove(&service.id);
        match waited {
            Ok(()) => {
                let state = ServiceCurrentState::settled(desired_state, emergency);
                debug!(service_id = %service.id, current_state = %state, "Service settled");
                self.record(&mut tracked, state, &[service.id.clone()]).await;
            }
            Err(err) => {
                warn!(service_id = %service.id, error = %err, "Could not wait for service to settle");
            }
        }
    }

    /// Drop every background wait.
    pub(crate) async fn shutdown(&self) {
        let mut tracked = self.tracked.lock().await;
        for (_, wait) in tracked.waits.drain() {
            wait.cancel();
        }
    }
}
