//! Per-service instance sync.
//!
//! A [`ServiceSyncLoop`] watches one service node and its instance records
//! and converges the records toward the service's desired state:
//!
//! - Stop: every instance is asked to stop.
//! - Run: missing instance IDs are placed on hosts, surplus ones stopped,
//!   paused ones resumed.
//! - Pause: every running instance is asked to pause.
//!
//! Instances on hosts that went offline are removed before the delta is
//! computed so they get rescheduled. Host registrations are watched so this
//! happens as soon as a host drops out.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use cove_coord::service::ServiceNode;
use cove_coord::state::{
    self, create_state, delete_state, pause_instance, resume_instance, stop_instance, State,
    StateRequest,
};
use cove_coord::{host, path, Connection, ConnectionExt, CoordError, Watch, WatchEvent};
use cove_id::{HostId, PoolId, ServiceId};
use cove_model::{ChangeOption, DesiredState, Service};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// Host selection
// =============================================================================

/// Placement decision for a new instance.
#[async_trait]
pub trait HostSelector: Send + Sync {
    async fn select_host(&self, service: &Service) -> Result<HostId>;
}

/// Cycles through the active hosts.
pub struct RoundRobinSelector<C: Connection + ?Sized> {
    conn: Arc<C>,
    pool_id: Option<PoolId>,
    next: AtomicUsize,
}

impl<C: Connection + ?Sized> RoundRobinSelector<C> {
    pub fn new(conn: Arc<C>, pool_id: Option<PoolId>) -> Self {
        Self {
            conn,
            pool_id,
            next: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl<C: Connection + ?Sized> HostSelector for RoundRobinSelector<C> {
    async fn select_host(&self, service: &Service) -> Result<HostId> {
        let hosts = host::get_active_hosts(self.conn.as_ref(), self.pool_id.as_ref()).await?;
        if hosts.is_empty() {
            return Err(anyhow!("no active hosts for service {}", service.id));
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % hosts.len();
        Ok(hosts[idx].clone())
    }
}

// =============================================================================
// Sync loop
// =============================================================================

/// Result of one sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Target instance count minus the live instance count.
    pub delta: i64,
    /// `false` when the pass hit an offline host or a placement failure and
    /// should be retried.
    pub applied: bool,
}

/// Keeps one service's instance records in line with its service node.
pub struct ServiceSyncLoop<C: Connection + ?Sized> {
    conn: Arc<C>,
    pool_id: Option<PoolId>,
    selector: Arc<dyn HostSelector>,
    retry_interval: Duration,
    /// Serializes instance starts.
    start_lock: Mutex<()>,
}

impl<C: Connection + ?Sized + 'static> ServiceSyncLoop<C> {
    pub fn new(
        conn: Arc<C>,
        pool_id: Option<PoolId>,
        selector: Arc<dyn HostSelector>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            conn,
            pool_id,
            selector,
            retry_interval,
            start_lock: Mutex::new(()),
        }
    }

    /// Watch one service until its node is deleted or `shutdown` is raised.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, service_id: ServiceId) {
        let spath = path::service(self.pool_id.as_ref(), &service_id);
        let conn = self.conn.as_ref();

        loop {
            if *shutdown.borrow() {
                return;
            }

            let (node, node_watch) = match conn.get_json_w::<ServiceNode>(&spath).await {
                Ok(loaded) => loaded,
                Err(CoordError::NoNode(_)) => {
                    info!("Service removed");
                    return;
                }
                Err(err) => {
                    error!(error = %err, "Could not load service");
                    return;
                }
            };
            let (state_ids, children_watch) = match conn.children_w(&spath).await {
                Ok(listing) => listing,
                Err(err) => {
                    error!(error = %err, "Could not load service states");
                    return;
                }
            };

            let hosts_watch = match self.watch_hosts().await {
                Ok(watch) => watch,
                Err(err) => {
                    error!(error = %err, "Could not watch online hosts");
                    return;
                }
            };

            let mut retry = false;
            let states = match self.live_states(&state_ids).await {
                Ok(states) => states,
                Err(err) => {
                    warn!(error = %err, "Could not get service states");
                    retry = true;
                    Vec::new()
                }
            };

            if !retry {
                match node.service.desired_state {
                    DesiredState::Stop => self.stop(&states).await,
                    DesiredState::Run | DesiredState::Restart => {
                        let outcome = self.sync(node.locked, &node.service, states.clone()).await;
                        debug!(delta = outcome.delta, applied = outcome.applied, "Synced service");
                        retry = !outcome.applied;
                    }
                    DesiredState::Pause => self.pause(&states).await,
                }
            }

            let retry_after = async {
                if retry {
                    tokio::time::sleep(self.retry_interval).await;
                } else {
                    std::future::pending::<()>().await;
                }
            };

            debug!("Waiting for event");
            tokio::select! {
                event = node_watch => {
                    if event == WatchEvent::Deleted {
                        info!("Service node deleted, stopping instances");
                        self.stop(&states).await;
                        return;
                    }
                }
                event = children_watch => {
                    if event == WatchEvent::Deleted {
                        info!("Service node deleted, stopping instances");
                        self.stop(&states).await;
                        return;
                    }
                }
                _ = hosts_watch => {
                    debug!("Online hosts changed");
                }
                _ = retry_after => {
                    info!("Re-syncing service");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Stopping watch");
                        return;
                    }
                }
            }
        }
    }

    /// Fires when a host comes online or goes away.
    async fn watch_hosts(&self) -> Result<Watch, CoordError> {
        let p = path::online_hosts(self.pool_id.as_ref());
        loop {
            match self.conn.children_w(&p).await {
                Ok((_, watch)) => return Ok(watch),
                Err(CoordError::NoNode(_)) => {}
                Err(err) => return Err(err),
            }
            if let (false, watch) = self.conn.exists_w(&p).await? {
                return Ok(watch);
            }
        }
    }

    /// Load the service's instances, removing those whose host is gone.
    async fn live_states(&self, state_ids: &[String]) -> Result<Vec<State>, CoordError> {
        let conn = self.conn.as_ref();
        let pool = self.pool_id.as_ref();
        let hosts: HashSet<HostId> = host::get_active_hosts(conn, pool).await?.into_iter().collect();

        let mut states = Vec::with_capacity(state_ids.len());
        for id in state_ids {
            let req = match StateRequest::from_state_id(pool, id) {
                Ok(req) => req,
                Err(err) => {
                    warn!(state_id = %id, error = %err, "Skipping malformed state");
                    continue;
                }
            };

            let active = hosts.contains(&req.host_id) && state::is_valid_state(conn, &req).await?;
            if !active {
                info!(state_id = %req, "Instance is not active, rescheduling");
                delete_state(conn, &req).await?;
                continue;
            }

            match state::get_state(conn, &req).await {
                Ok(state) => states.push(state),
                // Deleted between the listing and the read.
                Err(err) if err.as_state().is_some() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(states)
    }

    /// Converge instance records toward `service.instances`.
    pub async fn sync(&self, locked: bool, service: &Service, mut states: Vec<State>) -> SyncOutcome {
        let conn = self.conn.as_ref();
        states.sort_by_key(|s| s.request.instance_id);

        for state in &states {
            if let Err(err) = resume_instance(conn, &state.request).await {
                warn!(state_id = %state.request, error = %err, "Could not resume paused instance");
                return SyncOutcome {
                    delta: 0,
                    applied: false,
                };
            }
        }

        let count = states.len() as i64;
        let mut target = i64::from(service.instances);
        if count > 0
            && count != target
            && service.has_change_option(ChangeOption::RestartAllOnInstanceChanged)
        {
            // Cycle every instance; the next pass starts the full set again.
            target = 0;
        }

        let delta = target - count;
        if delta > 0 {
            if locked {
                warn!(service_id = %service.id, missing = delta, "Service is locked, not starting instances");
                return SyncOutcome {
                    delta,
                    applied: true,
                };
            }
            let ids = unused_instance_ids(&states, delta as usize);
            let started = self.start(service, &ids).await;
            return SyncOutcome {
                delta,
                applied: started == ids.len(),
            };
        }
        if delta < 0 {
            debug!(surplus = -delta, "Stopping surplus instances");
            self.stop(&states[target as usize..]).await;
        }
        SyncOutcome {
            delta,
            applied: true,
        }
    }

    /// Place instances one at a time. Returns how many were created.
    async fn start(&self, service: &Service, instance_ids: &[u32]) -> usize {
        for (started, &instance_id) in instance_ids.iter().enumerate() {
            let _guard = self.start_lock.lock().await;

            let host_id = match self.selector.select_host(service).await {
                Ok(host_id) => host_id,
                Err(err) => {
                    warn!(service_id = %service.id, error = %err, "Could not assign a host");
                    return started;
                }
            };

            let req = StateRequest::new(self.pool_id.clone(), host_id, service.id.clone(), instance_id);
            if let Err(err) = create_state(self.conn.as_ref(), &req).await {
                warn!(state_id = %req, error = %err, "Could not add instance");
                return started;
            }
            debug!(state_id = %req, "Scheduled instance");
        }
        instance_ids.len()
    }

    async fn stop(&self, states: &[State]) {
        let conn = self.conn.as_ref();
        for state in states {
            if let Err(err) = stop_instance(conn, &state.request).await {
                warn!(state_id = %state.request, error = %err, "Instance won't stop, removing it");
                let _ = delete_state(conn, &state.request).await;
            }
        }
    }

    async fn pause(&self, states: &[State]) {
        for state in states {
            if let Err(err) = pause_instance(self.conn.as_ref(), &state.request).await {
                warn!(state_id = %state.request, error = %err, "Could not pause instance");
            }
        }
    }
}

/// The `n` lowest instance IDs not already in use.
fn unused_instance_ids(states: &[State], n: usize) -> Vec<u32> {
    let used: BTreeSet<u32> = states.iter().map(|s| s.request.instance_id).collect();
    (0u32..).filter(|id| !used.contains(id)).take(n).collect()
}

// =============================================================================
// Supervision
// =============================================================================

/// Runs one [`ServiceSyncLoop::run`] per service node under `{base}/services`.
#[instrument(skip_all)]
pub async fn run_service_sync<C>(sync: Arc<ServiceSyncLoop<C>>, mut shutdown: watch::Receiver<bool>)
where
    C: Connection + ?Sized + 'static,
{
    let services_path = path::services(sync.pool_id.as_ref());
    let mut loops: HashMap<ServiceId, (watch::Sender<bool>, JoinHandle<()>)> = HashMap::new();
    info!("Started service sync supervisor");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let (children, watch) = match sync.conn.children_w(&services_path).await {
            Ok(listing) => listing,
            Err(CoordError::NoNode(_)) => match sync.conn.exists_w(&services_path).await {
                Ok((true, _)) => continue,
                Ok((false, watch)) => (Vec::new(), watch),
                Err(err) => {
                    error!(error = %err, "Could not watch services");
                    break;
                }
            },
            Err(err) => {
                error!(error = %err, "Could not watch services");
                break;
            }
        };

        loops.retain(|_, (_, task)| !task.is_finished());
        for id in children {
            let Ok(service_id) = ServiceId::parse(&id) else {
                warn!(node = %id, "Ignoring malformed service node");
                continue;
            };
            if loops.contains_key(&service_id) {
                continue;
            }
            let (tx, rx) = watch::channel(false);
            let task = tokio::spawn({
                let sync = Arc::clone(&sync);
                let service_id = service_id.clone();
                async move { sync.run(rx, service_id).await }
            });
            loops.insert(service_id, (tx, task));
        }

        tokio::select! {
            _ = watch => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    for (_, (tx, task)) in loops {
        tx.send_replace(true);
        let _ = task.await;
    }
    info!("Service sync supervisor stopped");
}
