//! Host supervisor - registry of instance supervisors on one host.
//!
//! Each instance supervisor runs as its own task with its own shutdown
//! signal, keyed by state ID. A failed instance does not affect its
//! siblings; the listener respawns it if its records still exist.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use cove_coord::state::delete_host_states;
use cove_coord::{Connection, StateRequest};
use cove_id::{HostId, PoolId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::instance::InstanceSupervisor;
use crate::runtime::ContainerRuntime;

/// How long `shutdown` waits for each instance to stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

/// Reference to one running instance supervisor.
struct InstanceRef {
    task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl InstanceRef {
    fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Supervises every instance assigned to one host.
pub struct HostSupervisor<C: Connection + ?Sized> {
    conn: Arc<C>,
    runtime: Arc<dyn ContainerRuntime>,
    pool_id: Option<PoolId>,
    host_id: HostId,
    instances: HashMap<String, InstanceRef>,
}

impl<C: Connection + ?Sized + 'static> HostSupervisor<C> {
    pub fn new(
        conn: Arc<C>,
        runtime: Arc<dyn ContainerRuntime>,
        pool_id: Option<PoolId>,
        host_id: HostId,
    ) -> Self {
        Self {
            conn,
            runtime,
            pool_id,
            host_id,
            instances: HashMap::new(),
        }
    }

    pub fn host_id(&self) -> &HostId {
        &self.host_id
    }

    /// Start supervising an instance. Returns `false` if it already is.
    pub fn spawn(&mut self, req: StateRequest) -> bool {
        let state_id = req.state_id();
        if self.instances.get(&state_id).is_some_and(InstanceRef::is_running) {
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = InstanceSupervisor::new(Arc::clone(&self.conn), Arc::clone(&self.runtime), req);
        let task = tokio::spawn({
            let state_id = state_id.clone();
            async move {
                if let Err(err) = supervisor.run(shutdown_rx).await {
                    error!(state_id = %state_id, error = %err, "Instance supervisor exited with error");
                }
            }
        });

        debug!(state_id = %state_id, "Spawned instance supervisor");
        self.instances.insert(state_id, InstanceRef { task, shutdown_tx });
        true
    }

    /// Signal one instance to stop. Returns `false` if it is unknown.
    pub fn cancel(&self, state_id: &str) -> bool {
        match self.instances.get(state_id) {
            Some(instance) => {
                instance.stop();
                true
            }
            None => false,
        }
    }

    /// Forget instances whose supervisor has exited.
    pub fn reap(&mut self) -> usize {
        let before = self.instances.len();
        self.instances.retain(|_, instance| instance.is_running());
        let reaped = before - self.instances.len();
        if reaped > 0 {
            debug!(reaped, "Reaped instance supervisors");
        }
        reaped
    }

    /// Stop instances whose host record is no longer listed.
    pub fn post_process(&self, listed: &HashSet<String>) {
        for (state_id, instance) in &self.instances {
            if !listed.contains(state_id) && instance.is_running() {
                info!(state_id = %state_id, "Host record removed, stopping instance");
                instance.stop();
            }
        }
    }

    pub fn contains(&self, state_id: &str) -> bool {
        self.instances.contains_key(state_id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Stop every container, then remove whatever records are left.
    pub async fn shutdown(&mut self) {
        info!(host_id = %self.host_id, instances = self.instances.len(), "Stopping all instances");

        for instance in self.instances.values() {
            instance.stop();
        }
        for (state_id, instance) in self.instances.drain() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, instance.task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(state_id = %state_id, error = %err, "Instance task panicked"),
                Err(_) => warn!(state_id = %state_id, "Timed out stopping instance"),
            }
        }

        let removed = delete_host_states(self.conn.as_ref(), self.pool_id.as_ref(), &self.host_id).await;
        if removed > 0 {
            warn!(removed, "Removed leftover instance records");
        }
    }
}

impl<C: Connection + ?Sized> Drop for HostSupervisor<C> {
    // Dropped without `shutdown`: leave containers and records in place for
    // the next agent to attach to.
    fn drop(&mut self) {
        for instance in self.instances.values() {
            instance.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use cove_coord::state::{create_state, get_host_state_ids};
    use cove_coord::{host, MemoryStore};
    use cove_id::ServiceId;

    #[tokio::test]
    async fn test_spawn_cancel_reap() {
        let store = MemoryStore::new();
        let conn = Arc::new(store.connect().await);
        let host_id = HostId::parse("h1").unwrap();
        host::register_host(conn.as_ref(), None, &host_id).await.unwrap();

        let runtime = Arc::new(MockRuntime::new());
        let mut sup = HostSupervisor::new(Arc::clone(&conn), runtime.clone(), None, host_id.clone());

        let req = StateRequest::new(None, host_id.clone(), ServiceId::parse("web").unwrap(), 0);
        create_state(conn.as_ref(), &req).await.unwrap();

        assert!(sup.spawn(req.clone()));
        assert!(!sup.spawn(req.clone()));
        assert!(sup.contains(&req.state_id()));

        assert!(sup.cancel(&req.state_id()));
        assert!(!sup.cancel("h1-other-0"));
        tokio::time::timeout(Duration::from_secs(2), async {
            while sup.reap() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(sup.is_empty());
        assert_eq!(runtime.running(), 0);
        assert!(get_host_state_ids(conn.as_ref(), None, &host_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let store = MemoryStore::new();
        let conn = Arc::new(store.connect().await);
        let host_id = HostId::parse("h1").unwrap();
        host::register_host(conn.as_ref(), None, &host_id).await.unwrap();

        let runtime = Arc::new(MockRuntime::new());
        let mut sup = HostSupervisor::new(Arc::clone(&conn), runtime.clone(), None, host_id.clone());
        for i in 0..3 {
            let req = StateRequest::new(None, host_id.clone(), ServiceId::parse("web").unwrap(), i);
            create_state(conn.as_ref(), &req).await.unwrap();
            sup.spawn(req);
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while runtime.running() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        sup.shutdown().await;
        assert_eq!(sup.len(), 0);
        assert_eq!(runtime.running(), 0);
        assert!(get_host_state_ids(conn.as_ref(), None, &host_id).await.unwrap().is_empty());
    }
}
