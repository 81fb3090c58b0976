#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cove_control_plane::sync::{run_service_sync, RoundRobinSelector, ServiceSyncLoop};
use cove_coord::state::{get_service_states, State};
use cove_coord::{MemoryConnection, MemoryStore};
use cove_id::{HostId, ServiceId};
use cove_node_agent::{HostListener, MockRuntime};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct Host {
    pub id: HostId,
    pub conn: MemoryConnection,
    pub runtime: Arc<MockRuntime>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Host {
    /// Stop the agent without cleaning up, as if the host lost power.
    pub async fn crash(self) {
        self.conn.close().await;
        self.task.abort();
        let _ = self.task.await;
    }

    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
        self.conn.close().await;
    }
}

/// An in-process cluster: one store, a control-plane session with the sync
/// supervisor running, and any number of hosts.
pub struct Cluster {
    pub store: MemoryStore,
    pub conn: Arc<MemoryConnection>,
    sync_shutdown: watch::Sender<bool>,
    sync_task: JoinHandle<()>,
}

impl Cluster {
    pub async fn new() -> Self {
        let store = MemoryStore::new();
        let conn = Arc::new(store.connect().await);

        let selector = Arc::new(RoundRobinSelector::new(Arc::clone(&conn), None));
        let sync = Arc::new(ServiceSyncLoop::new(
            Arc::clone(&conn),
            None,
            selector,
            Duration::from_millis(20),
        ));
        let (sync_shutdown, rx) = watch::channel(false);
        let sync_task = tokio::spawn(run_service_sync(sync, rx));

        Self {
            store,
            conn,
            sync_shutdown,
            sync_task,
        }
    }

    pub async fn add_host(&self, name: &str) -> Host {
        let id = HostId::parse(name).unwrap();
        let conn = self.store.connect().await;
        let runtime = Arc::new(MockRuntime::new());
        let listener = HostListener::new(Arc::new(conn.clone()), runtime.clone(), None, id.clone());
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let _ = listener.run(rx).await;
        });

        // Registration is the first thing the listener does.
        eventually(|| async {
            cove_coord::host::is_host_active(self.conn.as_ref(), None, &id)
                .await
                .unwrap_or(false)
        })
        .await;

        Host {
            id,
            conn,
            runtime,
            shutdown,
            task,
        }
    }

    pub async fn states(&self, service_id: &ServiceId) -> Vec<State> {
        let mut states = get_service_states(self.conn.as_ref(), None, service_id)
            .await
            .unwrap_or_default();
        states.sort_by_key(|s| s.request.instance_id);
        states
    }

    pub async fn running(&self, service_id: &ServiceId) -> usize {
        self.states(service_id)
            .await
            .iter()
            .filter(|s| s.service.is_running_fresh())
            .count()
    }

    pub async fn shutdown(self) {
        self.sync_shutdown.send_replace(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.sync_task).await;
    }
}

/// Poll until `check` holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
