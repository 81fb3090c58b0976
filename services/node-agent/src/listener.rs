//! Host listener - spawns instance supervisors for the records assigned to
//! this host.

use std::collections::HashSet;
use std::sync::Arc;

use cove_coord::state::clean_host_states;
use cove_coord::{host, path, Connection, CoordError, StateRequest};
use cove_id::{HostId, PoolId};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::error::AgentError;
use crate::runtime::ContainerRuntime;
use crate::supervisor::HostSupervisor;

/// Watches `{base}/hosts/{host}/instances` for one host.
pub struct HostListener<C: Connection + ?Sized> {
    conn: Arc<C>,
    runtime: Arc<dyn ContainerRuntime>,
    pool_id: Option<PoolId>,
    host_id: HostId,
}

impl<C: Connection + ?Sized + 'static> HostListener<C> {
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
        }
    }

    /// Register the host and supervise its instances until `shutdown` is
    /// raised. Every instance is stopped and its records removed on return.
    #[instrument(skip(self, shutdown), fields(host_id = %self.host_id))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        let conn = self.conn.as_ref();
        let pool = self.pool_id.as_ref();
        let instances_path = path::host_instances(pool, &self.host_id);

        host::register_host(conn, pool, &self.host_id).await?;
        clean_host_states(conn, pool, &self.host_id).await?;

        let mut supervisor = HostSupervisor::new(
            Arc::clone(&self.conn),
            Arc::clone(&self.runtime),
            self.pool_id.clone(),
            self.host_id.clone(),
        );
        info!("Host listener started");

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            let (children, watch) = match conn.children_w(&instances_path).await {
                Ok(listing) => listing,
                Err(CoordError::NoNode(_)) => match conn.exists_w(&instances_path).await {
                    Ok((true, _)) => continue,
                    Ok((false, watch)) => (Vec::new(), watch),
                    Err(err) => break Err(err.into()),
                },
                Err(err) => break Err(err.into()),
            };

            supervisor.reap();
            let listed: HashSet<String> = children.iter().cloned().collect();
            for state_id in &children {
                match StateRequest::from_state_id(pool, state_id) {
                    Ok(req) if req.host_id == self.host_id => {
                        supervisor.spawn(req);
                    }
                    Ok(_) => warn!(state_id = %state_id, "Ignoring instance assigned to another host"),
                    Err(err) => warn!(state_id = %state_id, error = %err, "Ignoring malformed instance"),
                }
            }
            supervisor.post_process(&listed);
            debug!(instances = supervisor.len(), "Waiting for instance changes");

            tokio::select! {
                _ = watch => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
            }
        };

        supervisor.shutdown().await;
        info!("Host listener stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use cove_coord::state::{create_state, get_state, stop_instance};
    use cove_coord::MemoryStore;
    use cove_id::ServiceId;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_listener_runs_assigned_instances() {
        let store = MemoryStore::new();
        let conn = Arc::new(store.connect().await);
        let host_id = HostId::parse("h1").unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let listener = Arc::new(HostListener::new(Arc::clone(&conn), runtime.clone(), None, host_id.clone()));

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn({
            let listener = Arc::clone(&listener);
            async move { listener.run(rx).await }
        });

        let req = StateRequest::new(None, host_id.clone(), ServiceId::parse("web").unwrap(), 0);
        create_state(conn.as_ref(), &req).await.unwrap();

        timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(state) = get_state(conn.as_ref(), &req).await {
                    if state.service.status.is_running() {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(host::is_host_active(conn.as_ref(), None, &host_id).await.unwrap());

        stop_instance(conn.as_ref(), &req).await.unwrap();
        timeout(Duration::from_secs(2), async {
            while runtime.running() > 0 || conn.exists(&req.host_record_path()).await.unwrap() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send_replace(true);
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_listener_shutdown_clears_host() {
        let store = MemoryStore::new();
        let conn = Arc::new(store.connect().await);
        let host_id = HostId::parse("h1").unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let listener = HostListener::new(Arc::clone(&conn), runtime.clone(), None, host_id.clone());

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { listener.run(rx).await });

        for i in 0..2 {
            let req = StateRequest::new(None, host_id.clone(), ServiceId::parse("web").unwrap(), i);
            create_state(conn.as_ref(), &req).await.unwrap();
        }
        timeout(Duration::from_secs(2), async {
            while runtime.running() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send_replace(true);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
        assert_eq!(runtime.running(), 0);
        assert!(cove_coord::state::get_host_state_ids(conn.as_ref(), None, &host_id)
            .await
            .unwrap()
            .is_empty());
    }
}
