//! Instance supervisor - drives one container from its instance records.
//!
//! ## State Machine
//!
//! ```text
//! unattached -> running <-> paused
//!                  |
//!                  +-> exited -> running     (implicit restart, unless paused)
//!                  |
//!                  +-> terminated            (stop, shutdown, records gone)
//! ```
//!
//! The supervisor reads the service-indexed record for the desired state
//! and writes back what the container is actually doing. Store failures end
//! the supervisor after the container is stopped; sibling instances are not
//! affected.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cove_coord::state::{self, ServiceRecord};
use cove_coord::{Connection, CoordError, StateRequest};
use cove_model::{DesiredState, InstanceStatus};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::error::AgentError;
use crate::runtime::{ContainerInfo, ContainerRuntime, ExitWatch};

/// How long to wait for a stopped container to report its exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// What woke the supervisor.
enum Event {
    RecordChanged,
    Exited,
    Shutdown,
}

/// Supervises the container of one `(host, service, instance)`.
pub struct InstanceSupervisor<C: Connection + ?Sized> {
    conn: Arc<C>,
    runtime: Arc<dyn ContainerRuntime>,
    req: StateRequest,
    container: Option<(String, ExitWatch)>,
}

impl<C: Connection + ?Sized> InstanceSupervisor<C> {
    pub fn new(conn: Arc<C>, runtime: Arc<dyn ContainerRuntime>, req: StateRequest) -> Self {
        Self {
            conn,
            runtime,
            req,
            container: None,
        }
    }

    /// Run until the instance is stopped, its records vanish or `shutdown`
    /// is raised. The records are deleted on the way out unless a store
    /// failure ended the run.
    #[instrument(skip(self, shutdown), fields(state_id = %self.req))]
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        let result = self.supervise(shutdown).await;
        if let Err(err) = &result {
            error!(error = %err, "Instance supervisor failed, stopping container");
            self.stop_container().await;
        }
        result
    }

    async fn supervise(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        let conn = Arc::clone(&self.conn);
        let conn = conn.as_ref();

        if !state::is_valid_state(conn, &self.req).await? {
            info!("Instance state is incomplete, removing it");
            state::delete_state(conn, &self.req).await?;
            return Ok(());
        }

        if let Some((info, exit)) = self.runtime.attach_container(&self.req).await? {
            info!(container_id = %info.container_id, "Attached to running container");
            self.record_started(&info, false).await?;
            self.container = Some((info.container_id, exit));
        }

        loop {
            let Some((record, record_watch, host_watch)) = self.load().await? else {
                info!("Instance state removed, stopping");
                self.stop_container().await;
                state::delete_state(conn, &self.req).await?;
                return Ok(());
            };

            if *shutdown.borrow() {
                return self.terminate().await;
            }

            match record.desired_state {
                DesiredState::Stop => return self.terminate().await,
                // A paused instance whose container went away stays down
                // until it is resumed.
                DesiredState::Pause if self.container.is_none() => {}
                _ if self.container.is_none() => self.start().await?,
                DesiredState::Run if record.paused => self.resume().await?,
                DesiredState::Pause if !record.paused => self.pause().await?,
                DesiredState::Restart => self.restart(&record).await?,
                DesiredState::Run | DesiredState::Pause => {}
            }

            let event = {
                let exit = async {
                    match self.container.as_mut() {
                        Some((_, exit)) => {
                            let _ = exit.await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                };

                debug!("Waiting for event");
                tokio::select! {
                    _ = record_watch => Event::RecordChanged,
                    _ = host_watch => Event::RecordChanged,
                    _ = exit => Event::Exited,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            Event::Shutdown
                        } else {
                            Event::RecordChanged
                        }
                    }
                }
            };

            match event {
                Event::RecordChanged => {}
                Event::Shutdown => return self.terminate().await,
                Event::Exited => {
                    let container_id = self.container.take().map(|(id, _)| id).unwrap_or_default();
                    warn!(container_id = %container_id, "Container exited");
                    self.record_exited().await?;
                    // The next pass starts a new container if the
                    // instance should still be running.
                }
            }
        }
    }

    /// Read the service record with a data watch plus an existence watch
    /// on the host record. `None` when either record is gone.
    async fn load(
        &self,
    ) -> Result<Option<(ServiceRecord, cove_coord::Watch, cove_coord::Watch)>, AgentError> {
        let conn = self.conn.as_ref();
        let (host_exists, host_watch) = conn.exists_w(&self.req.host_record_path()).await?;
        if !host_exists {
            return Ok(None);
        }
        let (data, record_watch) = match conn.get_w(&self.req.service_record_path()).await {
            Ok(loaded) => loaded,
            Err(CoordError::NoNode(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let record: ServiceRecord = serde_json::from_slice(&data)?;
        Ok(Some((record, record_watch, host_watch)))
    }

    /// Start a new container. A pending restart request is served by the
    /// start itself.
    async fn start(&mut self) -> Result<(), AgentError> {
        let (info, exit) = self.runtime.start_container(&self.req).await?;
        info!(container_id = %info.container_id, "Started container");
        self.container = Some((info.container_id.clone(), exit));
        self.record_started(&info, true).await
    }

    async fn pause(&mut self) -> Result<(), AgentError> {
        let Some((container_id, _)) = &self.container else {
            return Ok(());
        };
        self.runtime.pause_container(container_id).await?;
        info!(container_id = %container_id, "Paused container");
        state::update_state(self.conn.as_ref(), &self.req, |s| {
            s.service.paused = true;
            s.service.status = InstanceStatus::Paused;
            true
        })
        .await?;
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), AgentError> {
        let Some((container_id, _)) = &self.container else {
            return Ok(());
        };
        self.runtime.resume_container(container_id).await?;
        info!(container_id = %container_id, "Resumed container");
        state::update_state(self.conn.as_ref(), &self.req, |s| {
            s.service.paused = false;
            s.service.status = InstanceStatus::Running;
            true
        })
        .await?;
        Ok(())
    }

    /// Restart the container once per request. The exit that follows
    /// starts the replacement.
    async fn restart(&mut self, record: &ServiceRecord) -> Result<(), AgentError> {
        let Some((container_id, _)) = &self.container else {
            return Ok(());
        };
        let already_restarting = record.restart_pending();
        if !already_restarting {
            self.runtime.restart_container(container_id).await?;
            info!(container_id = %container_id, "Restarting container");
        }
        state::update_state(self.conn.as_ref(), &self.req, |s| {
            if !already_restarting {
                s.service.restarted = Some(Utc::now());
                s.service.status = InstanceStatus::Restarting;
            }
            s.service.desired_state = DesiredState::Run;
            true
        })
        .await?;
        Ok(())
    }

    async fn record_started(&self, info: &ContainerInfo, fresh: bool) -> Result<(), AgentError> {
        state::update_state(self.conn.as_ref(), &self.req, |s| {
            if fresh && s.service.desired_state == DesiredState::Restart {
                s.service.desired_state = DesiredState::Run;
                s.service.restarted = Some(info.started);
            }
            s.service.container_id = Some(info.container_id.clone());
            s.service.image_id = Some(info.image_id.clone());
            s.service.started = Some(info.started);
            s.service.status = InstanceStatus::Running;
            s.service.paused = false;
            true
        })
        .await?;
        Ok(())
    }

    async fn record_exited(&self) -> Result<(), AgentError> {
        match state::update_state(self.conn.as_ref(), &self.req, |s| {
            s.service.terminated = Some(Utc::now());
            s.service.status = InstanceStatus::Stopped;
            s.service.container_id = None;
            true
        })
        .await
        {
            Ok(()) => Ok(()),
            // Records removed while the container was going down; the next
            // load notices.
            Err(err) if err.as_state().is_some() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Stop the container and remove the records.
    async fn terminate(&mut self) -> Result<(), AgentError> {
        if let Some((container_id, _)) = &self.container {
            info!(container_id = %container_id, "Stopping instance");
        }
        self.stop_container().await;
        state::delete_state(self.conn.as_ref(), &self.req).await?;
        info!("Instance terminated");
        Ok(())
    }

    async fn stop_container(&mut self) {
        let Some((container_id, exit)) = self.container.take() else {
            return;
        };
        if let Err(err) = self.runtime.stop_container(&container_id).await {
            warn!(container_id = %container_id, error = %err, "Could not stop container");
            return;
        }
        if tokio::time::timeout(STOP_TIMEOUT, exit).await.is_err() {
            warn!(container_id = %container_id, "Container did not report its exit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cove_coord::state::{create_state, get_state, pause_instance, stop_instance};
    use cove_coord::{host, MemoryConnection, MemoryStore};
    use cove_id::{HostId, ServiceId};
    use crate::runtime::MockRuntime;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    struct Harness {
        conn: Arc<MemoryConnection>,
        runtime: Arc<MockRuntime>,
        req: StateRequest,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<Result<(), AgentError>>,
    }

    async fn harness(runtime: MockRuntime, adopt: bool) -> Harness {
        let store = MemoryStore::new();
        let conn = Arc::new(store.connect().await);
        let host_id = HostId::parse("h1").unwrap();
        host::register_host(conn.as_ref(), None, &host_id).await.unwrap();

        let req = StateRequest::new(None, host_id, ServiceId::parse("web").unwrap(), 0);
        create_state(conn.as_ref(), &req).await.unwrap();

        let runtime = Arc::new(runtime);
        if adopt {
            runtime.adopt(&req);
        }
        let (shutdown, rx) = watch::channel(false);
        let supervisor = InstanceSupervisor::new(
            Arc::clone(&conn),
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            req.clone(),
        );
        let task = tokio::spawn(supervisor.run(rx));
        Harness {
            conn,
            runtime,
            req,
            shutdown,
            task,
        }
    }

    async fn eventually<F>(mut check: F)
    where
        F: FnMut() -> bool,
    {
        timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn record(h: &Harness) -> Option<ServiceRecord> {
        get_state(h.conn.as_ref(), &h.req).await.ok().map(|s| s.service)
    }

    async fn wait_record<F>(h: &Harness, check: F) -> ServiceRecord
    where
        F: Fn(&ServiceRecord) -> bool,
    {
        timeout(Duration::from_secs(2), async {
            loop {
                if let Some(r) = record(h).await {
                    if check(&r) {
                        return r;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("record condition not reached")
    }

    #[tokio::test]
    async fn test_starts_and_stops() {
        let mut h = harness(MockRuntime::new(), false).await;
        let r = wait_record(&h, |r| r.status.is_running()).await;
        assert!(r.container_id.is_some());
        assert_eq!(h.runtime.running(), 1);

        stop_instance(h.conn.as_ref(), &h.req).await.unwrap();
        timeout(Duration::from_secs(2), &mut h.task).await.unwrap().unwrap().unwrap();
        assert_eq!(h.runtime.running(), 0);
        assert!(!state::is_valid_state(h.conn.as_ref(), &h.req).await.unwrap());
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let h = harness(MockRuntime::new(), false).await;
        let r = wait_record(&h, |r| r.status.is_running()).await;
        let container_id = r.container_id.unwrap();

        pause_instance(h.conn.as_ref(), &h.req).await.unwrap();
        wait_record(&h, |r| r.paused).await;
        assert_eq!(h.runtime.is_paused(&container_id), Some(true));

        state::resume_instance(h.conn.as_ref(), &h.req).await.unwrap();
        wait_record(&h, |r| !r.paused).await;
        assert_eq!(h.runtime.is_paused(&container_id), Some(false));
    }

    #[tokio::test]
    async fn test_paused_crash_stays_down_until_resumed() {
        let h = harness(MockRuntime::new(), false).await;
        let first = wait_record(&h, |r| r.status.is_running()).await.container_id.unwrap();
        pause_instance(h.conn.as_ref(), &h.req).await.unwrap();
        wait_record(&h, |r| r.paused).await;

        assert!(h.runtime.crash(&first));
        let r = wait_record(&h, |r| r.terminated.is_some()).await;
        assert_eq!(r.status, InstanceStatus::Stopped);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.runtime.running(), 0);
        assert!(record(&h).await.unwrap().container_id.is_none());

        state::resume_instance(h.conn.as_ref(), &h.req).await.unwrap();
        let r = wait_record(&h, |r| r.status.is_running()).await;
        assert!(!r.paused);
        assert_ne!(r.container_id.unwrap(), first);
        assert_eq!(h.runtime.running(), 1);
    }

    #[tokio::test]
    async fn test_crash_starts_new_container() {
        let h = harness(MockRuntime::new(), false).await;
        let first = wait_record(&h, |r| r.status.is_running()).await.container_id.unwrap();

        assert!(h.runtime.crash(&first));
        let r = wait_record(&h, |r| {
            r.terminated.is_some() && r.status.is_running() && r.container_id.as_deref() != Some(first.as_str())
        })
        .await;
        assert_ne!(r.container_id.unwrap(), first);
        assert_eq!(h.runtime.running(), 1);
    }

    #[tokio::test]
    async fn test_restart_replaces_container() {
        let h = harness(MockRuntime::new(), false).await;
        let first = wait_record(&h, |r| r.status.is_running()).await.container_id.unwrap();

        state::restart_instance(h.conn.as_ref(), &h.req).await.unwrap();
        let r = wait_record(&h, |r| {
            r.is_running_fresh() && r.container_id.as_deref() != Some(first.as_str())
        })
        .await;
        assert_eq!(r.desired_state, DesiredState::Run);
        assert!(r.restarted.is_some());
    }

    #[tokio::test]
    async fn test_attaches_to_existing_container() {
        let h = harness(MockRuntime::new(), true).await;
        let adopted = h.runtime.containers_for(&h.req);
        let r = wait_record(&h, |r| r.status.is_running()).await;
        assert_eq!(vec![r.container_id.unwrap()], adopted);
        assert_eq!(h.runtime.running(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_removes_records() {
        let mut h = harness(MockRuntime::new(), false).await;
        wait_record(&h, |r| r.status.is_running()).await;

        h.shutdown.send_replace(true);
        timeout(Duration::from_secs(2), &mut h.task).await.unwrap().unwrap().unwrap();
        assert_eq!(h.runtime.running(), 0);
        assert!(record(&h).await.is_none());
    }

    #[tokio::test]
    async fn test_orphan_record_is_removed() {
        let store = MemoryStore::new();
        let conn = Arc::new(store.connect().await);
        let req = StateRequest::new(None, HostId::parse("h1").unwrap(), ServiceId::parse("web").unwrap(), 3);
        create_state(conn.as_ref(), &req).await.unwrap();
        conn.delete(&req.host_record_path()).await.unwrap();

        let runtime = Arc::new(MockRuntime::new());
        let (_tx, rx) = watch::channel(false);
        InstanceSupervisor::new(Arc::clone(&conn), runtime.clone() as Arc<dyn ContainerRuntime>, req.clone())
            .run(rx)
            .await
            .unwrap();

        assert!(!conn.exists(&req.service_record_path()).await.unwrap());
        assert_eq!(runtime.running(), 0);
    }

    #[tokio::test]
    async fn test_start_failure_ends_supervisor() {
        let mut h = harness(MockRuntime::failing(), false).await;
        let result = timeout(Duration::from_secs(2), &mut h.task).await.unwrap().unwrap();
        assert!(matches!(result, Err(AgentError::Runtime(_))));
        eventually(|| h.runtime.running() == 0).await;
    }
}
