//! Container runtime interface and mock implementation.
//!
//! The runtime interface abstracts container lifecycle operations on one
//! host. Exits are reported through an [`ExitWatch`] handed out when a
//! container is started or attached.
//!
//! A mock implementation is provided for testing and development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cove_coord::StateRequest;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Fires once with the exit time when the container stops for any reason.
pub type ExitWatch = oneshot::Receiver<DateTime<Utc>>;

/// A container backing one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub container_id: String,
    pub image_id: String,
    pub started: DateTime<Utc>,
}

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Find a live container for this instance left over from an earlier
    /// agent process.
    async fn attach_container(&self, req: &StateRequest) -> Result<Option<(ContainerInfo, ExitWatch)>>;

    /// Start a new container for this instance.
    async fn start_container(&self, req: &StateRequest) -> Result<(ContainerInfo, ExitWatch)>;

    /// Restart a running container. Its exit watch fires.
    async fn restart_container(&self, container_id: &str) -> Result<()>;

    /// Stop a container. Its exit watch fires.
    async fn stop_container(&self, container_id: &str) -> Result<()>;

    async fn pause_container(&self, container_id: &str) -> Result<()>;

    async fn resume_container(&self, container_id: &str) -> Result<()>;
}

#[derive(Debug)]
struct MockContainer {
    state_id: String,
    paused: bool,
    exit_tx: Option<oneshot::Sender<DateTime<Utc>>>,
}

impl MockContainer {
    fn exit(&mut self) {
        if let Some(tx) = self.exit_tx.take() {
            let _ = tx.send(Utc::now());
        }
    }
}

/// Mock runtime for testing and development.
pub struct MockRuntime {
    /// Counter for generating container IDs.
    counter: AtomicU64,

    /// Whether containers should "fail" to start.
    fail_starts: bool,

    containers: Mutex<HashMap<String, MockContainer>>,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            fail_starts: false,
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Create a mock runtime that fails all starts.
    pub fn failing() -> Self {
        Self {
            fail_starts: true,
            ..Self::new()
        }
    }

    fn next_container_id(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("ctr_{:016x}", counter)
    }

    fn containers(&self) -> std::sync::MutexGuard<'_, HashMap<String, MockContainer>> {
        // A poisoned map is still consistent: every mutation is a single
        // insert, remove or flag flip.
        self.containers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a live container as if an earlier agent had started it.
    pub fn adopt(&self, req: &StateRequest) -> String {
        let container_id = self.next_container_id();
        let (tx, _rx) = oneshot::channel();
        self.containers().insert(
            container_id.clone(),
            MockContainer {
                state_id: req.state_id(),
                paused: false,
                exit_tx: Some(tx),
            },
        );
        container_id
    }

    /// Kill a container without going through the agent.
    pub fn crash(&self, container_id: &str) -> bool {
        match self.containers().remove(container_id) {
            Some(mut container) => {
                info!(container_id, "[MOCK] Container crashed");
                container.exit();
                true
            }
            None => false,
        }
    }

    /// IDs of the live containers of one instance.
    pub fn containers_for(&self, req: &StateRequest) -> Vec<String> {
        let state_id = req.state_id();
        let mut ids: Vec<String> = self
            .containers()
            .iter()
            .filter(|(_, c)| c.state_id == state_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_paused(&self, container_id: &str) -> Option<bool> {
        self.containers().get(container_id).map(|c| c.paused)
    }

    /// Number of live containers.
    pub fn running(&self) -> usize {
        self.containers().len()
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn attach_container(&self, req: &StateRequest) -> Result<Option<(ContainerInfo, ExitWatch)>> {
        let state_id = req.state_id();
        let mut containers = self.containers();
        let Some((id, container)) = containers.iter_mut().find(|(_, c)| c.state_id == state_id) else {
            return Ok(None);
        };

        // Re-arm the exit notification for the new owner.
        let (tx, rx) = oneshot::channel();
        container.exit_tx = Some(tx);
        debug!(state_id = %state_id, container_id = %id, "[MOCK] Attached to container");

        Ok(Some((
            ContainerInfo {
                container_id: id.clone(),
                image_id: "mock".to_string(),
                started: Utc::now(),
            },
            rx,
        )))
    }

    async fn start_container(&self, req: &StateRequest) -> Result<(ContainerInfo, ExitWatch)> {
        if self.fail_starts {
            bail!("Mock runtime configured to fail");
        }

        // Simulate some startup delay
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let container_id = self.next_container_id();
        let (tx, rx) = oneshot::channel();
        self.containers().insert(
            container_id.clone(),
            MockContainer {
                state_id: req.state_id(),
                paused: false,
                exit_tx: Some(tx),
            },
        );
        info!(state_id = %req, container_id = %container_id, "[MOCK] Started container");

        Ok((
            ContainerInfo {
                container_id,
                image_id: "mock".to_string(),
                started: Utc::now(),
            },
            rx,
        ))
    }

    async fn restart_container(&self, container_id: &str) -> Result<()> {
        // The instance supervisor starts the replacement when it sees the exit.
        match self.containers().remove(container_id) {
            Some(mut container) => {
                info!(container_id, "[MOCK] Restarting container");
                container.exit();
                Ok(())
            }
            None => bail!("no such container: {container_id}"),
        }
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        if let Some(mut container) = self.containers().remove(container_id) {
            info!(container_id, "[MOCK] Stopping container");
            container.exit();
        }
        Ok(())
    }

    async fn pause_container(&self, container_id: &str) -> Result<()> {
        match self.containers().get_mut(container_id) {
            Some(container) => {
                container.paused = true;
                Ok(())
            }
            None => bail!("no such container: {container_id}"),
        }
    }

    async fn resume_container(&self, container_id: &str) -> Result<()> {
        match self.containers().get_mut(container_id) {
            Some(container) => {
                container.paused = false;
                Ok(())
            }
            None => bail!("no such container: {container_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cove_id::{HostId, ServiceId};
    use rstest::rstest;

    fn req() -> StateRequest {
        StateRequest::new(None, HostId::parse("h1").unwrap(), ServiceId::parse("web").unwrap(), 0)
    }

    #[tokio::test]
    async fn test_mock_runtime_start_and_stop() {
        let runtime = MockRuntime::new();

        let (info, exit) = runtime.start_container(&req()).await.unwrap();
        assert!(info.container_id.starts_with("ctr_"));
        assert_eq!(runtime.containers_for(&req()), vec![info.container_id.clone()]);

        runtime.stop_container(&info.container_id).await.unwrap();
        assert!(exit.await.is_ok());
        assert_eq!(runtime.running(), 0);
    }

    #[tokio::test]
    async fn test_mock_runtime_pause_resume() {
        let runtime = MockRuntime::new();
        let (info, _exit) = runtime.start_container(&req()).await.unwrap();

        runtime.pause_container(&info.container_id).await.unwrap();
        assert_eq!(runtime.is_paused(&info.container_id), Some(true));
        runtime.resume_container(&info.container_id).await.unwrap();
        assert_eq!(runtime.is_paused(&info.container_id), Some(false));
    }

    #[tokio::test]
    async fn test_mock_runtime_attach() {
        let runtime = MockRuntime::new();
        assert!(runtime.attach_container(&req()).await.unwrap().is_none());

        let id = runtime.adopt(&req());
        let (info, exit) = runtime.attach_container(&req()).await.unwrap().unwrap();
        assert_eq!(info.container_id, id);

        assert!(runtime.crash(&id));
        assert!(exit.await.is_ok());
    }

    #[rstest]
    #[case::pause("pause")]
    #[case::resume("resume")]
    #[case::restart("restart")]
    #[tokio::test]
    async fn test_mock_runtime_unknown_container(#[case] op: &str) {
        let runtime = MockRuntime::new();
        let result = match op {
            "pause" => runtime.pause_container("ctr_missing").await,
            "resume" => runtime.resume_container("ctr_missing").await,
            _ => runtime.restart_container("ctr_missing").await,
        };
        assert!(result.is_err());
        // Stopping an unknown container is not an error.
        assert!(runtime.stop_container("ctr_missing").await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_runtime_failing() {
        let runtime = MockRuntime::failing();
        assert!(runtime.start_container(&req()).await.is_err());
    }
}
