//! The coordination store client seam.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::CoordError;
use crate::path;

/// A change observed on a watched node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    Created,
    Deleted,
    DataChanged,
    ChildrenChanged,
    SessionExpired,
}

/// A one-shot subscription to changes on a single node.
///
/// Resolves with the first event after it was set. Dropping a watch
/// unsubscribes only this subscriber; other watchers of the same node are
/// unaffected.
#[derive(Debug)]
pub struct Watch {
    rx: oneshot::Receiver<WatchEvent>,
}

impl Watch {
    /// Creates a watch and the sender the store fires it through.
    pub fn channel() -> (oneshot::Sender<WatchEvent>, Watch) {
        let (tx, rx) = oneshot::channel();
        (tx, Watch { rx })
    }
}

impl Future for Watch {
    type Output = WatchEvent;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the store or session went away.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|event| event.unwrap_or(WatchEvent::SessionExpired))
    }
}

/// Client for a hierarchical, watchable key-value store.
///
/// Paths are absolute (`/a/b`). Creating a node creates any missing
/// parents. Deleting a node that has children fails with
/// [`CoordError::NotEmpty`].
#[async_trait]
pub trait Connection: Send + Sync {
    async fn create(&self, path: &str, data: Vec<u8>) -> Result<(), CoordError>;

    /// Create a node that is removed when this connection's session ends.
    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<(), CoordError>;

    async fn get(&self, path: &str) -> Result<Vec<u8>, CoordError>;

    async fn set(&self, path: &str, data: Vec<u8>) -> Result<(), CoordError>;

    async fn delete(&self, path: &str) -> Result<(), CoordError>;

    async fn exists(&self, path: &str) -> Result<bool, CoordError>;

    /// Child names, sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>, CoordError>;

    /// Read a node and watch it for data changes or deletion.
    async fn get_w(&self, path: &str) -> Result<(Vec<u8>, Watch), CoordError>;

    /// Check a node and watch it for creation, data changes or deletion.
    async fn exists_w(&self, path: &str) -> Result<(bool, Watch), CoordError>;

    /// List a node's children and watch the list.
    async fn children_w(&self, path: &str) -> Result<(Vec<String>, Watch), CoordError>;
}

/// JSON-typed helpers over any [`Connection`].
#[async_trait]
pub trait ConnectionExt: Connection {
    async fn create_json<T>(&self, path: &str, value: &T) -> Result<(), CoordError>
    where
        T: Serialize + Sync,
    {
        let data = serde_json::to_vec(value)?;
        self.create(path, data).await
    }

    async fn get_json<T>(&self, path: &str) -> Result<T, CoordError>
    where
        T: DeserializeOwned,
    {
        let data = self.get(path).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn set_json<T>(&self, path: &str, value: &T) -> Result<(), CoordError>
    where
        T: Serialize + Sync,
    {
        let data = serde_json::to_vec(value)?;
        self.set(path, data).await
    }

    async fn get_json_w<T>(&self, path: &str) -> Result<(T, Watch), CoordError>
    where
        T: DeserializeOwned,
    {
        let (data, watch) = self.get_w(path).await?;
        Ok((serde_json::from_slice(&data)?, watch))
    }
}

impl<C: Connection + ?Sized> ConnectionExt for C {}

/// Delete a node and everything below it. Missing nodes are ignored.
pub async fn delete_recursive<C>(conn: &C, root: &str) -> Result<(), CoordError>
where
    C: Connection + ?Sized,
{
    let mut stack = vec![root.to_string()];
    let mut order = Vec::new();
    while let Some(node) = stack.pop() {
        match conn.children(&node).await {
            Ok(children) => stack.extend(children.iter().map(|c| path::join(&node, c))),
            Err(CoordError::NoNode(_)) => continue,
            Err(err) => return Err(err),
        }
        order.push(node);
    }

    // Parents precede their children in `order`.
    for node in order.into_iter().rev() {
        match conn.delete(&node).await {
            Ok(()) | Err(CoordError::NoNode(_)) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
