//! In-process coordination store.
//!
//! Used by tests and the single-process development binaries. Sessions are
//! modelled explicitly so ephemeral nodes vanish when a connection closes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::client::{Connection, Watch, WatchEvent};
use crate::error::CoordError;
use crate::path;

type Watchers = Vec<oneshot::Sender<WatchEvent>>;

#[derive(Default)]
struct Node {
    data: Vec<u8>,
    owner: Option<u64>,
    data_watchers: Watchers,
    child_watchers: Watchers,
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    /// Existence watches on nodes that do not exist yet.
    creation_watchers: HashMap<String, Watchers>,
    sessions: HashSet<u64>,
    next_session: u64,
}

impl Default for Tree {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::default());
        Self {
            nodes,
            creation_watchers: HashMap::new(),
            sessions: HashSet::new(),
            next_session: 1,
        }
    }
}

fn fire(watchers: &mut Watchers, event: WatchEvent) {
    for tx in watchers.drain(..) {
        let _ = tx.send(event);
    }
}

fn check_path(p: &str) -> Result<(), CoordError> {
    if path::is_valid(p) {
        Ok(())
    } else {
        Err(CoordError::InvalidPath(p.to_string()))
    }
}

impl Tree {
    fn children_of(&self, parent: &str) -> Vec<String> {
        let prefix = if parent == "/" {
            "/".to_string()
        } else {
            format!("{parent}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn notify_parent(&mut self, p: &str) {
        if let Some(parent) = path::parent(p) {
            if let Some(node) = self.nodes.get_mut(parent) {
                fire(&mut node.child_watchers, WatchEvent::ChildrenChanged);
            }
        }
    }

    fn insert(&mut self, p: &str, data: Vec<u8>, owner: Option<u64>) {
        self.nodes.insert(
            p.to_string(),
            Node {
                data,
                owner,
                ..Node::default()
            },
        );
        if let Some(mut watchers) = self.creation_watchers.remove(p) {
            fire(&mut watchers, WatchEvent::Created);
        }
        self.notify_parent(p);
    }

    fn create(&mut self, p: &str, data: Vec<u8>, owner: Option<u64>) -> Result<(), CoordError> {
        check_path(p)?;
        if self.nodes.contains_key(p) {
            return Err(CoordError::NodeExists(p.to_string()));
        }

        let mut missing = Vec::new();
        let mut cursor = path::parent(p);
        while let Some(parent) = cursor {
            if self.nodes.contains_key(parent) {
                break;
            }
            missing.push(parent.to_string());
            cursor = path::parent(parent);
        }
        for parent in missing.iter().rev() {
            self.insert(parent, Vec::new(), None);
        }

        self.insert(p, data, owner);
        Ok(())
    }

    fn delete(&mut self, p: &str) -> Result<(), CoordError> {
        check_path(p)?;
        if p == "/" {
            return Err(CoordError::InvalidPath(p.to_string()));
        }
        if !self.nodes.contains_key(p) {
            return Err(CoordError::NoNode(p.to_string()));
        }
        if !self.children_of(p).is_empty() {
            return Err(CoordError::NotEmpty(p.to_string()));
        }
        if let Some(mut node) = self.nodes.remove(p) {
            fire(&mut node.data_watchers, WatchEvent::Deleted);
            fire(&mut node.child_watchers, WatchEvent::Deleted);
        }
        self.notify_parent(p);
        Ok(())
    }

    fn node(&self, p: &str) -> Result<&Node, CoordError> {
        check_path(p)?;
        self.nodes
            .get(p)
            .ok_or_else(|| CoordError::NoNode(p.to_string()))
    }

    fn node_mut(&mut self, p: &str) -> Result<&mut Node, CoordError> {
        check_path(p)?;
        self.nodes
            .get_mut(p)
            .ok_or_else(|| CoordError::NoNode(p.to_string()))
    }
}

/// A process-local coordination store.
///
/// Cloning yields another handle to the same tree.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection bound to a fresh session.
    pub async fn connect(&self) -> MemoryConnection {
        let mut tree = self.tree.lock().await;
        let session = tree.next_session;
        tree.next_session += 1;
        tree.sessions.insert(session);
        MemoryConnection {
            tree: Arc::clone(&self.tree),
            session,
        }
    }

    /// Paths of every node in the store, sorted.
    pub async fn dump(&self) -> Vec<String> {
        self.tree.lock().await.nodes.keys().cloned().collect()
    }
}

/// A session-bound handle to a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryConnection {
    tree: Arc<Mutex<Tree>>,
    session: u64,
}

impl MemoryConnection {
    pub fn session(&self) -> u64 {
        self.session
    }

    /// End the session and remove the ephemeral nodes it owns.
    ///
    /// Other clones of this connection fail with
    /// [`CoordError::SessionExpired`] afterwards.
    pub async fn close(&self) {
        let mut tree = self.tree.lock().await;
        if !tree.sessions.remove(&self.session) {
            return;
        }
        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(self.session))
            .map(|(p, _)| p.clone())
            .collect();
        for p in owned.iter().rev() {
            if let Err(err) = tree.delete(p) {
                debug!(path = %p, error = %err, "Could not remove ephemeral node");
            }
        }
        debug!(session = self.session, removed = owned.len(), "Session closed");
    }

    async fn lock(&self) -> Result<tokio::sync::MutexGuard<'_, Tree>, CoordError> {
        let tree = self.tree.lock().await;
        if tree.sessions.contains(&self.session) {
            Ok(tree)
        } else {
            Err(CoordError::SessionExpired)
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create(&self, path: &str, data: Vec<u8>) -> Result<(), CoordError> {
        self.lock().await?.create(path, data, None)
    }

    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<(), CoordError> {
        self.lock().await?.create(path, data, Some(self.session))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, CoordError> {
        Ok(self.lock().await?.node(path)?.data.clone())
    }

    async fn set(&self, path: &str, data: Vec<u8>) -> Result<(), CoordError> {
        let mut tree = self.lock().await?;
        let node = tree.node_mut(path)?;
        node.data = data;
        fire(&mut node.data_watchers, WatchEvent::DataChanged);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), CoordError> {
        self.lock().await?.delete(path)
    }

    async fn exists(&self, path: &str) -> Result<bool, CoordError> {
        let tree = self.lock().await?;
        check_path(path)?;
        Ok(tree.nodes.contains_key(path))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordError> {
        let tree = self.lock().await?;
        tree.node(path)?;
        Ok(tree.children_of(path))
    }

    async fn get_w(&self, path: &str) -> Result<(Vec<u8>, Watch), CoordError> {
        let mut tree = self.lock().await?;
        let node = tree.node_mut(path)?;
        let (tx, watch) = Watch::channel();
        node.data_watchers.push(tx);
        Ok((node.data.clone(), watch))
    }

    async fn exists_w(&self, path: &str) -> Result<(bool, Watch), CoordError> {
        let mut tree = self.lock().await?;
        check_path(path)?;
        let (tx, watch) = Watch::channel();
        match tree.nodes.get_mut(path) {
            Some(node) => {
                node.data_watchers.push(tx);
                Ok((true, watch))
            }
            None => {
                tree.creation_watchers
                    .entry(path.to_string())
                    .or_default()
                    .push(tx);
                Ok((false, watch))
            }
        }
    }

    async fn children_w(&self, path: &str) -> Result<(Vec<String>, Watch), CoordError> {
        let mut tree = self.lock().await?;
        let children = {
            tree.node(path)?;
            tree.children_of(path)
        };
        let (tx, watch) = Watch::channel();
        tree.node_mut(path)?.child_watchers.push(tx);
        Ok((children, watch))
    }
}
