//! In-memory coordinator backend
//!
//! Backs the coordinator contract with process-local node tables. Multiple
//! clients can attach to one node space, each with its own session, which is
//! how tests model independent writer processes contending for a stream.

use super::{CoordError, Coordinator, SessionEvent, WatchEvent};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

struct Node {
    data: Bytes,
    version: u64,
    ephemeral_owner: Option<Uuid>,
}

/// Node space shared by every client attached to the same coordinator
struct CoordShared {
    nodes: DashMap<String, Node>,
    counters: DashMap<String, u64>,
    watches: Mutex<HashMap<String, Vec<oneshot::Sender<WatchEvent>>>>,
}

impl CoordShared {
    fn fire(&self, key: &str, event: WatchEvent) {
        let senders = { self.watches.lock().remove(key) };
        if let Some(senders) = senders {
            for tx in senders {
                // receiver may be gone; a dropped watch is a no-op
                let _ = tx.send(event.clone());
            }
        }
    }

    fn fire_node_event(&self, path: &str, event: WatchEvent) {
        self.fire(path, event);
        if let Some(parent) = parent_of(path) {
            self.fire(
                &children_key(parent),
                WatchEvent::ChildrenChanged(parent.to_string()),
            );
        }
    }
}

fn parent_of(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

fn children_key(path: &str) -> String {
    format!("{path}\u{0}children")
}

/// In-memory [`Coordinator`] client with its own session
pub struct MemoryCoordinator {
    shared: Arc<CoordShared>,
    session_id: Uuid,
    session_tx: broadcast::Sender<SessionEvent>,
    expired: AtomicBool,
}

impl MemoryCoordinator {
    /// New coordinator with a fresh node space
    pub fn new() -> Arc<Self> {
        let shared = Arc::new(CoordShared {
            nodes: DashMap::new(),
            counters: DashMap::new(),
            watches: Mutex::new(HashMap::new()),
        });
        Self::with_shared(shared)
    }

    /// New client session attached to this coordinator's node space
    pub fn attach(&self) -> Arc<Self> {
        Self::with_shared(Arc::clone(&self.shared))
    }

    fn with_shared(shared: Arc<CoordShared>) -> Arc<Self> {
        let (session_tx, _) = broadcast::channel(16);
        let session_id = Uuid::new_v4();
        debug!(session = %session_id, "coordinator session opened");
        Arc::new(Self {
            shared,
            session_id,
            session_tx,
            expired: AtomicBool::new(false),
        })
    }

    /// Expire this client's session: its ephemeral nodes are deleted and
    /// every registered observer is notified.
    pub fn expire_session(&self) {
        if self.expired.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session = %self.session_id, "expiring coordinator session");
        let owned: Vec<String> = self
            .shared
            .nodes
            .iter()
            .filter(|entry| entry.value().ephemeral_owner == Some(self.session_id))
            .map(|entry| entry.key().clone())
            .collect();
        for path in owned {
            self.shared.nodes.remove(&path);
            self.shared
                .fire_node_event(&path, WatchEvent::Deleted(path.clone()));
        }
        let _ = self.session_tx.send(SessionEvent::Expired);
    }

    fn check_session(&self) -> Result<(), CoordError> {
        if self.expired.load(Ordering::SeqCst) {
            Err(CoordError::SessionExpired)
        } else {
            Ok(())
        }
    }

    fn insert(&self, path: String, data: Bytes, ephemeral: bool) -> Result<(), CoordError> {
        if self.shared.nodes.contains_key(&path) {
            return Err(CoordError::NodeExists(path));
        }
        self.shared.nodes.insert(
            path.clone(),
            Node {
                data,
                version: 0,
                ephemeral_owner: ephemeral.then_some(self.session_id),
            },
        );
        self.shared
            .fire_node_event(&path, WatchEvent::Created(path.clone()));
        Ok(())
    }
}

#[async_trait::async_trait]
impl Coordinator for MemoryCoordinator {
    async fn create(&self, path: &str, data: Bytes, ephemeral: bool) -> Result<(), CoordError> {
        self.check_session()?;
        self.insert(path.to_string(), data, ephemeral)
    }

    async fn create_sequential(
        &self,
        prefix: &str,
        data: Bytes,
        ephemeral: bool,
    ) -> Result<String, CoordError> {
        self.check_session()?;
        let seq = {
            let mut counter = self.shared.counters.entry(prefix.to_string()).or_insert(0);
            let seq = *counter;
            *counter += 1;
            seq
        };
        let path = format!("{prefix}{seq:010}");
        self.insert(path.clone(), data, ephemeral)?;
        Ok(path)
    }

    async fn read(&self, path: &str) -> Result<(Bytes, u64), CoordError> {
        self.check_session()?;
        let node = self
            .shared
            .nodes
            .get(path)
            .ok_or_else(|| CoordError::NodeNotFound(path.to_string()))?;
        Ok((node.data.clone(), node.version))
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<u64, CoordError> {
        self.check_session()?;
        let version = {
            let mut node = self
                .shared
                .nodes
                .get_mut(path)
                .ok_or_else(|| CoordError::NodeNotFound(path.to_string()))?;
            node.data = data;
            node.version += 1;
            node.version
        };
        self.shared
            .fire_node_event(path, WatchEvent::DataChanged(path.to_string()));
        Ok(version)
    }

    async fn delete(&self, path: &str) -> Result<(), CoordError> {
        self.check_session()?;
        self.shared
            .nodes
            .remove(path)
            .ok_or_else(|| CoordError::NodeNotFound(path.to_string()))?;
        self.shared
            .fire_node_event(path, WatchEvent::Deleted(path.to_string()));
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, CoordError> {
        self.check_session()?;
        Ok(self.shared.nodes.contains_key(path))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordError> {
        self.check_session()?;
        let prefix = format!("{path}/");
        let mut names: Vec<String> = self
            .shared
            .nodes
            .iter()
            .filter_map(|entry| {
                let rest = entry.key().strip_prefix(&prefix)?;
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        names.sort();
        Ok(names)
    }

    async fn watch(&self, path: &str) -> Result<oneshot::Receiver<WatchEvent>, CoordError> {
        self.check_session()?;
        let (tx, rx) = oneshot::channel();
        self.shared
            .watches
            .lock()
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<oneshot::Receiver<WatchEvent>, CoordError> {
        self.check_session()?;
        let (tx, rx) = oneshot::channel();
        self.shared
            .watches
            .lock()
            .entry(children_key(path))
            .or_default()
            .push(tx);
        Ok(rx)
    }

    fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_read_write_delete() {
        let coord = MemoryCoordinator::new();
        coord
            .create("/a/b", Bytes::from_static(b"one"), false)
            .await
            .unwrap();
        assert!(matches!(
            coord.create("/a/b", Bytes::new(), false).await,
            Err(CoordError::NodeExists(_))
        ));
        let (data, version) = coord.read("/a/b").await.unwrap();
        assert_eq!(&data[..], b"one");
        assert_eq!(version, 0);
        assert_eq!(coord.write("/a/b", Bytes::from_static(b"two")).await.unwrap(), 1);
        coord.delete("/a/b").await.unwrap();
        assert!(!coord.exists("/a/b").await.unwrap());
    }

    #[tokio::test]
    async fn test_sequential_and_children() {
        let coord = MemoryCoordinator::new();
        let first = coord
            .create_sequential("/locks/member-", Bytes::new(), true)
            .await
            .unwrap();
        let second = coord
            .create_sequential("/locks/member-", Bytes::new(), true)
            .await
            .unwrap();
        assert!(first < second);
        let children = coord.children("/locks").await.unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0], "member-0000000000");
    }

    #[tokio::test]
    async fn test_watch_fires_on_delete() {
        let coord = MemoryCoordinator::new();
        coord.create("/n", Bytes::new(), false).await.unwrap();
        let rx = coord.watch("/n").await.unwrap();
        coord.delete("/n").await.unwrap();
        assert_eq!(rx.await.unwrap(), WatchEvent::Deleted("/n".to_string()));
    }

    #[tokio::test]
    async fn test_session_expiry_removes_ephemerals() {
        let coord = MemoryCoordinator::new();
        let other = coord.attach();
        other
            .create("/eph", Bytes::new(), true)
            .await
            .unwrap();
        coord.create("/durable", Bytes::new(), false).await.unwrap();

        let mut events = other.session_events();
        other.expire_session();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Expired);
        // the surviving session still sees the durable node
        assert!(coord.exists("/durable").await.unwrap());
        assert!(!coord.exists("/eph").await.unwrap());
        assert!(matches!(
            other.read("/durable").await,
            Err(CoordError::SessionExpired)
        ));
    }
}
