//! Metadata coordinator interface
//!
//! The coordinator provides hierarchical nodes with ephemeral semantics,
//! one-shot watches, and session expiration. Locks and segment metadata are
//! built on this contract; the engine never assumes a particular backend.

pub mod lock;
pub mod memory;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

pub use lock::StreamLock;
pub use memory::MemoryCoordinator;

/// Coordinator operation errors
#[derive(Debug, Clone, Error)]
pub enum CoordError {
    #[error("node already exists: {0}")]
    NodeExists(String),
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("coordinator session expired")]
    SessionExpired,
    #[error("coordinator backend error: {0}")]
    Backend(String),
}

/// One-shot node watch notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(String),
    DataChanged(String),
    Deleted(String),
    ChildrenChanged(String),
}

/// Session lifecycle notification, broadcast to all registered observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Expired,
}

/// Hierarchical node store with ephemeral nodes, sequential nodes and
/// one-shot watches. One session is shared per process; dependents register
/// for its expiration events.
#[async_trait::async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// Create a node. Ephemeral nodes die with the session that made them.
    async fn create(&self, path: &str, data: Bytes, ephemeral: bool) -> Result<(), CoordError>;

    /// Create a node whose name is `prefix` plus a monotonically increasing
    /// sequence number. Returns the full path of the created node.
    async fn create_sequential(
        &self,
        prefix: &str,
        data: Bytes,
        ephemeral: bool,
    ) -> Result<String, CoordError>;

    /// Read a node's data and version
    async fn read(&self, path: &str) -> Result<(Bytes, u64), CoordError>;

    /// Overwrite a node's data, returning the new version
    async fn write(&self, path: &str, data: Bytes) -> Result<u64, CoordError>;

    async fn delete(&self, path: &str) -> Result<(), CoordError>;

    async fn exists(&self, path: &str) -> Result<bool, CoordError>;

    /// Direct child names of `path`, sorted
    async fn children(&self, path: &str) -> Result<Vec<String>, CoordError>;

    /// One-shot watch firing on the next create/change/delete of `path`.
    /// The node does not have to exist yet.
    async fn watch(&self, path: &str) -> Result<oneshot::Receiver<WatchEvent>, CoordError>;

    /// One-shot watch firing when the set of children of `path` changes
    async fn watch_children(&self, path: &str)
        -> Result<oneshot::Receiver<WatchEvent>, CoordError>;

    /// Identifier of this client's session
    fn session_id(&self) -> Uuid;

    /// Subscribe to session lifecycle events
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}
