//! Segment store interface
//!
//! The segment store is the replicated entry store holding segment data.
//! The engine consumes this contract and never assumes a backend: appends
//! are acknowledged atomically per transmission unit, entries are ordinal,
//! and a fencing open guarantees older writers' appends are rejected.

pub mod cache;
pub mod memory;

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

pub use cache::HandleCache;
pub use memory::MemorySegmentStore;

/// Segment store errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("segment {0} not found")]
    SegmentNotFound(u64),
    #[error("writer fenced off segment {0}")]
    Fenced(u64),
    #[error("segment {0} handle is read-only")]
    ReadOnly(u64),
    #[error("segment store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient errors are retried where the engine allows it (segment
    /// close); everything else propagates immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// One acknowledged entry: a transmission unit with its assigned ordinal
#[derive(Debug, Clone)]
pub struct Entry {
    pub entry_id: i64,
    pub payload: Bytes,
}

/// Factory for segment handles
#[async_trait::async_trait]
pub trait SegmentStore: Send + Sync + 'static {
    /// Allocate a new segment and return its write handle
    async fn create(&self) -> Result<Arc<dyn SegmentHandle>, StoreError>;

    /// Open an existing segment. A fencing open seals the segment against
    /// the current writer and makes every entry visible; readers open with
    /// `fence = false` and observe the last-confirmed boundary instead.
    async fn open(&self, segment_id: u64, fence: bool)
        -> Result<Arc<dyn SegmentHandle>, StoreError>;

    /// Delete a segment outright (truncation only)
    async fn delete(&self, segment_id: u64) -> Result<(), StoreError>;
}

/// Handle to one segment-store object
#[async_trait::async_trait]
pub trait SegmentHandle: Send + Sync + 'static {
    fn segment_id(&self) -> u64;

    /// Append one transmission unit; returns the assigned entry ordinal
    async fn append(&self, payload: Bytes) -> Result<i64, StoreError>;

    /// Entries in `first..=last`, capped at the visible last-confirmed
    async fn read_entries(&self, first: i64, last: i64) -> Result<Vec<Entry>, StoreError>;

    /// Ordinal of the last entry visible to this handle, `-1` when none
    async fn last_confirmed(&self) -> Result<i64, StoreError>;

    /// Close the handle. Closing a write handle seals the segment.
    async fn close(&self) -> Result<(), StoreError>;
}
