//! Shared cache of opened segment handles
//!
//! Readers across a process share opened (never fenced) handles through this
//! cache, so tailing many readers of one stream costs one open per segment.
//! Writers hold their own handles; only the read path goes through here.

use super::{Entry, SegmentHandle, SegmentStore, StoreError};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Process-wide cache of reader handles, keyed by segment id
pub struct HandleCache {
    store: Arc<dyn SegmentStore>,
    handles: DashMap<u64, Arc<dyn SegmentHandle>>,
}

impl HandleCache {
    pub fn new(store: Arc<dyn SegmentStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            handles: DashMap::new(),
        })
    }

    pub fn store(&self) -> &Arc<dyn SegmentStore> {
        &self.store
    }

    /// Cached reader handle for `segment_id`, opening one if needed
    pub async fn get_or_open(&self, segment_id: u64) -> Result<Arc<dyn SegmentHandle>, StoreError> {
        if let Some(handle) = self.handles.get(&segment_id) {
            return Ok(Arc::clone(handle.value()));
        }
        let handle = self.store.open(segment_id, false).await?;
        debug!(segment = segment_id, "cached reader handle");
        self.handles.insert(segment_id, Arc::clone(&handle));
        Ok(handle)
    }

    /// Uniform read passthrough
    pub async fn read_entries(
        &self,
        segment_id: u64,
        first: i64,
        last: i64,
    ) -> Result<Vec<Entry>, StoreError> {
        self.get_or_open(segment_id).await?.read_entries(first, last).await
    }

    /// Uniform last-confirmed passthrough
    pub async fn read_last_confirmed(&self, segment_id: u64) -> Result<i64, StoreError> {
        self.get_or_open(segment_id).await?.last_confirmed().await
    }

    /// Drop the cached handle for a segment, closing it
    pub async fn evict(&self, segment_id: u64) {
        if let Some((_, handle)) = self.handles.remove(&segment_id) {
            let _ = handle.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySegmentStore;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_handles_are_shared() {
        let store = MemorySegmentStore::new();
        let writer = store.create().await.unwrap();
        writer.append(Bytes::from_static(b"a")).await.unwrap();
        writer.close().await.unwrap();

        let cache = HandleCache::new(store);
        let id = writer.segment_id();
        let first = cache.get_or_open(id).await.unwrap();
        let second = cache.get_or_open(id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.read_last_confirmed(id).await.unwrap(), 0);
        assert_eq!(cache.read_entries(id, 0, 0).await.unwrap().len(), 1);

        cache.evict(id).await;
        let third = cache.get_or_open(id).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
