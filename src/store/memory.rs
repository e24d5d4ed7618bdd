//! In-memory segment store backend
//!
//! Models the store contract the engine depends on, including the two
//! behaviors the write path is built around: last-confirmed lags one entry
//! behind the writer (an append confirms its predecessor, which is why
//! control records exist), and a fencing open bumps the segment epoch so
//! the previous writer's appends are rejected.

use super::{Entry, SegmentHandle, SegmentStore, StoreError};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

struct SegmentObject {
    entries: Vec<Bytes>,
    last_confirmed: i64,
    epoch: u64,
    sealed: bool,
}

impl SegmentObject {
    fn visible_last(&self) -> i64 {
        if self.sealed {
            self.entries.len() as i64 - 1
        } else {
            self.last_confirmed
        }
    }
}

/// In-memory [`SegmentStore`]
pub struct MemorySegmentStore {
    segments: DashMap<u64, Arc<Mutex<SegmentObject>>>,
    next_id: AtomicU64,
}

impl MemorySegmentStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            segments: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    fn object(&self, segment_id: u64) -> Result<Arc<Mutex<SegmentObject>>, StoreError> {
        self.segments
            .get(&segment_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StoreError::SegmentNotFound(segment_id))
    }
}

impl Default for MemorySegmentStore {
    fn default() -> Self {
        Self {
            segments: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait::async_trait]
impl SegmentStore for MemorySegmentStore {
    async fn create(&self) -> Result<Arc<dyn SegmentHandle>, StoreError> {
        let segment_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let object = Arc::new(Mutex::new(SegmentObject {
            entries: Vec::new(),
            last_confirmed: -1,
            epoch: 0,
            sealed: false,
        }));
        self.segments.insert(segment_id, Arc::clone(&object));
        debug!(segment = segment_id, "created segment");
        Ok(Arc::new(MemorySegmentHandle {
            segment_id,
            object,
            epoch: 0,
            writable: true,
        }))
    }

    async fn open(
        &self,
        segment_id: u64,
        fence: bool,
    ) -> Result<Arc<dyn SegmentHandle>, StoreError> {
        let object = self.object(segment_id)?;
        let epoch = {
            let mut obj = object.lock();
            if fence {
                obj.epoch += 1;
                obj.sealed = true;
                obj.last_confirmed = obj.entries.len() as i64 - 1;
                debug!(segment = segment_id, epoch = obj.epoch, "fencing open");
            }
            obj.epoch
        };
        Ok(Arc::new(MemorySegmentHandle {
            segment_id,
            object,
            epoch,
            writable: false,
        }))
    }

    async fn delete(&self, segment_id: u64) -> Result<(), StoreError> {
        self.segments
            .remove(&segment_id)
            .map(|_| ())
            .ok_or(StoreError::SegmentNotFound(segment_id))
    }
}

struct MemorySegmentHandle {
    segment_id: u64,
    object: Arc<Mutex<SegmentObject>>,
    epoch: u64,
    writable: bool,
}

#[async_trait::async_trait]
impl SegmentHandle for MemorySegmentHandle {
    fn segment_id(&self) -> u64 {
        self.segment_id
    }

    async fn append(&self, payload: Bytes) -> Result<i64, StoreError> {
        if !self.writable {
            return Err(StoreError::ReadOnly(self.segment_id));
        }
        let mut obj = self.object.lock();
        if obj.sealed || obj.epoch != self.epoch {
            return Err(StoreError::Fenced(self.segment_id));
        }
        obj.entries.push(payload);
        let entry_id = obj.entries.len() as i64 - 1;
        // an append confirms the entry before it
        obj.last_confirmed = entry_id - 1;
        Ok(entry_id)
    }

    async fn read_entries(&self, first: i64, last: i64) -> Result<Vec<Entry>, StoreError> {
        let obj = self.object.lock();
        let upper = last.min(obj.visible_last());
        if first < 0 || first > upper {
            return Ok(Vec::new());
        }
        Ok((first..=upper)
            .map(|id| Entry {
                entry_id: id,
                payload: obj.entries[id as usize].clone(),
            })
            .collect())
    }

    async fn last_confirmed(&self) -> Result<i64, StoreError> {
        Ok(self.object.lock().visible_last())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.writable {
            let mut obj = self.object.lock();
            if obj.epoch == self.epoch {
                obj.sealed = true;
                obj.last_confirmed = obj.entries.len() as i64 - 1;
            }
        }
        Ok(())
    }
}
