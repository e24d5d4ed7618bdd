//! Read-ahead worker
//!
//! Tails one segment by polling its last-confirmed entry and pre-fetching
//! batches into a bounded entry cache. The batch grows exponentially up to
//! a cap while fetches come back full, so a catching-up reader converges on
//! large reads without hammering the store when it is already at the tail.

use crate::config::ReaderConfig;
use crate::store::{Entry, SegmentHandle};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct ReadAheadShared {
    entries: Mutex<VecDeque<Entry>>,
    /// Next entry the worker will fetch
    next_fetch: AtomicI64,
    batch: AtomicUsize,
    capacity: usize,
    max_batch: usize,
    /// Signalled when the consumer frees cache space
    space: Notify,
}

/// Background pre-fetcher bound to one segment handle
pub(crate) struct ReadAheadWorker {
    shared: Arc<ReadAheadShared>,
    task: JoinHandle<()>,
}

impl ReadAheadWorker {
    pub fn spawn(handle: Arc<dyn SegmentHandle>, start_entry: i64, config: &ReaderConfig) -> Self {
        let shared = Arc::new(ReadAheadShared {
            entries: Mutex::new(VecDeque::new()),
            next_fetch: AtomicI64::new(start_entry),
            batch: AtomicUsize::new(config.readahead_batch_size),
            capacity: config.readahead_cache_entries,
            max_batch: config.readahead_max_batch_size,
            space: Notify::new(),
        });
        let task = tokio::spawn(run(
            handle,
            Arc::clone(&shared),
            config.poll_interval(),
        ));
        Self { shared, task }
    }

    /// Pop the cached entry with this exact ordinal, discarding any stale
    /// entries in front of it.
    pub fn take(&self, entry_id: i64) -> Option<Entry> {
        let mut entries = self.shared.entries.lock();
        while entries
            .front()
            .map_or(false, |entry| entry.entry_id < entry_id)
        {
            entries.pop_front();
        }
        if entries
            .front()
            .map_or(false, |entry| entry.entry_id == entry_id)
        {
            let entry = entries.pop_front();
            self.shared.space.notify_one();
            return entry;
        }
        None
    }

    /// Diagnostic snapshot for idle warnings
    pub fn dump_state(&self) -> String {
        format!(
            "readahead{{next_fetch={}, cached={}, batch={}}}",
            self.shared.next_fetch.load(Ordering::SeqCst),
            self.shared.entries.lock().len(),
            self.shared.batch.load(Ordering::SeqCst),
        )
    }
}

impl Drop for ReadAheadWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    handle: Arc<dyn SegmentHandle>,
    shared: Arc<ReadAheadShared>,
    poll_interval: std::time::Duration,
) {
    loop {
        let last_confirmed = match handle.last_confirmed().await {
            Ok(last) => last,
            Err(e) => {
                warn!(segment = handle.segment_id(), error = %e, "read-ahead poll failed");
                return;
            }
        };

        loop {
            let next = shared.next_fetch.load(Ordering::SeqCst);
            let cached = shared.entries.lock().len();
            if next > last_confirmed || cached >= shared.capacity {
                break;
            }
            let want = shared
                .batch
                .load(Ordering::SeqCst)
                .min((last_confirmed - next + 1) as usize)
                .min(shared.capacity - cached);
            match handle.read_entries(next, next + want as i64 - 1).await {
                Ok(entries) if entries.is_empty() => break,
                Ok(entries) => {
                    let got = entries.len();
                    shared.entries.lock().extend(entries);
                    shared.next_fetch.store(next + got as i64, Ordering::SeqCst);
                    let batch = shared.batch.load(Ordering::SeqCst);
                    if got == batch && batch < shared.max_batch {
                        let grown = (batch * 2).min(shared.max_batch);
                        shared.batch.store(grown, Ordering::SeqCst);
                        debug!(
                            segment = handle.segment_id(),
                            batch = grown,
                            "read-ahead batch grown"
                        );
                    }
                }
                Err(e) => {
                    warn!(segment = handle.segment_id(), error = %e, "read-ahead fetch failed");
                    return;
                }
            }
        }

        // caught up or cache full: wait for the tail to move or space to free
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shared.space.notified() => {}
        }
    }
}
