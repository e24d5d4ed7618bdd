//! Per-segment packing engine
//!
//! Buffers records into transmission units, submits them to the segment
//! store one at a time, and assigns positions on acknowledgement. Any
//! non-OK acknowledgement is sticky: the writer flips to errored and every
//! further operation reports the same failure until close.

use super::transmit::{PendingWrite, TransmissionUnit, WriteFuture};
use super::{WriteError, LOCK_REASON_WRITER};
use crate::config::StreamConfig;
use crate::coord::StreamLock;
use crate::record::{Record, MAX_RECORD_SIZE, MAX_TRANSMISSION_SIZE, MAX_TXID};
use crate::store::{SegmentHandle, StoreError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What the writer observed about its segment, consumed by the metadata
/// completion path on close.
#[derive(Debug, Clone, Copy)]
pub struct SegmentWriterSummary {
    /// Last acknowledged entry, control entries included
    pub last_entry_id: i64,
    /// Entry holding the last acknowledged data record
    pub last_data_entry: i64,
    /// Slot of the last acknowledged data record within its entry
    pub last_data_slot: i64,
    /// Highest acknowledged transaction id
    pub last_txid: i64,
    /// Data records accepted by this writer
    pub data_records: u64,
}

struct WriterState {
    active: TransmissionUnit,
    sealed: VecDeque<TransmissionUnit>,
    inflight: bool,
    errored: Option<WriteError>,
    control_flush_needed: bool,
    end_of_stream: bool,
    closed: bool,
    last_buffered_txid: i64,
    last_acked_txid: i64,
    last_entry_id: i64,
    last_data_entry: i64,
    last_data_slot: i64,
    data_records: u64,
    data_bytes: u64,
    flusher: Option<JoinHandle<()>>,
    lock_watch: Option<JoinHandle<()>>,
}

struct Inner {
    stream: String,
    segment_seq: i64,
    handle: Arc<dyn SegmentHandle>,
    output_buffer_size: usize,
    flush_timeout: Duration,
    close_retry_budget: u32,
    close_retry_backoff: Duration,
    state: Mutex<WriterState>,
    /// Count of sealed-but-unacknowledged units; the sync latch
    outstanding: watch::Sender<usize>,
    lock: Option<Arc<StreamLock>>,
}

/// Writer for one in-progress segment
pub struct SegmentWriter {
    inner: Arc<Inner>,
}

impl SegmentWriter {
    pub fn new(
        stream: &str,
        segment_seq: i64,
        handle: Arc<dyn SegmentHandle>,
        config: &StreamConfig,
        lock: Option<Arc<StreamLock>>,
    ) -> Self {
        let (outstanding, _) = watch::channel(0usize);
        let lost_signal = lock.as_ref().map(|lock| lock.lost_signal());
        let inner = Arc::new(Inner {
            stream: stream.to_string(),
            segment_seq,
            handle,
            output_buffer_size: config.writer.output_buffer_size,
            flush_timeout: config.writer.flush_timeout(),
            close_retry_budget: config.store.close_retry_budget,
            close_retry_backoff: Duration::from_millis(config.store.close_retry_backoff_ms),
            state: Mutex::new(WriterState {
                active: TransmissionUnit::new(segment_seq, false),
                sealed: VecDeque::new(),
                inflight: false,
                errored: None,
                control_flush_needed: false,
                end_of_stream: false,
                closed: false,
                last_buffered_txid: crate::record::INVALID_TXID,
                last_acked_txid: crate::record::INVALID_TXID,
                last_entry_id: -1,
                last_data_entry: -1,
                last_data_slot: -1,
                data_records: 0,
                data_bytes: 0,
                flusher: None,
                lock_watch: None,
            }),
            outstanding,
            lock,
        });

        {
            let mut state = inner.state.lock();
            if config.writer.periodic_flush_ms > 0 {
                state.flusher = Some(spawn_flusher(&inner, config.writer.periodic_flush_ms));
            }
            if let Some(lost) = lost_signal {
                state.lock_watch = Some(spawn_lock_watch(&inner, lost));
            }
        }
        debug!(stream, segment = segment_seq, "segment writer ready");
        Self { inner }
    }

    /// Append one record. The future resolves with the record's position
    /// once its transmission unit is acknowledged.
    pub fn write(&self, record: Record) -> WriteFuture {
        let (pending, future) = WriteFuture::channel(record.txid);
        self.inner.write_record(record, pending, false);
        future
    }

    /// Sequential writes plus one trailing transmission
    pub fn write_bulk(&self, records: Vec<Record>) -> Vec<WriteFuture> {
        let futures = records
            .into_iter()
            .map(|record| {
                let (pending, future) = WriteFuture::channel(record.txid);
                self.inner.write_record(record, pending, false);
                future
            })
            .collect();
        self.transmit();
        futures
    }

    /// Seal and submit whatever is buffered, without waiting
    pub(crate) fn transmit(&self) {
        let mut state = self.inner.state.lock();
        if state.errored.is_some() || state.closed {
            return;
        }
        self.inner.seal_locked(&mut state);
        self.inner.pump_locked(&mut state);
    }

    pub(crate) fn write_with(&self, record: Record, promise: PendingWrite, allow_reserved: bool) {
        self.inner.write_record(record, promise, allow_reserved);
    }

    /// Transmit the active buffer, wait for every outstanding unit to be
    /// acknowledged, then advance the visible last-confirmed boundary with
    /// a control record. Returns the last acknowledged transaction id.
    pub async fn flush_and_sync(&self) -> Result<i64, WriteError> {
        self.inner.flush_and_sync().await
    }

    /// Write the reserved terminal record and flush. The stream accepts no
    /// user records afterwards.
    pub async fn mark_end_of_stream(&self) -> Result<(), WriteError> {
        let (pending, future) = WriteFuture::channel(MAX_TXID);
        self.inner
            .write_record(Record::end_of_stream(), pending, true);
        self.inner.flush_and_sync().await?;
        future.await.map(|_| ())
    }

    /// Stop the flusher, flush unless errored, and close the segment-store
    /// handle with bounded retries. Releases the stream lock iff `finalize`.
    pub async fn close(&self, finalize: bool) -> Result<SegmentWriterSummary, WriteError> {
        self.inner.close(finalize).await
    }

    /// Cancel pending promises and release the lock without flushing
    pub async fn abort(&self) {
        self.inner.abort().await
    }

    pub fn segment_seq(&self) -> i64 {
        self.inner.segment_seq
    }

    /// Data records accepted so far
    pub fn record_count(&self) -> u64 {
        self.inner.state.lock().data_records
    }

    /// Data bytes accepted so far, headers included
    pub fn byte_count(&self) -> u64 {
        self.inner.state.lock().data_bytes
    }

    pub fn last_acked_txid(&self) -> i64 {
        self.inner.state.lock().last_acked_txid
    }

    pub fn is_errored(&self) -> bool {
        self.inner.state.lock().errored.is_some()
    }
}

impl Inner {
    fn write_record(self: &Arc<Self>, record: Record, promise: PendingWrite, allow_reserved: bool) {
        let mut state = self.state.lock();
        if let Some(err) = &state.errored {
            promise.fail(err.clone());
            return;
        }
        if state.closed {
            promise.fail(WriteError::Closed);
            return;
        }
        if state.end_of_stream {
            promise.fail(WriteError::EndOfStream);
            return;
        }
        if record.payload.len() > MAX_RECORD_SIZE {
            promise.fail(WriteError::OverLimit {
                size: record.payload.len(),
                limit: MAX_RECORD_SIZE,
            });
            return;
        }
        if !allow_reserved && (record.txid < 0 || record.txid == MAX_TXID) {
            promise.fail(WriteError::InvalidTxId(record.txid));
            return;
        }

        // the unit must never outgrow one segment-store append
        if state.active.byte_len() + record.persistent_size() > MAX_TRANSMISSION_SIZE {
            self.seal_locked(&mut state);
        }
        state.last_buffered_txid = state.last_buffered_txid.max(record.txid);
        if !record.is_control() {
            state.data_records += 1;
            state.data_bytes += record.persistent_size() as u64;
        }
        if record.is_end_of_stream() {
            state.end_of_stream = true;
        }
        state.active.append(&record, Some(promise));
        if state.active.byte_len() >= self.output_buffer_size {
            self.seal_locked(&mut state);
        }
        self.pump_locked(&mut state);
    }

    /// Move the active unit onto the sealed queue
    fn seal_locked(&self, state: &mut WriterState) {
        if state.active.is_empty() {
            return;
        }
        let fresh = TransmissionUnit::new(self.segment_seq, false);
        let sealed = std::mem::replace(&mut state.active, fresh);
        state.sealed.push_back(sealed);
        self.update_outstanding(state);
    }

    /// Submit the next sealed unit unless one is already in flight
    fn pump_locked(self: &Arc<Self>, state: &mut WriterState) {
        if state.inflight {
            return;
        }
        let Some(mut unit) = state.sealed.pop_front() else {
            return;
        };
        state.inflight = true;
        self.update_outstanding(state);
        let payload = unit.take_payload();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = inner.handle.append(payload).await;
            inner.finish_transmit(unit, result);
        });
    }

    fn finish_transmit(self: &Arc<Self>, unit: TransmissionUnit, result: Result<i64, StoreError>) {
        let mut state = self.state.lock();
        state.inflight = false;
        if let Some(err) = state.errored.clone() {
            unit.fail(&err);
            self.update_outstanding(&state);
            return;
        }
        match result {
            Ok(entry_id) => {
                let is_control = unit.is_control;
                state.last_entry_id = entry_id;
                if is_control {
                    state.control_flush_needed = false;
                } else {
                    state.control_flush_needed = true;
                    state.last_data_entry = entry_id;
                    state.last_acked_txid = state.last_acked_txid.max(unit.max_txid);
                }
                let last_slot = unit.complete(entry_id);
                if !is_control && last_slot >= 0 {
                    state.last_data_slot = last_slot;
                }
                debug!(
                    stream = %self.stream,
                    segment = self.segment_seq,
                    entry = entry_id,
                    control = is_control,
                    "transmit acknowledged"
                );
                self.pump_locked(&mut state);
                self.update_outstanding(&state);
            }
            Err(store_err) => {
                let err = match store_err {
                    StoreError::Fenced(id) => {
                        WriteError::Transmit(format!("segment {id} fenced by a newer writer"))
                    }
                    other => WriteError::Transmit(other.to_string()),
                };
                error!(
                    stream = %self.stream,
                    segment = self.segment_seq,
                    error = %err,
                    "transmit failed, writer errored"
                );
                state.errored = Some(err.clone());
                unit.fail(&err);
                self.fail_buffered_locked(&mut state, &err);
            }
        }
    }

    /// Fail everything buffered or queued; the writer is already errored
    fn fail_buffered_locked(&self, state: &mut WriterState, err: &WriteError) {
        let active = std::mem::replace(
            &mut state.active,
            TransmissionUnit::new(self.segment_seq, false),
        );
        active.fail(err);
        while let Some(unit) = state.sealed.pop_front() {
            unit.fail(err);
        }
        self.update_outstanding(state);
    }

    fn update_outstanding(&self, state: &WriterState) {
        self.outstanding
            .send_replace(state.sealed.len() + state.inflight as usize);
    }

    fn enqueue_control_locked(&self, state: &mut WriterState) {
        let txid = state.last_buffered_txid.max(state.last_acked_txid).max(0);
        let mut unit = TransmissionUnit::new(self.segment_seq, true);
        unit.append(&Record::control(txid), None);
        state.sealed.push_back(unit);
        self.update_outstanding(state);
    }

    async fn flush_and_sync(self: &Arc<Self>) -> Result<i64, WriteError> {
        let deadline = tokio::time::Instant::now() + self.flush_timeout;
        {
            let mut state = self.state.lock();
            if let Some(err) = &state.errored {
                return Err(err.clone());
            }
            self.seal_locked(&mut state);
            self.pump_locked(&mut state);
        }
        self.wait_drained(deadline).await?;
        {
            let mut state = self.state.lock();
            if let Some(err) = &state.errored {
                return Err(err.clone());
            }
            if state.control_flush_needed {
                self.enqueue_control_locked(&mut state);
                self.pump_locked(&mut state);
            }
        }
        self.wait_drained(deadline).await?;
        let state = self.state.lock();
        match &state.errored {
            Some(err) => Err(err.clone()),
            None => Ok(state.last_acked_txid),
        }
    }

    async fn wait_drained(self: &Arc<Self>, deadline: tokio::time::Instant) -> Result<(), WriteError> {
        let mut rx = self.outstanding.subscribe();
        let result = tokio::time::timeout_at(deadline, rx.wait_for(|count| *count == 0)).await;
        match result {
            Ok(_) => Ok(()),
            Err(_) => {
                let err = WriteError::FlushTimeout(self.flush_timeout.as_millis() as u64);
                let mut state = self.state.lock();
                if state.errored.is_none() {
                    state.errored = Some(err.clone());
                }
                self.fail_buffered_locked(&mut state, &err);
                Err(err)
            }
        }
    }

    async fn close(self: &Arc<Self>, finalize: bool) -> Result<SegmentWriterSummary, WriteError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(summary(&state));
            }
            state.closed = true;
            if let Some(task) = state.flusher.take() {
                task.abort();
            }
            if let Some(task) = state.lock_watch.take() {
                task.abort();
            }
        }

        let errored = self.state.lock().errored.is_some();
        if !errored {
            if let Err(e) = self.flush_and_sync().await {
                warn!(
                    stream = %self.stream,
                    segment = self.segment_seq,
                    error = %e,
                    "final flush failed during close"
                );
            }
        }
        self.close_handle().await;
        if finalize {
            if let Some(lock) = &self.lock {
                if let Err(e) = lock.release(LOCK_REASON_WRITER).await {
                    warn!(stream = %self.stream, error = %e, "lock release failed");
                }
            }
        }
        let state = self.state.lock();
        info!(
            stream = %self.stream,
            segment = self.segment_seq,
            records = state.data_records,
            last_txid = state.last_acked_txid,
            "segment writer closed"
        );
        Ok(summary(&state))
    }

    async fn close_handle(&self) {
        let mut backoff = self.close_retry_backoff;
        for attempt in 0..=self.close_retry_budget {
            match self.handle.close().await {
                Ok(()) => return,
                Err(e) if e.is_transient() && attempt < self.close_retry_budget => {
                    warn!(
                        stream = %self.stream,
                        segment = self.segment_seq,
                        attempt,
                        error = %e,
                        "transient error closing segment handle, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    error!(
                        stream = %self.stream,
                        segment = self.segment_seq,
                        error = %e,
                        "giving up on segment handle close"
                    );
                    return;
                }
            }
        }
    }

    async fn abort(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            if let Some(task) = state.flusher.take() {
                task.abort();
            }
            if let Some(task) = state.lock_watch.take() {
                task.abort();
            }
            let err = WriteError::Cancelled;
            if state.errored.is_none() {
                state.errored = Some(err.clone());
            }
            self.fail_buffered_locked(&mut state, &err);
        }
        let _ = self.handle.close().await;
        if let Some(lock) = &self.lock {
            let _ = lock.release(LOCK_REASON_WRITER).await;
        }
        info!(stream = %self.stream, segment = self.segment_seq, "segment writer aborted");
    }
}

fn summary(state: &WriterState) -> SegmentWriterSummary {
    SegmentWriterSummary {
        last_entry_id: state.last_entry_id,
        last_data_entry: state.last_data_entry,
        last_data_slot: state.last_data_slot,
        last_txid: state.last_acked_txid,
        data_records: state.data_records,
    }
}

/// Periodic flusher: transmit new data, or write a synthetic control record
/// so readers observe the advance of last-confirmed.
fn spawn_flusher(inner: &Arc<Inner>, period_ms: u64) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis((period_ms / 2).max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else { return };
            let mut state = inner.state.lock();
            if state.closed || state.errored.is_some() {
                return;
            }
            if !state.active.is_empty() {
                inner.seal_locked(&mut state);
                inner.pump_locked(&mut state);
            } else if state.control_flush_needed && !state.inflight && state.sealed.is_empty() {
                inner.enqueue_control_locked(&mut state);
                inner.pump_locked(&mut state);
            }
        }
    })
}

/// Lock-loss observer: session expiry flips the writer into errored state
fn spawn_lock_watch(inner: &Arc<Inner>, mut lost: watch::Receiver<bool>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        while !*lost.borrow() {
            if lost.changed().await.is_err() {
                return;
            }
        }
        let Some(inner) = weak.upgrade() else { return };
        let mut state = inner.state.lock();
        if state.closed {
            return;
        }
        warn!(
            stream = %inner.stream,
            segment = inner.segment_seq,
            "stream lock lost, writer errored"
        );
        let err = WriteError::LockLost;
        if state.errored.is_none() {
            state.errored = Some(err.clone());
        }
        inner.fail_buffered_locked(&mut state, &err);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EntryRecordReader;
    use crate::store::{MemorySegmentStore, SegmentStore};
    use crate::Position;
    use bytes::Bytes;

    fn config(output_buffer_size: usize) -> StreamConfig {
        let mut config = StreamConfig::default();
        config.writer.output_buffer_size = output_buffer_size;
        config.writer.periodic_flush_ms = 0;
        config
    }

    async fn writer(output_buffer_size: usize) -> (Arc<MemorySegmentStore>, SegmentWriter) {
        let store = MemorySegmentStore::new();
        let handle = store.create().await.unwrap();
        let writer = SegmentWriter::new("s1", 1, handle, &config(output_buffer_size), None);
        (store, writer)
    }

    #[tokio::test]
    async fn test_immediate_transmit_assigns_entry_per_record() {
        let (_, writer) = writer(0).await;
        for i in 0..5i64 {
            let position = writer.write(Record::new(i + 1, format!("record-{i}"))).await.unwrap();
            assert_eq!(position, Position::new(1, i, 0));
        }
        assert_eq!(writer.record_count(), 5);
    }

    #[tokio::test]
    async fn test_packing_multiple_records_per_entry() {
        let (_, writer) = writer(8 * 1024).await;
        let futures = writer.write_bulk(
            (0..10i64).map(|i| Record::new(i + 1, vec![0u8; 64])).collect(),
        );
        let mut slots = Vec::new();
        for future in futures {
            let position = future.await.unwrap();
            assert_eq!(position.entry_id, 0);
            slots.push(position.slot_id);
        }
        assert_eq!(slots, (0..10).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_over_limit_leaves_state_unchanged() {
        let (_, writer) = writer(8 * 1024).await;
        let result = writer.write(Record::new(1, vec![0u8; MAX_RECORD_SIZE + 1])).await;
        assert!(matches!(result, Err(WriteError::OverLimit { .. })));
        assert!(!writer.is_errored());
        assert_eq!(writer.record_count(), 0);

        // the writer keeps working and positions start at the beginning
        let position = writer.write_bulk(vec![Record::new(1, &b"ok"[..])])
            .remove(0)
            .await
            .unwrap();
        assert_eq!(position, Position::new(1, 0, 0));
    }

    #[tokio::test]
    async fn test_reserved_txids_rejected() {
        let (_, writer) = writer(0).await;
        assert!(matches!(
            writer.write(Record::new(-1, &b"x"[..])).await,
            Err(WriteError::InvalidTxId(-1))
        ));
        assert!(matches!(
            writer.write(Record::new(MAX_TXID, &b"x"[..])).await,
            Err(WriteError::InvalidTxId(_))
        ));
    }

    #[tokio::test]
    async fn test_flush_returns_last_acked_txid_and_advances_visibility() {
        let (store, writer) = writer(64 * 1024).await;
        let futures = writer.write_bulk(
            (0..3i64).map(|i| Record::new(i + 10, &b"payload"[..])).collect(),
        );
        let last = writer.flush_and_sync().await.unwrap();
        assert_eq!(last, 12);
        for future in futures {
            future.await.unwrap();
        }

        // the trailing control record makes the data entry visible
        let reader = store.open(1, false).await.unwrap();
        let lac = reader.last_confirmed().await.unwrap();
        assert!(lac >= 0);
        let entries = reader.read_entries(0, 0).await.unwrap();
        let mut records = EntryRecordReader::new(1, 0, entries[0].payload.clone());
        let (_, first) = records.next_record().unwrap().unwrap();
        assert_eq!(first.txid, 10);
    }

    #[tokio::test]
    async fn test_end_of_stream_rejects_further_writes() {
        let (_, writer) = writer(0).await;
        writer.write(Record::new(1, &b"a"[..])).await.unwrap();
        writer.mark_end_of_stream().await.unwrap();
        assert!(matches!(
            writer.write(Record::new(2, &b"b"[..])).await,
            Err(WriteError::EndOfStream)
        ));
    }

    #[tokio::test]
    async fn test_fencing_errors_are_sticky() {
        let (store, writer) = writer(0).await;
        writer.write(Record::new(1, &b"a"[..])).await.unwrap();

        // a newer owner fences the segment
        store.open(1, true).await.unwrap();
        assert!(matches!(
            writer.write(Record::new(2, &b"b"[..])).await,
            Err(WriteError::Transmit(_))
        ));
        assert!(writer.is_errored());
        // sticky: later writes fail without reaching the store
        assert!(matches!(
            writer.write(Record::new(3, &b"c"[..])).await,
            Err(WriteError::Transmit(_))
        ));
        assert!(matches!(
            writer.flush_and_sync().await,
            Err(WriteError::Transmit(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_cancels_pending() {
        let store = MemorySegmentStore::new();
        let handle = store.create().await.unwrap();
        // large buffer, no flusher: the write stays buffered
        let writer = SegmentWriter::new("s1", 1, handle, &config(64 * 1024), None);
        let future = writer.write(Record::new(1, &b"a"[..]));
        writer.abort().await;
        assert!(matches!(future.await, Err(WriteError::Cancelled)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_, writer) = writer(0).await;
        writer.write(Record::new(1, Bytes::from_static(b"a"))).await.unwrap();
        let first = writer.close(false).await.unwrap();
        let second = writer.close(false).await.unwrap();
        assert_eq!(first.last_txid, 1);
        assert_eq!(second.last_txid, 1);
        assert_eq!(first.last_data_entry, 0);
        assert_eq!(first.last_data_slot, 0);
    }

    #[tokio::test]
    async fn test_periodic_flusher_transmits_buffered_records() {
        let store = MemorySegmentStore::new();
        let handle = store.create().await.unwrap();
        let mut config = config(64 * 1024);
        config.writer.periodic_flush_ms = 20;
        let writer = SegmentWriter::new("s1", 1, handle, &config, None);

        // no explicit flush; the flusher must pick this up
        let position = writer.write(Record::new(1, &b"a"[..])).await.unwrap();
        assert_eq!(position, Position::new(1, 0, 0));
        writer.close(false).await.unwrap();
    }
}
