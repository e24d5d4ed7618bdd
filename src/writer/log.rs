//! Stream-level write orchestrator
//!
//! All user-visible operations are serialized through one ordered,
//! single-consumer task loop bound to the stream; the loop owns zero or one
//! segment writer and drives rolling, recovery and completion against the
//! metadata store. Futures returned to callers resolve when the underlying
//! record promise resolves.

use super::segment::SegmentWriter;
use super::transmit::{PendingWrite, WriteFuture};
use super::{WriteError, LOCK_REASON_WRITER};
use crate::config::StreamConfig;
use crate::coord::{Coordinator, StreamLock};
use crate::meta::{MetadataStore, SegmentMetadata};
use crate::position::Position;
use crate::record::{EntryRecordReader, Record, EMPTY_SEGMENT_TXID, INVALID_TXID, MAX_TXID};
use crate::store::SegmentStore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

enum Task {
    Write {
        record: Record,
        promise: PendingWrite,
    },
    WriteBulk {
        records: Vec<Record>,
        promises: Vec<PendingWrite>,
    },
    Flush {
        done: oneshot::Sender<Result<i64, WriteError>>,
    },
    Truncate {
        position: Position,
        done: oneshot::Sender<Result<usize, WriteError>>,
    },
    MarkEnd {
        done: oneshot::Sender<Result<(), WriteError>>,
    },
    Close {
        done: oneshot::Sender<Result<(), WriteError>>,
    },
}

enum Flow {
    Continue,
    Roll { trigger_txid: i64 },
    Shutdown,
}

struct Shared {
    last_txid: AtomicI64,
    pending_drained: AtomicU64,
    rolls: AtomicU64,
}

/// Single-owner writer for one stream
pub struct LogWriter {
    stream: String,
    task_tx: mpsc::UnboundedSender<Task>,
    driver: JoinHandle<()>,
    shared: Arc<Shared>,
}

impl LogWriter {
    /// Acquire stream ownership, recover any in-progress segment left by a
    /// previous owner, and start the ordered write loop.
    pub async fn open(
        stream: &str,
        config: StreamConfig,
        store: Arc<dyn SegmentStore>,
        coord: Arc<dyn Coordinator>,
    ) -> Result<LogWriter, WriteError> {
        let meta_store = Arc::new(MetadataStore::new(Arc::clone(&coord), &config.root, stream)?);
        let lock = StreamLock::new(coord, meta_store.lock_dir());
        lock.acquire(LOCK_REASON_WRITER, config.lock.acquire_timeout())
            .await?;

        let recovered = match recover(&meta_store, &store).await {
            Ok(recovered) => recovered,
            Err(e) => {
                let _ = lock.release(LOCK_REASON_WRITER).await;
                return Err(e);
            }
        };
        info!(
            stream,
            next_segment = recovered.next_seq,
            last_txid = recovered.last_txid,
            ended = recovered.ended,
            "log writer opened"
        );

        let shared = Arc::new(Shared {
            last_txid: AtomicI64::new(recovered.last_txid.max(0)),
            pending_drained: AtomicU64::new(0),
            rolls: AtomicU64::new(0),
        });
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            config,
            store,
            meta_store,
            lock,
            shared: Arc::clone(&shared),
            current: None,
            next_segment_seq: recovered.next_seq,
            errored: None,
            stream_ended: recovered.ended,
            rx: task_rx,
        };
        let driver = tokio::spawn(driver.run());
        Ok(LogWriter {
            stream: stream.to_string(),
            task_tx,
            driver,
            shared,
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Append one record; the future resolves with its position
    pub fn write(&self, record: Record) -> WriteFuture {
        let (promise, future) = WriteFuture::channel(record.txid);
        if self.task_tx.send(Task::Write { record, promise }).is_err() {
            return WriteFuture::failed(WriteError::Closed);
        }
        future
    }

    /// Append a batch atomically as one ordered task sharing one trailing
    /// transmission
    pub fn write_bulk(&self, records: Vec<Record>) -> Vec<WriteFuture> {
        let mut promises = Vec::with_capacity(records.len());
        let mut futures = Vec::with_capacity(records.len());
        for record in &records {
            let (promise, future) = WriteFuture::channel(record.txid);
            promises.push(promise);
            futures.push(future);
        }
        if self
            .task_tx
            .send(Task::WriteBulk { records, promises })
            .is_err()
        {
            return futures
                .into_iter()
                .map(|_| WriteFuture::failed(WriteError::Closed))
                .collect();
        }
        futures
    }

    /// Flush and sync the current segment; returns the last acknowledged
    /// transaction id
    pub async fn flush(&self) -> Result<i64, WriteError> {
        self.request(|done| Task::Flush { done }).await?
    }

    /// Mark every segment entirely below `position` as truncated.
    /// Idempotent; returns how many segments were newly marked.
    pub async fn truncate(&self, position: Position) -> Result<usize, WriteError> {
        self.request(|done| Task::Truncate { position, done }).await?
    }

    /// Write the terminal record; the stream accepts no user records after
    pub async fn mark_end_of_stream(&self) -> Result<(), WriteError> {
        self.request(|done| Task::MarkEnd { done }).await?
    }

    /// Drain the task queue, complete the current segment and release the
    /// stream lock
    pub async fn close_and_complete(self) -> Result<(), WriteError> {
        let (done, rx) = oneshot::channel();
        if self.task_tx.send(Task::Close { done }).is_err() {
            return Ok(());
        }
        let result = rx.await.map_err(|_| WriteError::Closed)?;
        let _ = self.driver.await;
        result
    }

    /// Highest transaction id accepted by this writer
    pub fn last_txid(&self) -> i64 {
        self.shared.last_txid.load(Ordering::SeqCst)
    }

    /// Writes queued during rolls and drained afterwards
    pub fn pending_drained(&self) -> u64 {
        self.shared.pending_drained.load(Ordering::SeqCst)
    }

    /// Segment rolls performed by this writer
    pub fn rolls(&self) -> u64 {
        self.shared.rolls.load(Ordering::SeqCst)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, WriteError>>) -> Task,
    ) -> Result<Result<T, WriteError>, WriteError> {
        let (done, rx) = oneshot::channel();
        self.task_tx
            .send(make(done))
            .map_err(|_| WriteError::Closed)?;
        rx.await.map_err(|_| WriteError::Closed)
    }
}

struct CurrentSegment {
    meta: SegmentMetadata,
    writer: SegmentWriter,
}

struct Driver {
    config: StreamConfig,
    store: Arc<dyn SegmentStore>,
    meta_store: Arc<MetadataStore>,
    lock: Arc<StreamLock>,
    shared: Arc<Shared>,
    current: Option<CurrentSegment>,
    next_segment_seq: i64,
    errored: Option<WriteError>,
    stream_ended: bool,
    rx: mpsc::UnboundedReceiver<Task>,
}

impl Driver {
    async fn run(mut self) {
        let mut backlog: VecDeque<Task> = VecDeque::new();
        loop {
            let task = match backlog.pop_front() {
                Some(task) => task,
                None => match self.rx.recv().await {
                    Some(task) => task,
                    None => break,
                },
            };
            match self.handle(task).await {
                Flow::Continue => {}
                Flow::Roll { trigger_txid } => {
                    backlog.extend(self.roll(trigger_txid).await);
                }
                Flow::Shutdown => break,
            }
        }
        debug!(stream = %self.meta_store.stream(), "write loop terminated");
    }

    async fn handle(&mut self, task: Task) -> Flow {
        match task {
            Task::Write { record, promise } => self.handle_write(record, promise).await,
            Task::WriteBulk { records, promises } => self.handle_bulk(records, promises).await,
            Task::Flush { done } => {
                let _ = done.send(self.flush_current().await);
                Flow::Continue
            }
            Task::Truncate { position, done } => {
                let result = self
                    .meta_store
                    .mark_truncated_below(position)
                    .await
                    .map_err(WriteError::from);
                let _ = done.send(result);
                Flow::Continue
            }
            Task::MarkEnd { done } => {
                let _ = done.send(self.mark_end().await);
                Flow::Continue
            }
            Task::Close { done } => {
                let _ = done.send(self.close_all().await);
                Flow::Shutdown
            }
        }
    }

    async fn handle_write(&mut self, record: Record, promise: PendingWrite) -> Flow {
        let txid = record.txid;
        match self.dispatch_record(record, promise).await {
            Some(()) if self.should_roll() => Flow::Roll { trigger_txid: txid },
            _ => Flow::Continue,
        }
    }

    async fn handle_bulk(&mut self, records: Vec<Record>, promises: Vec<PendingWrite>) -> Flow {
        let mut trigger_txid = None;
        for (record, promise) in records.into_iter().zip(promises) {
            let txid = record.txid;
            if self.dispatch_record(record, promise).await.is_some() {
                trigger_txid = Some(txid);
            }
        }
        if let Some(current) = &self.current {
            current.writer.transmit();
        }
        match trigger_txid {
            Some(txid) if self.should_roll() => Flow::Roll { trigger_txid: txid },
            _ => Flow::Continue,
        }
    }

    /// Hand one record to the current segment writer. Returns `Some(())`
    /// when the record was actually dispatched.
    async fn dispatch_record(&mut self, record: Record, promise: PendingWrite) -> Option<()> {
        if let Some(err) = &self.errored {
            promise.fail(err.clone());
            return None;
        }
        if self.stream_ended {
            promise.fail(WriteError::EndOfStream);
            return None;
        }
        let txid = record.txid;
        if txid >= 0 && txid != MAX_TXID {
            let last = self.shared.last_txid.load(Ordering::SeqCst);
            if txid < last {
                promise.fail(WriteError::TransactionOutOfOrder {
                    txid,
                    last_txid: last,
                });
                return None;
            }
        }
        if self.current.is_none() {
            if let Err(e) = self.open_segment(txid.max(0)).await {
                self.fail_fatal(e.clone());
                promise.fail(e);
                return None;
            }
        }
        let current = self.current.as_ref().expect("segment writer just opened");
        current.writer.write_with(record, promise, false);
        self.shared.last_txid.fetch_max(txid, Ordering::SeqCst);
        Some(())
    }

    fn should_roll(&self) -> bool {
        if !self.config.rolling.enabled {
            return false;
        }
        let Some(current) = &self.current else {
            return false;
        };
        let policy = &self.config.rolling;
        (policy.max_segment_records > 0
            && current.writer.record_count() >= policy.max_segment_records)
            || (policy.max_segment_bytes > 0
                && current.writer.byte_count() >= policy.max_segment_bytes)
    }

    /// Complete the current segment and open its successor. Writes arriving
    /// while the roll is in flight queue as pending (or fail fast when so
    /// configured) and drain in arrival order afterwards.
    async fn roll(&mut self, trigger_txid: i64) -> Vec<Task> {
        info!(
            stream = %self.meta_store.stream(),
            trigger_txid,
            "rolling segment"
        );
        self.shared.rolls.fetch_add(1, Ordering::SeqCst);

        let mut pending: Vec<Task> = Vec::new();
        let mut channel_open = true;
        let flush_result = {
            let writer = &self.current.as_ref().expect("rolling without a segment").writer;
            let flush = writer.flush_and_sync();
            tokio::pin!(flush);
            loop {
                tokio::select! {
                    biased;
                    result = &mut flush => break result,
                    task = self.rx.recv(), if channel_open => match task {
                        Some(task) if self.config.writer.fail_fast_on_roll => match task {
                            Task::Write { promise, .. } => {
                                promise.fail(WriteError::StreamNotReady);
                            }
                            Task::WriteBulk { promises, .. } => {
                                for promise in promises {
                                    promise.fail(WriteError::StreamNotReady);
                                }
                            }
                            other => pending.push(other),
                        },
                        Some(task) => pending.push(task),
                        None => channel_open = false,
                    },
                }
            }
        };

        match flush_result {
            Ok(_) => {
                let reopened = match self.complete_current().await {
                    Ok(()) => self.open_segment(trigger_txid).await,
                    Err(e) => Err(e),
                };
                match reopened {
                    Ok(()) => {
                        self.shared
                            .pending_drained
                            .fetch_add(pending.len() as u64, Ordering::SeqCst);
                    }
                    Err(e) => self.fail_fatal(e),
                }
            }
            Err(e) => self.fail_fatal(e),
        }
        pending
    }

    async fn open_segment(&mut self, start_txid: i64) -> Result<(), WriteError> {
        let handle = self.store.create().await?;
        let segment_seq = self.next_segment_seq;
        let meta = self
            .meta_store
            .create_in_progress(segment_seq, handle.segment_id(), start_txid, self.config.region_id)
            .await?;
        let writer = SegmentWriter::new(
            self.meta_store.stream(),
            segment_seq,
            handle,
            &self.config,
            Some(Arc::clone(&self.lock)),
        );
        self.next_segment_seq += 1;
        self.current = Some(CurrentSegment { meta, writer });
        Ok(())
    }

    async fn complete_current(&mut self) -> Result<(), WriteError> {
        let Some(current) = self.current.take() else {
            return Ok(());
        };
        let summary = current.writer.close(false).await?;
        let (last_entry, last_slot, last_txid) = if summary.data_records > 0 {
            (
                summary.last_data_entry,
                summary.last_data_slot,
                summary.last_txid,
            )
        } else {
            (summary.last_entry_id, -1, EMPTY_SEGMENT_TXID)
        };
        self.meta_store
            .complete(&current.meta, last_entry, last_slot, last_txid)
            .await?;
        Ok(())
    }

    async fn flush_current(&mut self) -> Result<i64, WriteError> {
        if let Some(err) = &self.errored {
            return Err(err.clone());
        }
        match &self.current {
            Some(current) => match current.writer.flush_and_sync().await {
                Ok(txid) => Ok(txid),
                Err(e) => {
                    self.fail_fatal(e.clone());
                    Err(e)
                }
            },
            None => Ok(self.shared.last_txid.load(Ordering::SeqCst)),
        }
    }

    async fn mark_end(&mut self) -> Result<(), WriteError> {
        if let Some(err) = &self.errored {
            return Err(err.clone());
        }
        if self.stream_ended {
            return Err(WriteError::EndOfStream);
        }
        if self.current.is_none() {
            let start = self.shared.last_txid.load(Ordering::SeqCst).max(0);
            self.open_segment(start).await?;
        }
        let current = self.current.as_ref().expect("segment writer just opened");
        match current.writer.mark_end_of_stream().await {
            Ok(()) => {
                self.stream_ended = true;
                info!(stream = %self.meta_store.stream(), "stream ended");
                Ok(())
            }
            Err(e) => {
                self.fail_fatal(e.clone());
                Err(e)
            }
        }
    }

    async fn close_all(&mut self) -> Result<(), WriteError> {
        let result = if self.errored.is_none() {
            self.complete_current().await
        } else if let Some(current) = self.current.take() {
            let _ = current.writer.close(false).await;
            Ok(())
        } else {
            Ok(())
        };
        if let Err(e) = self.lock.release(LOCK_REASON_WRITER).await {
            warn!(stream = %self.meta_store.stream(), error = %e, "lock release failed on close");
        }
        if let Err(e) = &result {
            error!(stream = %self.meta_store.stream(), error = %e, "close failed");
        }
        result
    }

    /// A fatal error cancels everything: further submissions and queued
    /// pending writes all fail with the root cause.
    fn fail_fatal(&mut self, err: WriteError) {
        error!(
            stream = %self.meta_store.stream(),
            error = %err,
            "log writer errored"
        );
        if self.errored.is_none() {
            self.errored = Some(err);
        }
    }
}

struct Recovered {
    next_seq: i64,
    last_txid: i64,
    ended: bool,
}

/// Complete any segment a previous owner left in progress: fence its store
/// object, scan it for the last record, and transition it to complete.
async fn recover(
    meta_store: &Arc<MetadataStore>,
    store: &Arc<dyn SegmentStore>,
) -> Result<Recovered, WriteError> {
    let mut recovered = Recovered {
        next_seq: 1,
        last_txid: INVALID_TXID,
        ended: false,
    };
    for meta in meta_store.list().await? {
        recovered.next_seq = recovered.next_seq.max(meta.segment_seq + 1);
        if meta.is_in_progress() {
            let (last_txid, ended) = recover_segment(meta_store, store, &meta).await?;
            recovered.last_txid = recovered.last_txid.max(last_txid);
            recovered.ended |= ended;
        } else {
            if meta.last_txid == MAX_TXID {
                recovered.ended = true;
            }
            if !meta.is_empty() {
                recovered.last_txid = recovered.last_txid.max(meta.last_txid);
            }
        }
    }
    Ok(recovered)
}

async fn recover_segment(
    meta_store: &Arc<MetadataStore>,
    store: &Arc<dyn SegmentStore>,
    meta: &SegmentMetadata,
) -> Result<(i64, bool), WriteError> {
    info!(
        stream = %meta_store.stream(),
        segment = meta.segment_seq,
        "recovering in-progress segment"
    );
    let handle = store.open(meta.store_id, true).await?;
    let last = handle.last_confirmed().await?;
    let mut last_txid = INVALID_TXID;
    let mut last_entry = -1i64;
    let mut last_slot = -1i64;
    let mut ended = false;
    if last >= 0 {
        for entry in handle.read_entries(0, last).await? {
            let mut records = EntryRecordReader::new(meta.segment_seq, entry.entry_id, entry.payload);
            while let Some((position, record)) = records
                .next_record()
                .map_err(|e| WriteError::Store(format!("corrupt entry during recovery: {e}")))?
            {
                if record.is_end_of_stream() {
                    ended = true;
                }
                if record.is_control() {
                    continue;
                }
                last_txid = last_txid.max(record.txid);
                last_entry = position.entry_id;
                last_slot = position.slot_id;
            }
        }
    }
    if last_entry >= 0 {
        meta_store
            .complete(meta, last_entry, last_slot, last_txid)
            .await?;
    } else {
        meta_store
            .complete(meta, last, -1, EMPTY_SEGMENT_TXID)
            .await?;
        last_txid = INVALID_TXID;
    }
    let _ = handle.close().await;
    Ok((last_txid, ended))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordinator;
    use crate::meta::SegmentState;
    use crate::store::MemorySegmentStore;

    fn test_config() -> StreamConfig {
        let mut config = StreamConfig::default();
        config.writer.output_buffer_size = 0;
        config.writer.periodic_flush_ms = 0;
        config.rolling.max_segment_bytes = 0;
        config.rolling.max_segment_records = 0;
        config
    }

    #[tokio::test]
    async fn test_write_and_complete() {
        let store = MemorySegmentStore::new();
        let coord = MemoryCoordinator::new();
        let writer = LogWriter::open("orders", test_config(), store, coord.clone())
            .await
            .unwrap();

        for i in 0..3i64 {
            let position = writer.write(Record::new(i + 1, format!("r-{i}"))).await.unwrap();
            assert_eq!(position.segment_seq, 1);
            assert_eq!(position.entry_id, i);
        }
        assert_eq!(writer.last_txid(), 3);
        writer.close_and_complete().await.unwrap();

        let meta_store = MetadataStore::new(coord, "/streamlog", "orders").unwrap();
        let segments = meta_store.list().await.unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].state, SegmentState::Complete);
        assert_eq!(segments[0].last_txid, 3);
        assert_eq!(segments[0].last_position(), Position::new(1, 2, 0));
    }

    #[tokio::test]
    async fn test_rolling_by_record_count() {
        let store = MemorySegmentStore::new();
        let coord = MemoryCoordinator::new();
        let mut config = test_config();
        config.rolling.max_segment_records = 2;
        let writer = LogWriter::open("orders", config, store, coord.clone())
            .await
            .unwrap();

        let mut positions = Vec::new();
        for i in 0..6i64 {
            positions.push(writer.write(Record::new(i + 1, &b"x"[..])).await.unwrap());
        }
        assert_eq!(writer.rolls(), 3);
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(positions[0].segment_seq, 1);
        assert_eq!(positions[2].segment_seq, 2);
        assert_eq!(positions[4].segment_seq, 3);
        writer.close_and_complete().await.unwrap();

        let meta_store = MetadataStore::new(coord, "/streamlog", "orders").unwrap();
        let segments = meta_store.list().await.unwrap();
        // the roll triggered by record 6 opened a trailing empty segment
        assert_eq!(segments.len(), 4);
        // a rolled segment starts at the txid of the record that forced it
        assert_eq!(segments[1].start_txid, 2);
        assert_eq!(segments[2].start_txid, 4);
    }

    #[tokio::test]
    async fn test_out_of_order_txid_rejected() {
        let store = MemorySegmentStore::new();
        let coord = MemoryCoordinator::new();
        let writer = LogWriter::open("orders", test_config(), store, coord)
            .await
            .unwrap();
        writer.write(Record::new(10, &b"a"[..])).await.unwrap();
        assert!(matches!(
            writer.write(Record::new(5, &b"b"[..])).await,
            Err(WriteError::TransactionOutOfOrder { .. })
        ));
        // the writer itself stays usable
        writer.write(Record::new(11, &b"c"[..])).await.unwrap();
        writer.close_and_complete().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_drains_queued_writes() {
        let store = MemorySegmentStore::new();
        let coord = MemoryCoordinator::new();
        let writer = LogWriter::open("orders", test_config(), store, coord)
            .await
            .unwrap();
        let futures: Vec<_> = (0..5i64)
            .map(|i| writer.write(Record::new(i + 1, &b"x"[..])))
            .collect();
        // close drains the task queue before completing the segment
        writer.close_and_complete().await.unwrap();
        let mut last = Position::INVALID;
        for future in futures {
            let position = future.await.unwrap();
            assert!(position > last);
            last = position;
        }
    }

    #[tokio::test]
    async fn test_recovery_completes_orphan_segment() {
        let store = MemorySegmentStore::new();
        let coord = MemoryCoordinator::new();
        {
            let writer = LogWriter::open("orders", test_config(), store.clone(), coord.clone())
                .await
                .unwrap();
            writer.write(Record::new(1, &b"a"[..])).await.unwrap();
            writer.write(Record::new(2, &b"b"[..])).await.unwrap();
            // dropped without close: the segment stays in progress
            drop(writer);
        }
        coord.expire_session();

        let second = coord.attach();
        let writer = LogWriter::open("orders", test_config(), store, second.clone())
            .await
            .unwrap();
        assert_eq!(writer.last_txid(), 2);
        writer.write(Record::new(3, &b"c"[..])).await.unwrap();
        writer.close_and_complete().await.unwrap();

        let meta_store = MetadataStore::new(second, "/streamlog", "orders").unwrap();
        let segments = meta_store.list().await.unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].state, SegmentState::Complete);
        assert_eq!(segments[0].last_txid, 2);
        assert_eq!(segments[1].start_txid, 3);
    }
}
