//! Continuous stream reader
//!
//! Serves ordered reads across segment boundaries: opens segments in order,
//! tails the in-progress segment against its last-confirmed boundary, and
//! sleeps on a coordinator watch when the tail is quiet. Requests are
//! served by a single loop, so pending reads resolve strictly in order.

use super::segment::SegmentCursor;
use super::ReadError;
use crate::config::StreamConfig;
use crate::coord::Coordinator;
use crate::meta::MetadataStore;
use crate::position::Position;
use crate::record::Record;
use crate::store::HandleCache;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum Request {
    Next {
        tx: oneshot::Sender<Result<(Position, Record), ReadError>>,
    },
    Bulk {
        max: usize,
        tx: oneshot::Sender<Result<Vec<(Position, Record)>, ReadError>>,
    },
}

/// Ordered reader over one stream
pub struct LogReader {
    stream: String,
    req_tx: mpsc::UnboundedSender<Request>,
    driver: JoinHandle<()>,
}

impl LogReader {
    /// Open a reader positioned at `start`. Fails if the stream does not
    /// exist yet.
    pub async fn open(
        stream: &str,
        start: Position,
        config: StreamConfig,
        cache: Arc<HandleCache>,
        coord: Arc<dyn Coordinator>,
    ) -> Result<LogReader, ReadError> {
        let meta_store = Arc::new(MetadataStore::new(coord, &config.root, stream)?);
        if meta_store.list().await?.is_empty() {
            return Err(ReadError::LogNotFound(stream.to_string()));
        }
        info!(stream, start = %start, "log reader opened");

        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let driver = ReaderDriver {
            config,
            cache,
            meta_store,
            next_position: start,
            cursor: None,
            errored: None,
            last_delivery: Instant::now(),
            warned: false,
            force_blocking: false,
            rx: req_rx,
        };
        let driver = tokio::spawn(driver.run());
        Ok(LogReader {
            stream: stream.to_string(),
            req_tx,
            driver,
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Next user record in order. Blocks while tailing an in-progress
    /// segment with no new data.
    pub async fn read_next(&self) -> Result<(Position, Record), ReadError> {
        let (tx, rx) = oneshot::channel();
        self.req_tx
            .send(Request::Next { tx })
            .map_err(|_| ReadError::Closed)?;
        rx.await.map_err(|_| ReadError::Closed)?
    }

    /// Up to `max` records. Blocks for the first record, then returns what
    /// is immediately available.
    pub async fn read_bulk(&self, max: usize) -> Result<Vec<(Position, Record)>, ReadError> {
        let (tx, rx) = oneshot::channel();
        self.req_tx
            .send(Request::Bulk { max, tx })
            .map_err(|_| ReadError::Closed)?;
        rx.await.map_err(|_| ReadError::Closed)?
    }

    /// Stop the reader, releasing its watches and read-ahead workers
    pub fn close(self) {}
}

impl Drop for LogReader {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

struct ReaderDriver {
    config: StreamConfig,
    cache: Arc<HandleCache>,
    meta_store: Arc<MetadataStore>,
    next_position: Position,
    cursor: Option<SegmentCursor>,
    errored: Option<ReadError>,
    last_delivery: Instant,
    warned: bool,
    force_blocking: bool,
    rx: mpsc::UnboundedReceiver<Request>,
}

impl ReaderDriver {
    async fn run(mut self) {
        while let Some(request) = self.rx.recv().await {
            match request {
                Request::Next { tx } => {
                    let result = match &self.errored {
                        Some(err) => Err(err.clone()),
                        None => {
                            let cancelled = || tx.is_closed();
                            self.next_user_record(&cancelled).await
                        }
                    };
                    if let Err(err) = &result {
                        self.errored.get_or_insert(err.clone());
                    }
                    if tx.send(result).is_err() {
                        self.fail_cancelled();
                    }
                }
                Request::Bulk { max, tx } => {
                    let result = match &self.errored {
                        Some(err) => Err(err.clone()),
                        None => {
                            let cancelled = || tx.is_closed();
                            self.bulk(max, &cancelled).await
                        }
                    };
                    if let Err(err) = &result {
                        self.errored.get_or_insert(err.clone());
                    }
                    if tx.send(result).is_err() {
                        self.fail_cancelled();
                    }
                }
            }
        }
        debug!(stream = %self.meta_store.stream(), "read loop terminated");
    }

    /// The consumer dropped the oldest pending read; it can no longer know
    /// what was consumed, so the reader is done.
    fn fail_cancelled(&mut self) {
        warn!(
            stream = %self.meta_store.stream(),
            "pending read cancelled by consumer, reader errored"
        );
        self.errored.get_or_insert(ReadError::ReadCancelled);
    }

    async fn next_user_record(
        &mut self,
        cancelled: &impl Fn() -> bool,
    ) -> Result<(Position, Record), ReadError> {
        loop {
            if cancelled() {
                return Err(ReadError::ReadCancelled);
            }
            if self.cursor.is_none() {
                self.open_next_cursor(cancelled).await?;
            }
            let force = self.force_blocking;
            let cursor = self.cursor.as_mut().expect("cursor just opened");
            match cursor.next_record(force).await? {
                Some((position, record)) => {
                    self.next_position = position.advance_slot();
                    if record.is_end_of_stream() {
                        info!(stream = %self.meta_store.stream(), "terminal record reached");
                        return Err(ReadError::EndOfStream);
                    }
                    if record.is_control() {
                        continue;
                    }
                    self.mark_delivered();
                    return Ok((position, record));
                }
                None => {
                    let drained_complete = cursor.is_complete() && cursor.is_drained();
                    let segment_seq = cursor.segment_seq();
                    if drained_complete {
                        self.advance_past(segment_seq).await;
                    } else {
                        self.wait_for_tail(cancelled).await?;
                    }
                }
            }
        }
    }

    /// Non-blocking attempt used past the first record of a bulk read
    async fn try_next_user_record(&mut self) -> Result<Option<(Position, Record)>, ReadError> {
        loop {
            if self.cursor.is_none() && !self.try_open_cursor().await? {
                return Ok(None);
            }
            let cursor = self.cursor.as_mut().expect("cursor just opened");
            match cursor.next_record(false).await? {
                Some((position, record)) => {
                    self.next_position = position.advance_slot();
                    if record.is_end_of_stream() {
                        return Err(ReadError::EndOfStream);
                    }
                    if record.is_control() {
                        continue;
                    }
                    self.mark_delivered();
                    return Ok(Some((position, record)));
                }
                None => {
                    let drained_complete = cursor.is_complete() && cursor.is_drained();
                    let segment_seq = cursor.segment_seq();
                    if drained_complete {
                        self.advance_past(segment_seq).await;
                        continue;
                    }
                    cursor.refresh().await?;
                    if self.cursor.as_ref().expect("cursor present").is_drained() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn bulk(
        &mut self,
        max: usize,
        cancelled: &impl Fn() -> bool,
    ) -> Result<Vec<(Position, Record)>, ReadError> {
        let mut records = Vec::new();
        while records.len() < max {
            if records.is_empty() {
                records.push(self.next_user_record(cancelled).await?);
                continue;
            }
            match self.try_next_user_record().await {
                Ok(Some(item)) => records.push(item),
                Ok(None) => break,
                Err(ReadError::EndOfStream) => {
                    // surface the terminal on the next read
                    self.errored.get_or_insert(ReadError::EndOfStream);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// Pick the first segment whose range contains or exceeds the cursor
    /// position, waiting for the segment list to change when none does.
    async fn open_next_cursor(&mut self, cancelled: &impl Fn() -> bool) -> Result<(), ReadError> {
        loop {
            if self.try_open_cursor().await? {
                return Ok(());
            }
            let watch = self.meta_store.watch_segments().await?;
            tokio::select! {
                _ = watch => {}
                _ = tokio::time::sleep(self.config.reader.poll_interval()) => {}
            }
            if cancelled() {
                return Err(ReadError::ReadCancelled);
            }
            self.check_idle()?;
        }
    }

    async fn try_open_cursor(&mut self) -> Result<bool, ReadError> {
        let segments = self.meta_store.list().await?;
        let candidate = segments
            .iter()
            .find(|meta| meta.reaches(self.next_position))
            .cloned();
        match candidate {
            Some(meta) if meta.truncated => Err(ReadError::PositionTruncated(self.next_position)),
            Some(meta) => {
                debug!(
                    stream = %self.meta_store.stream(),
                    segment = meta.segment_seq,
                    from = %self.next_position,
                    "opening segment"
                );
                let cursor = SegmentCursor::open(
                    meta,
                    Arc::clone(&self.cache),
                    self.next_position,
                    &self.config.reader,
                )
                .await?;
                self.cursor = Some(cursor);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// A fully drained complete segment: close it and move to the next
    async fn advance_past(&mut self, segment_seq: i64) {
        if let Some(cursor) = self.cursor.take() {
            cursor.close().await;
        }
        let next = Position::new(segment_seq + 1, 0, -1);
        if next > self.next_position {
            self.next_position = next;
        }
        debug!(
            stream = %self.meta_store.stream(),
            segment = segment_seq,
            "segment drained"
        );
    }

    /// In-progress segment with nothing visible: wait on the completion
    /// watch or the poll interval, then refresh last-confirmed.
    async fn wait_for_tail(&mut self, cancelled: &impl Fn() -> bool) -> Result<(), ReadError> {
        let segment_seq = self
            .cursor
            .as_ref()
            .expect("tailing without a cursor")
            .segment_seq();
        let completion = self.meta_store.watch_completion(segment_seq).await?;
        tokio::select! {
            event = completion => {
                if event.is_ok() {
                    let meta = self.meta_store.read(segment_seq).await?;
                    if let Some(cursor) = self.cursor.as_mut() {
                        cursor.update_meta(meta);
                    }
                }
            }
            _ = tokio::time::sleep(self.config.reader.poll_interval()) => {}
        }
        if cancelled() {
            return Err(ReadError::ReadCancelled);
        }
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.refresh().await?;
        }
        self.check_idle()
    }

    fn mark_delivered(&mut self) {
        self.last_delivery = Instant::now();
        self.warned = false;
        self.force_blocking = false;
    }

    /// Idle thresholds: warn once (with read-ahead state), force blocking
    /// reads after a second warn period, fail after the error threshold.
    fn check_idle(&mut self) -> Result<(), ReadError> {
        let reader = &self.config.reader;
        let elapsed = self.last_delivery.elapsed().as_millis() as u64;
        if reader.error_idle_ms > 0 && elapsed >= reader.error_idle_ms {
            return Err(ReadError::IdleReader(elapsed));
        }
        if reader.warn_idle_ms > 0 && elapsed >= reader.warn_idle_ms {
            if !self.warned {
                let readahead = self
                    .cursor
                    .as_ref()
                    .and_then(|cursor| cursor.readahead_state())
                    .unwrap_or_else(|| "readahead{disabled}".to_string());
                warn!(
                    stream = %self.meta_store.stream(),
                    idle_ms = elapsed,
                    %readahead,
                    "reader idle"
                );
                self.warned = true;
            } else if elapsed >= 2 * reader.warn_idle_ms && !self.force_blocking {
                warn!(
                    stream = %self.meta_store.stream(),
                    idle_ms = elapsed,
                    "reader still idle, forcing blocking reads"
                );
                self.force_blocking = true;
            }
        }
        Ok(())
    }
}
