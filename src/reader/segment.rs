//! Cursor over one segment
//!
//! Opens the segment's store handle without fencing, positions itself at
//! the first record at or past the requested position, and serves records
//! until the visible last-confirmed boundary. The skip scans record headers
//! only; payload bytes are never materialized for skipped records.

use super::readahead::ReadAheadWorker;
use super::ReadError;
use crate::config::ReaderConfig;
use crate::meta::SegmentMetadata;
use crate::position::Position;
use crate::record::{EntryRecordReader, Record};
use crate::store::{Entry, HandleCache, SegmentHandle};
use std::sync::Arc;
use tracing::debug;

pub(crate) struct SegmentCursor {
    meta: SegmentMetadata,
    handle: Arc<dyn SegmentHandle>,
    cache: Arc<HandleCache>,
    readahead: Option<ReadAheadWorker>,
    next_entry: i64,
    current: Option<EntryRecordReader>,
    last_confirmed: i64,
    skip_to: Option<Position>,
}

impl SegmentCursor {
    pub async fn open(
        meta: SegmentMetadata,
        cache: Arc<HandleCache>,
        start: Position,
        config: &ReaderConfig,
    ) -> Result<Self, ReadError> {
        let handle = cache.get_or_open(meta.store_id).await?;
        let last_confirmed = handle.last_confirmed().await?;
        let (next_entry, skip_to) = if start.segment_seq == meta.segment_seq {
            (start.entry_id.max(0), Some(start))
        } else {
            (0, None)
        };
        let readahead = config
            .readahead_enabled
            .then(|| ReadAheadWorker::spawn(Arc::clone(&handle), next_entry, config));
        debug!(
            segment = meta.segment_seq,
            next_entry, last_confirmed, "segment cursor opened"
        );
        Ok(Self {
            meta,
            handle,
            cache,
            readahead,
            next_entry,
            current: None,
            last_confirmed,
            skip_to,
        })
    }

    pub fn segment_seq(&self) -> i64 {
        self.meta.segment_seq
    }

    pub fn is_complete(&self) -> bool {
        !self.meta.is_in_progress()
    }

    /// Adopt refreshed metadata, typically after a completion watch fired
    pub fn update_meta(&mut self, meta: SegmentMetadata) {
        self.meta = meta;
    }

    /// No buffered record and nothing visible past the cursor
    pub fn is_drained(&self) -> bool {
        self.current.is_none() && self.next_entry > self.last_confirmed
    }

    /// Refresh the visible last-confirmed boundary
    pub async fn refresh(&mut self) -> Result<i64, ReadError> {
        self.last_confirmed = self.handle.last_confirmed().await?;
        Ok(self.last_confirmed)
    }

    /// Next record in the segment, or `None` once the cursor has drained
    /// everything visible. `force_blocking` bypasses the read-ahead cache.
    pub async fn next_record(
        &mut self,
        force_blocking: bool,
    ) -> Result<Option<(Position, Record)>, ReadError> {
        loop {
            if let Some(reader) = &mut self.current {
                if let Some(item) = reader.next_record()? {
                    return Ok(Some(item));
                }
                self.current = None;
                self.next_entry += 1;
            }
            if self.next_entry > self.last_confirmed {
                return Ok(None);
            }
            let Some(entry) = self.fetch_entry(force_blocking).await? else {
                return Ok(None);
            };
            let mut reader =
                EntryRecordReader::new(self.meta.segment_seq, entry.entry_id, entry.payload);
            if let Some(target) = self.skip_to.take() {
                if target.entry_id == entry.entry_id {
                    let skipped = reader.skip_until(target)?;
                    if skipped > 0 {
                        debug!(
                            segment = self.meta.segment_seq,
                            entry = entry.entry_id,
                            skipped,
                            "skipped records below start position"
                        );
                    }
                }
            }
            self.current = Some(reader);
        }
    }

    /// Serve from the read-ahead cache when populated, falling back to a
    /// synchronous read when the record is urgently required.
    async fn fetch_entry(&mut self, force_blocking: bool) -> Result<Option<Entry>, ReadError> {
        if !force_blocking {
            if let Some(readahead) = &self.readahead {
                if let Some(entry) = readahead.take(self.next_entry) {
                    return Ok(Some(entry));
                }
            }
        }
        let entries = self
            .handle
            .read_entries(self.next_entry, self.next_entry)
            .await?;
        Ok(entries.into_iter().next())
    }

    pub fn readahead_state(&self) -> Option<String> {
        self.readahead.as_ref().map(|worker| worker.dump_state())
    }

    /// Drop the read-ahead worker and, for complete segments, the shared
    /// cached handle.
    pub async fn close(self) {
        drop(self.readahead);
        if !self.meta.is_in_progress() {
            self.cache.evict(self.meta.store_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::record::Record;
    use crate::store::{MemorySegmentStore, SegmentStore};
    use crate::writer::SegmentWriter;

    async fn packed_segment(records_per_entry: usize, entries: usize) -> (Arc<HandleCache>, SegmentMetadata) {
        let store = MemorySegmentStore::new();
        let handle = store.create().await.unwrap();
        let store_id = handle.segment_id();

        let mut config = StreamConfig::default();
        config.writer.output_buffer_size = crate::record::MAX_TRANSMISSION_SIZE;
        config.writer.periodic_flush_ms = 0;
        let writer = SegmentWriter::new("s1", 1, handle, &config, None);
        let mut txid = 0i64;
        for _ in 0..entries {
            let batch: Vec<Record> = (0..records_per_entry)
                .map(|_| {
                    txid += 1;
                    Record::new(txid, format!("payload-{txid}"))
                })
                .collect();
            for future in writer.write_bulk(batch) {
                future.await.unwrap();
            }
        }
        writer.close(false).await.unwrap();

        let mut meta = SegmentMetadata::in_progress(1, store_id, 1, 0);
        meta.state = crate::meta::SegmentState::Complete;
        meta.last_txid = txid;
        (HandleCache::new(store), meta)
    }

    #[tokio::test]
    async fn test_reads_records_in_order() {
        let (cache, meta) = packed_segment(3, 4).await;
        let config = StreamConfig::default().reader;
        let mut cursor = SegmentCursor::open(meta, cache, Position::INITIAL, &config)
            .await
            .unwrap();

        let mut txids = Vec::new();
        let mut last = Position::INVALID;
        while let Some((position, record)) = cursor.next_record(false).await.unwrap() {
            if record.is_control() {
                continue;
            }
            assert!(position > last);
            last = position;
            txids.push(record.txid);
        }
        assert_eq!(txids, (1..=12).collect::<Vec<i64>>());
        assert!(cursor.is_drained());
    }

    #[tokio::test]
    async fn test_skip_to_mid_entry_position() {
        let (cache, meta) = packed_segment(4, 2).await;
        let config = StreamConfig::default().reader;
        // start in the middle of entry 1
        let start = Position::new(1, 1, 2);
        let mut cursor = SegmentCursor::open(meta, cache, start, &config)
            .await
            .unwrap();
        let (position, record) = cursor.next_record(false).await.unwrap().unwrap();
        assert_eq!(position, start);
        assert_eq!(record.txid, 7);
    }

    #[tokio::test]
    async fn test_forced_blocking_read_bypasses_cache() {
        let (cache, meta) = packed_segment(2, 2).await;
        let mut config = StreamConfig::default().reader;
        config.readahead_enabled = false;
        let mut cursor = SegmentCursor::open(meta, cache, Position::INITIAL, &config)
            .await
            .unwrap();
        assert!(cursor.readahead_state().is_none());
        let (position, _) = cursor.next_record(true).await.unwrap().unwrap();
        assert_eq!(position, Position::new(1, 0, 0));
    }
}
