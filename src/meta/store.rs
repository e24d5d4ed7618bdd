//! Segment metadata store over the coordinator
//!
//! Each segment owns one durable node carrying its metadata blob, plus an
//! in-progress marker node whose deletion signals completion to watchers.
//! The marker is durable rather than ephemeral: a crashed writer leaves its
//! segment in progress until the next owner recovers it.

use super::{validate_stream_name, MetadataError, SegmentMetadata, SegmentState};
use crate::coord::{CoordError, Coordinator, WatchEvent};
use crate::position::Position;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Metadata operations for one stream
pub struct MetadataStore {
    coord: Arc<dyn Coordinator>,
    stream: String,
    stream_root: String,
}

impl MetadataStore {
    pub fn new(
        coord: Arc<dyn Coordinator>,
        root: &str,
        stream: &str,
    ) -> Result<Self, MetadataError> {
        validate_stream_name(stream)?;
        Ok(Self {
            coord,
            stream: stream.to_string(),
            stream_root: format!("{root}/{stream}"),
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Lock directory for this stream's single-writer lock
    pub fn lock_dir(&self) -> String {
        format!("{}/lock", self.stream_root)
    }

    fn segment_path(&self, segment_seq: i64) -> String {
        format!("{}/segments/{segment_seq:020}", self.stream_root)
    }

    fn in_progress_path(&self, segment_seq: i64) -> String {
        format!("{}/inprogress/{segment_seq:020}", self.stream_root)
    }

    /// Record a new in-progress segment
    pub async fn create_in_progress(
        &self,
        segment_seq: i64,
        store_id: u64,
        start_txid: i64,
        region_id: u32,
    ) -> Result<SegmentMetadata, MetadataError> {
        let meta = SegmentMetadata::in_progress(segment_seq, store_id, start_txid, region_id);
        match self
            .coord
            .create(&self.segment_path(segment_seq), meta.encode(), false)
            .await
        {
            Ok(()) => {}
            Err(CoordError::NodeExists(_)) => {
                return Err(MetadataError::SegmentExists(segment_seq))
            }
            Err(e) => return Err(e.into()),
        }
        self.coord
            .create(
                &self.in_progress_path(segment_seq),
                bytes::Bytes::new(),
                false,
            )
            .await?;
        info!(stream = %self.stream, segment = segment_seq, start_txid, "segment in progress");
        Ok(meta)
    }

    /// Transition a segment to complete with its observed end attributes.
    /// In-progress → complete only; a segment never resurrects.
    pub async fn complete(
        &self,
        meta: &SegmentMetadata,
        last_entry_seq: i64,
        last_slot: i64,
        last_txid: i64,
    ) -> Result<SegmentMetadata, MetadataError> {
        let current = self.read(meta.segment_seq).await?;
        if current.state == SegmentState::Complete {
            return Err(MetadataError::AlreadyComplete(meta.segment_seq));
        }
        let mut completed = current;
        completed.last_entry_seq = last_entry_seq;
        completed.last_slot = last_slot;
        completed.last_txid = last_txid;
        completed.state = SegmentState::Complete;
        self.coord
            .write(&self.segment_path(meta.segment_seq), completed.encode())
            .await?;
        match self.coord.delete(&self.in_progress_path(meta.segment_seq)).await {
            Ok(()) | Err(CoordError::NodeNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!(
            stream = %self.stream,
            segment = meta.segment_seq,
            last_entry_seq,
            last_txid,
            "segment complete"
        );
        Ok(completed)
    }

    pub async fn read(&self, segment_seq: i64) -> Result<SegmentMetadata, MetadataError> {
        match self.coord.read(&self.segment_path(segment_seq)).await {
            Ok((blob, _)) => SegmentMetadata::decode(&blob),
            Err(CoordError::NodeNotFound(_)) => Err(MetadataError::SegmentNotFound(segment_seq)),
            Err(e) => Err(e.into()),
        }
    }

    /// All segments of the stream, ordered by sequence
    pub async fn list(&self) -> Result<Vec<SegmentMetadata>, MetadataError> {
        let dir = format!("{}/segments", self.stream_root);
        let mut segments = Vec::new();
        for name in self.coord.children(&dir).await? {
            let (blob, _) = self.coord.read(&format!("{dir}/{name}")).await?;
            segments.push(SegmentMetadata::decode(&blob)?);
        }
        segments.sort_by_key(|meta| meta.segment_seq);
        Ok(segments)
    }

    /// Mark every segment entirely below `position` as truncated. Idempotent.
    pub async fn mark_truncated_below(
        &self,
        position: Position,
    ) -> Result<usize, MetadataError> {
        let mut marked = 0;
        for meta in self.list().await? {
            if meta.truncated
                || meta.is_in_progress()
                || meta.segment_seq >= position.segment_seq
            {
                continue;
            }
            let mut truncated = meta.clone();
            truncated.truncated = true;
            self.coord
                .write(&self.segment_path(meta.segment_seq), truncated.encode())
                .await?;
            marked += 1;
        }
        if marked > 0 {
            debug!(stream = %self.stream, below = %position, marked, "segments truncated");
        }
        Ok(marked)
    }

    /// One-shot watch resolving when `segment_seq` completes. Resolves
    /// immediately if it already has.
    pub async fn watch_completion(
        &self,
        segment_seq: i64,
    ) -> Result<oneshot::Receiver<WatchEvent>, MetadataError> {
        let marker = self.in_progress_path(segment_seq);
        let watch = self.coord.watch(&marker).await?;
        if !self.coord.exists(&marker).await? {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(WatchEvent::Deleted(marker));
            return Ok(rx);
        }
        Ok(watch)
    }

    /// One-shot watch resolving when the segment list changes
    pub async fn watch_segments(&self) -> Result<oneshot::Receiver<WatchEvent>, MetadataError> {
        let dir = format!("{}/segments", self.stream_root);
        Ok(self.coord.watch_children(&dir).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordinator;
    use crate::record::INVALID_TXID;

    fn store() -> MetadataStore {
        MetadataStore::new(MemoryCoordinator::new(), "/streamlog", "orders").unwrap()
    }

    #[tokio::test]
    async fn test_create_and_list_in_order() {
        let meta_store = store();
        meta_store.create_in_progress(2, 12, 50, 0).await.unwrap();
        meta_store.create_in_progress(1, 11, 0, 0).await.unwrap();
        let listed = meta_store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].segment_seq, 1);
        assert_eq!(listed[1].segment_seq, 2);
        assert!(listed.iter().all(|m| m.is_in_progress()));
        assert!(matches!(
            meta_store.create_in_progress(1, 13, 0, 0).await,
            Err(MetadataError::SegmentExists(1))
        ));
    }

    #[tokio::test]
    async fn test_complete_transition() {
        let meta_store = store();
        let meta = meta_store.create_in_progress(1, 11, 0, 0).await.unwrap();
        assert_eq!(meta.last_txid, INVALID_TXID);

        let completed = meta_store.complete(&meta, 9, 0, 10).await.unwrap();
        assert_eq!(completed.state, SegmentState::Complete);
        assert_eq!(completed.last_position(), Position::new(1, 9, 0));
        assert_eq!(meta_store.read(1).await.unwrap(), completed);

        // no resurrection
        assert!(matches!(
            meta_store.complete(&meta, 10, 0, 11).await,
            Err(MetadataError::AlreadyComplete(1))
        ));
    }

    #[tokio::test]
    async fn test_truncation_is_idempotent() {
        let meta_store = store();
        for seq in 1..=3 {
            let meta = meta_store
                .create_in_progress(seq, seq as u64, 0, 0)
                .await
                .unwrap();
            meta_store.complete(&meta, 5, 0, 10).await.unwrap();
        }
        let below = Position::new(3, 0, 0);
        assert_eq!(meta_store.mark_truncated_below(below).await.unwrap(), 2);
        let first_pass = meta_store.list().await.unwrap();
        assert_eq!(meta_store.mark_truncated_below(below).await.unwrap(), 0);
        assert_eq!(meta_store.list().await.unwrap(), first_pass);
        assert!(first_pass[0].truncated);
        assert!(first_pass[1].truncated);
        assert!(!first_pass[2].truncated);
    }

    #[tokio::test]
    async fn test_watch_completion() {
        let meta_store = store();
        let meta = meta_store.create_in_progress(1, 11, 0, 0).await.unwrap();
        let watch = meta_store.watch_completion(1).await.unwrap();
        meta_store.complete(&meta, 3, 1, 7).await.unwrap();
        assert!(matches!(watch.await.unwrap(), WatchEvent::Deleted(_)));

        // already complete resolves immediately
        let watch = meta_store.watch_completion(1).await.unwrap();
        assert!(matches!(watch.await.unwrap(), WatchEvent::Deleted(_)));
    }

    #[tokio::test]
    async fn test_reserved_stream_names() {
        let coord = MemoryCoordinator::new();
        assert!(MetadataStore::new(coord.clone(), "/streamlog", ".hidden").is_err());
        assert!(MetadataStore::new(coord, "/streamlog", "a/b").is_err());
    }
}
