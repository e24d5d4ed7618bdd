//! Segment metadata and its coordinator blob format

pub mod store;

use crate::coord::CoordError;
use crate::position::Position;
use crate::record::{EMPTY_SEGMENT_TXID, INVALID_TXID};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub use store::MetadataStore;

/// Current metadata blob layout version
pub const METADATA_VERSION: u8 = 1;

/// Metadata errors
#[derive(Debug, Clone, Error)]
pub enum MetadataError {
    #[error("invalid stream name {0:?}")]
    InvalidStreamName(String),
    #[error("unknown metadata version {0}")]
    UnknownVersion(u8),
    #[error("metadata blob truncated at {0} bytes")]
    TruncatedBlob(usize),
    #[error("segment {0} already exists")]
    SegmentExists(i64),
    #[error("segment {0} not found")]
    SegmentNotFound(i64),
    #[error("segment {0} is already complete")]
    AlreadyComplete(i64),
    #[error(transparent)]
    Coord(#[from] CoordError),
}

/// Segment lifecycle state. Transitions are strictly in-progress →
/// complete; completed segments are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    InProgress,
    Complete,
}

/// One segment's coordinator-held attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMetadata {
    /// Stream-unique, monotonically increasing ordinal
    pub segment_seq: i64,
    /// Backing segment-store object
    pub store_id: u64,
    pub first_entry_seq: i64,
    /// Last entry ordinal, `-1` while in progress
    pub last_entry_seq: i64,
    pub start_txid: i64,
    pub last_txid: i64,
    /// Slot of the last record in the last entry, `-1` while in progress
    pub last_slot: i64,
    pub state: SegmentState,
    /// Opaque integer owned by the writer's host environment
    pub region_id: u32,
    pub truncated: bool,
}

impl SegmentMetadata {
    /// Fresh in-progress segment
    pub fn in_progress(segment_seq: i64, store_id: u64, start_txid: i64, region_id: u32) -> Self {
        Self {
            segment_seq,
            store_id,
            first_entry_seq: 0,
            last_entry_seq: -1,
            start_txid,
            last_txid: INVALID_TXID,
            last_slot: -1,
            state: SegmentState::InProgress,
            region_id,
            truncated: false,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.state == SegmentState::InProgress
    }

    /// Position of the last record, meaningful for complete segments only
    pub fn last_position(&self) -> Position {
        Position::new(self.segment_seq, self.last_entry_seq, self.last_slot)
    }

    /// This segment completed with a record at or past `position`
    pub fn reaches(&self, position: Position) -> bool {
        match self.state {
            SegmentState::InProgress => self.segment_seq >= position.segment_seq,
            SegmentState::Complete => {
                self.segment_seq > position.segment_seq || self.last_position() >= position
            }
        }
    }

    /// Complete segments whose last record never carried a transaction id
    /// were never written to.
    pub fn is_empty(&self) -> bool {
        self.state == SegmentState::Complete && self.last_txid == EMPTY_SEGMENT_TXID
    }

    /// Encode the blob carried on the segment's coordinator node
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(METADATA_VERSION);
        buf.put_i64(self.segment_seq);
        buf.put_u64(self.store_id);
        buf.put_i64(self.first_entry_seq);
        buf.put_i64(self.last_entry_seq);
        buf.put_i64(self.start_txid);
        buf.put_i64(self.last_txid);
        buf.put_i64(self.last_slot);
        buf.put_u8(match self.state {
            SegmentState::InProgress => 0,
            SegmentState::Complete => 1,
        });
        buf.put_u32(self.region_id);
        buf.put_u8(self.truncated as u8);
        buf.freeze()
    }

    /// Decode a blob. Unknown leading versions are rejected; unknown
    /// trailing bytes are tolerated so newer layouts stay readable.
    pub fn decode(data: &[u8]) -> Result<Self, MetadataError> {
        const FIXED_LEN: usize = 1 + 8 * 6 + 8 + 1 + 4 + 1;
        if data.is_empty() {
            return Err(MetadataError::TruncatedBlob(0));
        }
        let mut buf = data;
        let version = buf.get_u8();
        if version != METADATA_VERSION {
            return Err(MetadataError::UnknownVersion(version));
        }
        if data.len() < FIXED_LEN {
            return Err(MetadataError::TruncatedBlob(data.len()));
        }
        let segment_seq = buf.get_i64();
        let store_id = buf.get_u64();
        let first_entry_seq = buf.get_i64();
        let last_entry_seq = buf.get_i64();
        let start_txid = buf.get_i64();
        let last_txid = buf.get_i64();
        let last_slot = buf.get_i64();
        let state = match buf.get_u8() {
            0 => SegmentState::InProgress,
            _ => SegmentState::Complete,
        };
        let region_id = buf.get_u32();
        let truncated = buf.get_u8() != 0;
        Ok(Self {
            segment_seq,
            store_id,
            first_entry_seq,
            last_entry_seq,
            start_txid,
            last_txid,
            last_slot,
            state,
            region_id,
            truncated,
        })
    }
}

/// Stream names starting with `.` are reserved; `/` is forbidden.
pub fn validate_stream_name(name: &str) -> Result<(), MetadataError> {
    if name.is_empty() || name.starts_with('.') || name.contains('/') {
        return Err(MetadataError::InvalidStreamName(name.to_string()));
    }
    Ok(())
}
