//! Stream-unique record coordinates

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Serialized position length: 1 version byte + 3 big-endian i64 fields
pub const SERIALIZED_LEN: usize = 25;

const VERSION_0: u8 = 0;
const VERSION_1: u8 = 1;

/// Position decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PositionError {
    #[error("unknown position version {0}")]
    UnknownVersion(u8),
    #[error("position blob has {0} bytes, expected {SERIALIZED_LEN}")]
    WrongLength(usize),
    #[error("position string is not valid base64")]
    InvalidBase64,
}

/// Coordinate of one record within a stream.
///
/// `entry_id` is the segment-store-assigned ordinal of the transmission unit
/// the record was packed into; `slot_id` is the zero-based offset of the
/// record within that unit. Positions order lexicographically, which matches
/// the order records were acknowledged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    pub segment_seq: i64,
    pub entry_id: i64,
    pub slot_id: i64,
}

impl Position {
    /// Reserved "no position" value
    pub const INVALID: Position = Position {
        segment_seq: 0,
        entry_id: -1,
        slot_id: -1,
    };

    /// Lower bound of the very first record a stream can hold
    pub const INITIAL: Position = Position {
        segment_seq: 1,
        entry_id: 0,
        slot_id: -1,
    };

    pub fn new(segment_seq: i64, entry_id: i64, slot_id: i64) -> Self {
        Self {
            segment_seq,
            entry_id,
            slot_id,
        }
    }

    /// Lower bound of the segment following this position's segment
    pub fn next_segment(&self) -> Position {
        Position::new(self.segment_seq + 1, 0, -1)
    }

    /// Position immediately after this record within the same segment
    pub fn advance_slot(&self) -> Position {
        Position::new(self.segment_seq, self.entry_id, self.slot_id + 1)
    }

    /// Serialize in the current (v1) layout
    pub fn serialize(&self) -> Bytes {
        self.serialize_version(VERSION_1)
    }

    /// Serialize in the deprecated v0 layout, kept for wire compatibility
    pub fn serialize_v0(&self) -> Bytes {
        self.serialize_version(VERSION_0)
    }

    fn serialize_version(&self, version: u8) -> Bytes {
        let mut buf = BytesMut::with_capacity(SERIALIZED_LEN);
        buf.put_u8(version);
        buf.put_i64(self.segment_seq);
        buf.put_i64(self.entry_id);
        buf.put_i64(self.slot_id);
        buf.freeze()
    }

    /// Decode a serialized position, accepting both v0 and v1 layouts
    pub fn deserialize(data: &[u8]) -> Result<Position, PositionError> {
        if data.len() != SERIALIZED_LEN {
            return Err(PositionError::WrongLength(data.len()));
        }
        let mut buf = data;
        let version = buf.get_u8();
        if version != VERSION_0 && version != VERSION_1 {
            return Err(PositionError::UnknownVersion(version));
        }
        Ok(Position {
            segment_seq: buf.get_i64(),
            entry_id: buf.get_i64(),
            slot_id: buf.get_i64(),
        })
    }

    /// Base64 form carried in user-facing APIs
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.serialize())
    }

    /// Decode the base64 form
    pub fn from_base64(s: &str) -> Result<Position, PositionError> {
        let raw = BASE64
            .decode(s.as_bytes())
            .map_err(|_| PositionError::InvalidBase64)?;
        Position::deserialize(&raw)
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segment_seq
            .cmp(&other.segment_seq)
            .then(self.entry_id.cmp(&other.entry_id))
            .then(self.slot_id.cmp(&other.slot_id))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Position({}, {}, {})",
            self.segment_seq, self.entry_id, self.slot_id
        )
    }
}
