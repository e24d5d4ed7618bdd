//! Log records and their on-the-wire frame
//!
//! Records are concatenated inside a transmission unit with no outer
//! framing; each record carries a fixed 20-byte header followed by the
//! opaque payload. Integrity is the segment store's responsibility, so
//! there is no record-level checksum.

use crate::position::Position;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Record is a control record, invisible to user-facing readers
pub const FLAG_CONTROL: u64 = 0x1;
/// Record terminates the stream
pub const FLAG_END_OF_STREAM: u64 = 0x2;

/// Transaction id reserved for the end-of-stream marker
pub const MAX_TXID: i64 = i64::MAX;
/// Transaction id of records that never carried one
pub const INVALID_TXID: i64 = -999;
/// Transaction id recorded for segments that were never written to
pub const EMPTY_SEGMENT_TXID: i64 = -99;

/// Largest accepted record payload
pub const MAX_RECORD_SIZE: usize = 1024 * 1024 - 8 * 1024;
/// Largest transmission unit submitted to the segment store in one append
pub const MAX_TRANSMISSION_SIZE: usize = 1024 * 1024 - 4 * 1024;

/// Fixed frame header: u64 flags, i64 txid, i32 payload length
pub const RECORD_HEADER_SIZE: usize = 8 + 8 + 4;

/// Record decoding errors. Any of these means the entry buffer is corrupt;
/// nothing is consumed past the failure point.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record payload length {0} is negative")]
    NegativeLength(i32),
    #[error("entry truncated: {needed} bytes needed, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
}

/// One user or control record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub flags: u64,
    pub txid: i64,
    pub payload: Bytes,
}

impl Record {
    /// User record with the given transaction id
    pub fn new(txid: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            flags: 0,
            txid,
            payload: payload.into(),
        }
    }

    /// Control record advancing the visible last-confirmed boundary.
    /// The payload is an opaque marker; readers identify controls by flag.
    pub fn control(txid: i64) -> Self {
        Self {
            flags: FLAG_CONTROL,
            txid,
            payload: Bytes::from_static(b"ctrl"),
        }
    }

    /// The reserved terminal record closing a stream
    pub fn end_of_stream() -> Self {
        Self {
            flags: FLAG_END_OF_STREAM,
            txid: MAX_TXID,
            payload: Bytes::new(),
        }
    }

    pub fn is_control(&self) -> bool {
        self.flags & FLAG_CONTROL != 0
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags & FLAG_END_OF_STREAM != 0
    }

    /// Bytes this record occupies inside a transmission unit
    pub fn persistent_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }

    /// Append the wire frame of this record to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.persistent_size());
        buf.put_u64(self.flags);
        buf.put_i64(self.txid);
        buf.put_i32(self.payload.len() as i32);
        buf.put_slice(&self.payload);
    }

    /// Decode one record frame from the front of `buf`
    pub fn decode(buf: &mut Bytes) -> Result<Record, RecordError> {
        if buf.remaining() < RECORD_HEADER_SIZE {
            return Err(RecordError::Truncated {
                needed: RECORD_HEADER_SIZE,
                remaining: buf.remaining(),
            });
        }
        let flags = buf.get_u64();
        let txid = buf.get_i64();
        let len = buf.get_i32();
        if len < 0 {
            return Err(RecordError::NegativeLength(len));
        }
        let len = len as usize;
        if buf.remaining() < len {
            return Err(RecordError::Truncated {
                needed: len,
                remaining: buf.remaining(),
            });
        }
        let payload = buf.split_to(len);
        Ok(Record {
            flags,
            txid,
            payload,
        })
    }
}

/// Iterates the records packed into one segment-store entry, stamping each
/// with its position.
pub struct EntryRecordReader {
    segment_seq: i64,
    entry_id: i64,
    buf: Bytes,
    next_slot: i64,
}

impl EntryRecordReader {
    pub fn new(segment_seq: i64, entry_id: i64, entry_payload: Bytes) -> Self {
        Self {
            segment_seq,
            entry_id,
            buf: entry_payload,
            next_slot: 0,
        }
    }

    /// Next record in the entry, or `None` when the entry is exhausted
    pub fn next_record(&mut self) -> Result<Option<(Position, Record)>, RecordError> {
        if !self.buf.has_remaining() {
            return Ok(None);
        }
        let record = Record::decode(&mut self.buf)?;
        let position = Position::new(self.segment_seq, self.entry_id, self.next_slot);
        self.next_slot += 1;
        Ok(Some((position, record)))
    }

    /// Skip forward until the next record's position is at or past `target`,
    /// consuming only headers and advancing past payload bytes. Returns the
    /// number of records skipped.
    pub fn skip_until(&mut self, target: Position) -> Result<usize, RecordError> {
        let mut skipped = 0;
        loop {
            let next = Position::new(self.segment_seq, self.entry_id, self.next_slot);
            if next >= target || !self.buf.has_remaining() {
                return Ok(skipped);
            }
            if self.buf.remaining() < RECORD_HEADER_SIZE {
                return Err(RecordError::Truncated {
                    needed: RECORD_HEADER_SIZE,
                    remaining: self.buf.remaining(),
                });
            }
            self.buf.advance(8 + 8);
            let len = self.buf.get_i32();
            if len < 0 {
                return Err(RecordError::NegativeLength(len));
            }
            let len = len as usize;
            if self.buf.remaining() < len {
                return Err(RecordError::Truncated {
                    needed: len,
                    remaining: self.buf.remaining(),
                });
            }
            self.buf.advance(len);
            self.next_slot += 1;
            skipped += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode_all(records: &[Record]) -> Bytes {
        let mut buf = BytesMut::new();
        for r in records {
            r.encode(&mut buf);
        }
        buf.freeze()
    }

    #[test]
    fn test_frame_layout() {
        let record = Record::new(7, &b"abc"[..]);
        let mut buf = BytesMut::new();
        record.encode(&mut buf);
        assert_eq!(buf.len(), RECORD_HEADER_SIZE + 3);
        // flags, txid, length are big-endian
        assert_eq!(&buf[0..8], &0u64.to_be_bytes());
        assert_eq!(&buf[8..16], &7i64.to_be_bytes());
        assert_eq!(&buf[16..20], &3i32.to_be_bytes());
        assert_eq!(&buf[20..], b"abc");
    }

    #[test]
    fn test_roundtrip() {
        let record = Record::new(42, &b"hello"[..]);
        let mut buf = BytesMut::new();
        record.encode(&mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(Record::decode(&mut bytes).unwrap(), record);
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn test_decode_rejects_negative_length() {
        let mut buf = BytesMut::new();
        buf.put_u64(0);
        buf.put_i64(1);
        buf.put_i32(-5);
        let mut bytes = buf.freeze();
        assert_eq!(
            Record::decode(&mut bytes),
            Err(RecordError::NegativeLength(-5))
        );
    }

    #[test]
    fn test_decode_rejects_truncated_buffer() {
        let record = Record::new(1, &b"payload"[..]);
        let mut buf = BytesMut::new();
        record.encode(&mut buf);
        let mut short = buf.freeze().slice(0..RECORD_HEADER_SIZE + 3);
        assert!(matches!(
            Record::decode(&mut short),
            Err(RecordError::Truncated { .. })
        ));
    }

    #[test]
    fn test_entry_reader_assigns_slots() {
        let records: Vec<Record> = (0..4).map(|i| Record::new(i, vec![i as u8; 8])).collect();
        let mut reader = EntryRecordReader::new(2, 5, encode_all(&records));
        for (slot, expected) in records.iter().enumerate() {
            let (pos, record) = reader.next_record().unwrap().unwrap();
            assert_eq!(pos, Position::new(2, 5, slot as i64));
            assert_eq!(&record, expected);
        }
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_entry_reader_skip() {
        let records: Vec<Record> = (0..6).map(|i| Record::new(i, vec![0u8; 16])).collect();
        let mut reader = EntryRecordReader::new(1, 3, encode_all(&records));
        let skipped = reader.skip_until(Position::new(1, 3, 4)).unwrap();
        assert_eq!(skipped, 4);
        let (pos, record) = reader.next_record().unwrap().unwrap();
        assert_eq!(pos, Position::new(1, 3, 4));
        assert_eq!(record.txid, 4);
    }

    #[test]
    fn test_flags() {
        assert!(Record::control(9).is_control());
        assert!(!Record::control(9).is_end_of_stream());
        let eos = Record::end_of_stream();
        assert!(eos.is_end_of_stream());
        assert_eq!(eos.txid, MAX_TXID);
    }

    proptest! {
        #[test]
        fn prop_roundtrip(flags in 0u64..4, txid in 0i64..i64::MAX, payload in proptest::collection::vec(any::<u8>(), 0..512)) {
            let record = Record { flags, txid, payload: Bytes::from(payload) };
            let mut buf = BytesMut::new();
            record.encode(&mut buf);
            let mut bytes = buf.freeze();
            prop_assert_eq!(Record::decode(&mut bytes).unwrap(), record);
        }
    }
}
