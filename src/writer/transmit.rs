//! Transmission units and write completion promises
//!
//! A transmission unit is one buffered batch of records handed to the
//! segment store as a single append. The unit owns the completion promises
//! of every record it packed; ownership transfers with the unit, and on
//! acknowledgement the unit fans positions (or the failure) out to them.

use super::WriteError;
use crate::position::Position;
use crate::record::Record;
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Completion promise for one buffered record
pub(crate) struct PendingWrite {
    pub txid: i64,
    tx: oneshot::Sender<Result<Position, WriteError>>,
}

impl PendingWrite {
    pub fn succeed(self, position: Position) {
        let _ = self.tx.send(Ok(position));
    }

    pub fn fail(self, err: WriteError) {
        let _ = self.tx.send(Err(err));
    }
}

/// Future resolving to the acknowledged position of one write
pub struct WriteFuture {
    rx: oneshot::Receiver<Result<Position, WriteError>>,
}

impl WriteFuture {
    pub(crate) fn channel(txid: i64) -> (PendingWrite, WriteFuture) {
        let (tx, rx) = oneshot::channel();
        (PendingWrite { txid, tx }, WriteFuture { rx })
    }

    /// Already-failed future for writes rejected before buffering
    pub(crate) fn failed(err: WriteError) -> WriteFuture {
        let (pending, future) = WriteFuture::channel(crate::record::INVALID_TXID);
        pending.fail(err);
        future
    }
}

impl Future for WriteFuture {
    type Output = Result<Position, WriteError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| match result {
            Ok(inner) => inner,
            Err(_) => Err(WriteError::Cancelled),
        })
    }
}

/// One buffered batch bound for a single segment-store append
pub(crate) struct TransmissionUnit {
    pub segment_seq: i64,
    pub is_control: bool,
    /// Highest transaction id buffered into this unit
    pub max_txid: i64,
    buffer: BytesMut,
    promises: Vec<PendingWrite>,
    records: usize,
}

impl TransmissionUnit {
    pub fn new(segment_seq: i64, is_control: bool) -> Self {
        Self {
            segment_seq,
            is_control,
            max_txid: crate::record::INVALID_TXID,
            buffer: BytesMut::new(),
            promises: Vec::new(),
            records: 0,
        }
    }

    /// Buffer one record. Data records carry a promise; control records
    /// never do.
    pub fn append(&mut self, record: &Record, promise: Option<PendingWrite>) {
        record.encode(&mut self.buffer);
        self.records += 1;
        self.max_txid = self.max_txid.max(record.txid);
        if let Some(promise) = promise {
            self.promises.push(promise);
        }
    }

    pub fn byte_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn record_count(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Payload for the segment-store append
    pub fn take_payload(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    /// Fan out positions after a successful append. Returns the slot of the
    /// last promised record, `-1` for control units.
    pub fn complete(self, entry_id: i64) -> i64 {
        let last_slot = self.promises.len() as i64 - 1;
        for (slot, promise) in self.promises.into_iter().enumerate() {
            promise.succeed(Position::new(self.segment_seq, entry_id, slot as i64));
        }
        last_slot
    }

    /// Fan the failure out to every promise
    pub fn fail(self, err: &WriteError) {
        for promise in self.promises {
            promise.fail(err.clone());
        }
    }
}
