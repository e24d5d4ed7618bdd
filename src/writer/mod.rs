//! Write path: per-segment packing engine and stream-level orchestrator

pub mod log;
pub mod segment;
mod transmit;

use crate::coord::lock::LockError;
use crate::meta::MetadataError;
use crate::store::StoreError;
use thiserror::Error;

pub use log::LogWriter;
pub use segment::SegmentWriter;
pub use transmit::WriteFuture;

/// Lock acquisition reason used by the write path
pub(crate) const LOCK_REASON_WRITER: &str = "writer";

/// Write-path errors. Failures are clonable because one transmission
/// failure fans out to every promise it carried.
#[derive(Debug, Clone, Error)]
pub enum WriteError {
    #[error("record of {size} bytes exceeds the {limit}-byte limit")]
    OverLimit { size: usize, limit: usize },
    #[error("stream has been ended with a terminal record")]
    EndOfStream,
    #[error("transaction id {0} is reserved or negative")]
    InvalidTxId(i64),
    #[error("transaction id {txid} regresses behind {last_txid}")]
    TransactionOutOfOrder { txid: i64, last_txid: i64 },
    #[error("transmit failed: {0}")]
    Transmit(String),
    #[error("flush timed out after {0} ms")]
    FlushTimeout(u64),
    #[error("stream lock lost")]
    LockLost,
    #[error("write cancelled")]
    Cancelled,
    #[error("writer already closed")]
    Closed,
    #[error("stream is rolling and not accepting writes")]
    StreamNotReady,
    #[error("invalid stream name {0:?}")]
    InvalidStreamName(String),
    #[error("lock: {0}")]
    Lock(String),
    #[error("segment store: {0}")]
    Store(String),
    #[error("metadata: {0}")]
    Metadata(String),
}

impl From<StoreError> for WriteError {
    fn from(err: StoreError) -> Self {
        WriteError::Store(err.to_string())
    }
}

impl From<LockError> for WriteError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::SessionExpired => WriteError::LockLost,
            other => WriteError::Lock(other.to_string()),
        }
    }
}

impl From<MetadataError> for WriteError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::InvalidStreamName(name) => WriteError::InvalidStreamName(name),
            other => WriteError::Metadata(other.to_string()),
        }
    }
}
