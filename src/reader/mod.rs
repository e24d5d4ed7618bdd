//! Read path: per-segment cursor, read-ahead worker and the continuous
//! stream reader

pub mod log;
mod readahead;
mod segment;

use crate::meta::MetadataError;
use crate::position::Position;
use crate::record::RecordError;
use crate::store::StoreError;
use thiserror::Error;

pub use log::LogReader;

/// Read-path errors. Once a reader reports one of these, it repeats it for
/// every subsequent read; close still releases watches.
#[derive(Debug, Clone, Error)]
pub enum ReadError {
    #[error("end of stream")]
    EndOfStream,
    #[error("reader idle for {0} ms")]
    IdleReader(u64),
    #[error("read cancelled by consumer")]
    ReadCancelled,
    #[error("reader already closed")]
    Closed,
    #[error("log stream {0} not found")]
    LogNotFound(String),
    #[error("position {0} has been truncated")]
    PositionTruncated(Position),
    #[error("corrupt log entry: {0}")]
    Corrupt(String),
    #[error("invalid stream name {0:?}")]
    InvalidStreamName(String),
    #[error("segment store: {0}")]
    Store(String),
    #[error("metadata: {0}")]
    Metadata(String),
}

impl From<StoreError> for ReadError {
    fn from(err: StoreError) -> Self {
        ReadError::Store(err.to_string())
    }
}

impl From<RecordError> for ReadError {
    fn from(err: RecordError) -> Self {
        ReadError::Corrupt(err.to_string())
    }
}

impl From<MetadataError> for ReadError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::InvalidStreamName(name) => ReadError::InvalidStreamName(name),
            other => ReadError::Metadata(other.to_string()),
        }
    }
}
