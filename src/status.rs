//! Status codes surfaced by the RPC front-end
//!
//! The front-end server is not implemented here; this module is the
//! translation of the engine's internal error taxonomy onto the codes that
//! surface carries.

use crate::reader::ReadError;
use crate::writer::WriteError;

/// Front-end status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    /// Redirect: another host owns the stream
    Found,
    ServiceUnavailable,
    StreamUnavailable,
    LockingException,
    TransmitError,
    FlushTimeout,
    EndOfStream,
    InvalidStreamName,
    TooLargeRecord,
    TransactionOutOfOrder,
    LogNotFound,
}

impl StatusCode {
    /// Numeric wire form
    pub fn code(&self) -> u32 {
        match self {
            StatusCode::Success => 0,
            StatusCode::Found => 302,
            StatusCode::LogNotFound => 404,
            StatusCode::TooLargeRecord => 413,
            StatusCode::ServiceUnavailable => 503,
            StatusCode::StreamUnavailable => 505,
            StatusCode::LockingException => 506,
            StatusCode::TransmitError => 507,
            StatusCode::FlushTimeout => 508,
            StatusCode::EndOfStream => 509,
            StatusCode::InvalidStreamName => 510,
            StatusCode::TransactionOutOfOrder => 511,
        }
    }

    /// Clients may retry these against another owner
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StatusCode::Found | StatusCode::ServiceUnavailable | StatusCode::StreamUnavailable
        )
    }
}

impl From<&WriteError> for StatusCode {
    fn from(err: &WriteError) -> Self {
        match err {
            WriteError::OverLimit { .. } => StatusCode::TooLargeRecord,
            WriteError::EndOfStream => StatusCode::EndOfStream,
            WriteError::InvalidTxId(_) | WriteError::TransactionOutOfOrder { .. } => {
                StatusCode::TransactionOutOfOrder
            }
            WriteError::Transmit(_) => StatusCode::TransmitError,
            WriteError::FlushTimeout(_) => StatusCode::FlushTimeout,
            WriteError::LockLost | WriteError::Lock(_) => StatusCode::LockingException,
            WriteError::InvalidStreamName(_) => StatusCode::InvalidStreamName,
            WriteError::Cancelled | WriteError::Closed | WriteError::StreamNotReady => {
                StatusCode::StreamUnavailable
            }
            WriteError::Store(_) | WriteError::Metadata(_) => StatusCode::ServiceUnavailable,
        }
    }
}

impl From<&ReadError> for StatusCode {
    fn from(err: &ReadError) -> Self {
        match err {
            ReadError::EndOfStream => StatusCode::EndOfStream,
            ReadError::LogNotFound(_) => StatusCode::LogNotFound,
            ReadError::InvalidStreamName(_) => StatusCode::InvalidStreamName,
            ReadError::ReadCancelled | ReadError::Closed | ReadError::PositionTruncated(_) => {
                StatusCode::StreamUnavailable
            }
            ReadError::IdleReader(_) | ReadError::Corrupt(_) => StatusCode::ServiceUnavailable,
            ReadError::Store(_) | ReadError::Metadata(_) => StatusCode::ServiceUnavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_error_translation() {
        let err = WriteError::OverLimit {
            size: 2_000_000,
            limit: crate::record::MAX_RECORD_SIZE,
        };
        assert_eq!(StatusCode::from(&err), StatusCode::TooLargeRecord);
        assert_eq!(
            StatusCode::from(&WriteError::EndOfStream),
            StatusCode::EndOfStream
        );
        assert_eq!(
            StatusCode::from(&WriteError::LockLost),
            StatusCode::LockingException
        );
        assert_eq!(
            StatusCode::from(&WriteError::Transmit("fenced".to_string())),
            StatusCode::TransmitError
        );
    }

    #[test]
    fn test_read_error_translation() {
        assert_eq!(
            StatusCode::from(&ReadError::LogNotFound("x".to_string())),
            StatusCode::LogNotFound
        );
        assert_eq!(
            StatusCode::from(&ReadError::EndOfStream),
            StatusCode::EndOfStream
        );
    }

    #[test]
    fn test_retryable() {
        assert!(StatusCode::Found.is_retryable());
        assert!(!StatusCode::TooLargeRecord.is_retryable());
        assert_eq!(StatusCode::Success.code(), 0);
    }
}
