//! Storage error types.
//!
//! Every backend maps its native failures onto [`StorageError`] so the
//! retry layer can decide, uniformly, whether a failure is worth another
//! attempt.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("access denied by backing store: {0}")]
    Unauthorized(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("sha256 checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("storage request timed out: {0}")]
    Timeout(String),

    #[error("connection failure: {0}")]
    Connection(String),

    #[error("backing store returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether the failure is transient and the call may be retried.
    ///
    /// Timeouts, connection failures, throttling and 5xx responses are
    /// transient. Everything that describes the request itself (missing
    /// object, failed precondition, bad credentials, bad range) is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Timeout(_) | StorageError::Connection(_) => true,
            StorageError::Server { status, .. } => *status >= 500 || *status == 429,
            StorageError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::WouldBlock
            ),
            StorageError::NotFound(_)
            | StorageError::PreconditionFailed(_)
            | StorageError::Unauthorized(_)
            | StorageError::InvalidRange(_)
            | StorageError::InvalidKey(_)
            | StorageError::ChecksumMismatch(_)
            | StorageError::Backend(_) => false,
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(StorageError::Timeout("get".into()).is_retryable());
        assert!(StorageError::Connection("reset by peer".into()).is_retryable());
        assert!(StorageError::Server {
            status: 503,
            message: "slow down".into()
        }
        .is_retryable());
        assert!(StorageError::Server {
            status: 429,
            message: "throttled".into()
        }
        .is_retryable());
        assert!(StorageError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
            .is_retryable());
    }

    #[test]
    fn test_terminal_errors_are_not_retryable() {
        assert!(!StorageError::NotFound("k".into()).is_retryable());
        assert!(!StorageError::PreconditionFailed("k".into()).is_retryable());
        assert!(!StorageError::Unauthorized("k".into()).is_retryable());
        assert!(!StorageError::Server {
            status: 400,
            message: "bad request".into()
        }
        .is_retryable());
        assert!(!StorageError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
            .is_retryable());
    }
}
