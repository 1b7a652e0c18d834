//! Buffer pool errors.

use stasis_common::{ErrorCode, Lsn, PageId};
use thiserror::Error;

use crate::file::IoError;
use crate::page::PageError;

/// Result type for buffer pool operations.
pub type BufferResult<T> = Result<T, BufferError>;

/// Boxed error returned by a log forcer.
pub type ForceError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during buffer pool operations.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum BufferError {
    /// Every frame is pinned, so nothing can be evicted.
    #[error("buffer pool exhausted: all {frames} frames are pinned")]
    NoFreeFrames { frames: usize },

    /// Invalid page ID.
    #[error("invalid page ID: {page_id}")]
    InvalidPageId { page_id: PageId },

    /// Page file I/O failed.
    #[error("page file I/O error: {0}")]
    FileIo(#[from] IoError),

    /// Page contents could not be interpreted.
    #[error("page error: {0}")]
    Page(#[from] PageError),

    /// The log could not be forced far enough to write a dirty page.
    #[error("failed to force log to {lsn} before page write: {source}")]
    LogForce { lsn: Lsn, source: ForceError },

    /// Buffer pool is shutting down.
    #[error("buffer pool is shutting down")]
    ShuttingDown,

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl BufferError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if this is a transient error that can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NoFreeFrames { .. } => true,
            Self::FileIo(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if the engine cannot safely continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoFreeFrames { .. }
                | Self::LogForce { .. }
                | Self::Page(PageError::Corrupted { .. })
        )
    }

    /// Returns the engine-wide error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoFreeFrames { .. } => ErrorCode::BufferPoolExhausted,
            Self::InvalidPageId { .. } => ErrorCode::InvalidArgument,
            Self::FileIo(err) => err.code(),
            Self::Page(err) => err.code(),
            Self::LogForce { .. } => ErrorCode::Io,
            Self::ShuttingDown => ErrorCode::Internal,
            Self::Config { .. } => ErrorCode::Config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_is_fatal() {
        let err = BufferError::NoFreeFrames { frames: 8 };
        assert!(err.is_fatal());
        assert!(err.is_retryable());
        assert_eq!(err.code(), ErrorCode::BufferPoolExhausted);
        assert!(err.to_string().contains("8 frames"));
    }

    #[test]
    fn test_page_error_conversion() {
        let err: BufferError = PageError::corrupted("bad slot directory").into();
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_config_error() {
        let err = BufferError::config("too few frames");
        assert_eq!(err.code(), ErrorCode::Config);
        assert!(!err.is_fatal());
    }
}
