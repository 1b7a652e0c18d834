//! Page file errors.
//!
//! Every failure here leaves the on-disk image in an unknown state, so the
//! engine treats all but interrupted calls as fatal.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use stasis_common::error::ErrorCode;
use stasis_common::types::PageId;

/// Result type for page file operations.
pub type IoResult<T> = Result<T, IoError>;

/// Page file failure.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum IoError {
    /// Opening or creating the page file or its directory failed.
    #[error("cannot open {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    /// Reading, writing or syncing a page failed.
    #[error("{operation} of page {page_id} failed: {source}")]
    Page {
        operation: &'static str,
        page_id: PageId,
        source: io::Error,
    },

    /// Any other call on the underlying file failed.
    #[error("page file I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// The caller's buffer is not exactly one page.
    #[error("page buffer has {actual} bytes, expected {expected}")]
    BadBufferSize { expected: usize, actual: usize },
}

impl IoError {
    /// Attaches the file path to an open failure.
    pub fn from_io_with_path(source: io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Open {
            path: path.into(),
            source,
        }
    }

    /// Read failure on `page_id`.
    pub fn page_read(page_id: PageId, source: io::Error) -> Self {
        Self::Page {
            operation: "read",
            page_id,
            source,
        }
    }

    /// Write failure on `page_id`.
    pub fn page_write(page_id: PageId, source: io::Error) -> Self {
        Self::Page {
            operation: "write",
            page_id,
            source,
        }
    }

    fn source_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Open { source, .. } | Self::Page { source, .. } | Self::Io { source } => {
                Some(source.kind())
            }
            Self::BadBufferSize { .. } => None,
        }
    }

    /// True if the call was interrupted and may simply be repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.source_kind(),
            Some(io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
        )
    }

    /// Engine error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BadBufferSize { .. } => ErrorCode::InvalidArgument,
            _ => ErrorCode::Io,
        }
    }
}
