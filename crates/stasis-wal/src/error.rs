//! Log error types.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use stasis_common::types::Lsn;
use stasis_common::ErrorCode;

/// Result type for log operations.
pub type WalResult<T> = Result<T, WalError>;

/// Errors that can occur during log operations.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum WalError {
    /// I/O error on the log file.
    #[error("log I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// The log file header is not one this crate wrote.
    #[error("invalid log header in {}: {reason}", path.display())]
    InvalidHeader { path: PathBuf, reason: String },

    /// Entry bytes failed validation.
    #[error("log corrupted at LSN {lsn}: {reason}")]
    Corrupted { lsn: Lsn, reason: String },

    /// Entry checksum mismatch.
    #[error(
        "log entry checksum mismatch at LSN {lsn}: expected {expected:#010x}, \
         computed {computed:#010x}"
    )]
    ChecksumMismatch {
        lsn: Lsn,
        expected: u32,
        computed: u32,
    },

    /// Entry too large.
    #[error("log entry too large: {size} bytes exceeds maximum {max} bytes")]
    EntryTooLarge { size: usize, max: usize },

    /// The requested entry was discarded by truncation.
    #[error("LSN {lsn} precedes the truncation point {truncation_point}")]
    Truncated { lsn: Lsn, truncation_point: Lsn },

    /// The LSN does not name an entry boundary.
    #[error("LSN {lsn} is not the start of a log entry")]
    NotAnEntry { lsn: Lsn },

    /// Truncation was asked to move past durable data.
    #[error("cannot truncate to {lsn}: log is only durable up to {flushed}")]
    TruncateBeyondFlushed { lsn: Lsn, flushed: Lsn },

    /// Entry deserialization error.
    #[error("failed to decode log entry: {reason}")]
    Decode { reason: String },

    /// Configuration error.
    #[error("log configuration error: {reason}")]
    Config { reason: String },
}

impl WalError {
    /// Creates a corruption error.
    pub fn corrupted(lsn: Lsn, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            lsn,
            reason: reason.into(),
        }
    }

    /// Creates a checksum mismatch error.
    pub fn checksum_mismatch(lsn: Lsn, expected: u32, computed: u32) -> Self {
        Self::ChecksumMismatch {
            lsn,
            expected,
            computed,
        }
    }

    /// Creates a decode error.
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    /// Creates a config error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Returns true if this is a corruption error.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corrupted { .. }
                | Self::ChecksumMismatch { .. }
                | Self::InvalidHeader { .. }
                | Self::Decode { .. }
        )
    }

    /// Returns true if durability can no longer be guaranteed.
    ///
    /// Failed writes or syncs leave the log tail in an unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io { .. }) || self.is_corruption()
    }

    /// Returns the engine-wide error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } => ErrorCode::Io,
            Self::Truncated { .. }
            | Self::NotAnEntry { .. }
            | Self::TruncateBeyondFlushed { .. } => ErrorCode::InvalidLsn,
            Self::EntryTooLarge { .. } => ErrorCode::InvalidArgument,
            Self::Config { .. } => ErrorCode::Config,
            _ => ErrorCode::LogCorrupted,
        }
    }
}
