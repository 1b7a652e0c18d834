//! Engine-wide error types.
//!
//! Each crate has its own error enum; every one of them maps onto an
//! [`ErrorCode`] so callers can classify failures without matching on the
//! crate-specific variants.

use std::fmt;
use thiserror::Error;

use crate::types::{Lsn, PageId, TxnId};

/// Error codes for categorizing errors.
///
/// The low-level status values returned by [`ErrorCode::as_status`] are the
/// negative integers the engine has always reported for these conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Internal error (bug or broken invariant).
    Internal = 0x0001,
    /// Invalid argument provided.
    InvalidArgument = 0x0003,
    /// Invalid configuration.
    Config = 0x0006,

    // I/O errors (0x0100 - 0x01FF)
    /// General I/O error.
    Io = 0x0100,
    /// Data corruption detected.
    Corruption = 0x0104,

    // Storage errors (0x0200 - 0x02FF)
    /// Page has the wrong type for the requested operation.
    WrongPageType = 0x0200,
    /// Every frame in the buffer pool is pinned.
    BufferPoolExhausted = 0x0202,
    /// Record does not exist or has the wrong size.
    BadRecord = 0x0203,
    /// The page has no room for the record.
    PageFull = 0x0204,

    // Transaction errors (0x0300 - 0x03FF)
    /// Deadlock detected by the lock manager.
    Deadlock = 0x0302,
    /// Transaction not found.
    TransactionNotFound = 0x0304,
    /// Transaction table is full.
    TooManyTransactions = 0x0305,

    // Log errors (0x0400 - 0x04FF)
    /// Log is corrupted.
    LogCorrupted = 0x0400,
    /// Requested LSN is not in the log.
    InvalidLsn = 0x0403,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the classic status value for this code.
    ///
    /// `-1` deadlock, `-2` out of memory (pool exhausted), `-3` I/O and
    /// `-4` for everything else.
    #[must_use]
    pub const fn as_status(self) -> i32 {
        match self {
            Self::Deadlock => -1,
            Self::BufferPoolExhausted | Self::TooManyTransactions => -2,
            Self::Io => -3,
            _ => -4,
        }
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "I/O",
            0x02 => "Storage",
            0x03 => "Transaction",
            0x04 => "Log",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Engine-level error shared by configuration and the public API surface.
///
/// # Example
///
/// ```rust
/// use stasis_common::error::{ErrorCode, StasisError, StasisResult};
/// use stasis_common::types::TxnId;
///
/// fn lock_something(xid: TxnId) -> StasisResult<()> {
///     Err(StasisError::Deadlock { xid })
/// }
///
/// let err = lock_something(TxnId::new(3)).unwrap_err();
/// assert_eq!(err.code(), ErrorCode::Deadlock);
/// ```
#[derive(Debug, Error)]
pub enum StasisError {
    // ==========================================================================
    // General Errors
    // ==========================================================================
    /// Internal error; an invariant the engine relies on does not hold.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    Config {
        /// Error message.
        message: String,
    },

    // ==========================================================================
    // I/O Errors
    // ==========================================================================
    /// I/O error from the underlying system.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Persistent state failed validation.
    #[error("corruption detected: {message}")]
    Corruption {
        /// Error message.
        message: String,
    },

    // ==========================================================================
    // Storage Errors
    // ==========================================================================
    /// Every frame in the buffer pool is pinned.
    #[error("buffer pool exhausted: all {frames} frames are pinned")]
    BufferPoolExhausted {
        /// Pool size.
        frames: usize,
    },

    /// Page has the wrong type for the requested operation.
    #[error("page {page_id} has unexpected type {found}")]
    WrongPageType {
        /// The page.
        page_id: PageId,
        /// Raw page type found.
        found: i32,
    },

    // ==========================================================================
    // Transaction Errors
    // ==========================================================================
    /// Deadlock detected; the transaction must abort.
    #[error("deadlock detected for transaction {xid}")]
    Deadlock {
        /// The transaction that received the deadlock signal.
        xid: TxnId,
    },

    /// Transaction not found.
    #[error("transaction {xid} not found")]
    TransactionNotFound {
        /// The missing transaction.
        xid: TxnId,
    },

    /// Transaction table is full.
    #[error("too many active transactions (limit {limit})")]
    TooManyTransactions {
        /// Table capacity.
        limit: usize,
    },

    // ==========================================================================
    // Log Errors
    // ==========================================================================
    /// Requested LSN is not in the log.
    #[error("no log entry at LSN {lsn}")]
    InvalidLsn {
        /// The LSN.
        lsn: Lsn,
    },
}

impl StasisError {
    /// Returns the error code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Internal { .. } => ErrorCode::Internal,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::Config { .. } => ErrorCode::Config,
            Self::Io { .. } => ErrorCode::Io,
            Self::Corruption { .. } => ErrorCode::Corruption,
            Self::BufferPoolExhausted { .. } => ErrorCode::BufferPoolExhausted,
            Self::WrongPageType { .. } => ErrorCode::WrongPageType,
            Self::Deadlock { .. } => ErrorCode::Deadlock,
            Self::TransactionNotFound { .. } => ErrorCode::TransactionNotFound,
            Self::TooManyTransactions { .. } => ErrorCode::TooManyTransactions,
            Self::InvalidLsn { .. } => ErrorCode::InvalidLsn,
        }
    }

    /// Returns true if the caller may abort and retry the transaction.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Deadlock { .. } | Self::TooManyTransactions { .. })
    }

    /// Returns true if the engine's durable state can no longer be trusted.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Corruption { .. } | Self::Internal { .. }
        )
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }
}
