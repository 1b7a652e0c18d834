//! Transaction layer errors.

use thiserror::Error;

use stasis_common::error::{ErrorCode, StasisError};
use stasis_common::types::{Lsn, PageId, RecordId, TxnId};
use stasis_storage::buffer::BufferError;
use stasis_storage::file::IoError;
use stasis_storage::page::PageError;
use stasis_wal::WalError;

use crate::manager::TransactionState;

/// Result type for transaction operations.
pub type TxnResult<T> = Result<T, TxnError>;

/// Errors that can occur during transaction operations.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum TxnError {
    /// The lock manager chose this transaction as a deadlock victim. The
    /// caller must abort it and may retry.
    #[error("deadlock detected for transaction {xid}")]
    Deadlock { xid: TxnId },

    /// Transaction not found in the transaction table.
    #[error("transaction {xid} not found")]
    NotFound { xid: TxnId },

    /// The transaction table is full.
    #[error("transaction table full: {limit} transactions already active")]
    TooManyTransactions { limit: usize },

    /// Transaction is not in a state that allows the request.
    #[error("transaction {xid} is {state}, expected {expected}")]
    InvalidState {
        xid: TxnId,
        state: TransactionState,
        expected: &'static str,
    },

    /// No operation is registered under this id.
    #[error("unknown operation {op}")]
    UnknownOperation { op: u16 },

    /// The caller passed an argument the engine cannot act on.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// An operation could not be registered.
    #[error("cannot register operation {op}: {reason}")]
    Registration { op: u16, reason: &'static str },

    /// The record does not exist or disagrees with the caller's size.
    #[error("bad record {rid}: {reason}")]
    BadRecord { rid: RecordId, reason: String },

    /// The page has the wrong type for the request.
    #[error("page {page} has type {found}, expected {expected}")]
    WrongPageType {
        page: PageId,
        found: i32,
        expected: &'static str,
    },

    /// The boundary-tag chain is inconsistent.
    #[error("region allocator: {reason}")]
    Region { reason: String },

    /// Recovery could not replay an entry.
    #[error("recovery failed at LSN {lsn}: {reason}")]
    Recovery { lsn: Lsn, reason: String },

    /// Blob store failure.
    #[error("blob store: {reason}")]
    Blob { reason: String },

    /// Invalid configuration.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// The manager was shut down.
    #[error("transaction manager is shut down")]
    ShutDown,

    /// Buffer pool failure.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Log failure.
    #[error(transparent)]
    Wal(#[from] WalError),

    /// Page layout failure.
    #[error(transparent)]
    Page(#[from] PageError),

    /// Page file failure.
    #[error(transparent)]
    Io(#[from] IoError),
}

impl TxnError {
    /// Creates a bad-record error.
    pub fn bad_record(rid: RecordId, reason: impl Into<String>) -> Self {
        Self::BadRecord {
            rid,
            reason: reason.into(),
        }
    }

    /// Creates an invalid-argument error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Creates a region allocator error.
    pub fn region(reason: impl Into<String>) -> Self {
        Self::Region {
            reason: reason.into(),
        }
    }

    /// Creates a recovery error.
    pub fn recovery(lsn: Lsn, reason: impl Into<String>) -> Self {
        Self::Recovery {
            lsn,
            reason: reason.into(),
        }
    }

    /// Creates a blob store error.
    pub fn blob(reason: impl Into<String>) -> Self {
        Self::Blob {
            reason: reason.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Returns true for the deadlock sentinel.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::Deadlock { .. })
    }

    /// Returns true if the caller may abort and retry the transaction.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Deadlock { .. } | Self::TooManyTransactions { .. } => true,
            Self::Buffer(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if durable state can no longer be trusted and the
    /// engine must not continue.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Region { .. } | Self::Recovery { .. } => true,
            Self::Buffer(err) => err.is_fatal(),
            Self::Wal(err) => err.is_fatal(),
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// Returns the engine-wide error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Deadlock { .. } => ErrorCode::Deadlock,
            Self::NotFound { .. } => ErrorCode::TransactionNotFound,
            Self::TooManyTransactions { .. } => ErrorCode::TooManyTransactions,
            Self::InvalidState { .. } | Self::ShutDown => ErrorCode::Internal,
            Self::UnknownOperation { .. }
            | Self::Registration { .. }
            | Self::InvalidArgument { .. } => {
                ErrorCode::InvalidArgument
            }
            Self::BadRecord { .. } | Self::Blob { .. } => ErrorCode::BadRecord,
            Self::WrongPageType { .. } => ErrorCode::WrongPageType,
            Self::Region { .. } | Self::Recovery { .. } => ErrorCode::Corruption,
            Self::Config { .. } => ErrorCode::Config,
            Self::Buffer(err) => err.code(),
            Self::Wal(err) => err.code(),
            Self::Page(err) => err.code(),
            Self::Io(err) => err.code(),
        }
    }
}

impl From<StasisError> for TxnError {
    fn from(err: StasisError) -> Self {
        match err {
            StasisError::Deadlock { xid } => Self::Deadlock { xid },
            StasisError::TransactionNotFound { xid } => Self::NotFound { xid },
            StasisError::TooManyTransactions { limit } => Self::TooManyTransactions { limit },
            other => Self::Config {
                reason: other.to_string(),
            },
        }
    }
}

impl From<TxnError> for StasisError {
    fn from(err: TxnError) -> Self {
        match err {
            TxnError::Deadlock { xid } => Self::Deadlock { xid },
            TxnError::NotFound { xid } => Self::TransactionNotFound { xid },
            TxnError::TooManyTransactions { limit } => Self::TooManyTransactions { limit },
            TxnError::Config { reason } => Self::config(reason),
            TxnError::WrongPageType { page, found, .. } => Self::WrongPageType {
                page_id: page,
                found,
            },
            other if other.is_fatal() => Self::corruption(other.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadlock_classification() {
        let err = TxnError::Deadlock { xid: TxnId::new(7) };
        assert!(err.is_deadlock());
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
        assert_eq!(err.code(), ErrorCode::Deadlock);
        assert_eq!(err.code().as_status(), -1);
    }

    #[test]
    fn test_fatal_errors() {
        assert!(TxnError::region("missing boundary tag").is_fatal());
        assert!(TxnError::recovery(Lsn::new(40), "redo failed").is_fatal());
        assert!(!TxnError::bad_record(RecordId::INVALID, "size").is_fatal());
    }

    #[test]
    fn test_stasis_error_conversion() {
        let err: StasisError = TxnError::Deadlock { xid: TxnId::new(3) }.into();
        assert_eq!(err.code(), ErrorCode::Deadlock);

        let err: StasisError = TxnError::region("chain broken").into();
        assert!(err.is_fatal());

        let back: TxnError = StasisError::TooManyTransactions { limit: 1000 }.into();
        assert!(matches!(back, TxnError::TooManyTransactions { limit: 1000 }));
    }
}
