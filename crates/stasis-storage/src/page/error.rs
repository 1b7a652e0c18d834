//! Page layout errors.

use thiserror::Error;

use stasis_common::error::ErrorCode;
use stasis_common::types::SlotId;

use super::types::PageType;

/// Result type for page operations.
pub type PageResult<T> = Result<T, PageError>;

/// Errors raised while interpreting or mutating a page image.
///
/// Most of these indicate a broken caller contract; the engine reports
/// them instead of panicking so that the transaction layer can abort.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum PageError {
    /// The page's type does not support the requested operation.
    #[error("wrong page type: expected {expected}, found {found}")]
    WrongType { expected: &'static str, found: i32 },

    /// The slot does not hold a live record.
    #[error("slot {slot} is not allocated")]
    NoSuchSlot { slot: SlotId },

    /// The caller's record size disagrees with the slot directory.
    #[error(
        "record size mismatch in slot {slot}: slot holds {stored} bytes, \
         caller asked for {requested}"
    )]
    SizeMismatch {
        slot: SlotId,
        stored: usize,
        requested: usize,
    },

    /// Not enough room on the page.
    #[error("page full: need {needed} bytes, {available} available")]
    PageFull { needed: usize, available: usize },

    /// The page image failed structural validation.
    #[error("page corrupted: {reason}")]
    Corrupted { reason: String },

    /// A write or read fell outside the page.
    #[error("range {offset}..{end} is outside the page")]
    OutOfBounds { offset: usize, end: usize },
}

impl PageError {
    /// Creates a wrong-type error for a raw page type.
    pub fn wrong_type(expected: &'static str, found: i32) -> Self {
        Self::WrongType { expected, found }
    }

    /// Creates a wrong-type error from a decoded page type.
    pub fn unexpected(expected: &'static str, found: PageType) -> Self {
        Self::WrongType {
            expected,
            found: found.as_i32(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(reason: impl Into<String>) -> Self {
        Self::Corrupted {
            reason: reason.into(),
        }
    }

    /// Maps this error to an engine error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::WrongType { .. } => ErrorCode::WrongPageType,
            Self::NoSuchSlot { .. } | Self::SizeMismatch { .. } | Self::OutOfBounds { .. } => {
                ErrorCode::BadRecord
            }
            Self::PageFull { .. } => ErrorCode::PageFull,
            Self::Corrupted { .. } => ErrorCode::Corruption,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            PageError::wrong_type("slotted", 5).code(),
            ErrorCode::WrongPageType
        );
        assert_eq!(PageError::NoSuchSlot { slot: 3 }.code(), ErrorCode::BadRecord);
        assert_eq!(PageError::corrupted("x").code(), ErrorCode::Corruption);
    }

    #[test]
    fn test_error_display() {
        let err = PageError::SizeMismatch {
            slot: 2,
            stored: 4,
            requested: 8,
        };
        assert_eq!(
            err.to_string(),
            "record size mismatch in slot 2: slot holds 4 bytes, caller asked for 8"
        );
    }
}
