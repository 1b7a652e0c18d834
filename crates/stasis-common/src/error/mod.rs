//! Error types for Stasis.

mod engine;

pub use engine::{ErrorCode, StasisError};

/// Result type alias using [`StasisError`].
pub type StasisResult<T> = std::result::Result<T, StasisError>;
