//! # stasis-common
//!
//! Common types, errors, and configuration for the Stasis storage engine.
//!
//! - **Types**: identifiers (`PageId`, `TxnId`, `Lsn`) and `RecordId`
//! - **Errors**: `StasisError` and the `ErrorCode` classification
//! - **Config**: `StasisConfig` and its per-component sections
//! - **Constants**: page size, table capacities and on-disk numbering
//!
//! ## Example
//!
//! ```rust
//! use stasis_common::types::{PageId, RecordId};
//!
//! let rid = RecordId::new(PageId::new(4), 0, 8);
//! assert!(rid.is_valid());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use error::{ErrorCode, StasisError, StasisResult};
pub use types::{Lsn, PageId, RecordId, SlotId, TxnId};
