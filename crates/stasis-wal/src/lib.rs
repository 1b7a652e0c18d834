//! # stasis-wal
//!
//! Write-ahead log for the Stasis storage engine.
//!
//! This crate provides:
//! - Log entries: BEGIN, COMMIT, ABORT, UPDATE, END, CLR and PREPARE, with
//!   the per-transaction `prev_lsn` chain and compensation `undo_next` links
//! - A checksummed binary codec for entries
//! - The [`LogHandle`] trait with a file backend and an in-memory backend
//!
//! # Entry Format
//!
//! Each entry is framed by its length and a CRC32 of its body:
//!
//! ```text
//! +---------+---------+------+-------+------+---------+----------+-------------+
//! | len (4) | crc (4) | type | flags | rsvd | xid (8) | prev (8) | type body.. |
//! +---------+---------+------+-------+------+---------+----------+-------------+
//! ```
//!
//! An entry's LSN is the position of its frame in the log stream.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod error;

/// Log entries and their encoding.
pub mod entry;

/// Log backends.
pub mod log;

pub use config::LogConfig;
pub use entry::{ClrEntry, EntryBody, EntryFlags, EntryType, LogEntry, UpdateEntry};
pub use error::{WalError, WalResult};
pub use log::{FileLog, LogHandle, LogScanner, MemoryLog};
