//! Log backends.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              dyn LogHandle                   │
//! │ write_entry / read_entry / force / truncate  │
//! └───────────┬──────────────────────┬───────────┘
//!             │                      │
//!             ▼                      ▼
//! ┌──────────────────────┐  ┌──────────────────────┐
//! │ FileLog              │  │ MemoryLog            │
//! │ header + CRC frames  │  │ encoded frames in a  │
//! │ pending tail buffer  │  │ VecDeque, crash()    │
//! └──────────────────────┘  └──────────────────────┘
//! ```
//!
//! An LSN is the byte position of an entry's frame in the logical log
//! stream, so the LSN of the next entry is `lsn + frame_len`. The first
//! entry of a fresh log sits at [`Lsn::FIRST`].

mod file;
mod memory;

use std::fmt;

use stasis_common::types::Lsn;

use crate::entry::LogEntry;
use crate::error::WalResult;

pub use file::FileLog;
pub use memory::MemoryLog;

/// Append-only, randomly readable log of entries.
pub trait LogHandle: Send + Sync + fmt::Debug {
    /// Appends `entry`, stamping it with its LSN, and returns that LSN.
    ///
    /// The entry is not durable until a later [`LogHandle::force`] covers it.
    fn write_entry(&self, entry: &mut LogEntry) -> WalResult<Lsn>;

    /// Reads the entry at `lsn`. Returns `None` at the end of the log.
    fn read_entry(&self, lsn: Lsn) -> WalResult<Option<LogEntry>>;

    /// Blocks until every entry at or before `lsn` is durable.
    fn force(&self, lsn: Lsn) -> WalResult<()>;

    /// First LSN not known to be durable. Entries below it survive a crash.
    fn flushed_lsn(&self) -> Lsn;

    /// Discards every entry strictly before `lsn`.
    fn truncate(&self, lsn: Lsn) -> WalResult<()>;

    /// LSN of the oldest entry still in the log.
    fn truncation_point(&self) -> Lsn;

    /// LSN the next written entry will receive.
    fn next_available_lsn(&self) -> Lsn;

    /// Drops every entry that was not forced, as a crash would.
    fn discard_unforced(&self) -> WalResult<()>;

    /// LSN of the entry following `entry`.
    fn next_lsn_after(&self, entry: &LogEntry) -> Lsn {
        entry.next_lsn()
    }

    /// Forces every entry written so far.
    fn force_all(&self) -> WalResult<()> {
        self.force(self.next_available_lsn())
    }

    /// Bytes between the truncation point and the end of the log.
    fn len_bytes(&self) -> u64 {
        self.next_available_lsn().as_u64() - self.truncation_point().as_u64()
    }
}

/// Forward iterator over log entries.
pub struct LogScanner<'a> {
    log: &'a dyn LogHandle,
    next: Lsn,
    failed: bool,
}

impl<'a> LogScanner<'a> {
    /// Starts a scan at `from`. An LSN before the truncation point starts
    /// at the oldest surviving entry.
    pub fn new(log: &'a dyn LogHandle, from: Lsn) -> Self {
        Self {
            log,
            next: from.max(log.truncation_point()),
            failed: false,
        }
    }

    /// Starts a scan at the oldest surviving entry.
    pub fn from_start(log: &'a dyn LogHandle) -> Self {
        Self::new(log, log.truncation_point())
    }

    /// LSN the scanner will read next.
    pub fn position(&self) -> Lsn {
        self.next
    }
}

impl Iterator for LogScanner<'_> {
    type Item = WalResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.log.read_entry(self.next) {
            Ok(Some(entry)) => {
                self.next = self.log.next_lsn_after(&entry);
                Some(Ok(entry))
            }
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

impl fmt::Debug for LogScanner<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogScanner").field("next", &self.next).finish()
    }
}
