use std::sync::Arc;

use parking_lot::Mutex;

use stasis_common::types::{Lsn, PageId};
use stasis_storage::file::{IoResult, MemoryPageFile, PageFile};
use stasis_storage::page::PageHeader;
use stasis_wal::{LogEntry, LogHandle, MemoryLog, WalResult};

/// One observed I/O call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    /// A log force returned; entries below `durable` are on stable storage.
    Force {
        /// Flushed LSN after the force.
        durable: Lsn,
    },
    /// A page image was handed to the page file.
    Write {
        /// Page written.
        page: PageId,
        /// LSN stamped on the image.
        lsn: Lsn,
    },
}

/// Shared, ordered record of forces and page writes.
#[derive(Debug, Default)]
pub struct IoTrace {
    events: Mutex<Vec<IoEvent>>,
}

impl IoTrace {
    /// Creates an empty trace.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: IoEvent) {
        self.events.lock().push(event);
    }

    /// Events in the order they happened.
    pub fn events(&self) -> Vec<IoEvent> {
        self.events.lock().clone()
    }

    /// Number of page writes seen.
    pub fn writes(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, IoEvent::Write { .. }))
            .count()
    }

    /// Page writes whose LSN was not yet durable when they happened.
    ///
    /// Pages that were never logged carry an invalid LSN and are exempt.
    pub fn wal_violations(&self) -> Vec<IoEvent> {
        let mut durable = Lsn::INVALID;
        let mut violations = Vec::new();
        for event in self.events.lock().iter() {
            match *event {
                IoEvent::Force { durable: lsn } => durable = durable.max(lsn),
                IoEvent::Write { lsn, .. } if lsn.is_valid() && lsn >= durable => {
                    violations.push(*event);
                }
                IoEvent::Write { .. } => {}
            }
        }
        violations
    }
}

/// Memory page file that records every write in an [`IoTrace`].
#[derive(Debug)]
pub struct TracedPageFile {
    inner: MemoryPageFile,
    trace: Arc<IoTrace>,
}

impl TracedPageFile {
    /// Creates an empty page file reporting to `trace`.
    pub fn new(trace: Arc<IoTrace>) -> Self {
        Self {
            inner: MemoryPageFile::new(),
            trace,
        }
    }
}

impl PageFile for TracedPageFile {
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> IoResult<()> {
        self.inner.read_page(page_id, buf)
    }

    fn write_page(&self, page_id: PageId, buf: &[u8]) -> IoResult<()> {
        self.trace.push(IoEvent::Write {
            page: page_id,
            lsn: PageHeader::new(buf).lsn(),
        });
        self.inner.write_page(page_id, buf)
    }

    fn force(&self) -> IoResult<()> {
        self.inner.force()
    }

    fn page_count(&self) -> IoResult<u64> {
        self.inner.page_count()
    }

    fn truncate(&self, pages: u64) -> IoResult<()> {
        self.inner.truncate(pages)
    }
}

/// Memory log that records every force in an [`IoTrace`].
#[derive(Debug)]
pub struct TracedLog {
    inner: MemoryLog,
    trace: Arc<IoTrace>,
}

impl TracedLog {
    /// Creates an empty log reporting to `trace`.
    pub fn new(trace: Arc<IoTrace>) -> Self {
        Self {
            inner: MemoryLog::new(),
            trace,
        }
    }
}

impl LogHandle for TracedLog {
    fn write_entry(&self, entry: &mut LogEntry) -> WalResult<Lsn> {
        self.inner.write_entry(entry)
    }

    fn read_entry(&self, lsn: Lsn) -> WalResult<Option<LogEntry>> {
        self.inner.read_entry(lsn)
    }

    fn force(&self, lsn: Lsn) -> WalResult<()> {
        self.inner.force(lsn)?;
        self.trace.push(IoEvent::Force {
            durable: self.inner.flushed_lsn(),
        });
        Ok(())
    }

    fn flushed_lsn(&self) -> Lsn {
        self.inner.flushed_lsn()
    }

    fn truncate(&self, lsn: Lsn) -> WalResult<()> {
        self.inner.truncate(lsn)
    }

    fn truncation_point(&self) -> Lsn {
        self.inner.truncation_point()
    }

    fn next_available_lsn(&self) -> Lsn {
        self.inner.next_available_lsn()
    }

    fn discard_unforced(&self) -> WalResult<()> {
        self.inner.discard_unforced()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unforced_write_is_flagged() {
        let trace = IoTrace::new();
        trace.push(IoEvent::Force { durable: Lsn::new(100) });
        trace.push(IoEvent::Write {
            page: PageId::new(1),
            lsn: Lsn::new(50),
        });
        trace.push(IoEvent::Write {
            page: PageId::new(2),
            lsn: Lsn::new(150),
        });
        trace.push(IoEvent::Write {
            page: PageId::new(0),
            lsn: Lsn::INVALID,
        });

        assert_eq!(trace.writes(), 3);
        assert_eq!(
            trace.wal_violations(),
            vec![IoEvent::Write {
                page: PageId::new(2),
                lsn: Lsn::new(150),
            }]
        );
    }
}
