//! In-memory log.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use stasis_common::types::Lsn;
use tracing::debug;

use super::LogHandle;
use crate::config::LogConfig;
use crate::entry::codec;
use crate::entry::LogEntry;
use crate::error::{WalError, WalResult};

#[derive(Debug)]
struct MemoryLogInner {
    /// Encoded frames in LSN order.
    frames: VecDeque<(Lsn, Bytes)>,
    truncation_point: Lsn,
    next_lsn: Lsn,
    flushed_lsn: Lsn,
}

impl MemoryLogInner {
    fn position(&self, lsn: Lsn) -> Result<usize, usize> {
        self.frames.binary_search_by_key(&lsn, |(frame_lsn, _)| *frame_lsn)
    }
}

/// A log that keeps its encoded frames in memory.
///
/// Forcing only moves the durable mark; [`MemoryLog::crash`] drops everything
/// past it, which is what a crash does to a real log tail. Readers share the
/// lock and decode frames after releasing it.
#[derive(Debug)]
pub struct MemoryLog {
    config: LogConfig,
    inner: RwLock<MemoryLogInner>,
}

impl MemoryLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::with_config(LogConfig::default())
    }

    /// Creates an empty log with the given configuration.
    pub fn with_config(config: LogConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(MemoryLogInner {
                frames: VecDeque::new(),
                truncation_point: Lsn::FIRST,
                next_lsn: Lsn::FIRST,
                flushed_lsn: Lsn::FIRST,
            }),
        }
    }

    /// Drops every entry that was not forced.
    pub fn crash(&self) {
        let mut inner = self.inner.write();
        let flushed = inner.flushed_lsn;
        let before = inner.frames.len();
        inner.frames.retain(|(lsn, _)| *lsn < flushed);
        inner.next_lsn = flushed;
        debug!(
            lost = before - inner.frames.len(),
            flushed = %flushed,
            "memory log lost its unforced tail"
        );
    }

    /// Number of entries currently held.
    pub fn entry_count(&self) -> usize {
        self.inner.read().frames.len()
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LogHandle for MemoryLog {
    fn write_entry(&self, entry: &mut LogEntry) -> WalResult<Lsn> {
        let mut frame = BytesMut::new();
        codec::encode_frame(entry, &mut frame);
        if frame.len() > self.config.max_entry_size {
            return Err(WalError::EntryTooLarge {
                size: frame.len(),
                max: self.config.max_entry_size,
            });
        }

        let mut inner = self.inner.write();
        let lsn = inner.next_lsn;
        inner.next_lsn = lsn.advance(frame.len() as u64);
        inner.frames.push_back((lsn, frame.freeze()));
        entry.lsn = lsn;
        Ok(lsn)
    }

    fn read_entry(&self, lsn: Lsn) -> WalResult<Option<LogEntry>> {
        let inner = self.inner.read();
        if lsn < inner.truncation_point {
            return Err(WalError::Truncated {
                lsn,
                truncation_point: inner.truncation_point,
            });
        }
        if lsn >= inner.next_lsn {
            return Ok(None);
        }
        let index = inner
            .position(lsn)
            .map_err(|_| WalError::NotAnEntry { lsn })?;
        let frame = inner.frames[index].1.clone();
        drop(inner);
        codec::decode_frame(lsn, &frame).map(Some)
    }

    fn force(&self, lsn: Lsn) -> WalResult<()> {
        let mut inner = self.inner.write();
        if lsn >= inner.flushed_lsn {
            inner.flushed_lsn = inner.next_lsn;
        }
        Ok(())
    }

    fn flushed_lsn(&self) -> Lsn {
        self.inner.read().flushed_lsn
    }

    fn truncate(&self, lsn: Lsn) -> WalResult<()> {
        let mut inner = self.inner.write();
        if lsn <= inner.truncation_point {
            return Ok(());
        }
        if lsn > inner.flushed_lsn {
            return Err(WalError::TruncateBeyondFlushed {
                lsn,
                flushed: inner.flushed_lsn,
            });
        }
        if lsn < inner.next_lsn && inner.position(lsn).is_err() {
            return Err(WalError::NotAnEntry { lsn });
        }
        while inner.frames.front().is_some_and(|(frame_lsn, _)| *frame_lsn < lsn) {
            inner.frames.pop_front();
        }
        inner.truncation_point = lsn;
        debug!(truncation_point = %lsn, "memory log truncated");
        Ok(())
    }

    fn truncation_point(&self) -> Lsn {
        self.inner.read().truncation_point
    }

    fn next_available_lsn(&self) -> Lsn {
        self.inner.read().next_lsn
    }

    fn discard_unforced(&self) -> WalResult<()> {
        self.crash();
        Ok(())
    }
}
