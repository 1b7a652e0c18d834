//! Buffer frame - a slot in the buffer pool that holds a page.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use stasis_common::types::{Lsn, PageId};

use crate::page::{PageHeader, PAGE_SIZE};

/// Frame identifier - index into the buffer pool's frame array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub usize);

impl FrameId {
    /// Creates a new frame ID.
    #[inline]
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    /// Returns the raw index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl From<usize> for FrameId {
    fn from(id: usize) -> Self {
        Self::new(id)
    }
}

impl From<FrameId> for usize {
    fn from(id: FrameId) -> Self {
        id.0
    }
}

/// A buffer frame holds a single page in memory.
///
/// The page bytes sit behind a reader/writer latch. Pin count, dirty flag,
/// page id and recovery LSN are atomics so the pool can inspect them
/// without taking the latch.
///
/// The page LSN lives in the page trailer itself; [`BufferFrame::page_lsn`]
/// reads it from the bytes.
pub struct BufferFrame {
    frame_id: FrameId,
    data: RwLock<Box<[u8]>>,
    page_id: AtomicU64,
    pin_count: AtomicU32,
    dirty: AtomicBool,
    /// LSN of the first update that dirtied the page since it was last
    /// written (0 while clean).
    rec_lsn: AtomicU64,
}

impl BufferFrame {
    /// Creates a new empty buffer frame.
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            data: RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
            page_id: AtomicU64::new(PageId::INVALID.as_u64()),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            rec_lsn: AtomicU64::new(Lsn::INVALID.as_u64()),
        }
    }

    /// Returns the frame ID.
    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the page ID stored in this frame.
    #[inline]
    pub fn page_id(&self) -> PageId {
        PageId::new(self.page_id.load(Ordering::Acquire))
    }

    /// Sets the page ID for this frame.
    #[inline]
    pub fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id.as_u64(), Ordering::Release);
    }

    /// Returns true if this frame is empty (no page assigned).
    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.page_id().is_valid()
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the new value.
    #[inline]
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the pin count and returns the new value.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let old = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0, "unpinned frame with pin_count = 0");
        old - 1
    }

    /// Returns true if the frame is pinned.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Returns true if the frame is dirty.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Records that an update logged at `lsn` touched this page.
    ///
    /// The first such update after a write-back becomes the frame's
    /// recovery LSN.
    pub fn note_update(&self, lsn: Lsn) {
        self.dirty.store(true, Ordering::Release);
        if lsn.is_valid() {
            let _ = self.rec_lsn.compare_exchange(
                Lsn::INVALID.as_u64(),
                lsn.as_u64(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Marks the frame dirty without an associated log entry.
    #[inline]
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clears the dirty flag and recovery LSN after a write-back.
    #[inline]
    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
        self.rec_lsn.store(Lsn::INVALID.as_u64(), Ordering::Release);
    }

    /// Returns the recovery LSN, or `Lsn::INVALID` when clean.
    #[inline]
    pub fn rec_lsn(&self) -> Lsn {
        Lsn::new(self.rec_lsn.load(Ordering::Acquire))
    }

    /// Reads the page LSN out of the trailer.
    pub fn page_lsn(&self) -> Lsn {
        PageHeader::new(&self.data.read()[..]).lsn()
    }

    /// Takes the read latch on the page bytes.
    #[inline]
    pub fn read_data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Takes the write latch on the page bytes.
    #[inline]
    pub fn write_data(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    /// Copies the page bytes out under a short read latch.
    pub fn snapshot(&self) -> Box<[u8]> {
        self.data.read().clone()
    }

    /// Rekeys the frame to `page_id` with clean metadata.
    pub(crate) fn rekey(&self, page_id: PageId) {
        self.set_page_id(page_id);
        self.mark_clean();
    }

    /// Resets the frame to the empty state.
    pub(crate) fn reset(&self) {
        self.set_page_id(PageId::INVALID);
        self.pin_count.store(0, Ordering::Release);
        self.mark_clean();
    }

    /// Returns true if this frame holds a page nobody has pinned.
    #[inline]
    pub fn is_evictable(&self) -> bool {
        !self.is_pinned() && !self.is_empty()
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferFrame")
            .field("frame_id", &self.frame_id)
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .field("dirty", &self.is_dirty())
            .field("rec_lsn", &self.rec_lsn())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_creation() {
        let frame = BufferFrame::new(FrameId::new(0));
        assert_eq!(frame.frame_id().index(), 0);
        assert!(frame.is_empty());
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());
        assert_eq!(frame.read_data().len(), PAGE_SIZE);
    }

    #[test]
    fn test_pin_unpin() {
        let frame = BufferFrame::new(FrameId::new(0));
        assert_eq!(frame.pin(), 1);
        assert_eq!(frame.pin(), 2);
        assert!(frame.is_pinned());
        assert_eq!(frame.unpin(), 1);
        assert_eq!(frame.unpin(), 0);
        assert!(!frame.is_pinned());
    }

    #[test]
    fn test_rec_lsn_keeps_first_update() {
        let frame = BufferFrame::new(FrameId::new(0));
        frame.note_update(Lsn::new(40));
        frame.note_update(Lsn::new(90));
        assert!(frame.is_dirty());
        assert_eq!(frame.rec_lsn(), Lsn::new(40));

        frame.mark_clean();
        assert!(!frame.is_dirty());
        assert_eq!(frame.rec_lsn(), Lsn::INVALID);

        frame.note_update(Lsn::new(120));
        assert_eq!(frame.rec_lsn(), Lsn::new(120));
    }

    #[test]
    fn test_page_lsn_reads_trailer() {
        let frame = BufferFrame::new(FrameId::new(0));
        {
            let mut data = frame.write_data();
            PageHeader::new(&mut data[..]).set_lsn(Lsn::new(777));
        }
        assert_eq!(frame.page_lsn(), Lsn::new(777));
        assert_eq!(PageHeader::new(&frame.snapshot()[..]).lsn(), Lsn::new(777));
    }

    #[test]
    fn test_is_evictable() {
        let frame = BufferFrame::new(FrameId::new(0));
        assert!(!frame.is_evictable());

        frame.rekey(PageId::new(42));
        assert!(frame.is_evictable());

        frame.pin();
        assert!(!frame.is_evictable());
        frame.unpin();

        frame.reset();
        assert!(frame.is_empty());
    }
}
