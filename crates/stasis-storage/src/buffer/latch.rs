//! Pin handles and page latches.
//!
//! A [`PageHandle`] keeps its frame pinned until dropped. The page bytes are
//! reached through a read or write latch borrowed from the handle, so a latch
//! can never outlive the pin that keeps the frame from being rekeyed.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use stasis_common::types::{Lsn, PageId};

use super::frame::{BufferFrame, FrameId};
use crate::page::{PageHeader, PageType};

/// A pinned page in the buffer pool. Dropping it releases the pin.
pub struct PageHandle {
    frame: Arc<BufferFrame>,
    page_id: PageId,
}

impl PageHandle {
    pub(crate) fn new(frame: Arc<BufferFrame>, page_id: PageId) -> Self {
        Self { frame, page_id }
    }

    /// Returns the page ID.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the frame holding the page.
    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame.frame_id()
    }

    /// Takes the page's read latch.
    pub fn read(&self) -> PageReadLatch<'_> {
        PageReadLatch {
            guard: self.frame.read_data(),
        }
    }

    /// Takes the page's write latch.
    pub fn write(&self) -> PageWriteLatch<'_> {
        PageWriteLatch {
            frame: &self.frame,
            guard: self.frame.write_data(),
        }
    }

    /// Reads the page LSN under a read latch.
    pub fn lsn(&self) -> Lsn {
        self.read().lsn()
    }

    /// Reads the page type under a read latch.
    pub fn page_type(&self) -> Option<PageType> {
        self.read().header().page_type()
    }

    /// Returns true if the frame has unwritten changes.
    pub fn is_dirty(&self) -> bool {
        self.frame.is_dirty()
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.frame.unpin();
    }
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("page_id", &self.page_id)
            .field("frame_id", &self.frame.frame_id())
            .finish()
    }
}

/// Shared latch on a page's bytes.
pub struct PageReadLatch<'a> {
    guard: RwLockReadGuard<'a, Box<[u8]>>,
}

impl PageReadLatch<'_> {
    /// Views the trailer fields.
    pub fn header(&self) -> PageHeader<&[u8]> {
        PageHeader::new(&self.guard[..])
    }

    /// Returns the page LSN.
    pub fn lsn(&self) -> Lsn {
        self.header().lsn()
    }
}

impl Deref for PageReadLatch<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

/// Exclusive latch on a page's bytes.
///
/// Any mutable access marks the frame dirty.
pub struct PageWriteLatch<'a> {
    frame: &'a BufferFrame,
    guard: RwLockWriteGuard<'a, Box<[u8]>>,
}

impl PageWriteLatch<'_> {
    /// Views the trailer fields.
    pub fn header(&self) -> PageHeader<&[u8]> {
        PageHeader::new(&self.guard[..])
    }

    /// Returns the page LSN.
    pub fn lsn(&self) -> Lsn {
        self.header().lsn()
    }

    /// Stamps the page with the LSN of an update applied to it.
    ///
    /// The stored LSN only moves forward.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        let mut header = PageHeader::new(&mut self.guard[..]);
        if lsn > header.lsn() {
            header.set_lsn(lsn);
        }
        self.frame.note_update(lsn);
    }
}

impl Deref for PageWriteLatch<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl DerefMut for PageWriteLatch<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.frame.mark_dirty();
        &mut self.guard
    }
}
