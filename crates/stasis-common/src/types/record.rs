//! Record addressing.

use std::fmt;

use super::ids::PageId;

/// Slot number within a page.
pub type SlotId = u32;

/// Logical address of a record: `{page, slot, size}`.
///
/// `size` is the caller-visible length. Records whose size reaches
/// [`crate::constants::BLOB_THRESHOLD_SIZE`] are stored out of band; the
/// page layer resolves that distinction once when the slot is read.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    /// Page holding the record (or the root of an indirect tree).
    pub page: PageId,
    /// Slot within the page.
    pub slot: SlotId,
    /// Record length in bytes.
    pub size: u32,
}

impl RecordId {
    /// A record id that addresses nothing; logical log entries carry it.
    pub const INVALID: Self = Self {
        page: PageId::INVALID,
        slot: u32::MAX,
        size: 0,
    };

    /// Creates a new record id.
    #[inline]
    #[must_use]
    pub const fn new(page: PageId, slot: SlotId, size: u32) -> Self {
        Self { page, slot, size }
    }

    /// Record id addressing a whole page (used by page-level operations).
    #[inline]
    #[must_use]
    pub const fn for_page(page: PageId) -> Self {
        Self {
            page,
            slot: 0,
            size: 0,
        }
    }

    /// Returns true if the record names a real page.
    #[inline]
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.page.is_valid()
    }

    /// Returns the same record with a different slot.
    #[inline]
    #[must_use]
    pub const fn with_slot(self, slot: SlotId) -> Self {
        Self { slot, ..self }
    }

    /// Returns the same record with a different page.
    #[inline]
    #[must_use]
    pub const fn with_page(self, page: PageId) -> Self {
        Self { page, ..self }
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "RecordId({}:{}:{})", self.page, self.slot, self.size)
        } else {
            write!(f, "RecordId(INVALID)")
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {}, {}}}", self.page, self.slot, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id() {
        let rid = RecordId::new(PageId::new(3), 4, 16);
        assert!(rid.is_valid());
        assert_eq!(rid.with_slot(9).slot, 9);
        assert_eq!(rid.with_page(PageId::new(8)).page, PageId::new(8));
        assert_eq!(rid.to_string(), "{3, 4, 16}");
        assert!(!RecordId::INVALID.is_valid());
        assert_eq!(format!("{:?}", RecordId::INVALID), "RecordId(INVALID)");
    }
}
