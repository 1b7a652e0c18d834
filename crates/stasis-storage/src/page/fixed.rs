//! Fixed-length record pages.
//!
//! Record `n` lives at byte `n * record_size`. Two 16-bit fields before the
//! trailer hold the record size and the number of allocated records.

use stasis_common::types::SlotId;

use super::error::{PageError, PageResult};
use super::header::{PageHeader, USABLE_SIZE};
use super::types::{PageType, SlotType};

const RECORD_SIZE_FIELD: usize = 1;
const RECORD_COUNT_FIELD: usize = 2;

/// Bytes used by the fixed page header fields.
pub const FIXED_HEADER_OVERHEAD: usize = 4;

/// Number of `record_size`-byte records that fit on one fixed page.
#[must_use]
pub fn records_per_page(record_size: usize) -> usize {
    if record_size == 0 {
        0
    } else {
        (USABLE_SIZE - FIXED_HEADER_OVERHEAD) / record_size
    }
}

/// A fixed-length record page view.
#[derive(Debug)]
pub struct FixedPage<B> {
    header: PageHeader<B>,
}

impl<B: AsRef<[u8]>> FixedPage<B> {
    /// Creates a fixed-page view over a page image.
    #[inline]
    pub fn new(data: B) -> Self {
        Self {
            header: PageHeader::new(data),
        }
    }

    /// Returns the trailer view.
    #[inline]
    pub fn header(&self) -> &PageHeader<B> {
        &self.header
    }

    /// Size of each record in bytes.
    #[inline]
    pub fn record_size(&self) -> usize {
        usize::try_from(self.header.i16_from_end(RECORD_SIZE_FIELD)).unwrap_or(0)
    }

    /// Number of allocated records.
    #[inline]
    pub fn record_count(&self) -> SlotId {
        u32::try_from(self.header.i16_from_end(RECORD_COUNT_FIELD)).unwrap_or(0)
    }

    /// Capacity of this page.
    #[inline]
    pub fn capacity(&self) -> usize {
        records_per_page(self.record_size())
    }

    /// Returns what the slot holds.
    pub fn record_type(&self, slot: SlotId) -> SlotType {
        if slot < self.record_count() {
            SlotType::Normal(u16::try_from(self.record_size()).unwrap_or(u16::MAX))
        } else {
            SlotType::Invalid
        }
    }

    /// Byte range `[start, end)` of a live record.
    pub fn record_extent(&self, slot: SlotId) -> PageResult<(usize, usize)> {
        if slot >= self.record_count() {
            return Err(PageError::NoSuchSlot { slot });
        }
        let size = self.record_size();
        let start = slot as usize * size;
        let end = start + size;
        if end > USABLE_SIZE - FIXED_HEADER_OVERHEAD {
            return Err(PageError::OutOfBounds { offset: start, end });
        }
        Ok((start, end))
    }

    /// Returns the bytes of a record.
    pub fn record(&self, slot: SlotId) -> PageResult<&[u8]> {
        let (start, end) = self.record_extent(slot)?;
        Ok(&self.header.bytes()[start..end])
    }

    /// Bytes left for new records.
    pub fn freespace(&self) -> usize {
        let used = self.record_count() as usize * self.record_size();
        (USABLE_SIZE - FIXED_HEADER_OVERHEAD).saturating_sub(used)
    }

    /// Returns the next allocated slot after `after`.
    pub fn next_slot(&self, after: Option<SlotId>) -> Option<SlotId> {
        let next = after.map_or(0, |s| s + 1);
        (next < self.record_count()).then_some(next)
    }

    /// Validates the header fields.
    pub fn fsck(&self) -> PageResult<()> {
        let size = self.record_size();
        if size == 0 {
            return Err(PageError::corrupted("fixed page has zero record size"));
        }
        if self.record_count() as usize > records_per_page(size) {
            return Err(PageError::corrupted(format!(
                "fixed page holds {} records of {size} bytes",
                self.record_count()
            )));
        }
        Ok(())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> FixedPage<B> {
    /// Formats the page for `record_size`-byte records, `count` of them
    /// already allocated.
    ///
    /// # Panics
    ///
    /// Panics if `page_type` does not use the fixed layout or `count`
    /// exceeds the page capacity.
    pub fn initialize(&mut self, page_type: PageType, record_size: usize, count: usize) {
        assert!(page_type.is_fixed_layout(), "{page_type} is not a fixed layout");
        assert!(
            record_size > 0 && count <= records_per_page(record_size),
            "{count} records of {record_size} bytes do not fit on a page"
        );
        self.header.reset(page_type);
        self.header
            .set_i16_from_end(RECORD_SIZE_FIELD, i16::try_from(record_size).unwrap_or(i16::MAX));
        self.set_record_count(count);
    }

    fn set_record_count(&mut self, count: usize) {
        self.header
            .set_i16_from_end(RECORD_COUNT_FIELD, i16::try_from(count).unwrap_or(i16::MAX));
    }

    /// Returns the bytes of a record, mutably.
    pub fn record_mut(&mut self, slot: SlotId) -> PageResult<&mut [u8]> {
        let (start, end) = self.record_extent(slot)?;
        Ok(&mut self.header.bytes_mut()[start..end])
    }

    /// Returns the next slot if a record of `slot_type` fits.
    pub fn pre_alloc(&self, slot_type: SlotType) -> Option<SlotId> {
        let count = self.record_count();
        let fits = slot_type.physical_len() == self.record_size()
            && (count as usize) < self.capacity();
        fits.then_some(count)
    }

    /// Claims the slot returned by [`FixedPage::pre_alloc`].
    pub fn post_alloc(&mut self, slot: SlotId) -> PageResult<()> {
        let count = self.record_count();
        if slot < count {
            return Err(PageError::corrupted(format!("slot {slot} is already allocated")));
        }
        if slot as usize >= self.capacity() {
            return Err(PageError::PageFull {
                needed: self.record_size(),
                available: self.freespace(),
            });
        }
        self.set_record_count(slot as usize + 1);
        Ok(())
    }

    /// Frees a record. Only the last record returns its space.
    pub fn free(&mut self, slot: SlotId) -> PageResult<()> {
        self.record_mut(slot)?.fill(0);
        if slot + 1 == self.record_count() {
            self.set_record_count(slot as usize);
        }
        Ok(())
    }
}
