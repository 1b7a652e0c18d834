//! Slotted page format for variable-length records.
//!
//! Records grow upward from offset 0. The slot directory grows downward from
//! the trailer, as 16-bit fields counted back from the end of the usable area.
//!
//! # Page Layout
//!
//! ```text
//! +----------------------+ 0
//! |  record data ...     |  grows upward; `freespace` is the next free byte
//! +----------------------+ freespace
//! |  free space          |
//! +----------------------+
//! |  slot n-1 (off, len) |  4 bytes per slot, grows downward
//! |  ...                 |
//! |  slot 0   (off, len) |
//! |  freelist            |  i16 (first reusable slot or -1)
//! |  numslots            |  i16
//! |  freespace           |  i16
//! +----------------------+ USABLE_SIZE
//! |  trailer             |  page type + LSN
//! +----------------------+ PAGE_SIZE
//! ```
//!
//! A free slot has offset `INVALID_SLOT`; its length field links to the next
//! free slot, so the freelist costs no extra space. Slot numbers stay stable
//! across compaction; record offsets do not.

use stasis_common::types::SlotId;

use super::error::{PageError, PageResult};
use super::header::{PageHeader, USABLE_SIZE};
use super::types::{PageType, SlotType, INVALID_SLOT};

/// Bytes used by the freespace, numslots and freelist fields.
pub const SLOTTED_HEADER_OVERHEAD: usize = 6;

/// Bytes of slot directory per record.
pub const SLOTTED_OVERHEAD_PER_RECORD: usize = 4;

/// Largest record a freshly initialized slotted page can hold.
pub const SLOTTED_MAX_RECORD_SIZE: usize =
    USABLE_SIZE - SLOTTED_HEADER_OVERHEAD - SLOTTED_OVERHEAD_PER_RECORD;

const FREESPACE_FIELD: usize = 1;
const NUMSLOTS_FIELD: usize = 2;
const FREELIST_FIELD: usize = 3;

#[inline]
fn offset_field(slot: SlotId) -> usize {
    2 * slot as usize + 4
}

#[inline]
fn length_field(slot: SlotId) -> usize {
    2 * slot as usize + 5
}

#[inline]
fn to_i16(value: usize) -> i16 {
    i16::try_from(value).unwrap_or(i16::MAX)
}

/// A slotted page view.
///
/// # Example
///
/// ```rust
/// use stasis_storage::page::{SlottedPage, SlotType, PageType};
///
/// let mut buffer = vec![0u8; stasis_common::PAGE_SIZE];
/// let mut page = SlottedPage::new(&mut buffer[..]);
/// page.initialize(PageType::Slotted);
///
/// let slot = page.alloc(SlotType::Normal(5)).unwrap();
/// page.record_mut(slot).unwrap().copy_from_slice(b"hello");
/// assert_eq!(page.record(slot).unwrap(), b"hello");
/// ```
#[derive(Debug)]
pub struct SlottedPage<B> {
    header: PageHeader<B>,
}

impl<B: AsRef<[u8]>> SlottedPage<B> {
    /// Creates a slotted view over a page image.
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

    /// Offset of the first free byte after the record data.
    #[inline]
    pub fn freespace_cursor(&self) -> usize {
        usize::try_from(self.header.i16_from_end(FREESPACE_FIELD)).unwrap_or(0)
    }

    /// Number of slots in the directory, including free ones.
    #[inline]
    pub fn num_slots(&self) -> SlotId {
        u32::try_from(self.header.i16_from_end(NUMSLOTS_FIELD)).unwrap_or(0)
    }

    /// First slot on the freelist.
    #[inline]
    pub fn freelist_head(&self) -> Option<SlotId> {
        Self::decode_link(self.header.i16_from_end(FREELIST_FIELD))
    }

    #[inline]
    fn decode_link(raw: i16) -> Option<SlotId> {
        if raw == INVALID_SLOT {
            None
        } else {
            u32::try_from(raw).ok()
        }
    }

    #[inline]
    fn raw_offset(&self, slot: SlotId) -> i16 {
        self.header.i16_from_end(offset_field(slot))
    }

    #[inline]
    fn raw_length(&self, slot: SlotId) -> i16 {
        self.header.i16_from_end(length_field(slot))
    }

    #[inline]
    fn free_next(&self, slot: SlotId) -> Option<SlotId> {
        Self::decode_link(self.raw_length(slot))
    }

    /// Returns what the slot holds.
    pub fn record_type(&self, slot: SlotId) -> SlotType {
        if slot >= self.num_slots() || self.raw_offset(slot) == INVALID_SLOT {
            SlotType::Invalid
        } else {
            SlotType::from_raw(self.raw_length(slot))
        }
    }

    /// Returns the bytes stored in a slot.
    pub fn record(&self, slot: SlotId) -> PageResult<&[u8]> {
        let (start, end) = self.record_extent(slot)?;
        Ok(&self.header.bytes()[start..end])
    }

    /// Byte range `[start, end)` of a live record.
    pub fn record_extent(&self, slot: SlotId) -> PageResult<(usize, usize)> {
        let slot_type = self.record_type(slot);
        if !slot_type.is_live() {
            return Err(PageError::NoSuchSlot { slot });
        }
        let start = usize::try_from(self.raw_offset(slot))
            .map_err(|_| PageError::corrupted(format!("slot {slot} has negative offset")))?;
        let end = start + slot_type.physical_len();
        if end > USABLE_SIZE {
            return Err(PageError::OutOfBounds { offset: start, end });
        }
        Ok((start, end))
    }

    /// First byte of the slot directory.
    fn end_of_free_space(&self) -> usize {
        USABLE_SIZE
            .saturating_sub(SLOTTED_HEADER_OVERHEAD)
            .saturating_sub(SLOTTED_OVERHEAD_PER_RECORD * self.num_slots() as usize)
    }

    /// Contiguous bytes available to a record placed in `slot`.
    ///
    /// `None` asks about whichever slot the next allocation would use.
    /// Directory entries that the allocation would add are charged against
    /// the result.
    pub fn freespace_for_slot(&self, slot: Option<SlotId>) -> usize {
        let num_slots = self.num_slots() as usize;
        let overhead = match slot {
            None if self.freelist_head().is_some() => 0,
            None => SLOTTED_OVERHEAD_PER_RECORD,
            Some(s) if (s as usize) < num_slots => 0,
            Some(s) => SLOTTED_OVERHEAD_PER_RECORD * (s as usize + 1 - num_slots),
        };
        self.end_of_free_space()
            .saturating_sub(self.freespace_cursor())
            .saturating_sub(overhead)
    }

    /// Contiguous bytes available to the next allocation.
    #[inline]
    pub fn freespace(&self) -> usize {
        self.freespace_for_slot(None)
    }

    /// Returns the next live slot after `after` (or the first one).
    pub fn next_slot(&self, after: Option<SlotId>) -> Option<SlotId> {
        let start = after.map_or(0, |s| s + 1);
        (start..self.num_slots()).find(|&s| self.record_type(s).is_live())
    }

    /// Number of live records.
    pub fn live_records(&self) -> usize {
        (0..self.num_slots())
            .filter(|&s| self.record_type(s).is_live())
            .count()
    }

    fn freelist_tail(&self) -> Option<SlotId> {
        let mut tail = None;
        let mut cursor = self.freelist_head();
        let mut steps = 0;
        while let Some(slot) = cursor {
            tail = Some(slot);
            cursor = self.free_next(slot);
            steps += 1;
            if steps > self.num_slots() {
                break;
            }
        }
        tail
    }

    /// Validates the slot directory.
    pub fn fsck(&self) -> PageResult<()> {
        let num_slots = self.num_slots();
        if SLOTTED_HEADER_OVERHEAD + SLOTTED_OVERHEAD_PER_RECORD * num_slots as usize > USABLE_SIZE
        {
            return Err(PageError::corrupted(format!(
                "slot directory of {num_slots} entries overflows the page"
            )));
        }
        let cursor = self.freespace_cursor();
        if cursor > self.end_of_free_space() {
            return Err(PageError::corrupted(format!(
                "freespace cursor {cursor} overlaps the slot directory"
            )));
        }

        let mut extents = Vec::new();
        for slot in 0..num_slots {
            if !self.record_type(slot).is_live() {
                continue;
            }
            let (start, end) = self.record_extent(slot)?;
            if end > cursor {
                return Err(PageError::corrupted(format!(
                    "slot {slot} ends at {end}, past the freespace cursor {cursor}"
                )));
            }
            extents.push((start, end, slot));
        }
        extents.sort_unstable();
        for pair in extents.windows(2) {
            if pair[0].1 > pair[1].0 {
                return Err(PageError::corrupted(format!(
                    "slots {} and {} overlap",
                    pair[0].2, pair[1].2
                )));
            }
        }

        let mut seen = 0;
        let mut cursor = self.freelist_head();
        while let Some(slot) = cursor {
            if slot >= num_slots {
                return Err(PageError::corrupted(format!(
                    "freelist entry {slot} is past numslots {num_slots}"
                )));
            }
            if self.raw_offset(slot) != INVALID_SLOT {
                return Err(PageError::corrupted(format!(
                    "freelist entry {slot} is still allocated"
                )));
            }
            seen += 1;
            if seen > num_slots {
                return Err(PageError::corrupted("freelist does not terminate"));
            }
            cursor = self.free_next(slot);
        }
        Ok(())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SlottedPage<B> {
    #[inline]
    fn set_field(&mut self, field: usize, value: i16) {
        self.header.set_i16_from_end(field, value);
    }

    #[inline]
    fn set_num_slots(&mut self, value: SlotId) {
        self.set_field(NUMSLOTS_FIELD, to_i16(value as usize));
    }

    #[inline]
    fn set_raw_offset(&mut self, slot: SlotId, value: i16) {
        self.header.set_i16_from_end(offset_field(slot), value);
    }

    #[inline]
    fn set_raw_length(&mut self, slot: SlotId, value: i16) {
        self.header.set_i16_from_end(length_field(slot), value);
    }

    /// Formats the page as an empty slotted page of the given type.
    ///
    /// # Panics
    ///
    /// Panics if `page_type` does not use the slotted layout.
    pub fn initialize(&mut self, page_type: PageType) {
        assert!(
            page_type.is_slotted_layout(),
            "{page_type} is not a slotted layout"
        );
        self.header.reset(page_type);
        self.set_field(FREESPACE_FIELD, 0);
        self.set_field(NUMSLOTS_FIELD, 0);
        self.set_field(FREELIST_FIELD, INVALID_SLOT);
    }

    /// Returns the bytes stored in a slot, mutably.
    pub fn record_mut(&mut self, slot: SlotId) -> PageResult<&mut [u8]> {
        let (start, end) = self.record_extent(slot)?;
        Ok(&mut self.header.bytes_mut()[start..end])
    }

    /// Chooses the slot for a new record, compacting if that makes room.
    ///
    /// Returns `None` if the record cannot fit on this page.
    pub fn pre_alloc(&mut self, slot_type: SlotType) -> Option<SlotId> {
        let needed = slot_type.physical_len();
        let choose = |page: &Self| page.freelist_head().unwrap_or_else(|| page.num_slots());

        let slot = choose(self);
        if self.freespace_for_slot(Some(slot)) >= needed {
            return Some(slot);
        }
        self.compact();
        let slot = choose(self);
        (self.freespace_for_slot(Some(slot)) >= needed).then_some(slot)
    }

    /// Claims `slot` for a record of the given type.
    ///
    /// `slot` may be any free slot number, including one past the end of the
    /// directory; skipped slot numbers are threaded onto the freelist in
    /// increasing order.
    pub fn post_alloc(&mut self, slot: SlotId, slot_type: SlotType) -> PageResult<()> {
        if !slot_type.is_live() {
            return Err(PageError::corrupted("cannot allocate an invalid slot type"));
        }
        if self.record_type(slot).is_live() {
            return Err(PageError::corrupted(format!("slot {slot} is already allocated")));
        }

        let needed = slot_type.physical_len();
        if self.freespace_for_slot(Some(slot)) < needed {
            self.compact();
            let available = self.freespace_for_slot(Some(slot));
            if available < needed {
                return Err(PageError::PageFull { needed, available });
            }
        }

        if slot < self.num_slots() {
            self.unlink_free_slot(slot);
        }

        let num_slots = self.num_slots();
        if slot > num_slots {
            let mut last = if let Some(tail) = self.freelist_tail() {
                tail
            } else {
                self.set_field(FREELIST_FIELD, to_i16(num_slots as usize));
                self.set_raw_offset(num_slots, INVALID_SLOT);
                self.set_num_slots(num_slots + 1);
                num_slots
            };
            while self.num_slots() < slot {
                let next = self.num_slots();
                self.set_raw_length(last, to_i16(next as usize));
                self.set_raw_offset(next, INVALID_SLOT);
                self.set_num_slots(next + 1);
                last = next;
            }
            self.set_raw_length(last, INVALID_SLOT);
        }

        if self.num_slots() == slot {
            self.set_num_slots(slot + 1);
        }

        let cursor = self.freespace_cursor();
        self.set_raw_offset(slot, to_i16(cursor));
        self.set_raw_length(slot, slot_type.to_raw());
        self.set_field(FREESPACE_FIELD, to_i16(cursor + needed));
        Ok(())
    }

    /// Allocates a record, returning its slot.
    pub fn alloc(&mut self, slot_type: SlotType) -> PageResult<SlotId> {
        let slot = self.pre_alloc(slot_type).ok_or(PageError::PageFull {
            needed: slot_type.physical_len(),
            available: self.freespace(),
        })?;
        self.post_alloc(slot, slot_type)?;
        Ok(slot)
    }

    fn unlink_free_slot(&mut self, slot: SlotId) {
        let mut prev: Option<SlotId> = None;
        let mut cursor = self.freelist_head();
        let mut steps = 0;
        while let Some(current) = cursor {
            if current == slot {
                let next = self.raw_length(current);
                match prev {
                    None => self.set_field(FREELIST_FIELD, next),
                    Some(p) => self.set_raw_length(p, next),
                }
                return;
            }
            prev = Some(current);
            cursor = self.free_next(current);
            steps += 1;
            if steps > self.num_slots() {
                return;
            }
        }
    }

    /// Frees a slot.
    ///
    /// The last slot shrinks the directory; any other slot goes on the
    /// freelist. Record bytes are reclaimed by the next compaction unless
    /// the record sits right below the freespace cursor.
    pub fn free(&mut self, slot: SlotId) -> PageResult<()> {
        let (start, end) = self.record_extent(slot)?;
        if self.freespace_cursor() == end {
            self.set_field(FREESPACE_FIELD, to_i16(start));
        }

        if slot + 1 == self.num_slots() {
            self.set_num_slots(slot);
        } else {
            let head = self.header.i16_from_end(FREELIST_FIELD);
            self.set_raw_offset(slot, INVALID_SLOT);
            self.set_raw_length(slot, head);
            self.set_field(FREELIST_FIELD, to_i16(slot as usize));
        }
        Ok(())
    }

    /// Moves live records to the front of the page.
    ///
    /// Trailing free slots are dropped and the freelist is rebuilt in
    /// increasing slot order.
    pub fn compact(&mut self) {
        let num_slots = self.num_slots();
        let snapshot = self.header.bytes()[..USABLE_SIZE].to_vec();

        let mut live = Vec::new();
        for slot in 0..num_slots {
            if let Ok((start, end)) = self.record_extent(slot) {
                live.push((slot, start, end));
            }
        }
        let new_num_slots = live.last().map_or(0, |&(slot, _, _)| slot + 1);

        let mut cursor = 0usize;
        let mut freelist_tail: Option<SlotId> = None;
        self.set_field(FREELIST_FIELD, INVALID_SLOT);
        let mut live_iter = live.iter().peekable();
        for slot in 0..new_num_slots {
            if let Some(&&(live_slot, start, end)) = live_iter.peek() {
                if live_slot == slot {
                    live_iter.next();
                    let len = end - start;
                    self.header.bytes_mut()[cursor..cursor + len]
                        .copy_from_slice(&snapshot[start..end]);
                    self.set_raw_offset(slot, to_i16(cursor));
                    cursor += len;
                    continue;
                }
            }
            self.set_raw_offset(slot, INVALID_SLOT);
            self.set_raw_length(slot, INVALID_SLOT);
            match freelist_tail {
                None => self.set_field(FREELIST_FIELD, to_i16(slot as usize)),
                Some(tail) => self.set_raw_length(tail, to_i16(slot as usize)),
            }
            freelist_tail = Some(slot);
        }

        self.set_num_slots(new_num_slots);
        self.set_field(FREESPACE_FIELD, to_i16(cursor));
        let end = self.end_of_free_space();
        self.header.bytes_mut()[cursor..end].fill(0);
    }
}
