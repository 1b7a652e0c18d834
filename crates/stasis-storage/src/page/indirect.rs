//! Indirect pages: interior nodes of pre-sized record arrays.
//!
//! An indirect page holds `(child page, max slot)` pairs of little-endian
//! i64 values starting at offset 0. `max slot` is cumulative: entry `i`
//! covers logical slots `[max(i-1), max(i))` relative to this page. A
//! `level` field before the trailer records the node's height.

use stasis_common::types::{PageId, SlotId};

use super::error::{PageError, PageResult};
use super::header::{PageHeader, USABLE_SIZE};
use super::types::PageType;

const LEVEL_FIELD: usize = 3;
const POINTER_SIZE: usize = 16;

/// Number of child pointers that fit on an indirect page.
pub const INDIRECT_POINTERS_PER_PAGE: usize = (USABLE_SIZE - 2 * LEVEL_FIELD) / POINTER_SIZE;

/// Height of the tree needed to address `record_count` records when each
/// leaf holds `records_per_leaf` of them. Zero means a single leaf.
#[must_use]
pub fn calculate_level(records_per_leaf: usize, record_count: usize) -> u16 {
    let mut level = 0;
    let mut reach = records_per_leaf.max(1);
    while reach < record_count {
        reach = reach.saturating_mul(INDIRECT_POINTERS_PER_PAGE);
        level += 1;
    }
    level
}

/// An indirect page view.
#[derive(Debug)]
pub struct IndirectPage<B> {
    header: PageHeader<B>,
}

impl<B: AsRef<[u8]>> IndirectPage<B> {
    /// Creates an indirect view over a page image.
    #[inline]
    pub fn new(data: B) -> Self {
        Self {
            header: PageHeader::new(data),
        }
    }

    /// Height of this node above the leaves.
    #[inline]
    pub fn level(&self) -> u16 {
        u16::try_from(self.header.i16_from_end(LEVEL_FIELD)).unwrap_or(0)
    }

    /// Child page of entry `i`.
    pub fn child(&self, i: usize) -> PageId {
        let raw = self.header.i64_at(POINTER_SIZE * i);
        u64::try_from(raw).map_or(PageId::INVALID, PageId::new)
    }

    /// Cumulative slot bound of entry `i`.
    pub fn max_slot(&self, i: usize) -> u64 {
        u64::try_from(self.header.i64_at(POINTER_SIZE * i + 8)).unwrap_or(0)
    }

    /// Maps a logical slot to the child that holds it and the slot relative
    /// to that child.
    pub fn lookup(&self, slot: u64) -> PageResult<(PageId, u64)> {
        let mut base = 0u64;
        for i in 0..INDIRECT_POINTERS_PER_PAGE {
            let bound = self.max_slot(i);
            if bound == 0 {
                break;
            }
            if slot < bound {
                return Ok((self.child(i), slot - base));
            }
            base = bound;
        }
        Err(PageError::NoSuchSlot {
            slot: SlotId::try_from(slot).unwrap_or(SlotId::MAX),
        })
    }

    /// Total number of records addressed through this node.
    pub fn total_records(&self) -> u64 {
        (0..INDIRECT_POINTERS_PER_PAGE)
            .map(|i| self.max_slot(i))
            .take_while(|&bound| bound != 0)
            .last()
            .unwrap_or(0)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> IndirectPage<B> {
    /// Formats the page as an empty indirect node of the given level.
    pub fn initialize(&mut self, level: u16) {
        self.header.reset(PageType::Indirect);
        self.header
            .set_i16_from_end(LEVEL_FIELD, i16::try_from(level).unwrap_or(i16::MAX));
    }

    /// Sets entry `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i` is not below [`INDIRECT_POINTERS_PER_PAGE`].
    pub fn set_child(&mut self, i: usize, child: PageId, max_slot: u64) {
        assert!(i < INDIRECT_POINTERS_PER_PAGE, "indirect entry {i} out of range");
        let child = i64::try_from(child.as_u64()).unwrap_or(-1);
        let max_slot = i64::try_from(max_slot).unwrap_or(i64::MAX);
        self.header.set_i64_at(POINTER_SIZE * i, child);
        self.header.set_i64_at(POINTER_SIZE * i + 8, max_slot);
    }
}
