//! Pre-sized record arrays addressed through indirect pages.
//!
//! [`TransactionManager::alloc_many`] lays out `count` equal-sized records
//! as a tree: slotted leaves hold the records, indirect pages above them
//! hold `(child, max slot)` pairs. The pages are allocated as one
//! contiguous run, root first and leaves last.
//!
//! ```text
//!              [root: indirect, level 1]
//!              /            |           \
//!    [leaf 0..n)     [leaf n..2n)     [leaf 2n..count)
//! ```

use tracing::debug;

use stasis_common::constants::BLOB_THRESHOLD_SIZE;
use stasis_common::types::{PageId, RecordId, SlotId, TxnId};
use stasis_storage::page::{
    calculate_level, IndirectPage, PageType, SlotType, SlottedPage, INDIRECT_POINTERS_PER_PAGE,
    PAGE_SIZE, SLOTTED_HEADER_OVERHEAD, SLOTTED_OVERHEAD_PER_RECORD, USABLE_SIZE,
};

use crate::error::{TxnError, TxnResult};
use crate::manager::TransactionManager;

/// Number of `record_size`-byte records a slotted leaf holds.
fn records_per_leaf(record_size: usize) -> usize {
    (USABLE_SIZE - SLOTTED_HEADER_OVERHEAD) / (record_size + SLOTTED_OVERHEAD_PER_RECORD)
}

/// Shape of a record array tree.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TreeShape {
    count: u64,
    per_leaf: u64,
    /// Nodes per height, leaves first.
    widths: Vec<u64>,
}

impl TreeShape {
    fn new(per_leaf: usize, count: u64) -> Self {
        let fanout = INDIRECT_POINTERS_PER_PAGE as u64;
        let per_leaf = per_leaf as u64;
        let mut widths = vec![count.div_ceil(per_leaf)];
        while let Some(&width) = widths.last() {
            if width <= 1 {
                break;
            }
            widths.push(width.div_ceil(fanout));
        }
        Self {
            count,
            per_leaf,
            widths,
        }
    }

    fn height(&self) -> usize {
        self.widths.len() - 1
    }

    fn total_pages(&self) -> u64 {
        self.widths.iter().sum()
    }

    /// Records addressed by one full node at `height`.
    fn capacity(&self, height: usize) -> u64 {
        let fanout = INDIRECT_POINTERS_PER_PAGE as u64;
        (0..height).fold(self.per_leaf, |reach, _| reach.saturating_mul(fanout))
    }

    /// Page of node `index` at `height`, given the tree's first page.
    fn page_of(&self, first: PageId, height: usize, index: u64) -> PageId {
        let above: u64 = self.widths[height + 1..].iter().sum();
        first.offset_by(above + index)
    }

    /// Exclusive end of the records node `index` at `height` covers.
    fn end_of(&self, height: usize, index: u64) -> u64 {
        self.count.min((index + 1).saturating_mul(self.capacity(height)))
    }
}

impl TransactionManager {
    /// Allocates an array of `count` records of `record_size` bytes each.
    ///
    /// Returns a handle for [`TransactionManager::dereference`]; the handle
    /// itself is not a readable record.
    pub fn alloc_many(&self, xid: TxnId, record_size: usize, count: u64) -> TxnResult<RecordId> {
        if record_size == 0 || record_size >= BLOB_THRESHOLD_SIZE || count == 0 {
            return Err(TxnError::invalid_argument(format!(
                "array of {count} records of {record_size} bytes"
            )));
        }
        self.check_writable(xid)?;
        let size = record_size as u32;
        let shape = TreeShape::new(records_per_leaf(record_size), count);
        debug_assert_eq!(
            shape.height(),
            usize::from(calculate_level(records_per_leaf(record_size), count as usize))
        );
        let first = self.page_alloc_many(xid, shape.total_pages())?;

        let mut image = vec![0u8; PAGE_SIZE];
        for leaf in 0..shape.widths[0] {
            image.fill(0);
            let mut page = SlottedPage::new(&mut image[..]);
            page.initialize(PageType::Slotted);
            let records = shape.end_of(0, leaf) - leaf * shape.per_leaf;
            for _ in 0..records {
                page.alloc(SlotType::Normal(size as u16))?;
            }
            self.page_set(xid, shape.page_of(first, 0, leaf), &image)?;
        }

        for height in 1..shape.widths.len() {
            let fanout = INDIRECT_POINTERS_PER_PAGE as u64;
            for node in 0..shape.widths[height] {
                image.fill(0);
                let mut page = IndirectPage::new(&mut image[..]);
                page.initialize(height as u16);
                let base = node * shape.capacity(height);
                let children = (node * fanout)..((node + 1) * fanout).min(shape.widths[height - 1]);
                for (i, child) in children.enumerate() {
                    let bound = shape.end_of(height - 1, child) - base;
                    page.set_child(i, shape.page_of(first, height - 1, child), bound);
                }
                self.page_set(xid, shape.page_of(first, height, node), &image)?;
            }
        }

        debug!(
            %xid,
            root = %first,
            count,
            record_size,
            pages = shape.total_pages(),
            "Allocated record array"
        );
        Ok(RecordId::new(first, 0, size))
    }

    /// Record `offset` of an array from [`TransactionManager::alloc_many`].
    pub fn dereference(&self, xid: TxnId, array: RecordId, offset: u64) -> TxnResult<RecordId> {
        self.check_open()?;
        let mut page = array.page;
        let mut slot = offset;
        loop {
            self.read_lock(xid, RecordId::for_page(page))?;
            let handle = self.pool.load_page(page)?;
            let image = handle.read();
            match image.header().page_type() {
                Some(PageType::Indirect) => {
                    (page, slot) = IndirectPage::new(&*image).lookup(slot)?;
                }
                Some(PageType::Slotted) => {
                    let rid = SlotId::try_from(slot)
                        .ok()
                        .map(|slot| RecordId::new(page, slot, array.size))
                        .filter(|rid| SlottedPage::new(&*image).record_type(rid.slot).is_live())
                        .ok_or_else(|| {
                            let reason = format!("array has no record at offset {offset}");
                            TxnError::bad_record(array, reason)
                        })?;
                    return Ok(rid);
                }
                _ => {
                    return Err(TxnError::WrongPageType {
                        page,
                        found: image.header().raw_page_type(),
                        expected: "indirect or slotted",
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use stasis_common::config::StasisConfig;

    use super::*;

    fn open() -> TransactionManager {
        TransactionManager::open(StasisConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_tree_shape() {
        let single = TreeShape::new(100, 40);
        assert_eq!(single.widths, vec![1]);
        assert_eq!(single.height(), 0);

        let two_levels = TreeShape::new(100, 250);
        assert_eq!(two_levels.widths, vec![3, 1]);
        assert_eq!(two_levels.total_pages(), 4);
        assert_eq!(two_levels.end_of(0, 2), 250);
        assert_eq!(two_levels.page_of(PageId::new(10), 1, 0), PageId::new(10));
        assert_eq!(two_levels.page_of(PageId::new(10), 0, 0), PageId::new(11));

        let fanout = INDIRECT_POINTERS_PER_PAGE as u64;
        let deep = TreeShape::new(1, fanout + 1);
        assert_eq!(deep.widths, vec![fanout + 1, 2, 1]);
        assert_eq!(deep.height(), usize::from(calculate_level(1, fanout as usize + 1)));
    }

    #[test]
    fn test_single_leaf_array() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let array = tm.alloc_many(xid, 8, 10).unwrap();
        let rid = tm.dereference(xid, array, 9).unwrap();
        assert_eq!(rid.page, array.page);
        assert_eq!(rid.slot, 9);
        tm.set(xid, rid, b"12345678").unwrap();
        assert_eq!(tm.read(xid, rid).unwrap(), b"12345678");
        assert!(tm.dereference(xid, array, 10).is_err());
        tm.commit(xid).unwrap();
    }

    #[test]
    fn test_multi_level_array() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let per_leaf = records_per_leaf(100) as u64;
        let count = per_leaf * 3 + 1;
        let array = tm.alloc_many(xid, 100, count).unwrap();
        assert_eq!(tm.page_type(array.page).unwrap(), Some(PageType::Indirect));

        let mut seen = std::collections::HashSet::new();
        for offset in [0, per_leaf - 1, per_leaf, count - 1] {
            let rid = tm.dereference(xid, array, offset).unwrap();
            assert_eq!(rid.size, 100);
            assert!(seen.insert((rid.page, rid.slot)));
            tm.set(xid, rid, &[offset as u8; 100]).unwrap();
        }
        let last = tm.dereference(xid, array, count - 1).unwrap();
        assert_eq!(last.slot, 0);
        assert_eq!(tm.read(xid, last).unwrap(), vec![(count - 1) as u8; 100]);
        assert!(tm.dereference(xid, array, count).is_err());
        tm.commit(xid).unwrap();
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let tm = open();
        let xid = tm.begin().unwrap();
        assert!(tm.alloc_many(xid, 0, 4).is_err());
        assert!(tm.alloc_many(xid, BLOB_THRESHOLD_SIZE, 4).is_err());
        assert!(tm.alloc_many(xid, 4, 0).is_err());
        tm.commit(xid).unwrap();
    }
}
