//! Growable arrays of fixed-size records.
//!
//! An array list is a header page followed by blocks of fixed pages. The
//! header is a fixed page of i32 slots:
//!
//! | slot | value |
//! |------|-------|
//! | 0 | pages in block 0 |
//! | 1 | growth multiplier |
//! | 2 | record size |
//! | 3 | highest valid offset, -1 when empty |
//! | 4 + i | first page of block i |
//!
//! Block `i` holds `initial * multiplier^i` pages. Block 0 is allocated with
//! the header; later blocks are allocated as the list grows.

use tracing::debug;

use stasis_common::constants::STORAGE_MANAGER_ARRAY_LIST;
use stasis_common::types::{PageId, RecordId, SlotId, TxnId};
use stasis_storage::page::{records_per_page, FixedPage, PageType};

use crate::error::{TxnError, TxnResult};
use crate::manager::TransactionManager;
use crate::operations::physical::{
    array_list_arg, ARRAY_LIST_FIRST_BLOCK, ARRAY_LIST_INITIAL, ARRAY_LIST_MAX_OFFSET,
    ARRAY_LIST_MULTIPLIER, ARRAY_LIST_RECORD_SIZE,
};
use crate::operations::OperationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArrayListHeader {
    initial: u64,
    multiplier: u64,
    record_size: usize,
    max_offset: i64,
}

impl ArrayListHeader {
    fn records_per_page(&self) -> u64 {
        records_per_page(self.record_size) as u64
    }

    fn block_pages(&self, block: u32) -> u64 {
        (0..block).fold(self.initial, |pages, _| pages.saturating_mul(self.multiplier))
    }

    /// Block holding `offset` and the first offset stored in that block.
    fn block_of(&self, offset: u64) -> (u32, u64) {
        let per_page = self.records_per_page();
        let mut block = 0;
        let mut low = 0u64;
        let mut high = per_page.saturating_mul(self.initial);
        while offset >= high {
            block += 1;
            low = high;
            high = high.saturating_add(per_page.saturating_mul(self.block_pages(block)));
        }
        (block, low)
    }
}

fn header_slot(header: PageId, slot: SlotId) -> RecordId {
    RecordId::new(header, slot, 4)
}

impl TransactionManager {
    /// Creates an empty array list of `record_size`-byte records whose
    /// first block spans `initial` pages.
    pub fn array_list_alloc(
        &self,
        xid: TxnId,
        initial: u32,
        multiplier: u32,
        record_size: usize,
    ) -> TxnResult<RecordId> {
        if initial == 0 || multiplier == 0 || records_per_page(record_size) == 0 {
            return Err(TxnError::invalid_argument(format!(
                "array list of {record_size}-byte records, initial {initial}, \
                 multiplier {multiplier}"
            )));
        }
        let arg_of = |value: u32| {
            i32::try_from(value)
                .map_err(|_| TxnError::invalid_argument(format!("{value} is out of range")))
        };
        let arg = array_list_arg(
            arg_of(initial)?,
            arg_of(multiplier)?,
            arg_of(record_size as u32)?,
        );

        let header = self.region_alloc(xid, u64::from(initial) + 1, STORAGE_MANAGER_ARRAY_LIST)?;
        let rid = RecordId::new(header, 0, record_size as u32);
        self.update(xid, rid, OperationId::ARRAY_LIST_ALLOC, arg)?;
        for i in 1..=u64::from(initial) {
            self.initialize_fixed_page(xid, header.offset_by(i), record_size)?;
        }
        debug!(%xid, %header, initial, multiplier, record_size, "Allocated array list");
        Ok(rid)
    }

    /// Grows the list by `slots` records.
    pub fn array_list_extend(&self, xid: TxnId, list: RecordId, slots: u64) -> TxnResult<()> {
        self.write_lock(xid, RecordId::for_page(list.page))?;
        let header = self.array_list_header(list.page)?;
        let last_block = |max_offset: i64| {
            u64::try_from(max_offset).ok().map(|offset| header.block_of(offset).0)
        };
        let new_max = header.max_offset + i64::try_from(slots).unwrap_or(i64::MAX);
        let current = last_block(header.max_offset);
        let Some(target) = last_block(new_max) else {
            return Ok(());
        };

        let first_new = current.map_or(0, |block| block + 1);
        for block in first_new..=target {
            let pages = header.block_pages(block);
            let first = self.page_alloc_many(xid, pages)?;
            for i in 0..pages {
                self.initialize_fixed_page(xid, first.offset_by(i), header.record_size)?;
            }
            let first = i32::try_from(first.as_u64()).map_err(|_| {
                TxnError::invalid_argument(format!("page {first} does not fit an array list"))
            })?;
            self.set(
                xid,
                header_slot(list.page, ARRAY_LIST_FIRST_BLOCK + block),
                &first.to_le_bytes(),
            )?;
        }

        let new_max = i32::try_from(new_max).map_err(|_| {
            TxnError::invalid_argument(format!("array list cannot hold {new_max} records"))
        })?;
        self.set(xid, header_slot(list.page, ARRAY_LIST_MAX_OFFSET), &new_max.to_le_bytes())?;
        debug!(%xid, list = %list.page, slots, "Extended array list");
        Ok(())
    }

    /// Number of records in the list.
    pub fn array_list_length(&self, xid: TxnId, list: RecordId) -> TxnResult<u64> {
        self.read_lock(xid, RecordId::for_page(list.page))?;
        let header = self.array_list_header(list.page)?;
        Ok(u64::try_from(header.max_offset + 1).unwrap_or(0))
    }

    /// Record `offset` of the list.
    pub fn array_list_dereference(
        &self,
        xid: TxnId,
        list: RecordId,
        offset: u64,
    ) -> TxnResult<RecordId> {
        self.read_lock(xid, RecordId::for_page(list.page))?;
        let header = self.array_list_header(list.page)?;
        if i64::try_from(offset).map_or(true, |offset| offset > header.max_offset) {
            return Err(TxnError::bad_record(
                list,
                format!("offset {offset} is past the end of the list"),
            ));
        }

        let (block, low) = header.block_of(offset);
        let first = self.header_field(list.page, ARRAY_LIST_FIRST_BLOCK + block)?;
        let first = u64::try_from(first)
            .map_err(|_| TxnError::bad_record(list, format!("block {block} has no pages")))?;
        let in_block = offset - low;
        let per_page = header.records_per_page();
        let slot = SlotId::try_from(in_block % per_page)
            .map_err(|_| TxnError::bad_record(list, "slot out of range"))?;
        Ok(RecordId::new(
            PageId::new(first + in_block / per_page),
            slot,
            header.record_size as u32,
        ))
    }

    fn array_list_header(&self, page: PageId) -> TxnResult<ArrayListHeader> {
        let handle = self.pool.load_page(page)?;
        let image = handle.read();
        if image.header().page_type() != Some(PageType::ArrayList) {
            return Err(TxnError::WrongPageType {
                page,
                found: image.header().raw_page_type(),
                expected: "array list",
            });
        }
        let field = |slot| -> TxnResult<i32> {
            let (start, _) = FixedPage::new(&*image).record_extent(slot)?;
            Ok(image.header().i32_at(start))
        };
        let positive = |slot| -> TxnResult<u64> {
            let value = field(slot)?;
            u64::try_from(value)
                .ok()
                .filter(|value| *value > 0)
                .ok_or_else(|| {
                    let reason = format!("header slot {slot} holds {value}");
                    TxnError::bad_record(RecordId::for_page(page), reason)
                })
        };
        Ok(ArrayListHeader {
            initial: positive(ARRAY_LIST_INITIAL)?,
            multiplier: positive(ARRAY_LIST_MULTIPLIER)?,
            record_size: positive(ARRAY_LIST_RECORD_SIZE)? as usize,
            max_offset: i64::from(field(ARRAY_LIST_MAX_OFFSET)?),
        })
    }

    fn header_field(&self, page: PageId, slot: SlotId) -> TxnResult<i32> {
        let handle = self.pool.load_page(page)?;
        let image = handle.read();
        let (start, _) = FixedPage::new(&*image).record_extent(slot)?;
        Ok(image.header().i32_at(start))
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
    fn test_block_math() {
        let header = ArrayListHeader {
            initial: 2,
            multiplier: 2,
            record_size: 1000,
            max_offset: -1,
        };
        // Four 1000-byte records per page.
        assert_eq!(header.records_per_page(), 4);
        assert_eq!(header.block_of(0), (0, 0));
        assert_eq!(header.block_of(7), (0, 0));
        assert_eq!(header.block_of(8), (1, 8));
        assert_eq!(header.block_of(23), (1, 8));
        assert_eq!(header.block_of(24), (2, 24));
        assert_eq!(header.block_pages(2), 8);
    }

    #[test]
    fn test_new_list_is_empty() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let list = tm.array_list_alloc(xid, 2, 2, 8).unwrap();
        assert_eq!(tm.array_list_length(xid, list).unwrap(), 0);
        assert!(tm.array_list_dereference(xid, list, 0).is_err());
        assert_eq!(tm.page_type(list.page).unwrap(), Some(PageType::ArrayList));
        tm.commit(xid).unwrap();
    }

    #[test]
    fn test_extend_across_blocks() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let list = tm.array_list_alloc(xid, 1, 2, 1000).unwrap();
        tm.array_list_extend(xid, list, 30).unwrap();
        assert_eq!(tm.array_list_length(xid, list).unwrap(), 30);

        for offset in [0u64, 3, 4, 11, 12, 29] {
            let rid = tm.array_list_dereference(xid, list, offset).unwrap();
            assert_eq!(tm.page_type(rid.page).unwrap(), Some(PageType::Fixed));
            tm.set(xid, rid, &[offset as u8; 1000]).unwrap();
        }
        for offset in [0u64, 3, 4, 11, 12, 29] {
            let rid = tm.array_list_dereference(xid, list, offset).unwrap();
            assert_eq!(tm.read(xid, rid).unwrap(), vec![offset as u8; 1000]);
        }
        let a = tm.array_list_dereference(xid, list, 3).unwrap();
        let b = tm.array_list_dereference(xid, list, 4).unwrap();
        assert_ne!(a.page, b.page);
        tm.commit(xid).unwrap();
    }

    #[test]
    fn test_aborted_extend_is_undone() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let list = tm.array_list_alloc(xid, 1, 2, 8).unwrap();
        tm.array_list_extend(xid, list, 5).unwrap();
        tm.commit(xid).unwrap();

        let xid = tm.begin().unwrap();
        tm.array_list_extend(xid, list, 10_000).unwrap();
        tm.abort(xid).unwrap();

        let xid = tm.begin().unwrap();
        assert_eq!(tm.array_list_length(xid, list).unwrap(), 5);
        tm.commit(xid).unwrap();
    }
}
