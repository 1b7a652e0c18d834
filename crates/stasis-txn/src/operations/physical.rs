//! Page-level operations and their argument encodings.
//!
//! Each function receives the whole page image under the write latch. The
//! caller stamps the page LSN afterwards.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use stasis_common::types::{PageId, RecordId, SlotId};
use stasis_storage::page::{
    format_of, records_per_page, FixedPage, PageError, PageHeader, PageResult, PageType, RecordKind,
    SlotType, SlottedPage, LSN_SIZE, PAGE_SIZE,
};

use crate::error::{TxnError, TxnResult};
use crate::region::BOUNDARY_TAG_SIZE;

/// Highest page offset a range write may touch. The LSN is owned by the
/// log machinery.
const RANGE_LIMIT: usize = PAGE_SIZE - LSN_SIZE;

/// Int32 slots of an array list header page.
pub(crate) const ARRAY_LIST_INITIAL: SlotId = 0;
pub(crate) const ARRAY_LIST_MULTIPLIER: SlotId = 1;
pub(crate) const ARRAY_LIST_RECORD_SIZE: SlotId = 2;
pub(crate) const ARRAY_LIST_MAX_OFFSET: SlotId = 3;
pub(crate) const ARRAY_LIST_FIRST_BLOCK: SlotId = 4;

/// Argument of a SET: the new value followed by the old one.
pub fn set_arg(new: &[u8], old: &[u8]) -> Bytes {
    debug_assert_eq!(new.len(), old.len());
    let mut buf = BytesMut::with_capacity(new.len() * 2);
    buf.put_slice(new);
    buf.put_slice(old);
    buf.freeze()
}

/// Argument of a PAGE_SET_RANGE over `offset..offset + new.len()`.
pub fn range_arg(offset: usize, new: &[u8], old: &[u8]) -> TxnResult<Bytes> {
    if new.len() != old.len() {
        return Err(TxnError::invalid_argument(format!(
            "range write of {} bytes over {} old bytes",
            new.len(),
            old.len()
        )));
    }
    let offset = u32::try_from(offset)
        .map_err(|_| TxnError::invalid_argument(format!("range offset {offset} too large")))?;
    let len = u32::try_from(new.len())
        .map_err(|_| TxnError::invalid_argument(format!("range of {} bytes", new.len())))?;
    let mut buf = BytesMut::with_capacity(8 + new.len() * 2);
    buf.put_u32_le(offset);
    buf.put_u32_le(len);
    buf.put_slice(new);
    buf.put_slice(old);
    Ok(buf.freeze())
}

/// Argument of an INCREMENT or DECREMENT.
pub fn delta_arg(delta: i32) -> Bytes {
    Bytes::copy_from_slice(&delta.to_le_bytes())
}

/// Argument of an ARRAY_LIST_ALLOC.
pub fn array_list_arg(initial: i32, multiplier: i32, record_size: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_i32_le(initial);
    buf.put_i32_le(multiplier);
    buf.put_i32_le(record_size);
    buf.freeze()
}

/// Record id an INITIALIZE_PAGE entry targets.
pub fn initialize_rid(
    page: PageId,
    page_type: PageType,
    record_size: usize,
) -> TxnResult<RecordId> {
    let slot = SlotId::try_from(page_type.as_i32())
        .map_err(|_| TxnError::invalid_argument(format!("page type {page_type:?} has no slot")))?;
    let size = u32::try_from(record_size)
        .map_err(|_| TxnError::invalid_argument(format!("record size {record_size} too large")))?;
    Ok(RecordId::new(page, slot, size))
}

fn record_mut(page: &mut [u8], slot: SlotId) -> PageResult<&mut [u8]> {
    format_of(page)?.record_mut(page, slot)
}

fn write_record(page: &mut [u8], slot: SlotId, value: &[u8]) -> PageResult<()> {
    let record = record_mut(page, slot)?;
    if record.len() != value.len() {
        return Err(PageError::SizeMismatch {
            slot,
            stored: record.len(),
            requested: value.len(),
        });
    }
    record.copy_from_slice(value);
    Ok(())
}

fn split_set(arg: &[u8]) -> PageResult<(&[u8], &[u8])> {
    if arg.len() % 2 != 0 {
        return Err(PageError::corrupted(format!(
            "set argument of {} bytes is not a new/old pair",
            arg.len()
        )));
    }
    Ok(arg.split_at(arg.len() / 2))
}

pub(crate) fn set(page: &mut [u8], rid: RecordId, arg: &[u8]) -> PageResult<()> {
    let (new, _) = split_set(arg)?;
    write_record(page, rid.slot, new)
}

pub(crate) fn set_inverse(page: &mut [u8], rid: RecordId, arg: &[u8]) -> PageResult<()> {
    let (_, old) = split_set(arg)?;
    write_record(page, rid.slot, old)
}

fn add_delta(page: &mut [u8], rid: RecordId, mut arg: &[u8], sign: i32) -> PageResult<()> {
    if arg.len() != 4 {
        return Err(PageError::corrupted("counter delta must be 4 bytes"));
    }
    let delta = arg.get_i32_le();
    let record = record_mut(page, rid.slot)?;
    let bytes: [u8; 4] = (&*record).try_into().map_err(|_| PageError::SizeMismatch {
        slot: rid.slot,
        stored: record.len(),
        requested: 4,
    })?;
    let value = i32::from_le_bytes(bytes).wrapping_add(delta.wrapping_mul(sign));
    record.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub(crate) fn increment(page: &mut [u8], rid: RecordId, arg: &[u8]) -> PageResult<()> {
    add_delta(page, rid, arg, 1)
}

pub(crate) fn decrement(page: &mut [u8], rid: RecordId, arg: &[u8]) -> PageResult<()> {
    add_delta(page, rid, arg, -1)
}

fn slot_type_of(rid: RecordId) -> SlotType {
    RecordKind::slot_type_for(rid.size as usize)
}

pub(crate) fn alloc(page: &mut [u8], rid: RecordId, _arg: &[u8]) -> PageResult<()> {
    let format = format_of(page)?;
    if format.record_type(page, rid.slot).is_live() {
        return Ok(());
    }
    format.post_alloc(page, rid.slot, slot_type_of(rid))
}

pub(crate) fn dealloc(page: &mut [u8], rid: RecordId, _arg: &[u8]) -> PageResult<()> {
    let format = format_of(page)?;
    if !format.record_type(page, rid.slot).is_live() {
        return Ok(());
    }
    format.free(page, rid.slot)
}

pub(crate) fn realloc(page: &mut [u8], rid: RecordId, arg: &[u8]) -> PageResult<()> {
    let format = format_of(page)?;
    if !format.record_type(page, rid.slot).is_live() {
        format.post_alloc(page, rid.slot, slot_type_of(rid))?;
    }
    if arg.is_empty() {
        return Ok(());
    }
    write_record(page, rid.slot, arg)
}

fn split_range(mut arg: &[u8]) -> PageResult<(usize, &[u8], &[u8])> {
    if arg.len() < 8 {
        return Err(PageError::corrupted("range argument is truncated"));
    }
    let offset = arg.get_u32_le() as usize;
    let len = arg.get_u32_le() as usize;
    if arg.len() != len * 2 {
        return Err(PageError::corrupted(format!(
            "range argument carries {} bytes for a {len}-byte range",
            arg.len()
        )));
    }
    if offset + len > RANGE_LIMIT {
        return Err(PageError::OutOfBounds {
            offset,
            end: offset + len,
        });
    }
    let (new, old) = arg.split_at(len);
    Ok((offset, new, old))
}

pub(crate) fn page_set_range(page: &mut [u8], _rid: RecordId, arg: &[u8]) -> PageResult<()> {
    let (offset, new, _) = split_range(arg)?;
    page[offset..offset + new.len()].copy_from_slice(new);
    Ok(())
}

pub(crate) fn page_set_range_inverse(
    page: &mut [u8],
    _rid: RecordId,
    arg: &[u8],
) -> PageResult<()> {
    let (offset, _, old) = split_range(arg)?;
    page[offset..offset + old.len()].copy_from_slice(old);
    Ok(())
}

pub(crate) fn initialize_page(page: &mut [u8], rid: RecordId, _arg: &[u8]) -> PageResult<()> {
    let raw = i32::try_from(rid.slot)
        .map_err(|_| PageError::corrupted(format!("slot {} is not a page type", rid.slot)))?;
    let page_type =
        PageType::from_i32(raw).ok_or_else(|| PageError::wrong_type("a page type", raw))?;
    if page_type.is_slotted_layout() {
        SlottedPage::new(page).initialize(page_type);
    } else if page_type.is_fixed_layout() {
        let size = rid.size as usize;
        let count = records_per_page(size);
        if count == 0 {
            return Err(PageError::corrupted(format!(
                "fixed records of {size} bytes do not fit on a page"
            )));
        }
        FixedPage::new(page).initialize(page_type, size, count);
    } else {
        PageHeader::new(page).reset(page_type);
    }
    Ok(())
}

pub(crate) fn alloc_boundary_tag(page: &mut [u8], _rid: RecordId, arg: &[u8]) -> PageResult<()> {
    if arg.len() != BOUNDARY_TAG_SIZE {
        return Err(PageError::corrupted(format!(
            "boundary tag argument has {} bytes",
            arg.len()
        )));
    }
    let mut tag_page = SlottedPage::new(&mut *page);
    tag_page.initialize(PageType::BoundaryTag);
    tag_page.post_alloc(0, SlotType::Normal(BOUNDARY_TAG_SIZE as u16))?;
    tag_page.record_mut(0)?.copy_from_slice(arg);
    Ok(())
}

pub(crate) fn array_list_alloc(page: &mut [u8], rid: RecordId, mut arg: &[u8]) -> PageResult<()> {
    if arg.len() != 12 {
        return Err(PageError::corrupted("array list argument must be 12 bytes"));
    }
    let initial = arg.get_i32_le();
    let multiplier = arg.get_i32_le();
    let record_size = arg.get_i32_le();
    let first_block = i32::try_from(rid.page.as_u64() + 1)
        .map_err(|_| PageError::corrupted("array list header page is out of range"))?;

    let mut header = FixedPage::new(&mut *page);
    header.initialize(PageType::ArrayList, 4, records_per_page(4));
    for (slot, value) in [
        (ARRAY_LIST_INITIAL, initial),
        (ARRAY_LIST_MULTIPLIER, multiplier),
        (ARRAY_LIST_RECORD_SIZE, record_size),
        (ARRAY_LIST_MAX_OFFSET, -1),
        (ARRAY_LIST_FIRST_BLOCK, first_block),
    ] {
        header.record_mut(slot)?.copy_from_slice(&value.to_le_bytes());
    }
    Ok(())
}
