//! Record-level dispatch over page layouts.
//!
//! Higher layers address records by `(page, slot)` without caring whether the
//! page is slotted or fixed. [`format_of`] picks the [`PageFormat`] for a page
//! image from its trailer, and [`RecordKind`] tells inline records apart from
//! references into the blob store.

use std::fmt;

use stasis_common::types::SlotId;
use stasis_common::BLOB_THRESHOLD_SIZE;

use super::error::{PageError, PageResult};
use super::fixed::FixedPage;
use super::header::PageHeader;
use super::slotted::SlottedPage;
use super::types::{PageType, SlotType};

/// Encoded size of a [`BlobRef`].
pub const BLOB_REF_SIZE: usize = 16;

/// Location of a record stored out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobRef {
    /// Blob store handle.
    pub id: u64,
    /// Length of the blob in bytes.
    pub size: u64,
}

impl BlobRef {
    /// Encodes the reference as it is stored in a `BLOB_SLOT` record.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; BLOB_REF_SIZE] {
        let mut out = [0u8; BLOB_REF_SIZE];
        out[..8].copy_from_slice(&self.id.to_le_bytes());
        out[8..].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    /// Decodes a reference from a `BLOB_SLOT` record.
    pub fn from_bytes(bytes: &[u8]) -> PageResult<Self> {
        if bytes.len() != BLOB_REF_SIZE {
            return Err(PageError::corrupted(format!(
                "blob reference has {} bytes",
                bytes.len()
            )));
        }
        let mut id = [0u8; 8];
        let mut size = [0u8; 8];
        id.copy_from_slice(&bytes[..8]);
        size.copy_from_slice(&bytes[8..]);
        Ok(Self {
            id: u64::from_le_bytes(id),
            size: u64::from_le_bytes(size),
        })
    }
}

/// How a record's bytes are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Bytes live in the slot itself.
    Inline(usize),
    /// The slot holds a [`BlobRef`].
    Blob(BlobRef),
}

impl RecordKind {
    /// Slot type used to store a record of `size` bytes.
    #[must_use]
    pub fn slot_type_for(size: usize) -> SlotType {
        if size >= BLOB_THRESHOLD_SIZE {
            SlotType::Blob
        } else {
            SlotType::Normal(u16::try_from(size).unwrap_or(u16::MAX))
        }
    }

    /// Resolves a slot's type and stored bytes into a record kind.
    pub fn resolve(slot_type: SlotType, stored: &[u8]) -> PageResult<Self> {
        match slot_type {
            SlotType::Normal(len) => Ok(Self::Inline(usize::from(len))),
            SlotType::Blob => BlobRef::from_bytes(stored).map(Self::Blob),
            SlotType::Invalid => Err(PageError::corrupted("record slot is not allocated")),
        }
    }

    /// Caller-visible length of the record.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Inline(len) => *len,
            Self::Blob(blob) => usize::try_from(blob.size).unwrap_or(usize::MAX),
        }
    }

    /// Returns true for zero-length records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Record operations over one page layout.
///
/// Implementations are stateless; the page image is passed to every call.
pub trait PageFormat: Send + Sync + fmt::Debug {
    /// Layout name for diagnostics.
    fn name(&self) -> &'static str;

    /// What the slot holds.
    fn record_type(&self, page: &[u8], slot: SlotId) -> SlotType;

    /// The record's stored bytes.
    fn record<'a>(&self, page: &'a [u8], slot: SlotId) -> PageResult<&'a [u8]>;

    /// The record's stored bytes, mutably.
    fn record_mut<'a>(&self, page: &'a mut [u8], slot: SlotId) -> PageResult<&'a mut [u8]>;

    /// Picks a slot for a new record, or `None` if it does not fit.
    fn pre_alloc(&self, page: &mut [u8], slot_type: SlotType) -> Option<SlotId>;

    /// Claims a slot chosen by `pre_alloc` (or named by a log entry).
    fn post_alloc(&self, page: &mut [u8], slot: SlotId, slot_type: SlotType) -> PageResult<()>;

    /// Releases a slot.
    fn free(&self, page: &mut [u8], slot: SlotId) -> PageResult<()>;

    /// Bytes available to the next allocation.
    fn freespace(&self, page: &[u8]) -> usize;

    /// Next live slot after `after`.
    fn next_slot(&self, page: &[u8], after: Option<SlotId>) -> Option<SlotId>;

    /// Defragments the page. Layouts without fragmentation do nothing.
    fn compact(&self, _page: &mut [u8]) {}

    /// Structural validation.
    fn fsck(&self, page: &[u8]) -> PageResult<()>;
}

/// Slotted layout (`SLOTTED`, `BOUNDARY_TAG`, `SLOTTED_LSN_FREE`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SlottedFormat;

/// Fixed layout (`FIXED`, `ARRAY_LIST`).
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedFormat;

impl PageFormat for SlottedFormat {
    fn name(&self) -> &'static str {
        "slotted"
    }

    fn record_type(&self, page: &[u8], slot: SlotId) -> SlotType {
        SlottedPage::new(page).record_type(slot)
    }

    fn record<'a>(&self, page: &'a [u8], slot: SlotId) -> PageResult<&'a [u8]> {
        let (start, end) = SlottedPage::new(page).record_extent(slot)?;
        Ok(&page[start..end])
    }

    fn record_mut<'a>(&self, page: &'a mut [u8], slot: SlotId) -> PageResult<&'a mut [u8]> {
        let (start, end) = SlottedPage::new(&*page).record_extent(slot)?;
        Ok(&mut page[start..end])
    }

    fn pre_alloc(&self, page: &mut [u8], slot_type: SlotType) -> Option<SlotId> {
        SlottedPage::new(page).pre_alloc(slot_type)
    }

    fn post_alloc(&self, page: &mut [u8], slot: SlotId, slot_type: SlotType) -> PageResult<()> {
        SlottedPage::new(page).post_alloc(slot, slot_type)
    }

    fn free(&self, page: &mut [u8], slot: SlotId) -> PageResult<()> {
        SlottedPage::new(page).free(slot)
    }

    fn freespace(&self, page: &[u8]) -> usize {
        SlottedPage::new(page).freespace()
    }

    fn next_slot(&self, page: &[u8], after: Option<SlotId>) -> Option<SlotId> {
        SlottedPage::new(page).next_slot(after)
    }

    fn compact(&self, page: &mut [u8]) {
        SlottedPage::new(page).compact();
    }

    fn fsck(&self, page: &[u8]) -> PageResult<()> {
        SlottedPage::new(page).fsck()
    }
}

impl PageFormat for FixedFormat {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn record_type(&self, page: &[u8], slot: SlotId) -> SlotType {
        FixedPage::new(page).record_type(slot)
    }

    fn record<'a>(&self, page: &'a [u8], slot: SlotId) -> PageResult<&'a [u8]> {
        let (start, end) = FixedPage::new(page).record_extent(slot)?;
        Ok(&page[start..end])
    }

    fn record_mut<'a>(&self, page: &'a mut [u8], slot: SlotId) -> PageResult<&'a mut [u8]> {
        let (start, end) = FixedPage::new(&*page).record_extent(slot)?;
        Ok(&mut page[start..end])
    }

    fn pre_alloc(&self, page: &mut [u8], slot_type: SlotType) -> Option<SlotId> {
        FixedPage::new(page).pre_alloc(slot_type)
    }

    fn post_alloc(&self, page: &mut [u8], slot: SlotId, slot_type: SlotType) -> PageResult<()> {
        let mut fixed = FixedPage::new(page);
        if slot_type.physical_len() != fixed.record_size() {
            return Err(PageError::SizeMismatch {
                slot,
                stored: fixed.record_size(),
                requested: slot_type.physical_len(),
            });
        }
        fixed.post_alloc(slot)
    }

    fn free(&self, page: &mut [u8], slot: SlotId) -> PageResult<()> {
        FixedPage::new(page).free(slot)
    }

    fn freespace(&self, page: &[u8]) -> usize {
        FixedPage::new(page).freespace()
    }

    fn next_slot(&self, page: &[u8], after: Option<SlotId>) -> Option<SlotId> {
        FixedPage::new(page).next_slot(after)
    }

    fn fsck(&self, page: &[u8]) -> PageResult<()> {
        FixedPage::new(page).fsck()
    }
}

static SLOTTED_FORMAT: SlottedFormat = SlottedFormat;
static FIXED_FORMAT: FixedFormat = FixedFormat;

/// Returns the record layout for a page type, if it stores records.
#[must_use]
pub fn format_for(page_type: PageType) -> Option<&'static dyn PageFormat> {
    if page_type.is_slotted_layout() {
        Some(&SLOTTED_FORMAT)
    } else if page_type.is_fixed_layout() {
        Some(&FIXED_FORMAT)
    } else {
        None
    }
}

/// Returns the record layout of a page image.
pub fn format_of(page: &[u8]) -> PageResult<&'static dyn PageFormat> {
    let header = PageHeader::new(page);
    let raw = header.raw_page_type();
    header
        .page_type()
        .and_then(format_for)
        .ok_or_else(|| PageError::wrong_type("a record page", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stasis_common::PAGE_SIZE;

    #[test]
    fn test_blob_ref_encoding() {
        let blob = BlobRef { id: 7, size: 9000 };
        let bytes = blob.to_bytes();
        assert_eq!(BlobRef::from_bytes(&bytes).unwrap(), blob);
        assert!(BlobRef::from_bytes(&bytes[..8]).is_err());
    }

    #[test]
    fn test_record_kind() {
        assert_eq!(RecordKind::slot_type_for(10), SlotType::Normal(10));
        assert_eq!(RecordKind::slot_type_for(BLOB_THRESHOLD_SIZE), SlotType::Blob);

        let blob = BlobRef { id: 1, size: 5000 };
        let kind = RecordKind::resolve(SlotType::Blob, &blob.to_bytes()).unwrap();
        assert_eq!(kind, RecordKind::Blob(blob));
        assert_eq!(kind.len(), 5000);
        assert_eq!(
            RecordKind::resolve(SlotType::Normal(3), b"abc").unwrap(),
            RecordKind::Inline(3)
        );
    }

    #[test]
    fn test_dispatch_by_page_type() {
        assert_eq!(format_for(PageType::BoundaryTag).unwrap().name(), "slotted");
        assert_eq!(format_for(PageType::ArrayList).unwrap().name(), "fixed");
        assert!(format_for(PageType::Indirect).is_none());

        let buffer = vec![0u8; PAGE_SIZE];
        assert!(matches!(
            format_of(&buffer),
            Err(PageError::WrongType { found: 0, .. })
        ));
    }

    #[test]
    fn test_dispatch_roundtrip() {
        let mut buffer = vec![0u8; PAGE_SIZE];
        SlottedPage::new(&mut buffer[..]).initialize(PageType::Slotted);
        let format = format_of(&buffer).unwrap();

        let slot = format.pre_alloc(&mut buffer, SlotType::Normal(3)).unwrap();
        format.post_alloc(&mut buffer, slot, SlotType::Normal(3)).unwrap();
        format.record_mut(&mut buffer, slot).unwrap().copy_from_slice(b"xyz");
        assert_eq!(format.record(&buffer, slot).unwrap(), b"xyz");
        assert_eq!(format.next_slot(&buffer, None), Some(slot));
        format.free(&mut buffer, slot).unwrap();
        assert_eq!(format.record_type(&buffer, slot), SlotType::Invalid);
        format.fsck(&buffer).unwrap();
    }
}
