//! Record allocation.
//!
//! Records are placed on slotted pages drawn from regions tagged
//! [`STORAGE_MANAGER_TALLOC`]. [`AllocPolicy`] remembers roughly how much
//! space each of those pages has left. When no known page fits a request a
//! new region of [`TALLOC_REGION_SIZE`] pages is reserved and formatted.
//!
//! A page that had a record freed is owned by the freeing transaction until
//! it finishes, so other transactions cannot fill the hole and make the
//! free impossible to undo.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use stasis_common::constants::{STORAGE_MANAGER_TALLOC, TALLOC_REGION_SIZE};
use stasis_common::types::{PageId, RecordId, TxnId};
use stasis_storage::page::{format_of, BlobRef, PageType, RecordKind, SlotType};

use crate::error::{TxnError, TxnResult};
use crate::manager::TransactionManager;
use crate::nta::NestedAction;
use crate::operations::OperationId;

#[derive(Debug, Clone, Copy)]
struct PageSpace {
    freespace: usize,
    owner: Option<TxnId>,
}

/// Free-space map of the pages records are allocated from.
#[derive(Debug, Default)]
pub(crate) struct AllocPolicy {
    pages: BTreeMap<PageId, PageSpace>,
}

impl AllocPolicy {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// First page with at least `needed` bytes free that `xid` may use.
    fn find(&self, needed: usize, xid: TxnId, is_active: impl Fn(TxnId) -> bool) -> Option<PageId> {
        self.pages
            .iter()
            .find(|(_, space)| {
                space.freespace >= needed
                    && match space.owner {
                        None => true,
                        Some(owner) => owner == xid || !is_active(owner),
                    }
            })
            .map(|(page, _)| *page)
    }

    fn record(&mut self, page: PageId, freespace: usize) {
        self.pages
            .entry(page)
            .and_modify(|space| space.freespace = freespace)
            .or_insert(PageSpace {
                freespace,
                owner: None,
            });
    }

    /// Reserves a tracked page for `xid`. Untracked pages are left alone.
    fn claim(&mut self, page: PageId, xid: TxnId, freespace: usize) {
        if let Some(space) = self.pages.get_mut(&page) {
            space.freespace = freespace;
            space.owner = Some(xid);
        }
    }

    /// Drops every reservation `xid` holds.
    pub(crate) fn release(&mut self, xid: TxnId) {
        for space in self.pages.values_mut() {
            if space.owner == Some(xid) {
                space.owner = None;
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pages.len()
    }
}

impl TransactionManager {
    /// Allocates a record of `size` bytes and returns its id.
    ///
    /// Records of at least [`stasis_common::BLOB_THRESHOLD_SIZE`] bytes are
    /// stored in the blob store; the slot keeps a reference to them.
    pub fn alloc(&self, xid: TxnId, size: usize) -> TxnResult<RecordId> {
        self.check_writable(xid)?;
        let rid_size = u32::try_from(size)
            .map_err(|_| TxnError::invalid_argument(format!("record of {size} bytes")))?;
        let slot_type = RecordKind::slot_type_for(size);

        let mut policy = self.allocator.lock();
        let rid = loop {
            let found = policy.find(slot_type.physical_len(), xid, |owner| self.is_active(owner));
            let Some(page) = found else {
                self.reserve_talloc_region(xid, &mut policy)?;
                continue;
            };
            if let Some(rid) = self.alloc_on_page(xid, page, rid_size, slot_type, &mut policy)? {
                break rid;
            }
        };
        drop(policy);

        if slot_type == SlotType::Blob {
            let blob = self.blobs.alloc_blob(size as u64)?;
            self.table.lock().get_mut(xid)?.new_blobs.push(blob);
            self.write_blob_ref(xid, rid, blob)?;
        }
        trace!(%xid, %rid, "Allocated record");
        Ok(rid)
    }

    /// Allocates a record of `size` bytes on a specific page.
    ///
    /// Fails with a page-full error if the page has no room.
    pub fn alloc_from_page(&self, xid: TxnId, page: PageId, size: usize) -> TxnResult<RecordId> {
        self.check_writable(xid)?;
        let rid_size = u32::try_from(size)
            .map_err(|_| TxnError::invalid_argument(format!("record of {size} bytes")))?;
        let slot_type = RecordKind::slot_type_for(size);
        self.write_lock(xid, RecordId::for_page(page))?;

        let mut policy = self.allocator.lock();
        let rid = self
            .alloc_on_page(xid, page, rid_size, slot_type, &mut policy)?
            .ok_or_else(|| {
                TxnError::from(stasis_storage::page::PageError::PageFull {
                    needed: slot_type.physical_len(),
                    available: 0,
                })
            })?;
        drop(policy);

        if slot_type == SlotType::Blob {
            let blob = self.blobs.alloc_blob(size as u64)?;
            self.table.lock().get_mut(xid)?.new_blobs.push(blob);
            self.write_blob_ref(xid, rid, blob)?;
        }
        Ok(rid)
    }

    /// Frees a record.
    ///
    /// The record's bytes are logged so an abort can restore them. A blob
    /// behind the record is released when the transaction commits.
    pub fn dealloc(&self, xid: TxnId, rid: RecordId) -> TxnResult<()> {
        self.check_writable(xid)?;
        self.write_lock(xid, rid)?;

        let mut policy = self.allocator.lock();
        let mut freed_blob = None;
        self.update_with(xid, rid, OperationId::DEALLOC, false, |page| {
            let format = format_of(page)?;
            let slot_type = format.record_type(page, rid.slot);
            let stored = format.record(page, rid.slot)?;
            match RecordKind::resolve(slot_type, stored)? {
                RecordKind::Blob(blob) => freed_blob = Some(blob),
                RecordKind::Inline(len) if len != rid.size as usize => {
                    return Err(TxnError::bad_record(rid, format!("record holds {len} bytes")));
                }
                RecordKind::Inline(_) => {}
            }
            Ok(bytes::Bytes::copy_from_slice(stored))
        })?;

        let freespace = self.page_freespace(rid.page)?;
        policy.claim(rid.page, xid, freespace);
        drop(policy);

        if let Some(blob) = freed_blob {
            self.table.lock().get_mut(xid)?.freed_blobs.push(blob);
        }
        trace!(%xid, %rid, "Freed record");
        Ok(())
    }

    /// Tries to place a record on `page`. Returns `None` if it does not
    /// fit, after refreshing the page's entry in the policy.
    fn alloc_on_page(
        &self,
        xid: TxnId,
        page: PageId,
        size: u32,
        slot_type: SlotType,
        policy: &mut AllocPolicy,
    ) -> TxnResult<Option<RecordId>> {
        let slot = {
            let handle = self.pool.load_page(page)?;
            let mut image = handle.write();
            let format = format_of(&image)?;
            match format.pre_alloc(&mut image, slot_type) {
                Some(slot) => slot,
                None => {
                    policy.record(page, format.freespace(&image));
                    return Ok(None);
                }
            }
        };

        let rid = RecordId::new(page, slot, size);
        self.update_with(xid, rid, OperationId::ALLOC, false, |_| Ok(bytes::Bytes::new()))?;
        policy.record(page, self.page_freespace(page)?);
        Ok(Some(rid))
    }

    fn page_freespace(&self, page: PageId) -> TxnResult<usize> {
        let handle = self.pool.load_page(page)?;
        let image = handle.read();
        Ok(format_of(&image)?.freespace(&image))
    }

    /// Reserves and formats a region of slotted pages for records.
    ///
    /// Runs as a nested top action: the pages stay with the allocator even
    /// if `xid` aborts.
    fn reserve_talloc_region(&self, xid: TxnId, policy: &mut AllocPolicy) -> TxnResult<()> {
        let action = NestedAction::begin(self, xid, OperationId::NOOP, bytes::Bytes::new())?;
        let first = self.region_alloc(xid, TALLOC_REGION_SIZE, STORAGE_MANAGER_TALLOC)?;
        for i in 0..TALLOC_REGION_SIZE {
            self.initialize_page(xid, first.offset_by(i), PageType::Slotted, 0, false)?;
        }
        action.end()?;

        let freespace = self.page_freespace(first)?;
        for i in 0..TALLOC_REGION_SIZE {
            policy.record(first.offset_by(i), freespace);
        }
        debug!(%xid, %first, pages = TALLOC_REGION_SIZE, "Reserved record region");
        Ok(())
    }

    /// Rebuilds the free-space map from the record regions on disk.
    pub(crate) fn talloc_init(&self) -> TxnResult<()> {
        let mut policy = self.allocator.lock();
        let mut after = None;
        while let Some((first, tag)) =
            self.region_next_boundary_tag(after, STORAGE_MANAGER_TALLOC)?
        {
            for i in 0..tag.size {
                let page = first.offset_by(i);
                // A crash can leave a region reserved but not yet formatted.
                match self.page_freespace(page) {
                    Ok(freespace) => policy.record(page, freespace),
                    Err(err) => debug!(%page, error = %err, "Skipping unformatted record page"),
                }
            }
            after = Some(first);
        }
        debug!(pages = policy.len(), "Loaded record allocator");
        Ok(())
    }

    /// Blob referenced by the record at `rid`, if any.
    pub fn record_blob(&self, rid: RecordId) -> TxnResult<Option<BlobRef>> {
        self.check_open()?;
        self.blob_of(rid)
    }
}
