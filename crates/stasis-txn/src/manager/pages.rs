//! Whole-page operations.

use bytes::Bytes;

use stasis_common::constants::STORAGE_MANAGER_NAIVE_PAGE_ALLOC;
use stasis_common::types::{Lsn, PageId, RecordId, TxnId};
use stasis_storage::page::{PageType, LSN_SIZE, PAGE_SIZE};

use super::TransactionManager;
use crate::error::{TxnError, TxnResult};
use crate::operations::physical::{initialize_rid, range_arg};
use crate::operations::OperationId;

/// Bytes of a page image a page write covers. The LSN stays with the log.
const PAGE_BODY: usize = PAGE_SIZE - LSN_SIZE;

impl TransactionManager {
    /// Copies a whole page.
    pub fn page_get(&self, xid: TxnId, page: PageId) -> TxnResult<Vec<u8>> {
        self.check_open()?;
        self.read_lock(xid, RecordId::for_page(page))?;
        let handle = self.pool.load_page(page)?;
        let image = handle.read().to_vec();
        Ok(image)
    }

    /// Overwrites a page with `image`, except for its LSN.
    pub fn page_set(&self, xid: TxnId, page: PageId, image: &[u8]) -> TxnResult<Lsn> {
        if image.len() != PAGE_SIZE {
            return Err(TxnError::invalid_argument(format!(
                "page image of {} bytes",
                image.len()
            )));
        }
        let new = &image[..PAGE_BODY];
        self.update_with(
            xid,
            RecordId::for_page(page),
            OperationId::PAGE_SET_RANGE,
            true,
            |current| range_arg(0, new, &current[..PAGE_BODY]),
        )
    }

    /// Type stamped on a page, or `None` for an unknown type.
    pub fn page_type(&self, page: PageId) -> TxnResult<Option<PageType>> {
        self.check_open()?;
        Ok(self.pool.load_page(page)?.page_type())
    }

    /// Allocates a single page.
    pub fn page_alloc(&self, xid: TxnId) -> TxnResult<PageId> {
        self.page_alloc_many(xid, 1)
    }

    /// Allocates `count` contiguous pages and returns the first.
    pub fn page_alloc_many(&self, xid: TxnId, count: u64) -> TxnResult<PageId> {
        self.region_alloc(xid, count, STORAGE_MANAGER_NAIVE_PAGE_ALLOC)
    }

    /// Frees pages obtained from [`TransactionManager::page_alloc`] or
    /// [`TransactionManager::page_alloc_many`].
    pub fn page_dealloc(&self, xid: TxnId, page: PageId) -> TxnResult<()> {
        self.region_dealloc(xid, page)
    }

    /// Formats `page` as an empty slotted page.
    pub fn initialize_slotted_page(&self, xid: TxnId, page: PageId) -> TxnResult<Lsn> {
        self.initialize_page(xid, page, PageType::Slotted, 0, true)
    }

    /// Formats `page` as a fixed-length page of `record_size`-byte records.
    pub fn initialize_fixed_page(
        &self,
        xid: TxnId,
        page: PageId,
        record_size: usize,
    ) -> TxnResult<Lsn> {
        self.initialize_page(xid, page, PageType::Fixed, record_size, true)
    }

    pub(crate) fn initialize_page(
        &self,
        xid: TxnId,
        page: PageId,
        page_type: PageType,
        record_size: usize,
        lock: bool,
    ) -> TxnResult<Lsn> {
        let rid = initialize_rid(page, page_type, record_size)?;
        self.update_with(xid, rid, OperationId::INITIALIZE_PAGE, lock, |_| Ok(Bytes::new()))
    }
}
