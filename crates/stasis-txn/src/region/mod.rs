//! Region allocator.
//!
//! The page file is carved into regions of contiguous pages. Each region
//! is preceded by a page holding its [`BoundaryTag`]; the tags form a chain
//! from page 0 that ends with an open-ended vacant region:
//!
//! ```text
//!  page 0      1..=100       101      102..=110     111
//! ┌──────┬───────────────┬──────┬───────────────┬──────┬─────────
//! │ tag  │  ZONED (100)  │ tag  │  VACANT (9)   │ tag  │ VACANT (MAX) ...
//! └──────┴───────────────┴──────┴───────────────┴──────┴─────────
//! ```
//!
//! Allocation is first fit. Every vacant region the scan visits is first
//! merged with vacant neighbors that no live transaction claims. Tag writes
//! are ordinary logged updates grouped into nested top actions, so an
//! aborted allocation is rolled back logically (the region goes back to
//! VACANT) rather than tag by tag.
//!
//! All tag manipulation happens under the region mutex. Internal helpers
//! take a [`RegionGuard`] to prove it is held.

mod tag;

pub use tag::{BoundaryTag, RegionStatus, BOUNDARY_TAG_SIZE, REGION_SIZE_MAX};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use stasis_common::types::{PageId, RecordId, TxnId};
use stasis_storage::page::{PageType, SlottedPage};

use crate::error::{TxnError, TxnResult};
use crate::manager::TransactionManager;
use crate::nta::NestedAction;
use crate::operations::physical::{self, set_arg};
use crate::operations::OperationId;

/// The region mutex.
#[derive(Debug, Default)]
pub(crate) struct RegionLock(Mutex<()>);

impl RegionLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> RegionGuard<'_> {
        RegionGuard {
            _guard: self.0.lock(),
        }
    }
}

/// Token proving the region mutex is held. Released on drop.
#[must_use]
pub struct RegionGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl std::fmt::Debug for RegionGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RegionGuard")
    }
}

/// Argument of the region nested top actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RegionArg {
    /// Tag page of the region.
    start: PageId,
    count: u64,
    alloc_mgr: i32,
}

impl RegionArg {
    const SIZE: usize = 20;

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64_le(self.start.as_u64());
        buf.put_u64_le(self.count);
        buf.put_i32_le(self.alloc_mgr);
        buf.freeze()
    }

    fn decode(mut arg: &[u8]) -> TxnResult<Self> {
        if arg.len() != Self::SIZE {
            return Err(TxnError::region(format!(
                "region argument of {} bytes",
                arg.len()
            )));
        }
        Ok(Self {
            start: PageId::new(arg.get_u64_le()),
            count: arg.get_u64_le(),
            alloc_mgr: arg.get_i32_le(),
        })
    }
}

/// Summary produced by [`TransactionManager::fsck_regions`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionReport {
    /// Regions in the chain, excluding the open-ended last one.
    pub regions: usize,
    /// Regions currently handed out.
    pub zoned: usize,
    /// Pages in bounded vacant regions.
    pub vacant_pages: u64,
    /// Pages in handed-out regions.
    pub zoned_pages: u64,
    /// Stale tag pages found inside regions.
    pub orphan_tags: usize,
}

impl TransactionManager {
    /// Allocates `count` contiguous pages tagged with `alloc_mgr` and
    /// returns the first of them.
    pub fn region_alloc(&self, xid: TxnId, count: u64, alloc_mgr: i32) -> TxnResult<PageId> {
        if count == 0 || count >= REGION_SIZE_MAX / 2 {
            return Err(TxnError::invalid_argument(format!(
                "cannot allocate a region of {count} pages"
            )));
        }
        let guard = self.regions.lock();

        let search = NestedAction::begin(self, xid, OperationId::NOOP, Bytes::new())?;
        let mut page = PageId::FIRST;
        let mut tag = self.require_tag(&guard, page)?;
        self.consolidate(&guard, xid, &mut page, &mut tag)?;
        while !tag.is_vacant() || tag.size < count || self.is_claimed(&tag) {
            let next = tag.successor_of(page).ok_or_else(|| {
                TxnError::region(format!("last region on page {page} is not allocatable: {tag}"))
            })?;
            page = next;
            tag = self.require_tag(&guard, page)?;
            self.consolidate(&guard, xid, &mut page, &mut tag)?;
        }
        search.end()?;

        let arg = RegionArg {
            start: page,
            count,
            alloc_mgr,
        };
        let claim = NestedAction::begin(self, xid, OperationId::ALLOC_REGION, arg.encode())?;
        self.zone_region(&guard, xid, page, count, alloc_mgr)?;
        claim.end()?;

        debug!(%xid, first = %page.next(), count, alloc_mgr, "Allocated region");
        Ok(page.next())
    }

    /// Frees the region whose first page is `first_page`.
    ///
    /// The region becomes VACANT and unowned at once, so other
    /// transactions may reuse it before this one commits. If this
    /// transaction then aborts, the region is only reclaimed if nobody
    /// took it in the meantime.
    pub fn region_dealloc(&self, xid: TxnId, first_page: PageId) -> TxnResult<()> {
        let start = tag_page_of(first_page)?;
        let guard = self.regions.lock();
        let mut tag = self.require_tag(&guard, start)?;
        if tag.is_vacant() {
            return Err(TxnError::invalid_argument(format!(
                "region at page {first_page} is not allocated"
            )));
        }

        let arg = RegionArg {
            start,
            count: tag.size,
            alloc_mgr: tag.alloc_mgr,
        };
        let action = NestedAction::begin(self, xid, OperationId::DEALLOC_REGION, arg.encode())?;
        tag.status = RegionStatus::Vacant;
        tag.region_xid = TxnId::INVALID;
        self.set_tag(&guard, xid, start, &tag)?;
        action.end()?;

        debug!(%xid, first = %first_page, count = arg.count, "Freed region");
        Ok(())
    }

    /// Tag of the region whose first page is `first_page`, or `None` if the
    /// page before it holds no tag.
    pub fn region_read_boundary_tag(&self, first_page: PageId) -> TxnResult<Option<BoundaryTag>> {
        let start = tag_page_of(first_page)?;
        let guard = self.regions.lock();
        self.read_tag(&guard, start)
    }

    /// Number of pages in the region whose first page is `first_page`.
    pub fn region_size(&self, first_page: PageId) -> TxnResult<u64> {
        let start = tag_page_of(first_page)?;
        let guard = self.regions.lock();
        Ok(self.require_tag(&guard, start)?.size)
    }

    /// Finds the next handed-out region after the one starting at `after`,
    /// or the first one if `after` is `None`.
    ///
    /// With a non-zero `alloc_mgr` only regions tagged with it match.
    /// Returns the region's first page and tag.
    pub fn region_next_boundary_tag(
        &self,
        after: Option<PageId>,
        alloc_mgr: i32,
    ) -> TxnResult<Option<(PageId, BoundaryTag)>> {
        let matches = |tag: &BoundaryTag| {
            tag.status == RegionStatus::Zoned && (alloc_mgr == 0 || tag.alloc_mgr == alloc_mgr)
        };
        let guard = self.regions.lock();
        let mut page = match after {
            Some(first) => tag_page_of(first)?,
            None => PageId::FIRST,
        };
        let Some(mut tag) = self.read_tag(&guard, page)? else {
            return Ok(None);
        };
        if after.is_none() && matches(&tag) {
            return Ok(Some((page.next(), tag)));
        }
        while let Some(next) = tag.successor_of(page) {
            page = next;
            tag = self.require_tag(&guard, page)?;
            if matches(&tag) {
                return Ok(Some((page.next(), tag)));
            }
        }
        Ok(None)
    }

    /// First page and size of the `n`th (from zero) region that is not
    /// vacant.
    pub fn region_find_nth_active(&self, n: u64) -> TxnResult<Option<(PageId, u64)>> {
        let guard = self.regions.lock();
        let mut page = PageId::FIRST;
        let mut tag = self.require_tag(&guard, page)?;
        let mut remaining = n;
        loop {
            if tag.is_last() {
                return Ok(None);
            }
            if !tag.is_vacant() {
                if remaining == 0 {
                    return Ok(Some((page.next(), tag.size)));
                }
                remaining -= 1;
            }
            page = page.offset_by(tag.size + 1);
            tag = self.require_tag(&guard, page)?;
        }
    }

    /// Walks the tag chain and checks that it covers the file exactly once.
    pub fn fsck_regions(&self) -> TxnResult<RegionReport> {
        let guard = self.regions.lock();
        let mut report = RegionReport::default();
        let mut page = PageId::FIRST;
        let mut tag = self.require_tag(&guard, page)?;
        let mut prev_size = REGION_SIZE_MAX;

        loop {
            if tag.prev_size != prev_size {
                return Err(TxnError::region(format!(
                    "tag on page {page} has prev_size {} but the previous region has \
                     {prev_size} pages",
                    tag.prev_size
                )));
            }
            if tag.is_last() {
                break;
            }
            match tag.status {
                RegionStatus::Vacant => report.vacant_pages += tag.size,
                RegionStatus::Zoned => {
                    report.zoned += 1;
                    report.zoned_pages += tag.size;
                }
                status => {
                    return Err(TxnError::region(format!(
                        "region on page {page} is {status}"
                    )))
                }
            }
            for i in 1..=tag.size {
                let inner = page.offset_by(i);
                if self.pool.load_page(inner)?.page_type() != Some(PageType::BoundaryTag) {
                    continue;
                }
                match self.require_tag(&guard, inner)?.status {
                    RegionStatus::Condemned | RegionStatus::Vacant => report.orphan_tags += 1,
                    status => {
                        return Err(TxnError::region(format!(
                            "live {status} tag on page {inner} inside the region on page {page}"
                        )))
                    }
                }
            }
            report.regions += 1;
            prev_size = tag.size;
            page = page.offset_by(tag.size + 1);
            tag = self.require_tag(&guard, page)?;
        }

        if !tag.is_vacant() {
            return Err(TxnError::region(format!(
                "open-ended region on page {page} is {}",
                tag.status
            )));
        }
        trace!(?report, "Region chain is consistent");
        Ok(report)
    }

    /// Formats page 0 with the sentinel tag if the file is fresh.
    ///
    /// Not logged: the result is deterministic and recovery replays later
    /// tag updates over it.
    pub(crate) fn regions_init(&self) -> TxnResult<()> {
        let _guard = self.regions.lock();
        let handle = self.pool.load_page(PageId::FIRST)?;
        let mut page = handle.write();
        if page.header().page_type() != Some(PageType::BoundaryTag) {
            let rid = RecordId::new(PageId::FIRST, 0, BOUNDARY_TAG_SIZE as u32);
            physical::alloc_boundary_tag(&mut page, rid, &BoundaryTag::sentinel().to_bytes())?;
            debug!("Formatted region chain");
        }
        Ok(())
    }

    fn is_claimed(&self, tag: &BoundaryTag) -> bool {
        tag.region_xid.is_valid() && self.is_active(tag.region_xid)
    }

    fn read_tag(&self, _guard: &RegionGuard<'_>, page: PageId) -> TxnResult<Option<BoundaryTag>> {
        let handle = self.pool.load_page(page)?;
        let image = handle.read();
        if image.header().page_type() != Some(PageType::BoundaryTag) {
            return Ok(None);
        }
        let tag = BoundaryTag::from_bytes(SlottedPage::new(&*image).record(0)?)?;
        Ok(Some(tag))
    }

    fn require_tag(&self, guard: &RegionGuard<'_>, page: PageId) -> TxnResult<BoundaryTag> {
        self.read_tag(guard, page)?
            .ok_or_else(|| TxnError::region(format!("missing boundary tag on page {page}")))
    }

    fn set_tag(
        &self,
        _guard: &RegionGuard<'_>,
        xid: TxnId,
        page: PageId,
        tag: &BoundaryTag,
    ) -> TxnResult<()> {
        let first = page == PageId::FIRST;
        if first != (tag.prev_size == REGION_SIZE_MAX) {
            return Err(TxnError::region(format!(
                "refusing to write {tag} on page {page}"
            )));
        }
        let new = tag.to_bytes();
        let rid = RecordId::new(page, 0, BOUNDARY_TAG_SIZE as u32);
        self.update_with(xid, rid, OperationId::SET, false, |image| {
            let (start, end) = SlottedPage::new(image).record_extent(0)?;
            Ok(set_arg(&new, &image[start..end]))
        })?;
        trace!(%page, %tag, "Wrote boundary tag");
        Ok(())
    }

    fn alloc_tag(
        &self,
        _guard: &RegionGuard<'_>,
        xid: TxnId,
        page: PageId,
        tag: &BoundaryTag,
    ) -> TxnResult<()> {
        let rid = RecordId::new(page, 0, BOUNDARY_TAG_SIZE as u32);
        let bytes = Bytes::copy_from_slice(&tag.to_bytes());
        self.update_with(xid, rid, OperationId::ALLOC_BOUNDARY_TAG, false, |_| Ok(bytes))?;
        trace!(%page, %tag, "Created boundary tag");
        Ok(())
    }

    fn condemn_tag(&self, guard: &RegionGuard<'_>, xid: TxnId, page: PageId) -> TxnResult<()> {
        let mut tag = self.require_tag(guard, page)?;
        tag.status = RegionStatus::Condemned;
        tag.region_xid = xid;
        self.set_tag(guard, xid, page, &tag)
    }

    /// Merges the vacant region tagged on `page` with vacant, unclaimed
    /// neighbors. On return `page` and `tag` describe the merged region.
    fn consolidate(
        &self,
        guard: &RegionGuard<'_>,
        xid: TxnId,
        page: &mut PageId,
        tag: &mut BoundaryTag,
    ) -> TxnResult<()> {
        if !tag.is_vacant() || self.is_claimed(tag) {
            return Ok(());
        }
        let mut must_write = false;

        if let Some(succ_page) = tag.successor_of(*page) {
            let succ = self.require_tag(guard, succ_page)?;
            if succ.is_last() {
                if !succ.is_vacant() {
                    return Err(TxnError::region(format!(
                        "open-ended region on page {succ_page} is {}",
                        succ.status
                    )));
                }
                tag.size = REGION_SIZE_MAX;
                self.condemn_tag(guard, xid, succ_page)?;
                must_write = true;
            } else if succ.is_vacant() && !self.is_claimed(&succ) {
                tag.size += succ.size + 1;
                let after_page = succ_page.offset_by(succ.size + 1);
                let mut after = self.require_tag(guard, after_page)?;
                after.prev_size = tag.size;
                self.set_tag(guard, xid, after_page, &after)?;
                self.condemn_tag(guard, xid, succ_page)?;
                must_write = true;
            }
        }

        if tag.prev_size != REGION_SIZE_MAX {
            let pred_page = page
                .as_u64()
                .checked_sub(tag.prev_size + 1)
                .map(PageId::new)
                .ok_or_else(|| {
                    TxnError::region(format!(
                        "tag on page {page} points before the start of the file"
                    ))
                })?;
            let mut pred = self.require_tag(guard, pred_page)?;
            if pred.is_vacant() && !self.is_claimed(&pred) {
                self.condemn_tag(guard, xid, *page)?;
                if tag.is_last() {
                    pred.size = REGION_SIZE_MAX;
                } else {
                    pred.size += tag.size + 1;
                    let succ_page = page.offset_by(tag.size + 1);
                    let mut succ = self.require_tag(guard, succ_page)?;
                    succ.prev_size = pred.size;
                    self.set_tag(guard, xid, succ_page, &succ)?;
                }
                self.set_tag(guard, xid, pred_page, &pred)?;
                *page = pred_page;
                *tag = pred;
                return Ok(());
            }
        }

        if must_write {
            self.set_tag(guard, xid, *page, tag)?;
        }
        Ok(())
    }

    /// Marks the vacant region on `page` as ZONED for `count` pages,
    /// splitting off the remainder as a new vacant region.
    fn zone_region(
        &self,
        guard: &RegionGuard<'_>,
        xid: TxnId,
        page: PageId,
        count: u64,
        alloc_mgr: i32,
    ) -> TxnResult<()> {
        let mut tag = self.require_tag(guard, page)?;
        if tag.size != count {
            if tag.size < count {
                return Err(TxnError::region(format!(
                    "region on page {page} has {} pages, {count} requested",
                    tag.size
                )));
            }
            let mut rest = BoundaryTag {
                size: REGION_SIZE_MAX,
                prev_size: count,
                status: RegionStatus::Vacant,
                region_xid: TxnId::INVALID,
                alloc_mgr: 0,
            };
            if let Some(succ_page) = tag.successor_of(page) {
                rest.size = tag.size - count - 1;
                let mut succ = self.require_tag(guard, succ_page)?;
                succ.prev_size = rest.size;
                self.set_tag(guard, xid, succ_page, &succ)?;
            }
            self.alloc_tag(guard, xid, page.offset_by(count + 1), &rest)?;
        }

        tag.status = RegionStatus::Zoned;
        tag.region_xid = xid;
        tag.alloc_mgr = alloc_mgr;
        tag.size = count;
        self.set_tag(guard, xid, page, &tag)
    }
}

/// Tag page of the region starting at `first_page`.
fn tag_page_of(first_page: PageId) -> TxnResult<PageId> {
    first_page
        .prev()
        .ok_or_else(|| TxnError::invalid_argument("page 0 holds the first boundary tag"))
}

/// Logical undo of a region allocation: the region becomes vacant again.
pub(crate) fn undo_region_alloc(tm: &TransactionManager, xid: TxnId, arg: &[u8]) -> TxnResult<()> {
    let arg = RegionArg::decode(arg)?;
    let guard = tm.regions.lock();
    if let Some(mut tag) = tm.read_tag(&guard, arg.start)? {
        if matches!(tag.status, RegionStatus::Zoned | RegionStatus::Occupied) {
            tag.status = RegionStatus::Vacant;
            tag.region_xid = TxnId::INVALID;
            tm.set_tag(&guard, xid, arg.start, &tag)?;
        }
    }
    Ok(())
}

/// Logical undo of a region deallocation: the region is zoned again,
/// unless another transaction has taken or merged it since.
pub(crate) fn undo_region_dealloc(
    tm: &TransactionManager,
    xid: TxnId,
    arg: &[u8],
) -> TxnResult<()> {
    let arg = RegionArg::decode(arg)?;
    let guard = tm.regions.lock();
    match tm.read_tag(&guard, arg.start)? {
        Some(tag) if tag.is_vacant() && tag.size >= arg.count => {
            tm.zone_region(&guard, xid, arg.start, arg.count, arg.alloc_mgr)
        }
        _ => {
            debug!(%xid, start = %arg.start, "Freed region was reused before the free rolled back");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use stasis_common::config::StasisConfig;
    use stasis_storage::file::{MemoryPageFile, PageFile};
    use stasis_wal::{LogHandle, MemoryLog};

    use super::*;

    fn open() -> TransactionManager {
        TransactionManager::open(StasisConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_fresh_chain() {
        let tm = open();
        let report = tm.fsck_regions().unwrap();
        assert_eq!(report, RegionReport::default());
        let tag = tm.region_read_boundary_tag(PageId::new(1)).unwrap().unwrap();
        assert_eq!(tag, BoundaryTag::sentinel());
    }

    #[test]
    fn test_alloc_splits_and_dealloc_merges() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let a = tm.region_alloc(xid, 10, 7).unwrap();
        let b = tm.region_alloc(xid, 5, 7).unwrap();
        assert_eq!(a, PageId::new(1));
        assert_eq!(b, PageId::new(12));
        assert_eq!(tm.region_size(a).unwrap(), 10);
        let tag = tm.region_read_boundary_tag(b).unwrap().unwrap();
        assert_eq!(tag.status, RegionStatus::Zoned);
        assert_eq!(tag.prev_size, 10);
        assert_eq!(tag.alloc_mgr, 7);

        tm.region_dealloc(xid, a).unwrap();
        tm.region_dealloc(xid, b).unwrap();
        tm.commit(xid).unwrap();

        // The next scan merges the two freed regions and reuses the front.
        let xid = tm.begin().unwrap();
        let c = tm.region_alloc(xid, 3, 1).unwrap();
        assert_eq!(c, PageId::new(1));
        tm.commit(xid).unwrap();
        let report = tm.fsck_regions().unwrap();
        assert_eq!(report.zoned, 1);
        assert_eq!(report.zoned_pages, 3);
    }

    #[test]
    fn test_abort_returns_region() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let first = tm.region_alloc(xid, 4, 1).unwrap();
        tm.abort(xid).unwrap();

        let tag = tm.region_read_boundary_tag(first).unwrap().unwrap();
        assert!(tag.is_vacant());
        assert_eq!(tm.region_find_nth_active(0).unwrap(), None);
        tm.fsck_regions().unwrap();
    }

    #[test]
    fn test_aborted_dealloc_rezones() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let first = tm.region_alloc(xid, 6, 2).unwrap();
        tm.commit(xid).unwrap();

        let xid = tm.begin().unwrap();
        tm.region_dealloc(xid, first).unwrap();
        assert!(tm.region_read_boundary_tag(first).unwrap().unwrap().is_vacant());
        tm.abort(xid).unwrap();

        let tag = tm.region_read_boundary_tag(first).unwrap().unwrap();
        assert_eq!(tag.status, RegionStatus::Zoned);
        assert_eq!(tag.size, 6);
        assert_eq!(tag.alloc_mgr, 2);
        tm.fsck_regions().unwrap();
    }

    #[test]
    fn test_iteration() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let a = tm.region_alloc(xid, 2, 5).unwrap();
        let b = tm.region_alloc(xid, 3, 6).unwrap();
        let c = tm.region_alloc(xid, 4, 5).unwrap();
        tm.commit(xid).unwrap();

        let (first, _) = tm.region_next_boundary_tag(None, 5).unwrap().unwrap();
        assert_eq!(first, a);
        let (second, tag) = tm.region_next_boundary_tag(Some(first), 5).unwrap().unwrap();
        assert_eq!(second, c);
        assert_eq!(tag.size, 4);
        assert!(tm.region_next_boundary_tag(Some(second), 5).unwrap().is_none());
        assert_eq!(tm.region_next_boundary_tag(Some(a), 0).unwrap().unwrap().0, b);

        assert_eq!(tm.region_find_nth_active(1).unwrap(), Some((b, 3)));
        assert_eq!(tm.region_find_nth_active(3).unwrap(), None);
    }

    #[test]
    fn test_rejects_bad_arguments() {
        let tm = open();
        let xid = tm.begin().unwrap();
        assert!(matches!(
            tm.region_alloc(xid, 0, 1),
            Err(TxnError::InvalidArgument { .. })
        ));
        let first = tm.region_alloc(xid, 1, 1).unwrap();
        tm.region_dealloc(xid, first).unwrap();
        assert!(matches!(
            tm.region_dealloc(xid, first),
            Err(TxnError::InvalidArgument { .. })
        ));
        tm.commit(xid).unwrap();
    }

    #[test]
    fn test_region_arg_encoding() {
        let arg = RegionArg {
            start: PageId::new(41),
            count: 9,
            alloc_mgr: -3,
        };
        assert_eq!(RegionArg::decode(&arg.encode()).unwrap(), arg);
        assert!(RegionArg::decode(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_crash_inside_claim_undoes_tag_writes() {
        let pages: Arc<dyn PageFile> = Arc::new(MemoryPageFile::new());
        let log: Arc<dyn LogHandle> = Arc::new(MemoryLog::new());
        let reopen = || {
            TransactionManager::open_with(StasisConfig::for_testing(), pages.clone(), log.clone())
                .unwrap()
        };

        let tm = reopen();
        let xid = tm.begin().unwrap();
        let kept = tm.region_alloc(xid, 3, 1).unwrap();
        tm.commit(xid).unwrap();

        // The open-ended region follows the kept one.
        let start = kept.offset_by(3);
        let before = tm.region_read_boundary_tag(start.next()).unwrap().unwrap();
        assert!(before.is_last());

        let loser = tm.begin().unwrap();
        {
            let guard = tm.regions.lock();
            let arg = RegionArg {
                start,
                count: 5,
                alloc_mgr: 2,
            };
            let claim =
                NestedAction::begin(&tm, loser, OperationId::ALLOC_REGION, arg.encode()).unwrap();
            tm.zone_region(&guard, loser, start, 5, 2).unwrap();
            // Crash before the end entry is written.
            std::mem::forget(claim);
        }
        assert_eq!(tm.region_size(start.next()).unwrap(), 5);
        tm.log().force_all().unwrap();
        tm.buffer_pool().flush_all().unwrap();
        tm.unclean_shutdown().unwrap();
        drop(tm);

        let tm = reopen();
        assert!(!tm.is_active(loser));
        let after = tm.region_read_boundary_tag(start.next()).unwrap().unwrap();
        assert_eq!(after, before);
        let report = tm.fsck_regions().unwrap();
        assert_eq!(report.zoned, 1);
        assert_eq!(report.zoned_pages, 3);

        // The open-ended region is whole again; the split-off tag left
        // behind is only an orphan inside the next allocation.
        let xid = tm.begin().unwrap();
        assert_eq!(tm.region_alloc(xid, 8, 2).unwrap(), start.next());
        tm.commit(xid).unwrap();
        assert_eq!(tm.fsck_regions().unwrap().zoned, 2);
    }
}
