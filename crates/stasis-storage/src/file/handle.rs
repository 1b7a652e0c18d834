//! The page file abstraction.

use std::fmt;
use std::path::Path;

use stasis_common::types::PageId;

use super::error::IoResult;

/// Raw page-granularity storage.
///
/// Implementations must be safe to call from many threads. Reading a page
/// that was never written yields zeros, which decode as an
/// `UNINITIALIZED` page.
pub trait PageFile: Send + Sync + fmt::Debug {
    /// Reads page `page_id` into `buf` (exactly one page).
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> IoResult<()>;

    /// Writes `buf` (exactly one page) as page `page_id`.
    fn write_page(&self, page_id: PageId, buf: &[u8]) -> IoResult<()>;

    /// Makes every completed write durable.
    fn force(&self) -> IoResult<()>;

    /// Number of pages the backing store currently holds.
    fn page_count(&self) -> IoResult<u64>;

    /// Shrinks or grows the store to `pages` pages.
    fn truncate(&self, pages: u64) -> IoResult<()>;

    /// Backing file, if there is one.
    fn path(&self) -> Option<&Path> {
        None
    }
}
