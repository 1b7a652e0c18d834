//! Memory-backed page store.

use std::collections::HashMap;

use parking_lot::RwLock;
use stasis_common::types::PageId;
use stasis_common::PAGE_SIZE;

use super::error::{IoError, IoResult};
use super::handle::PageFile;

/// Page file kept in process memory.
///
/// Writes are durable for as long as the value lives, which lets tests
/// drop a buffer pool without flushing and reopen over the same pages to
/// simulate a crash.
#[derive(Debug, Default)]
pub struct MemoryPageFile {
    pages: RwLock<HashMap<PageId, Box<[u8]>>>,
}

impl MemoryPageFile {
    /// Creates an empty memory page file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages that were ever written.
    pub fn written_pages(&self) -> usize {
        self.pages.read().len()
    }
}

impl PageFile for MemoryPageFile {
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> IoResult<()> {
        if buf.len() != PAGE_SIZE {
            return Err(IoError::BadBufferSize {
                expected: PAGE_SIZE,
                actual: buf.len(),
            });
        }
        match self.pages.read().get(&page_id) {
            Some(page) => buf.copy_from_slice(page),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_page(&self, page_id: PageId, buf: &[u8]) -> IoResult<()> {
        if buf.len() != PAGE_SIZE {
            return Err(IoError::BadBufferSize {
                expected: PAGE_SIZE,
                actual: buf.len(),
            });
        }
        self.pages.write().insert(page_id, buf.into());
        Ok(())
    }

    fn force(&self) -> IoResult<()> {
        Ok(())
    }

    fn page_count(&self) -> IoResult<u64> {
        Ok(self
            .pages
            .read()
            .keys()
            .map(|p| p.as_u64() + 1)
            .max()
            .unwrap_or(0))
    }

    fn truncate(&self, pages: u64) -> IoResult<()> {
        self.pages.write().retain(|id, _| id.as_u64() < pages);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_roundtrip() {
        let file = MemoryPageFile::new();
        let page = vec![3u8; PAGE_SIZE];
        file.write_page(PageId::new(5), &page).unwrap();

        let mut read = vec![0u8; PAGE_SIZE];
        file.read_page(PageId::new(5), &mut read).unwrap();
        assert_eq!(read, page);
        assert_eq!(file.page_count().unwrap(), 6);
        assert_eq!(file.written_pages(), 1);

        file.read_page(PageId::new(1), &mut read).unwrap();
        assert!(read.iter().all(|&b| b == 0));

        file.truncate(3).unwrap();
        assert_eq!(file.page_count().unwrap(), 0);
    }
}
