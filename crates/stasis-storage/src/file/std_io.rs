//! File-backed page store.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use stasis_common::types::PageId;
use stasis_common::PAGE_SIZE;
use tracing::debug;

use super::error::{IoError, IoResult};
use super::handle::PageFile;

/// Page file stored in a regular file, one page per `PAGE_SIZE` bytes.
///
/// The file handle sits behind a mutex so that seek+read and seek+write
/// pairs cannot interleave between threads.
pub struct FilePageFile {
    /// The underlying file.
    file: Mutex<File>,
    /// The file path.
    path: PathBuf,
}

impl FilePageFile {
    /// Opens (creating if necessary) the page file at `path`.
    pub fn open(path: impl AsRef<Path>) -> IoResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| IoError::from_io_with_path(e, &path))?;
        debug!(path = %path.display(), "opened page file");
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    fn check_buffer(len: usize) -> IoResult<()> {
        if len == PAGE_SIZE {
            Ok(())
        } else {
            Err(IoError::BadBufferSize {
                expected: PAGE_SIZE,
                actual: len,
            })
        }
    }
}

impl PageFile for FilePageFile {
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> IoResult<()> {
        Self::check_buffer(buf.len())?;
        let offset = page_id.file_offset(PAGE_SIZE);
        let mut file = self.file.lock();
        let len = file
            .metadata()
            .map_err(|e| IoError::page_read(page_id, e))?
            .len();

        buf.fill(0);
        if offset >= len {
            return Ok(());
        }
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| IoError::page_read(page_id, e))?;

        let mut total = 0;
        while total < buf.len() {
            let n = file
                .read(&mut buf[total..])
                .map_err(|e| IoError::page_read(page_id, e))?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(())
    }

    fn write_page(&self, page_id: PageId, buf: &[u8]) -> IoResult<()> {
        Self::check_buffer(buf.len())?;
        let offset = page_id.file_offset(PAGE_SIZE);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| IoError::page_write(page_id, e))?;
        file.write_all(buf)
            .map_err(|e| IoError::page_write(page_id, e))
    }

    fn force(&self) -> IoResult<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    fn page_count(&self) -> IoResult<u64> {
        let len = self.file.lock().metadata()?.len();
        Ok(len.div_ceil(PAGE_SIZE as u64))
    }

    fn truncate(&self, pages: u64) -> IoResult<()> {
        self.file.lock().set_len(pages * PAGE_SIZE as u64)?;
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

impl std::fmt::Debug for FilePageFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePageFile")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_page() {
        let dir = tempdir().unwrap();
        let file = FilePageFile::open(dir.path().join("pages")).unwrap();

        let mut page = vec![0u8; PAGE_SIZE];
        page[..5].copy_from_slice(b"hello");
        file.write_page(PageId::new(2), &page).unwrap();
        file.force().unwrap();

        let mut read = vec![0xFFu8; PAGE_SIZE];
        file.read_page(PageId::new(2), &mut read).unwrap();
        assert_eq!(read, page);
        assert_eq!(file.page_count().unwrap(), 3);
    }

    #[test]
    fn test_read_past_eof_is_zero() {
        let dir = tempdir().unwrap();
        let file = FilePageFile::open(dir.path().join("pages")).unwrap();
        let mut read = vec![0xFFu8; PAGE_SIZE];
        file.read_page(PageId::new(10), &mut read).unwrap();
        assert!(read.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages");
        {
            let file = FilePageFile::open(&path).unwrap();
            file.write_page(PageId::new(0), &vec![7u8; PAGE_SIZE]).unwrap();
            file.force().unwrap();
        }
        let file = FilePageFile::open(&path).unwrap();
        let mut read = vec![0u8; PAGE_SIZE];
        file.read_page(PageId::new(0), &mut read).unwrap();
        assert!(read.iter().all(|&b| b == 7));
        assert_eq!(file.path(), Some(path.as_path()));
    }

    #[test]
    fn test_bad_buffer_size() {
        let dir = tempdir().unwrap();
        let file = FilePageFile::open(dir.path().join("pages")).unwrap();
        let mut small = vec![0u8; 10];
        assert!(matches!(
            file.read_page(PageId::new(0), &mut small),
            Err(IoError::BadBufferSize { .. })
        ));
    }

    #[test]
    fn test_truncate() {
        let dir = tempdir().unwrap();
        let file = FilePageFile::open(dir.path().join("pages")).unwrap();
        file.write_page(PageId::new(4), &vec![1u8; PAGE_SIZE]).unwrap();
        file.truncate(2).unwrap();
        assert_eq!(file.page_count().unwrap(), 2);
    }
}
