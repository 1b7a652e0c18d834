//! Page trailer format.
//!
//! Stasis keeps page metadata at the *end* of the page so that record data
//! can start at offset 0. Layouts that need more header fields count 16-bit
//! slots backwards from the trailer (`i16_from_end`).
//!
//! # Trailer Layout (12 bytes)
//!
//! ```text
//! Offset          Size  Field
//! --------------  ----  -----
//! PAGE_SIZE - 12    4   page_type (i32)
//! PAGE_SIZE -  8    8   lsn (i64)
//! ```
//!
//! `i16_from_end(n)` addresses the 16-bit field at `PAGE_SIZE - 12 - 2n`.

use stasis_common::types::Lsn;
use stasis_common::PAGE_SIZE;

use super::types::PageType;

/// Size of the LSN field.
pub const LSN_SIZE: usize = 8;

/// Size of the page type field.
pub const PAGE_TYPE_SIZE: usize = 4;

/// Size of the page trailer.
pub const TRAILER_SIZE: usize = LSN_SIZE + PAGE_TYPE_SIZE;

/// Bytes available to a page layout (everything before the trailer).
pub const USABLE_SIZE: usize = PAGE_SIZE - TRAILER_SIZE;

const PAGE_TYPE_OFFSET: usize = PAGE_SIZE - TRAILER_SIZE;
const LSN_OFFSET: usize = PAGE_SIZE - LSN_SIZE;

/// Typed view over a page image's trailer and end-relative fields.
///
/// Works over any byte container; mutating accessors need `AsMut<[u8]>`.
///
/// # Example
///
/// ```rust
/// use stasis_storage::page::{PageHeader, PageType};
/// use stasis_common::types::Lsn;
///
/// let mut buffer = vec![0u8; stasis_common::PAGE_SIZE];
/// let mut header = PageHeader::new(&mut buffer[..]);
/// header.set_page_type(PageType::Slotted);
/// header.set_lsn(Lsn::new(42));
///
/// let header = PageHeader::new(&buffer[..]);
/// assert_eq!(header.page_type(), Some(PageType::Slotted));
/// assert_eq!(header.lsn(), Lsn::new(42));
/// ```
#[derive(Debug)]
pub struct PageHeader<B> {
    data: B,
}

impl<B: AsRef<[u8]>> PageHeader<B> {
    /// Creates a header view.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not exactly one page.
    #[inline]
    pub fn new(data: B) -> Self {
        assert_eq!(data.as_ref().len(), PAGE_SIZE, "page buffer has wrong size");
        Self { data }
    }

    /// Returns the underlying bytes.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    // =========================================================================
    // Page Type (PAGE_SIZE - 12, 4 bytes)
    // =========================================================================

    /// Returns the raw page type value.
    #[inline]
    pub fn raw_page_type(&self) -> i32 {
        let d = self.bytes();
        i32::from_le_bytes([
            d[PAGE_TYPE_OFFSET],
            d[PAGE_TYPE_OFFSET + 1],
            d[PAGE_TYPE_OFFSET + 2],
            d[PAGE_TYPE_OFFSET + 3],
        ])
    }

    /// Returns the page type, or `None` for an unknown value.
    #[inline]
    pub fn page_type(&self) -> Option<PageType> {
        PageType::from_i32(self.raw_page_type())
    }

    // =========================================================================
    // LSN (PAGE_SIZE - 8, 8 bytes)
    // =========================================================================

    /// Returns the LSN recorded in the trailer.
    #[inline]
    pub fn lsn(&self) -> Lsn {
        let mut raw = [0u8; LSN_SIZE];
        raw.copy_from_slice(&self.bytes()[LSN_OFFSET..]);
        Lsn::new(u64::try_from(i64::from_le_bytes(raw)).unwrap_or(0))
    }

    // =========================================================================
    // End-relative fields
    // =========================================================================

    /// Reads the `index`-th 16-bit field counted back from the trailer.
    ///
    /// # Panics
    ///
    /// Panics if `index` is zero or addresses memory before the page.
    #[inline]
    pub fn i16_from_end(&self, index: usize) -> i16 {
        let offset = Self::i16_offset(index);
        let d = self.bytes();
        i16::from_le_bytes([d[offset], d[offset + 1]])
    }

    /// Byte offset of the `index`-th 16-bit field counted back from the trailer.
    #[inline]
    pub fn i16_offset(index: usize) -> usize {
        assert!(
            index >= 1 && 2 * index <= USABLE_SIZE,
            "end-relative field {index} out of range"
        );
        PAGE_TYPE_OFFSET - 2 * index
    }

    /// Reads a little-endian i64 at `offset`.
    #[inline]
    pub fn i64_at(&self, offset: usize) -> i64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes()[offset..offset + 8]);
        i64::from_le_bytes(raw)
    }

    /// Reads a little-endian i32 at `offset`.
    #[inline]
    pub fn i32_at(&self, offset: usize) -> i32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes()[offset..offset + 4]);
        i32::from_le_bytes(raw)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> PageHeader<B> {
    /// Returns the underlying bytes mutably.
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    /// Sets the page type.
    #[inline]
    pub fn set_page_type(&mut self, page_type: PageType) {
        self.bytes_mut()[PAGE_TYPE_OFFSET..LSN_OFFSET]
            .copy_from_slice(&page_type.as_i32().to_le_bytes());
    }

    /// Writes the LSN into the trailer.
    #[inline]
    pub fn set_lsn(&mut self, lsn: Lsn) {
        let raw = i64::try_from(lsn.as_u64()).unwrap_or(i64::MAX);
        self.bytes_mut()[LSN_OFFSET..].copy_from_slice(&raw.to_le_bytes());
    }

    /// Writes the `index`-th 16-bit field counted back from the trailer.
    #[inline]
    pub fn set_i16_from_end(&mut self, index: usize, value: i16) {
        let offset = Self::i16_offset(index);
        self.bytes_mut()[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Writes a little-endian i64 at `offset`.
    #[inline]
    pub fn set_i64_at(&mut self, offset: usize, value: i64) {
        self.bytes_mut()[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Writes a little-endian i32 at `offset`.
    #[inline]
    pub fn set_i32_at(&mut self, offset: usize, value: i32) {
        self.bytes_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Zeroes the usable area and stamps a new page type, keeping the LSN.
    pub fn reset(&mut self, page_type: PageType) {
        self.bytes_mut()[..USABLE_SIZE].fill(0);
        self.set_page_type(page_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Vec<u8> {
        vec![0u8; PAGE_SIZE]
    }

    #[test]
    fn test_trailer_layout() {
        let mut buffer = page();
        let mut header = PageHeader::new(&mut buffer[..]);
        header.set_page_type(PageType::Fixed);
        header.set_lsn(Lsn::new(0x0102_0304));

        assert_eq!(&buffer[PAGE_SIZE - 12..PAGE_SIZE - 8], &5i32.to_le_bytes());
        assert_eq!(&buffer[PAGE_SIZE - 8..], &0x0102_0304i64.to_le_bytes());
    }

    #[test]
    fn test_i16_from_end() {
        let mut buffer = page();
        let mut header = PageHeader::new(&mut buffer[..]);
        header.set_i16_from_end(1, 77);
        header.set_i16_from_end(2, -1);
        assert_eq!(header.i16_from_end(1), 77);
        assert_eq!(header.i16_from_end(2), -1);
        assert_eq!(PageHeader::<&[u8]>::i16_offset(1), USABLE_SIZE - 2);
        assert_eq!(&buffer[USABLE_SIZE - 2..USABLE_SIZE], &77i16.to_le_bytes());
    }

    #[test]
    fn test_reset_keeps_lsn() {
        let mut buffer = vec![0xAAu8; PAGE_SIZE];
        let mut header = PageHeader::new(&mut buffer[..]);
        header.set_lsn(Lsn::new(9));
        header.reset(PageType::Slotted);
        assert_eq!(header.lsn(), Lsn::new(9));
        assert_eq!(header.page_type(), Some(PageType::Slotted));
        assert!(header.bytes()[..USABLE_SIZE].iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_i16_index_zero_panics() {
        let buffer = page();
        let header = PageHeader::new(&buffer[..]);
        let _ = header.i16_from_end(0);
    }
}
