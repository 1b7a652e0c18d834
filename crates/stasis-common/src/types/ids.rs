//! Core identifier types for Stasis.
//!
//! These wrap the raw integers the engine stores on pages and in the log so
//! that a page number cannot be passed where an LSN is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Page identifier: the page's offset in the page file divided by the page size.
///
/// # Example
///
/// ```rust
/// use stasis_common::types::PageId;
///
/// let page = PageId::new(42);
/// assert_eq!(page.as_u64(), 42);
/// assert_eq!(page.offset_by(3), PageId::new(45));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PageId(u64);

impl PageId {
    /// Invalid page ID, used by logical log entries that touch no page.
    pub const INVALID: Self = Self(u64::MAX);

    /// Page 0 begins the boundary-tag chain.
    pub const FIRST: Self = Self(0);

    /// Creates a new `PageId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next page ID.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the page `delta` pages after this one.
    #[inline]
    #[must_use]
    pub const fn offset_by(self, delta: u64) -> Self {
        Self(self.0.saturating_add(delta))
    }

    /// Returns the previous page, or `None` for page 0.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Option<Self> {
        match self.0.checked_sub(1) {
            Some(p) => Some(Self(p)),
            None => None,
        }
    }

    /// Checks if this is a valid page ID.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Byte offset of this page within a page file.
    #[inline]
    #[must_use]
    pub const fn file_offset(self, page_size: usize) -> u64 {
        self.0 * page_size as u64
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "PageId(INVALID)")
        } else {
            write!(f, "PageId({})", self.0)
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PageId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

impl From<PageId> for u64 {
    #[inline]
    fn from(id: PageId) -> Self {
        id.0
    }
}

/// Transaction identifier (`xid`).
///
/// Identifiers are handed out in increasing order by the transaction table.
/// Recovery bumps the allocator past the highest identifier in the log so
/// that a restarted engine never reuses a loser's id.
///
/// # Example
///
/// ```rust
/// use stasis_common::types::TxnId;
///
/// let xid = TxnId::new(1);
/// assert!(xid.is_valid());
/// assert!(!TxnId::INVALID.is_valid());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TxnId(u64);

impl TxnId {
    /// Invalid transaction ID.
    pub const INVALID: Self = Self(0);

    /// Minimum valid transaction ID.
    pub const MIN: Self = Self(1);

    /// Creates a new `TxnId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next transaction ID.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Checks if this is a valid transaction ID.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Encodes the id as the signed 32-bit owner field kept in boundary tags,
    /// where `-1` means "no transaction".
    #[inline]
    #[must_use]
    pub fn to_tag_xid(self) -> i32 {
        if self.is_valid() {
            i32::try_from(self.0).unwrap_or(i32::MAX)
        } else {
            -1
        }
    }

    /// Inverse of [`TxnId::to_tag_xid`].
    #[inline]
    #[must_use]
    pub fn from_tag_xid(raw: i32) -> Self {
        u64::try_from(raw).map_or(Self::INVALID, Self)
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "TxnId(INVALID)")
        } else {
            write!(f, "TxnId({})", self.0)
        }
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TxnId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

impl From<TxnId> for u64 {
    #[inline]
    fn from(id: TxnId) -> Self {
        id.0
    }
}

/// Log Sequence Number.
///
/// An LSN is the byte offset of a log entry in the logical log stream, so
/// LSNs strictly increase in append order and the LSN of the entry after `e`
/// is `e.lsn + encoded_len(e)`. Zero is reserved as "no LSN"; a freshly
/// initialized page carries it.
///
/// # Example
///
/// ```rust
/// use stasis_common::types::Lsn;
///
/// let lsn = Lsn::new(100);
/// assert_eq!(lsn.advance(28), Lsn::new(128));
/// assert!(Lsn::INVALID < lsn);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// Invalid LSN constant.
    pub const INVALID: Self = Self(0);

    /// First LSN handed out by an empty log.
    pub const FIRST: Self = Self(1);

    /// Maximum LSN value.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a new LSN from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the LSN `bytes` further along the log.
    #[inline]
    #[must_use]
    pub const fn advance(self, bytes: u64) -> Self {
        Self(self.0.saturating_add(bytes))
    }

    /// Checks if this is a valid LSN.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Returns the smaller of two LSNs, ignoring invalid ones.
    #[inline]
    #[must_use]
    pub fn min_valid(self, other: Self) -> Self {
        match (self.is_valid(), other.is_valid()) {
            (true, true) => self.min(other),
            (true, false) => self,
            (false, _) => other,
        }
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "Lsn(INVALID)")
        } else {
            write!(f, "Lsn({})", self.0)
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Lsn {
    #[inline]
    fn from(lsn: u64) -> Self {
        Self::new(lsn)
    }
}

impl From<Lsn> for u64 {
    #[inline]
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_id() {
        let page = PageId::new(42);
        assert_eq!(page.as_u64(), 42);
        assert!(page.is_valid());
        assert_eq!(page.next(), PageId::new(43));
        assert_eq!(page.prev(), Some(PageId::new(41)));
        assert_eq!(PageId::FIRST.prev(), None);
        assert!(!PageId::INVALID.is_valid());
        assert_eq!(page.file_offset(4096), 42 * 4096);
    }

    #[test]
    fn test_page_id_debug() {
        assert_eq!(format!("{:?}", PageId::new(7)), "PageId(7)");
        assert_eq!(format!("{:?}", PageId::INVALID), "PageId(INVALID)");
    }

    #[test]
    fn test_txn_id_tag_encoding() {
        assert_eq!(TxnId::INVALID.to_tag_xid(), -1);
        assert_eq!(TxnId::new(9).to_tag_xid(), 9);
        assert_eq!(TxnId::from_tag_xid(-1), TxnId::INVALID);
        assert_eq!(TxnId::from_tag_xid(9), TxnId::new(9));
    }

    #[test]
    fn test_lsn_ordering() {
        let a = Lsn::new(10);
        let b = a.advance(5);
        assert!(a < b);
        assert_eq!(b.as_u64(), 15);
        assert_eq!(a.min_valid(Lsn::INVALID), a);
        assert_eq!(Lsn::INVALID.min_valid(b), b);
        assert_eq!(a.min_valid(b), a);
    }
}
