//! Boundary tag encoding.
//!
//! A tag occupies slot 0 of a boundary-tag page:
//!
//! ```text
//! +----------+---------------+------------+----------------+---------------+---------+
//! | size (8) | prev_size (8) | status (4) | region_xid (4) | alloc_mgr (4) | pad (4) |
//! +----------+---------------+------------+----------------+---------------+---------+
//! ```

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use stasis_common::types::{PageId, TxnId};
use stasis_storage::page::{PageError, PageResult};

/// Encoded size of a [`BoundaryTag`].
pub const BOUNDARY_TAG_SIZE: usize = 32;

/// `size` and `prev_size` of the sentinel tag at the end of the chain, and
/// `prev_size` of the first tag.
pub const REGION_SIZE_MAX: u64 = u64::MAX;

const REGION_BASE: i32 = 123;

/// Lifecycle state of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum RegionStatus {
    /// Free for allocation.
    Vacant = REGION_BASE,
    /// Handed out by the allocator.
    Zoned = REGION_BASE + 1,
    /// In use by an allocation manager.
    Occupied = REGION_BASE + 2,
    /// Tag of a region absorbed by a neighbor; the page is no longer part
    /// of the chain.
    Condemned = REGION_BASE + 3,
}

impl RegionStatus {
    /// Decodes a stored status.
    pub fn from_i32(raw: i32) -> Option<Self> {
        match raw {
            x if x == Self::Vacant as i32 => Some(Self::Vacant),
            x if x == Self::Zoned as i32 => Some(Self::Zoned),
            x if x == Self::Occupied as i32 => Some(Self::Occupied),
            x if x == Self::Condemned as i32 => Some(Self::Condemned),
            _ => None,
        }
    }
}

impl fmt::Display for RegionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vacant => write!(f, "VACANT"),
            Self::Zoned => write!(f, "ZONED"),
            Self::Occupied => write!(f, "OCCUPIED"),
            Self::Condemned => write!(f, "CONDEMNED"),
        }
    }
}

/// Header of a region, stored on the page before the region's first page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryTag {
    /// Pages in the region, not counting the tag page.
    pub size: u64,
    /// Size of the preceding region.
    pub prev_size: u64,
    /// Lifecycle state.
    pub status: RegionStatus,
    /// Transaction that last claimed the region.
    pub region_xid: TxnId,
    /// Caller-defined classifier of the region's contents.
    pub alloc_mgr: i32,
}

impl BoundaryTag {
    /// The tag a fresh page file starts with: one vacant region spanning
    /// the whole file.
    pub const fn sentinel() -> Self {
        Self {
            size: REGION_SIZE_MAX,
            prev_size: REGION_SIZE_MAX,
            status: RegionStatus::Vacant,
            region_xid: TxnId::INVALID,
            alloc_mgr: 0,
        }
    }

    /// Returns true for the open-ended region at the end of the chain.
    pub fn is_last(&self) -> bool {
        self.size == REGION_SIZE_MAX
    }

    /// Returns true if nothing holds the region.
    pub fn is_vacant(&self) -> bool {
        self.status == RegionStatus::Vacant
    }

    /// Tag page of the region that follows this one, whose tag is on
    /// `tag_page`.
    pub fn successor_of(&self, tag_page: PageId) -> Option<PageId> {
        (!self.is_last()).then(|| tag_page.offset_by(self.size + 1))
    }

    /// Encodes the tag.
    pub fn to_bytes(&self) -> [u8; BOUNDARY_TAG_SIZE] {
        let mut buf = BytesMut::with_capacity(BOUNDARY_TAG_SIZE);
        buf.put_u64_le(self.size);
        buf.put_u64_le(self.prev_size);
        buf.put_i32_le(self.status as i32);
        buf.put_i32_le(self.region_xid.to_tag_xid());
        buf.put_i32_le(self.alloc_mgr);
        buf.put_u32_le(0);
        let mut out = [0u8; BOUNDARY_TAG_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Decodes a tag.
    pub fn from_bytes(mut bytes: &[u8]) -> PageResult<Self> {
        if bytes.len() != BOUNDARY_TAG_SIZE {
            return Err(PageError::corrupted(format!(
                "boundary tag of {} bytes",
                bytes.len()
            )));
        }
        let size = bytes.get_u64_le();
        let prev_size = bytes.get_u64_le();
        let raw_status = bytes.get_i32_le();
        let status = RegionStatus::from_i32(raw_status)
            .ok_or_else(|| PageError::corrupted(format!("unknown region status {raw_status}")))?;
        let region_xid = TxnId::from_tag_xid(bytes.get_i32_le());
        let alloc_mgr = bytes.get_i32_le();
        Ok(Self {
            size,
            prev_size,
            status,
            region_xid,
            alloc_mgr,
        })
    }
}

impl fmt::Display for BoundaryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |n: u64| {
            if n == REGION_SIZE_MAX {
                "MAX".to_string()
            } else {
                n.to_string()
            }
        };
        write!(
            f,
            "{{size={}, prev={}, {}, xid={}, mgr={}}}",
            show(self.size),
            show(self.prev_size),
            self.status,
            self.region_xid,
            self.alloc_mgr
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_encoding() {
        let tag = BoundaryTag {
            size: 100,
            prev_size: REGION_SIZE_MAX,
            status: RegionStatus::Zoned,
            region_xid: TxnId::new(7),
            alloc_mgr: 3,
        };
        let bytes = tag.to_bytes();
        assert_eq!(&bytes[..8], &100u64.to_le_bytes());
        assert_eq!(&bytes[16..20], &124i32.to_le_bytes());
        assert_eq!(BoundaryTag::from_bytes(&bytes).unwrap(), tag);
    }

    #[test]
    fn test_unknown_status_is_corruption() {
        let mut bytes = BoundaryTag::sentinel().to_bytes();
        bytes[16..20].copy_from_slice(&9i32.to_le_bytes());
        assert!(BoundaryTag::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_successor() {
        let tag = BoundaryTag {
            size: 10,
            ..BoundaryTag::sentinel()
        };
        assert_eq!(tag.successor_of(PageId::new(5)), Some(PageId::new(16)));
        assert_eq!(BoundaryTag::sentinel().successor_of(PageId::FIRST), None);
        assert_eq!(
            BoundaryTag::sentinel().to_string(),
            "{size=MAX, prev=MAX, VACANT, xid=0, mgr=0}"
        );
    }
}
