//! Page types and record slot types.

use std::fmt;

use super::record::BLOB_REF_SIZE;

/// Types of pages in a Stasis page file.
///
/// The discriminants are the values stored in the page trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PageType {
    /// Never initialized (all zeros).
    Uninitialized = 0,
    /// Variable-length records behind a slot directory.
    Slotted = 1,
    /// Interior node of a pre-sized record array.
    Indirect = 2,
    /// Engine header page.
    Header = 3,
    /// Free page.
    Free = 4,
    /// Fixed-length records.
    Fixed = 5,
    /// Array list header page (fixed layout of int32 slots).
    ArrayList = 6,
    /// Boundary tag page (slotted layout, one tag in slot 0).
    BoundaryTag = 7,
    /// Blob page.
    Blob = 8,
    /// LSM tree root.
    LsmRoot = 9,
    /// Slotted page whose LSN is not maintained.
    SlottedLsnFree = 10,
}

impl PageType {
    /// Creates a `PageType` from the raw trailer value.
    #[inline]
    #[must_use]
    pub const fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Uninitialized),
            1 => Some(Self::Slotted),
            2 => Some(Self::Indirect),
            3 => Some(Self::Header),
            4 => Some(Self::Free),
            5 => Some(Self::Fixed),
            6 => Some(Self::ArrayList),
            7 => Some(Self::BoundaryTag),
            8 => Some(Self::Blob),
            9 => Some(Self::LsmRoot),
            10 => Some(Self::SlottedLsnFree),
            _ => None,
        }
    }

    /// Returns the raw trailer value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Returns true if the page uses the slotted record layout.
    #[inline]
    #[must_use]
    pub const fn is_slotted_layout(self) -> bool {
        matches!(self, Self::Slotted | Self::BoundaryTag | Self::SlottedLsnFree)
    }

    /// Returns true if the page uses the fixed-length record layout.
    #[inline]
    #[must_use]
    pub const fn is_fixed_layout(self) -> bool {
        matches!(self, Self::Fixed | Self::ArrayList)
    }
}

impl Default for PageType {
    fn default() -> Self {
        Self::Uninitialized
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "UNINITIALIZED_PAGE",
            Self::Slotted => "SLOTTED_PAGE",
            Self::Indirect => "INDIRECT_PAGE",
            Self::Header => "HEADER_PAGE",
            Self::Free => "FREE_PAGE",
            Self::Fixed => "FIXED_PAGE",
            Self::ArrayList => "ARRAY_LIST_PAGE",
            Self::BoundaryTag => "BOUNDARY_TAG_PAGE",
            Self::Blob => "BLOB_PAGE",
            Self::LsmRoot => "LSM_ROOT_PAGE",
            Self::SlottedLsnFree => "SLOTTED_LSN_FREE_PAGE",
        };
        f.write_str(name)
    }
}

/// Raw slot length marking an unused slot.
pub const INVALID_SLOT: i16 = -1;
/// Raw slot length marking a record stored in the blob store.
pub const BLOB_SLOT: i16 = -2;
/// Raw slot length reported for fixed-page records.
pub const NORMAL_SLOT: i16 = -3;

/// What a slot holds.
///
/// Slotted pages store the raw form in the slot's length field: a
/// non-negative value is a record length, negative values are sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotType {
    /// Unused slot.
    Invalid,
    /// Reference to an out-of-band blob.
    Blob,
    /// Inline record of the given length.
    Normal(u16),
}

impl SlotType {
    /// Decodes a raw slot length field.
    #[must_use]
    pub fn from_raw(raw: i16) -> Self {
        match raw {
            BLOB_SLOT => Self::Blob,
            len if len >= 0 => Self::Normal(len.unsigned_abs()),
            _ => Self::Invalid,
        }
    }

    /// Encodes the slot type as a raw slot length field.
    #[must_use]
    pub fn to_raw(self) -> i16 {
        match self {
            Self::Invalid => INVALID_SLOT,
            Self::Blob => BLOB_SLOT,
            Self::Normal(len) => i16::try_from(len).unwrap_or(i16::MAX),
        }
    }

    /// Number of bytes the record occupies on the page.
    #[must_use]
    pub fn physical_len(self) -> usize {
        match self {
            Self::Invalid => 0,
            Self::Blob => BLOB_REF_SIZE,
            Self::Normal(len) => usize::from(len),
        }
    }

    /// Returns true unless the slot is unused.
    #[inline]
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Invalid)
    }
}
