//! Page layouts for Stasis.
//!
//! Every page is `PAGE_SIZE` bytes and ends in a 12-byte trailer holding its
//! page type and LSN. The rest of the page is interpreted according to the
//! page type:
//!
//! - **Slotted**: variable-length records behind a slot directory
//!   (also used by boundary-tag pages)
//! - **Fixed**: records of one size packed from offset 0
//!   (also used by array list pages)
//! - **Indirect**: `(child, max slot)` pairs forming a record-array tree
//!
//! ```text
//! +------------------------------+ 0
//! |  layout-specific contents    |
//! |  (records, slot directory)   |
//! +------------------------------+ USABLE_SIZE
//! |  page_type: i32 | LSN: i64   |
//! +------------------------------+ PAGE_SIZE
//! ```
//!
//! The layouts operate on borrowed byte buffers; the buffer manager owns the
//! frames and hands them out under a latch.

mod error;
mod fixed;
mod header;
mod indirect;
mod record;
mod slotted;
mod types;

pub use error::{PageError, PageResult};
pub use fixed::{records_per_page, FixedPage, FIXED_HEADER_OVERHEAD};
pub use header::{PageHeader, LSN_SIZE, PAGE_TYPE_SIZE, TRAILER_SIZE, USABLE_SIZE};
pub use indirect::{calculate_level, IndirectPage, INDIRECT_POINTERS_PER_PAGE};
pub use record::{
    format_for, format_of, BlobRef, FixedFormat, PageFormat, RecordKind, SlottedFormat,
    BLOB_REF_SIZE,
};
pub use slotted::{
    SlottedPage, SLOTTED_HEADER_OVERHEAD, SLOTTED_MAX_RECORD_SIZE, SLOTTED_OVERHEAD_PER_RECORD,
};
pub use types::{PageType, SlotType, BLOB_SLOT, INVALID_SLOT, NORMAL_SLOT};

/// Page size in bytes.
pub const PAGE_SIZE: usize = stasis_common::PAGE_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_constants() {
        assert!(PAGE_SIZE.is_power_of_two());
        assert_eq!(USABLE_SIZE + TRAILER_SIZE, PAGE_SIZE);
        assert!(stasis_common::BLOB_THRESHOLD_SIZE <= SLOTTED_MAX_RECORD_SIZE);
    }
}
