//! System-wide constants for Stasis.
//!
//! Values that appear on disk or in the log keep the numbering the engine has
//! always used, so existing page files and logs stay readable.

// =============================================================================
// Page Constants
// =============================================================================

/// Page size in bytes.
///
/// Every page in the page file has this size; the trailer holding the page
/// type and LSN occupies its last 12 bytes.
pub const PAGE_SIZE: usize = 4096;

/// Records at least this large are stored in the blob store and referenced
/// from a `BLOB_SLOT` record on the page.
pub const BLOB_THRESHOLD_SIZE: usize = PAGE_SIZE - 30;

// =============================================================================
// Transaction Constants
// =============================================================================

/// Capacity of the transaction table.
pub const MAX_TRANSACTIONS: usize = 1000;

/// Capacity of the operations table.
pub const MAX_OPERATIONS: usize = 80;

/// Number of pages reserved at a time by the record allocator.
pub const TALLOC_REGION_SIZE: u64 = 100;

/// Allocation-manager tag used by regions reserved for `Talloc`.
pub const STORAGE_MANAGER_TALLOC: i32 = 1;

/// Allocation-manager tag used by single pages handed out by `TpageAlloc`.
pub const STORAGE_MANAGER_NAIVE_PAGE_ALLOC: i32 = 2;

/// Allocation-manager tag used by array list blocks.
pub const STORAGE_MANAGER_ARRAY_LIST: i32 = 3;

// =============================================================================
// Buffer Pool Constants
// =============================================================================

/// Default number of page frames in the buffer pool.
pub const DEFAULT_BUFFER_FRAMES: usize = 1024;

/// Minimum number of page frames the pool accepts.
pub const MIN_BUFFER_FRAMES: usize = 4;

/// Default share of the replacement queue given to the probationary segment.
pub const DEFAULT_PROBATIONARY_RATIO: f64 = 0.3;

// =============================================================================
// Log Constants
// =============================================================================

/// Largest encoded log entry accepted by the log (16 MB).
pub const MAX_LOG_ENTRY_SIZE: usize = 16 * 1024 * 1024;

/// Default log size that triggers automatic truncation (64 MB).
pub const DEFAULT_TRUNCATION_THRESHOLD: u64 = 64 * 1024 * 1024;

// =============================================================================
// File Names
// =============================================================================

/// Default name of the page file inside the data directory.
pub const DEFAULT_PAGE_FILE_NAME: &str = "storefile.txt";

/// Default name of the log file inside the data directory.
pub const DEFAULT_LOG_FILE_NAME: &str = "logfile.txt";

// =============================================================================
// Lock Manager Constants
// =============================================================================

/// How long a lock request may wait before it is treated as a deadlock.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_constants() {
        assert!(PAGE_SIZE.is_power_of_two());
        assert!(BLOB_THRESHOLD_SIZE < PAGE_SIZE);
    }

    #[test]
    fn test_buffer_constants() {
        assert!(DEFAULT_BUFFER_FRAMES >= MIN_BUFFER_FRAMES);
        assert!(DEFAULT_PROBATIONARY_RATIO > 0.0 && DEFAULT_PROBATIONARY_RATIO < 1.0);
    }
}
