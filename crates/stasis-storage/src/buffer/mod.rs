//! Buffer manager.
//!
//! The buffer pool caches pages of the page file in a fixed array of frames:
//!
//! - **Pin handles**: [`BufferPool::load_page`] returns a [`PageHandle`];
//!   a pinned frame is never evicted or rekeyed
//! - **Latches**: page bytes are read through [`PageReadLatch`] and written
//!   through [`PageWriteLatch`]
//! - **Replacement**: LRU-2S queue with a probationary and a protected segment
//! - **Write-ahead logging**: a dirty page is written only after the log is
//!   durable up to the page LSN, through the [`ForceLog`] hook
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          BufferPool                           │
//! │  ┌─────────────────────── Mutex ──────────────────────────┐   │
//! │  │  page table: HashMap<PageId, FrameId>                  │   │
//! │  │  free frames: Vec<FrameId>                             │   │
//! │  │  Lru2sReplacer: head ─ protected ─ middle ─ prob ─ tail │   │
//! │  └────────────────────────────────────────────────────────┘   │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐     ┌─────────┐          │
//! │  │ Frame 0 │ │ Frame 1 │ │ Frame 2 │ ... │ Frame N │          │
//! │  │ latch   │ │ latch   │ │ latch   │     │ latch   │          │
//! │  │ pin_cnt │ │ pin_cnt │ │ pin_cnt │     │ pin_cnt │          │
//! │  │ rec_lsn │ │ rec_lsn │ │ rec_lsn │     │ rec_lsn │          │
//! │  └─────────┘ └─────────┘ └─────────┘     └─────────┘          │
//! └───────────────┬───────────────────────────────┬───────────────┘
//!                 │ force_to(page LSN)            │ read/write
//!                 ▼                               ▼
//!              ForceLog                        PageFile
//! ```
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use stasis_common::types::{Lsn, PageId};
//! use stasis_storage::buffer::{BufferPool, BufferPoolConfig};
//! use stasis_storage::file::MemoryPageFile;
//!
//! let pool = BufferPool::new(BufferPoolConfig::new(16), Arc::new(MemoryPageFile::new()))?;
//! let page = pool.load_page(PageId::new(3))?;
//! {
//!     let mut latch = page.write();
//!     latch[0] = 0xAB;
//!     latch.set_lsn(Lsn::new(1));
//! }
//! assert_eq!(page.read()[0], 0xAB);
//! // The pin is released when the handle is dropped.
//! # Ok::<(), stasis_storage::buffer::BufferError>(())
//! ```

mod config;
mod error;
mod frame;
mod latch;
mod pool;
mod replacer;

pub use config::BufferPoolConfig;
pub use error::{BufferError, BufferResult, ForceError};
pub use frame::{BufferFrame, FrameId};
pub use latch::{PageHandle, PageReadLatch, PageWriteLatch};
pub use pool::BufferPool;
pub use replacer::Lru2sReplacer;

use stasis_common::types::Lsn;

/// Hook the buffer pool uses to make the log durable before a page write.
pub trait ForceLog: Send + Sync {
    /// Blocks until every log entry up to and including `lsn` is durable.
    fn force_to(&self, lsn: Lsn) -> Result<(), ForceError>;
}

/// Statistics for buffer pool monitoring.
#[derive(Debug, Clone, Default)]
pub struct BufferPoolStats {
    /// Total number of page fetches.
    pub fetches: u64,
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses (required disk read).
    pub misses: u64,
    /// Number of pages evicted.
    pub evictions: u64,
    /// Number of dirty pages written back.
    pub flushes: u64,
    /// Current number of pinned frames.
    pub pinned_frames: usize,
    /// Current number of dirty frames.
    pub dirty_frames: usize,
}

impl BufferPoolStats {
    /// Returns the cache hit ratio (0.0 to 1.0).
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        if self.fetches == 0 {
            0.0
        } else {
            self.hits as f64 / self.fetches as f64
        }
    }
}
