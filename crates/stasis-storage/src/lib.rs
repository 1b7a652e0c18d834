//! # stasis-storage
//!
//! Page-level storage for the Stasis transactional storage engine.
//!
//! This crate provides:
//! - Page formats: slotted, fixed-record and indirect pages sharing a common
//!   `{page type, LSN}` trailer
//! - Page file I/O over a regular file or an in-memory map
//! - A buffer pool with LRU-2S replacement, pin handles, per-page latches and
//!   a write-ahead hook

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Page layout and disk format
pub mod page;

/// Page file I/O
pub mod file;

/// Buffer manager
pub mod buffer;

pub use buffer::{BufferPool, BufferPoolConfig, ForceLog, PageHandle};
pub use file::{FilePageFile, MemoryPageFile, PageFile};
pub use page::{PageType, PAGE_SIZE};
