//! Page file I/O for Stasis.
//!
//! The buffer manager reads and writes whole pages through the [`PageFile`]
//! trait. Two backends are provided:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            PageFile Trait               │
//! │  (read_page, write_page, force, ...)    │
//! └─────────────────────────────────────────┘
//!              │                   │
//!              ▼                   ▼
//! ┌─────────────────────┐  ┌─────────────────────┐
//! │   FilePageFile      │  │   MemoryPageFile    │
//! │   (std::fs::File)   │  │   (HashMap of pages)│
//! └─────────────────────┘  └─────────────────────┘
//! ```
//!
//! Page `n` occupies bytes `[n * PAGE_SIZE, (n + 1) * PAGE_SIZE)`.

mod error;
mod handle;
mod memory;
mod std_io;

pub use error::{IoError, IoResult};
pub use handle::PageFile;
pub use memory::MemoryPageFile;
pub use std_io::FilePageFile;
