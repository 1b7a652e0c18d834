//! Log entries and their binary encoding.

pub mod codec;
mod types;

pub use codec::{frame_len, FRAME_HEADER_SIZE};
pub use types::{ClrEntry, EntryBody, EntryFlags, EntryType, LogEntry, UpdateEntry};
