//! Configuration for Stasis.

mod engine;

pub use engine::{Backend, BufferPoolConfig, LockConfig, LogConfig, StasisConfig, StorageConfig};
