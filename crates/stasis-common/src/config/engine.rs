//! Engine configuration structures.
//!
//! These structures describe a complete Stasis instance: where its files
//! live, which backends hold pages and log entries, and how large the buffer
//! pool is.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_BUFFER_FRAMES, DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_LOG_FILE_NAME,
    DEFAULT_PAGE_FILE_NAME, DEFAULT_PROBATIONARY_RATIO, DEFAULT_TRUNCATION_THRESHOLD,
    MIN_BUFFER_FRAMES,
};
use crate::error::{StasisError, StasisResult};

/// Where a component keeps its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    /// A file in the data directory.
    File,
    /// Process memory; contents are lost when the engine is dropped.
    Memory,
}

/// Main engine configuration.
///
/// # Example
///
/// ```rust
/// use stasis_common::config::{Backend, StasisConfig};
///
/// let config = StasisConfig::default();
/// assert_eq!(config.storage.backend, Backend::File);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StasisConfig {
    /// Data directory for the page file and the log.
    pub data_dir: PathBuf,

    /// Page file configuration.
    pub storage: StorageConfig,

    /// Buffer pool configuration.
    pub buffer_pool: BufferPoolConfig,

    /// Log configuration.
    pub log: LogConfig,

    /// Lock manager configuration.
    pub lock: LockConfig,
}

impl Default for StasisConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            storage: StorageConfig::default(),
            buffer_pool: BufferPoolConfig::default(),
            log: LogConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

impl StasisConfig {
    /// Creates a new configuration with the specified data directory.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Creates a fully in-memory configuration with a small pool.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            storage: StorageConfig {
                backend: Backend::Memory,
                ..Default::default()
            },
            buffer_pool: BufferPoolConfig {
                frames: 64,
                ..Default::default()
            },
            log: LogConfig {
                backend: Backend::Memory,
                ..Default::default()
            },
            lock: LockConfig::default(),
        }
    }

    /// Sets the number of buffer pool frames.
    #[must_use]
    pub fn with_buffer_frames(mut self, frames: usize) -> Self {
        self.buffer_pool.frames = frames;
        self
    }

    /// Enables or disables the page-granularity lock manager.
    #[must_use]
    pub fn with_page_locking(mut self, enabled: bool) -> Self {
        self.lock.enabled = enabled;
        self
    }

    /// Path of the page file.
    #[must_use]
    pub fn page_file_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.file_name)
    }

    /// Path of the log file.
    #[must_use]
    pub fn log_file_path(&self) -> PathBuf {
        self.data_dir.join(&self.log.file_name)
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> StasisResult<()> {
        if self.buffer_pool.frames < MIN_BUFFER_FRAMES {
            return Err(StasisError::config(format!(
                "buffer_pool.frames must be at least {MIN_BUFFER_FRAMES}"
            )));
        }

        let ratio = self.buffer_pool.probationary_ratio;
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(StasisError::config(
                "buffer_pool.probationary_ratio must be in (0, 1)",
            ));
        }

        if self.storage.file_name.is_empty() || self.log.file_name.is_empty() {
            return Err(StasisError::config("file names must not be empty"));
        }

        if self.lock.timeout_ms == 0 {
            return Err(StasisError::config("lock.timeout_ms must be positive"));
        }

        Ok(())
    }
}

/// Page file configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Page file backend.
    /// Default: File
    pub backend: Backend,

    /// Name of the page file inside the data directory.
    /// Default: "storefile.txt"
    pub file_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: Backend::File,
            file_name: DEFAULT_PAGE_FILE_NAME.to_string(),
        }
    }
}

/// Buffer pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    /// Number of page frames.
    /// Default: 1024
    pub frames: usize,

    /// Share of the replacement queue used as the probationary segment.
    /// Default: 0.3
    pub probationary_ratio: f64,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            frames: DEFAULT_BUFFER_FRAMES,
            probationary_ratio: DEFAULT_PROBATIONARY_RATIO,
        }
    }
}

/// Log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log backend.
    /// Default: File
    pub backend: Backend,

    /// Name of the log file inside the data directory.
    /// Default: "logfile.txt"
    pub file_name: String,

    /// Call `fsync` when the log is forced.
    /// Default: true
    pub sync_on_force: bool,

    /// Log size in bytes above which commits trigger truncation.
    /// Default: 67108864 (64 MB)
    pub truncation_threshold: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            backend: Backend::File,
            file_name: DEFAULT_LOG_FILE_NAME.to_string(),
            sync_on_force: true,
            truncation_threshold: DEFAULT_TRUNCATION_THRESHOLD,
        }
    }
}

/// Lock manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Install the page-granularity lock manager.
    /// Default: false
    pub enabled: bool,

    /// Maximum wait for a single lock request, in milliseconds.
    /// Default: 1000
    pub timeout_ms: u64,
}

impl LockConfig {
    /// Lock wait timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}
