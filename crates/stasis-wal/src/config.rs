//! Log configuration.

use stasis_common::config::LogConfig as EngineLogConfig;
use stasis_common::constants::{DEFAULT_TRUNCATION_THRESHOLD, MAX_LOG_ENTRY_SIZE};

/// Configuration shared by the log backends.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Call `fsync` when the log is forced. Turning this off keeps
    /// ordering but gives up durability across power loss.
    pub sync_on_force: bool,

    /// Maximum encoded size of a single entry.
    pub max_entry_size: usize,

    /// Pending bytes buffered before they are written to the file,
    /// independent of forces.
    pub write_buffer_size: usize,

    /// Log length in bytes above which the transaction manager truncates.
    pub truncation_threshold: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            sync_on_force: true,
            max_entry_size: MAX_LOG_ENTRY_SIZE,
            write_buffer_size: 64 * 1024,
            truncation_threshold: DEFAULT_TRUNCATION_THRESHOLD,
        }
    }
}

impl LogConfig {
    /// Sets whether forces call `fsync`.
    #[must_use]
    pub fn with_sync_on_force(mut self, sync: bool) -> Self {
        self.sync_on_force = sync;
        self
    }

    /// Sets the maximum entry size.
    #[must_use]
    pub fn with_max_entry_size(mut self, size: usize) -> Self {
        self.max_entry_size = size;
        self
    }

    /// Sets the truncation threshold.
    #[must_use]
    pub fn with_truncation_threshold(mut self, bytes: u64) -> Self {
        self.truncation_threshold = bytes;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_entry_size < 64 {
            return Err("max_entry_size is too small to hold any entry");
        }
        if self.write_buffer_size == 0 {
            return Err("write_buffer_size must be non-zero");
        }
        Ok(())
    }
}

impl From<&EngineLogConfig> for LogConfig {
    fn from(config: &EngineLogConfig) -> Self {
        Self::default()
            .with_sync_on_force(config.sync_on_force)
            .with_truncation_threshold(config.truncation_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert!(config.sync_on_force);
        assert_eq!(config.max_entry_size, MAX_LOG_ENTRY_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_engine_config() {
        let engine = EngineLogConfig {
            sync_on_force: false,
            truncation_threshold: 1024,
            ..EngineLogConfig::default()
        };
        let config = LogConfig::from(&engine);
        assert!(!config.sync_on_force);
        assert_eq!(config.truncation_threshold, 1024);
    }

    #[test]
    fn test_validate() {
        assert!(LogConfig::default().with_max_entry_size(8).validate().is_err());
    }
}
