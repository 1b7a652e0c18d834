//! Buffer pool configuration.

use stasis_common::config::BufferPoolConfig as EngineBufferConfig;
use stasis_common::constants::{
    DEFAULT_BUFFER_FRAMES, DEFAULT_PROBATIONARY_RATIO, MIN_BUFFER_FRAMES,
};

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of page frames in the buffer pool.
    pub num_frames: usize,
    /// Fraction of the LRU-2S list reserved for probationary (touched once)
    /// pages. The protected segment holds the remainder.
    pub probationary_ratio: f64,
}

impl BufferPoolConfig {
    /// Creates a new configuration with the specified number of frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            num_frames,
            probationary_ratio: DEFAULT_PROBATIONARY_RATIO,
        }
    }

    /// Sets the probationary segment ratio.
    pub fn with_probationary_ratio(mut self, ratio: f64) -> Self {
        self.probationary_ratio = ratio;
        self
    }

    /// Returns the number of frames the protected segment may hold before
    /// its coldest entry is demoted.
    pub fn protected_capacity(&self) -> usize {
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let protected = (self.num_frames as f64 * (1.0 - self.probationary_ratio)) as usize;
        protected.min(self.num_frames.saturating_sub(1))
    }

    /// Returns the total memory used by the buffer pool.
    pub fn memory_usage(&self) -> usize {
        self.num_frames * crate::page::PAGE_SIZE
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.num_frames < MIN_BUFFER_FRAMES {
            return Err("buffer pool needs at least MIN_BUFFER_FRAMES frames");
        }
        if !(self.probationary_ratio > 0.0 && self.probationary_ratio < 1.0) {
            return Err("probationary ratio must lie strictly between 0 and 1");
        }
        Ok(())
    }
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_FRAMES)
    }
}

impl From<&EngineBufferConfig> for BufferPoolConfig {
    fn from(config: &EngineBufferConfig) -> Self {
        Self::new(config.frames).with_probationary_ratio(config.probationary_ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BufferPoolConfig::default();
        assert_eq!(config.num_frames, DEFAULT_BUFFER_FRAMES);
        assert!((config.probationary_ratio - 0.3).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_protected_capacity() {
        let config = BufferPoolConfig::new(100);
        assert_eq!(config.protected_capacity(), 70);

        let config = BufferPoolConfig::new(10).with_probationary_ratio(0.5);
        assert_eq!(config.protected_capacity(), 5);
    }

    #[test]
    fn test_validate() {
        assert!(BufferPoolConfig::new(2).validate().is_err());
        assert!(BufferPoolConfig::new(16)
            .with_probationary_ratio(1.0)
            .validate()
            .is_err());
        assert!(BufferPoolConfig::new(16)
            .with_probationary_ratio(0.0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_from_engine_config() {
        let engine = EngineBufferConfig {
            frames: 32,
            probationary_ratio: 0.25,
        };
        let config = BufferPoolConfig::from(&engine);
        assert_eq!(config.num_frames, 32);
        assert_eq!(config.protected_capacity(), 24);
    }
}
