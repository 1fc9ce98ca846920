//! Configuration management for the persistent heap.
//!
//! This module handles all configuration settings with performance-optimized
//! defaults.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Pool configuration
    pub pool: PoolConfig,

    /// Heap tuning
    pub heap: HeapConfig,

    /// Metrics and monitoring
    pub metrics: MetricsConfig,
}

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool file path
    pub path: PathBuf,

    /// Pool size in bytes (only used on create)
    pub size: u64,

    /// Number of lanes / info slots (only used on create; durably recorded)
    pub lane_count: u64,

    /// Reject pools whose mapping only offers page-granular durability
    pub require_byte_granularity: bool,
}

/// Heap tuning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapConfig {
    /// Granularity of the size-to-class range table
    pub class_granularity: u64,

    /// Largest size the class range table may cover; bigger requests go to
    /// the huge bucket
    pub class_limit: u64,

    /// Fail allocations whose size matches no registered class instead of
    /// falling through to the next larger one
    pub fail_no_matching_class: bool,

    /// Number of per-lane bucket cache groups (0 = one per CPU)
    pub cache_count: usize,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics mirroring of the ctl statistics
    pub enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            heap: HeapConfig::default(),
            metrics: MetricsConfig { enabled: true },
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("heap.pool"),
            size: 64 * 1024 * 1024,
            lane_count: crate::layout::DEFAULT_LANE_COUNT,
            require_byte_granularity: false,
        }
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            class_granularity: 256,
            class_limit: 64 * 1024,
            fail_no_matching_class: false,
            cache_count: 0,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&raw).map_err(|e| Error::config(format!("parse failure: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.pool.size < crate::layout::MIN_POOL_SIZE {
            return Err(Error::config(format!(
                "pool size {} below minimum {}",
                self.pool.size,
                crate::layout::MIN_POOL_SIZE
            )));
        }
        if self.pool.lane_count == 0 || !self.pool.lane_count.is_power_of_two() {
            return Err(Error::config("lane_count must be a nonzero power of two"));
        }
        if self.heap.class_granularity == 0 {
            return Err(Error::config("class_granularity must be nonzero"));
        }
        if self.heap.class_limit < self.heap.class_granularity {
            return Err(Error::config("class_limit below class_granularity"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_tiny_pool() {
        let mut config = Config::default();
        config.pool.size = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_odd_lane_count() {
        let mut config = Config::default();
        config.pool.lane_count = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let raw = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.pool.size, config.pool.size);
        assert_eq!(parsed.heap.class_limit, config.heap.class_limit);
    }
}
