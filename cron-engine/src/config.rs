//! Configuration for the cron engine
//!
//! Defaults match the legacy server constants: a 10 second tick, a pool
//! refilled to 50 numbers, and at most 10 concurrently active items per
//! owning nym.

use serde::{Deserialize, Serialize};

/// Cron engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    /// Milliseconds between ticks
    pub tick_interval_ms: u64,

    /// Refill the private number pool up to this size each tick
    pub refill_threshold: usize,

    /// Maximum concurrently active items per owning nym
    pub max_items_per_nym: usize,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 10_000,
            refill_threshold: 50,
            max_items_per_nym: 10,
        }
    }
}

impl CronConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configured values
    pub fn validate(&self) -> crate::Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(crate::Error::Config(
                "tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.max_items_per_nym == 0 {
            return Err(crate::Error::Config(
                "max_items_per_nym must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
