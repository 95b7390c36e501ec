//! Configuration for the notary engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Notary configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Where the server signing seed lives; created on first run
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Notary identifier this server signs as
    pub notary_id: String,

    /// Metrics listen address
    pub metrics_listen_addr: String,

    /// RocksDB configuration
    pub rocksdb: RocksDbConfig,
}

fn default_key_file() -> PathBuf {
    PathBuf::from("./data/notary.seed")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/notary"),
            key_file: default_key_file(),
            service_name: "notary-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            notary_id: "notary-main".to_string(),
            metrics_listen_addr: "0.0.0.0:9090".to_string(),
            rocksdb: RocksDbConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDbConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Sync every counter write to disk before acknowledging issuance
    pub sync_counter_writes: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            sync_counter_writes: true,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("NOTARY_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(key_file) = std::env::var("NOTARY_KEY_FILE") {
            config.key_file = PathBuf::from(key_file);
        }

        if let Ok(notary_id) = std::env::var("NOTARY_ID") {
            config.notary_id = notary_id;
        }

        if let Ok(addr) = std::env::var("NOTARY_METRICS_ADDR") {
            config.metrics_listen_addr = addr;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "notary-core");
        assert_eq!(config.notary_id, "notary-main");
        assert!(config.rocksdb.sync_counter_writes);
    }
}
