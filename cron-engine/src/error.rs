//! Error types for the cron engine

use thiserror::Error;

/// Result type for cron operations
pub type Result<T> = std::result::Result<T, Error>;

/// Cron errors
#[derive(Error, Debug)]
pub enum Error {
    /// Notary core error
    #[error("Notary error: {0}")]
    Notary(#[from] notary_core::Error),

    /// An owning nym hit its concurrent item cap
    #[error("Nym {nym} already has {count} active items (max {max})")]
    ItemLimitExceeded {
        /// Owning nym
        nym: String,
        /// Active items held
        count: usize,
        /// Configured cap
        max: usize,
    },

    /// A cron item was rejected at registration
    #[error("Invalid cron item: {0}")]
    InvalidItem(String),

    /// An item with this transaction number is already registered
    #[error("Duplicate cron item number: {0}")]
    DuplicateItem(i64),

    /// Market matching error
    #[error("Market error: {0}")]
    Market(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
