//! Error types for the notary engine

use thiserror::Error;

/// Result type for notary operations
pub type Result<T> = std::result::Result<T, Error>;

/// Notary errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Transaction number could not be durably issued
    #[error("Issuance error: {0}")]
    Issuance(String),

    /// Delivery aborted cleanly, no box mutation occurred
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Box failed integrity verification (notary id or signature)
    #[error("Box integrity error: {0}")]
    BoxIntegrity(String),

    /// Box not found
    #[error("Box not found: {0}")]
    BoxNotFound(String),

    /// Box receipt not found
    #[error("Receipt not found for number {0}")]
    ReceiptNotFound(i64),

    /// Identity record or public key missing
    #[error("Identity not found: {0}")]
    IdentityNotFound(String),

    /// Envelope sealing or opening failed (opaque)
    #[error("Envelope error: {0}")]
    Envelope(String),

    /// Signature verification failed
    #[error("Signature verification failed: {0}")]
    SignatureError(String),

    /// Account balance insufficient for a debit
    #[error("Insufficient funds in account {0}")]
    InsufficientFunds(String),

    /// Account not found
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Shutdown already in progress; no new operations admitted
    #[error("Server is shutting down")]
    ShuttingDown,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
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
