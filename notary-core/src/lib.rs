//! Notary Core
//!
//! Centralized financial notary engine: transaction number issuance,
//! guaranteed delivery of signed notices into per-identity nymboxes, and
//! the concurrency gate that drains in-flight operations before shutdown.
//!
//! # Architecture
//!
//! - **Number authority**: the sole issuer of transaction numbers;
//!   strictly increasing, durably recorded before grant, never reused
//! - **Guaranteed delivery**: sealed, signed notices appended to a
//!   recipient's nymbox together with a durable box receipt, atomically
//! - **Gatekeeper**: atomic admission counter; shutdown drains in-flight
//!   tickets and refuses new ones
//!
//! # Invariants
//!
//! - Number uniqueness: no transaction number is ever issued twice
//! - Atomic delivery: a failed delivery leaves the target box untouched
//! - Receipt correspondence: every abbreviated box entry has a
//!   retrievable full-body receipt

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod accounts;
pub mod config;
pub mod crypto;
pub mod delivery;
pub mod error;
pub mod gatekeeper;
pub mod identity;
pub mod metrics;
pub mod server;
pub mod storage;
pub mod transactor;
pub mod types;

// Re-exports
pub use config::Config;
pub use delivery::{NotaryDeliveryService, Payload};
pub use error::{Error, Result};
pub use gatekeeper::{Gatekeeper, Ticket};
pub use server::ServerCore;
pub use storage::Storage;
pub use transactor::NumberAuthority;
pub use types::{
    AccountId, BoxKind, BoxLedger, BoxTransaction, Currency, Instrument, InstrumentKind,
    NoticeKind, NoticeMessage, NotaryId, NymId, ReceiptHandle, Signature, TransactionNumber,
};
