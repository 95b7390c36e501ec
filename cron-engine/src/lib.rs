//! Cron Engine
//!
//! Periodic processing of recurring financial instruments registered
//! against a notary: standing payment plans, clause-bearing smart
//! contracts, and resting market offers matched against each other at
//! price-time priority.
//!
//! Each item is anchored by a transaction number issued by the notary's
//! number authority. The engine keeps a private pool of numbers it
//! refills every tick and spends one per action it performs, so every
//! payment, trade, and contract notice carries its own closing number.
//!
//! # Invariants
//!
//! - Ticks never overlap; a long tick delays the next one
//! - A refill shortfall shrinks the tick's capacity, never fails it
//! - One item's failure never aborts its siblings in the same tick
//! - Expired and completed items leave the active set permanently

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod config;
pub mod engine;
pub mod error;
pub mod item;
pub mod market;

// Re-exports
pub use config::CronConfig;
pub use engine::{CronEngine, NumberSource, TickSummary};
pub use error::{Error, Result};
pub use item::{
    ContractClause, ContractTerms, CronItem, ItemHeader, ItemTerms, OfferSide, OfferTerms,
    PlanTerms,
};
pub use market::{build_markets, plan_trades, MarketKey, PlannedTrade};
