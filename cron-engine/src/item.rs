//! Recurring financial instruments processed each tick
//!
//! A cron item is a tagged variant over market offers, payment plans, and
//! smart contracts, sharing a header with the owning nym, the notary, the
//! authorizing transaction number, and an expiration time. Items are
//! created when a client request is accepted, advanced each tick, and
//! destroyed when they expire, complete, or are killed by their owner.

use chrono::{DateTime, Utc};
use notary_core::types::{AccountId, Currency, NotaryId, NymId, TransactionNumber};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Fields shared by every cron item variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemHeader {
    /// Owning nym
    pub owner: NymId,

    /// Notary the item is registered at
    pub notary: NotaryId,

    /// Transaction number authorizing this item (also its registry key)
    pub number: TransactionNumber,

    /// Expiration time; the item is swept after this instant
    pub expires_at: DateTime<Utc>,
}

/// Side of a market offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfferSide {
    /// Buying the asset, paying currency
    Buy,
    /// Selling the asset, receiving currency
    Sell,
}

/// Terms of a resting market offer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferTerms {
    /// Which side of the book
    pub side: OfferSide,

    /// Asset type being traded
    pub asset: String,

    /// Currency the asset trades against
    pub currency: Currency,

    /// Minimum lot size; fills happen in multiples of this
    pub scale: Decimal,

    /// Limit price per lot of `scale` units
    pub price_per_scale: Decimal,

    /// Quantity still unfilled
    pub remaining: Decimal,

    /// Account holding the owner's asset units
    pub asset_account: AccountId,

    /// Account holding the owner's currency
    pub currency_account: AccountId,
}

impl OfferTerms {
    /// True once the remaining quantity can no longer form a full lot
    pub fn is_exhausted(&self) -> bool {
        self.remaining < self.scale
    }
}

/// Terms of a recurring payment plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTerms {
    /// Paying account (owned by the item's owner)
    pub payer_account: AccountId,

    /// Receiving account
    pub payee_account: AccountId,

    /// Receiving nym, notified on every installment
    pub payee: NymId,

    /// Installment amount
    pub amount: Decimal,

    /// Currency
    pub currency: Currency,

    /// Seconds between installments
    pub interval_secs: i64,

    /// When the next installment falls due
    pub next_due: DateTime<Utc>,

    /// Installments still owed; the plan retires at zero
    pub payments_left: u32,
}

impl PlanTerms {
    /// True if an installment is due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.payments_left > 0 && now >= self.next_due
    }
}

/// One clause of a smart contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractClause {
    /// Clause name
    pub name: String,

    /// Trigger condition: fires once this instant passes
    pub trigger_at: DateTime<Utc>,

    /// Notice text delivered to every party on execution
    pub notice: String,
}

/// Terms of a smart contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractTerms {
    /// All parties; each receives a notice when a clause executes
    pub parties: Vec<NymId>,

    /// Pending clauses; the contract retires when none remain
    pub clauses: Vec<ContractClause>,
}

/// Variant-specific terms
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ItemTerms {
    /// Resting offer on a market
    MarketOffer(OfferTerms),
    /// Recurring payment plan
    PaymentPlan(PlanTerms),
    /// Smart contract with triggered clauses
    SmartContract(ContractTerms),
}

/// A registered recurring instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronItem {
    /// Shared header
    pub header: ItemHeader,

    /// Variant terms
    pub terms: ItemTerms,
}

impl CronItem {
    /// True if the item's lifetime has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.header.expires_at
    }

    /// True once the item has nothing left to do and can be retired
    pub fn is_complete(&self) -> bool {
        match &self.terms {
            ItemTerms::MarketOffer(offer) => offer.is_exhausted(),
            ItemTerms::PaymentPlan(plan) => plan.payments_left == 0,
            ItemTerms::SmartContract(contract) => contract.clauses.is_empty(),
        }
    }

    /// Serialized form persisted in the cron column family
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a persisted item
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
