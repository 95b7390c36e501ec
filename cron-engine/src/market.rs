//! Market aggregation and offer matching
//!
//! A market aggregates the active offers for one asset/currency pair at
//! one lot scale. Markets are derived from the registered cron items each
//! tick, never persisted independently.
//!
//! Matching is price-time priority: the best bid crosses the best ask,
//! fills happen in whole lots, and the trade executes at the resting
//! (earlier registered) offer's price. Matching is a pure planning step;
//! the engine applies the resulting fills to accounts and items.

use crate::item::{OfferSide, OfferTerms};
use notary_core::types::{Currency, TransactionNumber};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Identifies one market: asset traded against currency at a lot scale
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MarketKey {
    /// Asset type
    pub asset: String,

    /// Quote currency
    pub currency: Currency,

    /// Lot scale
    pub scale: Decimal,
}

impl MarketKey {
    /// Key of the market an offer rests on
    pub fn for_offer(offer: &OfferTerms) -> Self {
        Self {
            asset: offer.asset.clone(),
            currency: offer.currency,
            scale: offer.scale,
        }
    }
}

/// A fill planned between two crossed offers
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTrade {
    /// Buying offer's transaction number
    pub buy_number: TransactionNumber,

    /// Selling offer's transaction number
    pub sell_number: TransactionNumber,

    /// Asset quantity filled (a whole multiple of the lot scale)
    pub quantity: Decimal,

    /// Execution price per lot (the resting offer's limit)
    pub price: Decimal,

    /// Currency moved from buyer to seller
    pub payment: Decimal,
}

/// Group active offers into markets, preserving registration order
pub fn build_markets(
    offers: impl IntoIterator<Item = (TransactionNumber, OfferTerms)>,
) -> BTreeMap<MarketKey, Vec<(TransactionNumber, OfferTerms)>> {
    let mut markets: BTreeMap<MarketKey, Vec<(TransactionNumber, OfferTerms)>> = BTreeMap::new();

    for (number, offer) in offers {
        markets
            .entry(MarketKey::for_offer(&offer))
            .or_default()
            .push((number, offer));
    }

    markets
}

/// Plan all fills for one market's offers.
///
/// Deterministic for a given input: bids sort by price descending then
/// number ascending, asks by price ascending then number ascending, so
/// replaying a tick over identical items yields identical trades.
pub fn plan_trades(offers: &[(TransactionNumber, OfferTerms)]) -> Vec<PlannedTrade> {
    let scale = match offers.first() {
        Some((_, offer)) => offer.scale,
        None => return Vec::new(),
    };
    if scale <= Decimal::ZERO {
        return Vec::new();
    }

    struct BookEntry {
        number: TransactionNumber,
        price: Decimal,
        remaining: Decimal,
    }

    let mut bids: Vec<BookEntry> = Vec::new();
    let mut asks: Vec<BookEntry> = Vec::new();

    for (number, offer) in offers {
        let entry = BookEntry {
            number: *number,
            price: offer.price_per_scale,
            remaining: offer.remaining,
        };
        match offer.side {
            OfferSide::Buy => bids.push(entry),
            OfferSide::Sell => asks.push(entry),
        }
    }

    bids.sort_by(|a, b| b.price.cmp(&a.price).then(a.number.cmp(&b.number)));
    asks.sort_by(|a, b| a.price.cmp(&b.price).then(a.number.cmp(&b.number)));

    let mut trades = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < bids.len() && j < asks.len() {
        if bids[i].remaining < scale {
            i += 1;
            continue;
        }
        if asks[j].remaining < scale {
            j += 1;
            continue;
        }

        let (bid, ask) = (&bids[i], &asks[j]);
        if bid.price < ask.price {
            break;
        }

        // Whole lots only
        let lots = (bid.remaining.min(ask.remaining) / scale).floor();
        let quantity = lots * scale;

        // The resting (earlier registered) offer sets the price
        let price = if bid.number < ask.number {
            bid.price
        } else {
            ask.price
        };

        trades.push(PlannedTrade {
            buy_number: bid.number,
            sell_number: ask.number,
            quantity,
            price,
            payment: lots * price,
        });

        bids[i].remaining -= quantity;
        asks[j].remaining -= quantity;
    }

    trades
}
