//! Periodic processing of recurring instruments
//!
//! The engine holds every active cron item in memory, mirrored to
//! storage, and advances them on a fixed tick: refill the transaction
//! number pool, execute due payment plans and contract clauses, cross
//! market offers, then sweep expired and completed items. Ticks never
//! overlap because the single run loop awaits each tick to completion.
//!
//! Every action a tick performs (a payment, a trade, a fired clause)
//! consumes one number from the pool; when the pool runs dry the
//! remaining work is deferred to a later tick rather than failed.

use crate::config::CronConfig;
use crate::item::{ContractTerms, CronItem, ItemHeader, ItemTerms, OfferTerms, PlanTerms};
use crate::market::{build_markets, plan_trades, PlannedTrade};
use crate::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use notary_core::accounts::AccountLedger;
use notary_core::metrics::Metrics;
use notary_core::types::{Instrument, InstrumentKind, NymId, TransactionNumber};
use notary_core::{NotaryDeliveryService, NumberAuthority, Payload, Storage};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;

/// Source of fresh transaction numbers for the engine's pool
pub trait NumberSource: Send + Sync {
    /// Issue the next number; refusal stops the current refill, not the tick
    fn issue_next(&self) -> notary_core::Result<TransactionNumber>;

    /// Whether this number was ever issued by the authority
    fn verify_issued(&self, number: TransactionNumber) -> bool;

    /// Spend `number` out of `consumer`'s pool; false if not held
    fn consume(&self, consumer: &str, number: TransactionNumber) -> notary_core::Result<bool>;
}

impl NumberSource for NumberAuthority {
    fn issue_next(&self) -> notary_core::Result<TransactionNumber> {
        NumberAuthority::issue_next(self)
    }

    fn verify_issued(&self, number: TransactionNumber) -> bool {
        NumberAuthority::verify_issued(self, number)
    }

    fn consume(&self, consumer: &str, number: TransactionNumber) -> notary_core::Result<bool> {
        NumberAuthority::consume(self, consumer, number)
    }
}

/// What a single tick accomplished
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Numbers added to the pool
    pub refilled: usize,

    /// Payment plan installments executed
    pub payments: usize,

    /// Contract clauses fired
    pub clauses: usize,

    /// Market trades settled
    pub trades: usize,

    /// Items swept as expired or complete
    pub expired: usize,
}

struct EngineState {
    pool: BTreeSet<TransactionNumber>,
    items: BTreeMap<TransactionNumber, CronItem>,
}

/// The recurring-instrument processor
pub struct CronEngine {
    config: CronConfig,
    numbers: Arc<dyn NumberSource>,
    delivery: Arc<NotaryDeliveryService>,
    accounts: Arc<dyn AccountLedger>,
    storage: Arc<Storage>,
    metrics: Metrics,
    state: Mutex<EngineState>,
}

impl CronEngine {
    /// Open the engine, resuming the number pool and item set from storage
    pub fn open(
        config: CronConfig,
        numbers: Arc<dyn NumberSource>,
        delivery: Arc<NotaryDeliveryService>,
        accounts: Arc<dyn AccountLedger>,
        storage: Arc<Storage>,
        metrics: Metrics,
    ) -> Result<Self> {
        config.validate()?;

        let pool = storage.load_cron_pool()?;
        let mut items = BTreeMap::new();
        for (number, bytes) in storage.load_cron_items()? {
            match CronItem::from_bytes(&bytes) {
                Ok(item) => {
                    items.insert(number, item);
                }
                Err(e) => {
                    tracing::warn!(number, error = %e, "Skipping undecodable cron item")
                }
            }
        }

        metrics.cron_items_active.set(items.len() as i64);
        tracing::info!(
            items = items.len(),
            pool = pool.len(),
            tick_ms = config.tick_interval_ms,
            "Cron engine opened"
        );

        Ok(Self {
            config,
            numbers,
            delivery,
            accounts,
            storage,
            metrics,
            state: Mutex::new(EngineState { pool, items }),
        })
    }

    /// Register a new cron item against an issued opening number.
    ///
    /// The item is persisted before it becomes visible to ticks. Rejects
    /// already-expired items, numbers the authority never issued, numbers
    /// the owner does not hold, duplicate numbers, and owners at their
    /// item cap. The opening number is consumed out of the owner's pool
    /// on success, so once an item retires or is killed its number can
    /// never open another item.
    pub async fn register_item(&self, item: CronItem) -> Result<()> {
        let now = Utc::now();
        if item.is_expired(now) {
            return Err(Error::InvalidItem(format!(
                "Item {} is already expired",
                item.header.number
            )));
        }
        validate_terms(&item)?;
        if !self.numbers.verify_issued(item.header.number) {
            return Err(Error::InvalidItem(format!(
                "Transaction number {} was never issued",
                item.header.number
            )));
        }

        let mut state = self.state.lock().await;
        if state.items.contains_key(&item.header.number) {
            return Err(Error::DuplicateItem(item.header.number));
        }
        let count = state
            .items
            .values()
            .filter(|existing| existing.header.owner == item.header.owner)
            .count();
        if count >= self.config.max_items_per_nym {
            return Err(Error::ItemLimitExceeded {
                nym: item.header.owner.to_string(),
                count,
                max: self.config.max_items_per_nym,
            });
        }

        // Spend the opening number last, once every cheaper check has
        // passed. A number already spent, including by a prior item that
        // has since retired, cannot open an item again.
        if !self
            .numbers
            .consume(item.header.owner.as_str(), item.header.number)?
        {
            return Err(Error::InvalidItem(format!(
                "Transaction number {} is not held by {}",
                item.header.number, item.header.owner
            )));
        }

        self.storage
            .put_cron_item(item.header.number, &item.to_bytes()?)?;
        tracing::info!(
            number = item.header.number,
            owner = %item.header.owner,
            "Cron item registered"
        );
        state.items.insert(item.header.number, item);
        self.metrics.cron_items_active.set(state.items.len() as i64);
        Ok(())
    }

    /// Remove an item at its owner's request.
    ///
    /// Returns false when the number is unknown or owned by someone else.
    pub async fn kill_item(&self, owner: &NymId, number: TransactionNumber) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.items.get(&number) {
            Some(item) if item.header.owner == *owner => {
                self.storage.delete_cron_item(number)?;
                state.items.remove(&number);
                self.metrics.cron_items_active.set(state.items.len() as i64);
                tracing::info!(number, owner = %owner, "Cron item killed");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Look up an active item by its opening number
    pub async fn item(&self, number: TransactionNumber) -> Option<CronItem> {
        self.state.lock().await.items.get(&number).cloned()
    }

    /// Number of active items
    pub async fn active_items(&self) -> usize {
        self.state.lock().await.items.len()
    }

    /// Numbers currently available to ticks
    pub async fn pool_size(&self) -> usize {
        self.state.lock().await.pool.len()
    }

    /// Run one tick: refill, process, match, sweep.
    ///
    /// Individual item failures are logged and skipped; a tick itself
    /// never fails.
    pub async fn tick(&self) -> TickSummary {
        let timer = self.metrics.cron_tick_duration.start_timer();
        let now = Utc::now();
        let mut summary = TickSummary::default();
        let mut state = self.state.lock().await;
        let mut pool_dirty = false;

        // Phase 1: top the pool back up, stopping quietly if the
        // authority refuses. A short pool starves work, it never
        // aborts the tick.
        while state.pool.len() < self.config.refill_threshold {
            match self.numbers.issue_next() {
                Ok(number) => {
                    state.pool.insert(number);
                    summary.refilled += 1;
                    pool_dirty = true;
                }
                Err(e) => {
                    tracing::warn!(
                        have = state.pool.len(),
                        want = self.config.refill_threshold,
                        error = %e,
                        "Number pool refill cut short"
                    );
                    break;
                }
            }
        }
        if pool_dirty {
            // Granted numbers must survive a crash between here and use
            if let Err(e) = self.storage.save_cron_pool(&state.pool) {
                tracing::warn!(error = %e, "Failed to persist refilled number pool");
            }
        }

        // Phase 2: payment plans and contract clauses, ascending number
        // order. Each item is advanced on a private clone and written
        // back only after it succeeds, so a failed transfer leaves the
        // schedule untouched for retry.
        let active: Vec<TransactionNumber> = state.items.keys().copied().collect();
        for number in active {
            let Some(mut item) = state.items.get(&number).cloned() else {
                continue;
            };
            if item.is_expired(now) {
                continue;
            }

            let state_mut = &mut *state;
            let advanced = match &mut item.terms {
                ItemTerms::PaymentPlan(plan) => {
                    match self
                        .advance_plan(&mut state_mut.pool, &mut pool_dirty, &item.header, plan, now)
                        .await
                    {
                        Ok(true) => {
                            summary.payments += 1;
                            true
                        }
                        Ok(false) => false,
                        Err(e) => {
                            tracing::warn!(number, error = %e, "Payment plan installment failed");
                            false
                        }
                    }
                }
                ItemTerms::SmartContract(contract) => {
                    match self
                        .advance_contract(
                            &mut state_mut.pool,
                            &mut pool_dirty,
                            &item.header,
                            contract,
                            now,
                        )
                        .await
                    {
                        Ok(0) => false,
                        Ok(fired) => {
                            summary.clauses += fired;
                            true
                        }
                        Err(e) => {
                            tracing::warn!(number, error = %e, "Contract clause processing failed");
                            false
                        }
                    }
                }
                // Offers are crossed against each other in phase 3
                ItemTerms::MarketOffer(_) => false,
            };

            if advanced {
                match item.to_bytes() {
                    Ok(bytes) => {
                        if let Err(e) = self.storage.put_cron_item(number, &bytes) {
                            tracing::warn!(number, error = %e, "Failed to persist advanced item");
                        }
                    }
                    Err(e) => tracing::warn!(number, error = %e, "Failed to encode advanced item"),
                }
                state.items.insert(number, item);
            }
        }

        // Phase 3: group live offers into markets and settle crossings
        // at the resting offer's price.
        let offers: Vec<(TransactionNumber, OfferTerms)> = state
            .items
            .iter()
            .filter(|(_, item)| !item.is_expired(now))
            .filter_map(|(number, item)| match &item.terms {
                ItemTerms::MarketOffer(offer) => Some((*number, offer.clone())),
                _ => None,
            })
            .collect();
        'markets: for (_key, market) in build_markets(offers) {
            for trade in plan_trades(&market) {
                match self.execute_trade(&mut state, &mut pool_dirty, &trade).await {
                    Some(true) => summary.trades += 1,
                    Some(false) => {}
                    // Pool exhausted; defer the rest of the book
                    None => break 'markets,
                }
            }
        }

        // Phase 4: expired and completed items leave the active set for
        // good, so a later tick never sees them again.
        let storage = &self.storage;
        state.items.retain(|number, item| {
            let retired = item.is_expired(now) || item.is_complete();
            if retired {
                if let Err(e) = storage.delete_cron_item(*number) {
                    tracing::warn!(number = *number, error = %e, "Failed to delete retired item");
                }
                tracing::info!(number = *number, owner = %item.header.owner, "Cron item retired");
                summary.expired += 1;
            }
            !retired
        });

        if pool_dirty {
            if let Err(e) = self.storage.save_cron_pool(&state.pool) {
                tracing::warn!(error = %e, "Failed to persist number pool");
            }
        }

        self.metrics.cron_ticks.inc();
        self.metrics.cron_items_active.set(state.items.len() as i64);
        timer.observe_duration();
        summary
    }

    /// Tick at the configured interval until `shutdown` flips to true.
    /// Missed ticks are delayed rather than bunched, and ticks cannot
    /// overlap. Shutdown is only observed between ticks: a tick in flight
    /// always finishes, so a funds transfer and its item write-back land
    /// together.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.tick().await;
                    tracing::debug!(
                        refilled = summary.refilled,
                        payments = summary.payments,
                        clauses = summary.clauses,
                        trades = summary.trades,
                        expired = summary.expired,
                        "Cron tick complete"
                    );
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Cron run loop stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn advance_plan(
        &self,
        pool: &mut BTreeSet<TransactionNumber>,
        pool_dirty: &mut bool,
        header: &ItemHeader,
        plan: &mut PlanTerms,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if plan.payments_left == 0 || !plan.is_due(now) {
            return Ok(false);
        }
        let Some(&closing) = pool.iter().next() else {
            tracing::warn!(number = header.number, "Number pool empty; payment deferred");
            return Ok(false);
        };

        // Funds move before the number is consumed; a bounced transfer
        // leaves both the pool and the schedule as they were.
        self.accounts
            .transfer(&plan.payer_account, &plan.payee_account, plan.amount)?;
        pool.remove(&closing);
        *pool_dirty = true;

        plan.payments_left -= 1;
        plan.next_due = plan.next_due + ChronoDuration::seconds(plan.interval_secs);

        let receipt = Instrument {
            kind: InstrumentKind::PaymentReceipt,
            amount: plan.amount,
            currency: plan.currency,
            sender: header.owner.clone(),
            recipient: plan.payee.clone(),
            terms: format!(
                "payment plan {} installment, closing number {}",
                header.number, closing
            ),
        };
        if let Err(e) = self
            .delivery
            .deliver(
                &header.owner,
                &plan.payee,
                Payload::Instrument(receipt),
                "payment-receipt",
            )
            .await
        {
            // Funds already moved; the payee misses the notice, not the money
            tracing::warn!(
                number = header.number,
                payee = %plan.payee,
                error = %e,
                "Payment receipt delivery failed"
            );
        }

        tracing::info!(
            number = header.number,
            payee = %plan.payee,
            amount = %plan.amount,
            remaining = plan.payments_left,
            closing,
            "Payment plan installment executed"
        );
        Ok(true)
    }

    async fn advance_contract(
        &self,
        pool: &mut BTreeSet<TransactionNumber>,
        pool_dirty: &mut bool,
        header: &ItemHeader,
        contract: &mut ContractTerms,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut fired = 0;
        let mut pending = Vec::with_capacity(contract.clauses.len());
        for clause in contract.clauses.drain(..) {
            if clause.trigger_at > now {
                pending.push(clause);
                continue;
            }
            let Some(&closing) = pool.iter().next() else {
                tracing::warn!(
                    number = header.number,
                    clause = %clause.name,
                    "Number pool empty; clause deferred"
                );
                pending.push(clause);
                continue;
            };
            pool.remove(&closing);
            *pool_dirty = true;

            for party in &contract.parties {
                let notice = Instrument {
                    kind: InstrumentKind::ContractNotice,
                    amount: Decimal::ZERO,
                    currency: notary_core::types::Currency::USD,
                    sender: header.owner.clone(),
                    recipient: party.clone(),
                    terms: format!(
                        "{}: {} (closing number {})",
                        clause.name, clause.notice, closing
                    ),
                };
                if let Err(e) = self
                    .delivery
                    .deliver(
                        &header.owner,
                        party,
                        Payload::Instrument(notice),
                        "contract-notice",
                    )
                    .await
                {
                    tracing::warn!(
                        number = header.number,
                        party = %party,
                        error = %e,
                        "Contract notice delivery failed"
                    );
                }
            }
            tracing::info!(
                number = header.number,
                clause = %clause.name,
                closing,
                "Contract clause fired"
            );
            fired += 1;
        }
        contract.clauses = pending;
        Ok(fired)
    }

    /// Settle one planned trade. `None` means the number pool is empty
    /// and the rest of the book should wait for the next tick.
    async fn execute_trade(
        &self,
        state: &mut EngineState,
        pool_dirty: &mut bool,
        trade: &PlannedTrade,
    ) -> Option<bool> {
        let Some(&closing) = state.pool.iter().next() else {
            tracing::warn!("Number pool empty; deferring remaining trades");
            return None;
        };

        let Some((buyer, buy_offer)) = offer_of(&state.items, trade.buy_number) else {
            return Some(false);
        };
        let Some((seller, sell_offer)) = offer_of(&state.items, trade.sell_number) else {
            return Some(false);
        };

        // Both legs are checked before either moves, so a short account
        // skips the trade instead of stranding half of it.
        match self.accounts.balance(&buy_offer.currency_account) {
            Ok(cash) if cash >= trade.payment => {}
            Ok(_) => {
                tracing::info!(
                    buy = trade.buy_number,
                    "Buyer cannot cover payment; trade skipped"
                );
                return Some(false);
            }
            Err(e) => {
                tracing::warn!(buy = trade.buy_number, error = %e, "Buyer account unreadable");
                return Some(false);
            }
        }
        match self.accounts.balance(&sell_offer.asset_account) {
            Ok(inventory) if inventory >= trade.quantity => {}
            Ok(_) => {
                tracing::info!(
                    sell = trade.sell_number,
                    "Seller cannot cover quantity; trade skipped"
                );
                return Some(false);
            }
            Err(e) => {
                tracing::warn!(sell = trade.sell_number, error = %e, "Seller account unreadable");
                return Some(false);
            }
        }

        if let Err(e) = self.accounts.transfer(
            &buy_offer.currency_account,
            &sell_offer.currency_account,
            trade.payment,
        ) {
            tracing::warn!(buy = trade.buy_number, error = %e, "Payment leg failed");
            return Some(false);
        }
        if let Err(e) = self.accounts.transfer(
            &sell_offer.asset_account,
            &buy_offer.asset_account,
            trade.quantity,
        ) {
            // Unwind the payment so no half-trade survives
            if let Err(undo) = self.accounts.transfer(
                &sell_offer.currency_account,
                &buy_offer.currency_account,
                trade.payment,
            ) {
                tracing::error!(
                    buy = trade.buy_number,
                    sell = trade.sell_number,
                    error = %undo,
                    "Failed to unwind payment leg"
                );
            }
            tracing::warn!(sell = trade.sell_number, error = %e, "Asset leg failed");
            return Some(false);
        }

        state.pool.remove(&closing);
        *pool_dirty = true;

        for number in [trade.buy_number, trade.sell_number] {
            if let Some(item) = state.items.get_mut(&number) {
                if let ItemTerms::MarketOffer(offer) = &mut item.terms {
                    offer.remaining -= trade.quantity;
                }
                match item.to_bytes() {
                    Ok(bytes) => {
                        if let Err(e) = self.storage.put_cron_item(number, &bytes) {
                            tracing::warn!(number, error = %e, "Failed to persist filled offer");
                        }
                    }
                    Err(e) => tracing::warn!(number, error = %e, "Failed to encode filled offer"),
                }
            }
        }

        for (counterparty, owner) in [(&seller, &buyer), (&buyer, &seller)] {
            let receipt = Instrument {
                kind: InstrumentKind::TradeReceipt,
                amount: trade.payment,
                currency: buy_offer.currency,
                sender: counterparty.clone(),
                recipient: owner.clone(),
                terms: format!(
                    "trade fill: {} {} at {} per lot, closing number {}",
                    trade.quantity, buy_offer.asset, trade.price, closing
                ),
            };
            if let Err(e) = self
                .delivery
                .deliver(
                    counterparty,
                    owner,
                    Payload::Instrument(receipt),
                    "trade-receipt",
                )
                .await
            {
                tracing::warn!(recipient = %owner, error = %e, "Trade receipt delivery failed");
            }
        }

        tracing::info!(
            buy = trade.buy_number,
            sell = trade.sell_number,
            quantity = %trade.quantity,
            price = %trade.price,
            closing,
            "Market offers crossed"
        );
        Some(true)
    }
}

fn offer_of(
    items: &BTreeMap<TransactionNumber, CronItem>,
    number: TransactionNumber,
) -> Option<(NymId, OfferTerms)> {
    let item = items.get(&number)?;
    match &item.terms {
        ItemTerms::MarketOffer(offer) => Some((item.header.owner.clone(), offer.clone())),
        _ => None,
    }
}

fn validate_terms(item: &CronItem) -> Result<()> {
    match &item.terms {
        ItemTerms::MarketOffer(offer) => {
            if offer.scale <= Decimal::ZERO
                || offer.price_per_scale <= Decimal::ZERO
                || offer.remaining < offer.scale
            {
                return Err(Error::InvalidItem(format!(
                    "Offer {} has non-positive terms or less than one lot",
                    item.header.number
                )));
            }
        }
        ItemTerms::PaymentPlan(plan) => {
            if plan.amount <= Decimal::ZERO || plan.interval_secs <= 0 || plan.payments_left == 0 {
                return Err(Error::InvalidItem(format!(
                    "Plan {} has non-positive amount, interval, or payment count",
                    item.header.number
                )));
            }
        }
        ItemTerms::SmartContract(contract) => {
            if contract.parties.is_empty() || contract.clauses.is_empty() {
                return Err(Error::InvalidItem(format!(
                    "Contract {} has no parties or no clauses",
                    item.header.number
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ContractClause, OfferSide};
    use notary_core::crypto::KeyPair;
    use notary_core::types::{AccountId, Currency, NotaryId};
    use notary_core::{Config, ServerCore};
    use parking_lot::Mutex as SyncMutex;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    struct ScriptedNumbers {
        grants: SyncMutex<VecDeque<TransactionNumber>>,
        spent: SyncMutex<BTreeSet<TransactionNumber>>,
    }

    impl ScriptedNumbers {
        fn new(grants: impl IntoIterator<Item = TransactionNumber>) -> Arc<Self> {
            Arc::new(Self {
                grants: SyncMutex::new(grants.into_iter().collect()),
                spent: SyncMutex::new(BTreeSet::new()),
            })
        }
    }

    impl NumberSource for ScriptedNumbers {
        fn issue_next(&self) -> notary_core::Result<TransactionNumber> {
            self.grants.lock().pop_front().ok_or_else(|| {
                notary_core::Error::Issuance("scripted source exhausted".to_string())
            })
        }

        fn verify_issued(&self, _number: TransactionNumber) -> bool {
            true
        }

        fn consume(&self, _consumer: &str, number: TransactionNumber) -> notary_core::Result<bool> {
            Ok(self.spent.lock().insert(number))
        }
    }

    fn open_core(dir: &TempDir) -> ServerCore {
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            notary_id: "notary.test".to_string(),
            ..Config::default()
        };
        ServerCore::open(config, KeyPair::from_seed(&[7u8; 32])).unwrap()
    }

    fn open_engine(core: &ServerCore, config: CronConfig) -> CronEngine {
        CronEngine::open(
            config,
            core.authority(),
            core.delivery(),
            core.accounts(),
            core.storage(),
            core.metrics().clone(),
        )
        .unwrap()
    }

    fn open_engine_with_source(
        core: &ServerCore,
        config: CronConfig,
        numbers: Arc<dyn NumberSource>,
    ) -> CronEngine {
        CronEngine::open(
            config,
            numbers,
            core.delivery(),
            core.accounts(),
            core.storage(),
            core.metrics().clone(),
        )
        .unwrap()
    }

    fn register_recipient(core: &ServerCore, nym: &NymId, seed: u8) {
        let keys = KeyPair::from_seed(&[seed; 32]);
        core.directory()
            .register_nym(nym, &keys.public_key())
            .unwrap();
    }

    fn header(core: &ServerCore, owner: &NymId, ttl_secs: i64) -> ItemHeader {
        let number = core.authority().issue_next().unwrap();
        core.authority().allocate(owner.as_str(), number).unwrap();
        ItemHeader {
            owner: owner.clone(),
            notary: NotaryId::new("notary.test"),
            number,
            expires_at: Utc::now() + ChronoDuration::seconds(ttl_secs),
        }
    }

    fn due_plan(
        payer_account: &AccountId,
        payee_account: &AccountId,
        payee: &NymId,
        amount: Decimal,
        payments_left: u32,
    ) -> PlanTerms {
        PlanTerms {
            payer_account: payer_account.clone(),
            payee_account: payee_account.clone(),
            payee: payee.clone(),
            amount,
            currency: Currency::USD,
            interval_secs: 3600,
            next_due: Utc::now() - ChronoDuration::seconds(1),
            payments_left,
        }
    }

    #[tokio::test]
    async fn test_refill_shortfall_keeps_granted_numbers() {
        let dir = TempDir::new().unwrap();
        let core = open_core(&dir);
        let source = ScriptedNumbers::new([100, 101, 102]);
        let engine = open_engine_with_source(
            &core,
            CronConfig {
                refill_threshold: 5,
                ..CronConfig::default()
            },
            source,
        );

        // The source grants three numbers, then refuses; the tick keeps
        // what it got and carries on
        let summary = engine.tick().await;
        assert_eq!(summary.refilled, 3);
        assert_eq!(engine.pool_size().await, 3);

        // The shortfall tick persisted what it did get
        assert_eq!(core.storage().load_cron_pool().unwrap().len(), 3);

        // Next tick gets nothing more and still succeeds
        let summary = engine.tick().await;
        assert_eq!(summary.refilled, 0);
        assert_eq!(engine.pool_size().await, 3);
    }

    #[tokio::test]
    async fn test_register_enforces_per_nym_cap() {
        let dir = TempDir::new().unwrap();
        let core = open_core(&dir);
        let engine = open_engine(
            &core,
            CronConfig {
                max_items_per_nym: 2,
                ..CronConfig::default()
            },
        );

        let alice = NymId::new("alice");
        let payee = NymId::new("bob");
        let payer = AccountId::new("alice-cash");
        let payee_acct = AccountId::new("bob-cash");

        for _ in 0..2 {
            let item = CronItem {
                header: header(&core, &alice, 3600),
                terms: ItemTerms::PaymentPlan(due_plan(
                    &payer,
                    &payee_acct,
                    &payee,
                    dec!(10),
                    1,
                )),
            };
            engine.register_item(item).await.unwrap();
        }

        let third = CronItem {
            header: header(&core, &alice, 3600),
            terms: ItemTerms::PaymentPlan(due_plan(&payer, &payee_acct, &payee, dec!(10), 1)),
        };
        let err = engine.register_item(third).await.unwrap_err();
        assert!(matches!(err, Error::ItemLimitExceeded { max: 2, .. }));
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates_and_unissued_numbers() {
        let dir = TempDir::new().unwrap();
        let core = open_core(&dir);
        let engine = open_engine(&core, CronConfig::default());

        let alice = NymId::new("alice");
        let payee = NymId::new("bob");
        let payer = AccountId::new("alice-cash");
        let payee_acct = AccountId::new("bob-cash");

        let item = CronItem {
            header: header(&core, &alice, 3600),
            terms: ItemTerms::PaymentPlan(due_plan(&payer, &payee_acct, &payee, dec!(10), 1)),
        };
        let duplicate = item.clone();
        engine.register_item(item).await.unwrap();
        let err = engine.register_item(duplicate).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateItem(_)));

        let mut unissued = CronItem {
            header: header(&core, &alice, 3600),
            terms: ItemTerms::PaymentPlan(due_plan(&payer, &payee_acct, &payee, dec!(10), 1)),
        };
        unissued.header.number = 999_999;
        let err = engine.register_item(unissued).await.unwrap_err();
        assert!(matches!(err, Error::InvalidItem(_)));
    }

    #[tokio::test]
    async fn test_retired_number_cannot_open_another_item() {
        let dir = TempDir::new().unwrap();
        let core = open_core(&dir);
        let engine = open_engine(&core, CronConfig::default());

        let alice = NymId::new("alice");
        let bob = NymId::new("bob");
        register_recipient(&core, &bob, 11);

        let payer = AccountId::new("alice-cash");
        let payee_acct = AccountId::new("bob-cash");
        core.accounts().open_account(&payer, dec!(100)).unwrap();
        core.accounts().open_account(&payee_acct, dec!(0)).unwrap();

        let item = CronItem {
            header: header(&core, &alice, 3600),
            terms: ItemTerms::PaymentPlan(due_plan(&payer, &payee_acct, &bob, dec!(40), 1)),
        };
        let number = item.header.number;
        let replay = item.clone();
        engine.register_item(item).await.unwrap();

        // Final installment pays out and the plan retires
        let summary = engine.tick().await;
        assert_eq!(summary.payments, 1);
        assert_eq!(summary.expired, 1);
        assert_eq!(engine.active_items().await, 0);

        // The opening number was spent at registration; presenting it
        // again after the item is gone must not open a second item
        let err = engine.register_item(replay).await.unwrap_err();
        assert!(matches!(err, Error::InvalidItem(_)));
        assert_eq!(engine.active_items().await, 0);
        assert_eq!(core.accounts().balance(&payer).unwrap(), dec!(60));
        assert!(!core.authority().pool(alice.as_str()).unwrap().contains(&number));
    }

    #[tokio::test]
    async fn test_killed_number_cannot_reopen_item() {
        let dir = TempDir::new().unwrap();
        let core = open_core(&dir);
        let engine = open_engine(&core, CronConfig::default());

        let alice = NymId::new("alice");
        let payer = AccountId::new("alice-cash");
        let payee_acct = AccountId::new("bob-cash");

        let item = CronItem {
            header: header(&core, &alice, 3600),
            terms: ItemTerms::PaymentPlan(due_plan(
                &payer,
                &payee_acct,
                &NymId::new("bob"),
                dec!(10),
                2,
            )),
        };
        let number = item.header.number;
        let replay = item.clone();
        engine.register_item(item).await.unwrap();

        assert!(engine.kill_item(&alice, number).await.unwrap());

        let err = engine.register_item(replay).await.unwrap_err();
        assert!(matches!(err, Error::InvalidItem(_)));
    }

    #[tokio::test]
    async fn test_payment_plan_executes_and_reschedules() {
        let dir = TempDir::new().unwrap();
        let core = open_core(&dir);
        let engine = open_engine(&core, CronConfig::default());

        let alice = NymId::new("alice");
        let bob = NymId::new("bob");
        register_recipient(&core, &bob, 11);

        let payer = AccountId::new("alice-cash");
        let payee_acct = AccountId::new("bob-cash");
        core.accounts().open_account(&payer, dec!(100)).unwrap();
        core.accounts().open_account(&payee_acct, dec!(0)).unwrap();

        let item = CronItem {
            header: header(&core, &alice, 3600),
            terms: ItemTerms::PaymentPlan(due_plan(&payer, &payee_acct, &bob, dec!(25), 2)),
        };
        let number = item.header.number;
        engine.register_item(item).await.unwrap();

        let summary = engine.tick().await;
        assert_eq!(summary.payments, 1);
        assert_eq!(core.accounts().balance(&payer).unwrap(), dec!(75));
        assert_eq!(core.accounts().balance(&payee_acct).unwrap(), dec!(25));

        // Bob got a payment receipt in his nymbox
        let nymbox = core
            .storage()
            .load_box(&bob, notary_core::BoxKind::Nymbox)
            .unwrap()
            .unwrap();
        assert_eq!(nymbox.len(), 1);

        // Rescheduled, not retired
        let item = engine.item(number).await.unwrap();
        match item.terms {
            ItemTerms::PaymentPlan(plan) => {
                assert_eq!(plan.payments_left, 1);
                assert!(plan.next_due > Utc::now());
            }
            _ => panic!("plan terms expected"),
        }

        // Not due again, so the next tick pays nothing
        let summary = engine.tick().await;
        assert_eq!(summary.payments, 0);
        assert_eq!(core.accounts().balance(&payer).unwrap(), dec!(75));
    }

    #[tokio::test]
    async fn test_plan_retires_after_final_payment() {
        let dir = TempDir::new().unwrap();
        let core = open_core(&dir);
        let engine = open_engine(&core, CronConfig::default());

        let alice = NymId::new("alice");
        let bob = NymId::new("bob");
        register_recipient(&core, &bob, 11);

        let payer = AccountId::new("alice-cash");
        let payee_acct = AccountId::new("bob-cash");
        core.accounts().open_account(&payer, dec!(100)).unwrap();
        core.accounts().open_account(&payee_acct, dec!(0)).unwrap();

        let item = CronItem {
            header: header(&core, &alice, 3600),
            terms: ItemTerms::PaymentPlan(due_plan(&payer, &payee_acct, &bob, dec!(40), 1)),
        };
        engine.register_item(item).await.unwrap();

        let summary = engine.tick().await;
        assert_eq!(summary.payments, 1);
        assert_eq!(summary.expired, 1);
        assert_eq!(engine.active_items().await, 0);
        assert!(core.storage().load_cron_items().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_item_is_swept_without_processing() {
        let dir = TempDir::new().unwrap();
        let core = open_core(&dir);
        let engine = open_engine(&core, CronConfig::default());

        let alice = NymId::new("alice");
        let bob = NymId::new("bob");
        register_recipient(&core, &bob, 11);

        let payer = AccountId::new("alice-cash");
        let payee_acct = AccountId::new("bob-cash");
        core.accounts().open_account(&payer, dec!(100)).unwrap();
        core.accounts().open_account(&payee_acct, dec!(0)).unwrap();

        let mut item = CronItem {
            header: header(&core, &alice, 3600),
            terms: ItemTerms::PaymentPlan(due_plan(&payer, &payee_acct, &bob, dec!(25), 5)),
        };
        item.header.expires_at = Utc::now() + ChronoDuration::milliseconds(50);
        engine.register_item(item).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        let summary = engine.tick().await;
        assert_eq!(summary.payments, 0);
        assert_eq!(summary.expired, 1);
        assert_eq!(engine.active_items().await, 0);
        // The due installment was never executed
        assert_eq!(core.accounts().balance(&payer).unwrap(), dec!(100));

        // And a later tick has nothing to reprocess
        let summary = engine.tick().await;
        assert_eq!(summary.payments, 0);
        assert_eq!(summary.expired, 0);
    }

    #[tokio::test]
    async fn test_market_offers_cross_and_settle() {
        let dir = TempDir::new().unwrap();
        let core = open_core(&dir);
        let engine = open_engine(&core, CronConfig::default());

        let alice = NymId::new("alice");
        let dave = NymId::new("dave");
        register_recipient(&core, &alice, 11);
        register_recipient(&core, &dave, 12);

        let alice_gold = AccountId::new("alice-gold");
        let alice_cash = AccountId::new("alice-cash");
        let dave_gold = AccountId::new("dave-gold");
        let dave_cash = AccountId::new("dave-cash");
        core.accounts().open_account(&alice_gold, dec!(30)).unwrap();
        core.accounts().open_account(&alice_cash, dec!(0)).unwrap();
        core.accounts().open_account(&dave_gold, dec!(0)).unwrap();
        core.accounts().open_account(&dave_cash, dec!(1000)).unwrap();

        // The ask rests first (lower number), so it sets the price
        let sell = CronItem {
            header: header(&core, &alice, 3600),
            terms: ItemTerms::MarketOffer(OfferTerms {
                side: OfferSide::Sell,
                asset: "GOLD".to_string(),
                currency: Currency::USD,
                scale: dec!(10),
                price_per_scale: dec!(50),
                remaining: dec!(30),
                asset_account: alice_gold.clone(),
                currency_account: alice_cash.clone(),
            }),
        };
        let buy = CronItem {
            header: header(&core, &dave, 3600),
            terms: ItemTerms::MarketOffer(OfferTerms {
                side: OfferSide::Buy,
                asset: "GOLD".to_string(),
                currency: Currency::USD,
                scale: dec!(10),
                price_per_scale: dec!(60),
                remaining: dec!(30),
                asset_account: dave_gold.clone(),
                currency_account: dave_cash.clone(),
            }),
        };
        engine.register_item(sell).await.unwrap();
        engine.register_item(buy).await.unwrap();

        let summary = engine.tick().await;
        assert_eq!(summary.trades, 1);

        // Three lots at the resting price of 50
        assert_eq!(core.accounts().balance(&dave_cash).unwrap(), dec!(850));
        assert_eq!(core.accounts().balance(&alice_cash).unwrap(), dec!(150));
        assert_eq!(core.accounts().balance(&alice_gold).unwrap(), dec!(0));
        assert_eq!(core.accounts().balance(&dave_gold).unwrap(), dec!(30));

        // Both offers filled completely and were swept
        assert_eq!(summary.expired, 2);
        assert_eq!(engine.active_items().await, 0);

        // Both parties received a trade receipt
        for nym in [&alice, &dave] {
            let nymbox = core
                .storage()
                .load_box(nym, notary_core::BoxKind::Nymbox)
                .unwrap()
                .unwrap();
            assert_eq!(nymbox.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_failed_item_does_not_abort_siblings() {
        let dir = TempDir::new().unwrap();
        let core = open_core(&dir);
        let engine = open_engine(&core, CronConfig::default());

        let alice = NymId::new("alice");
        let carol = NymId::new("carol");
        let bob = NymId::new("bob");
        register_recipient(&core, &bob, 11);

        let missing = AccountId::new("alice-nonexistent");
        let carol_cash = AccountId::new("carol-cash");
        let bob_cash = AccountId::new("bob-cash");
        core.accounts().open_account(&carol_cash, dec!(100)).unwrap();
        core.accounts().open_account(&bob_cash, dec!(0)).unwrap();

        // Lower number fails on a missing payer account
        let broken = CronItem {
            header: header(&core, &alice, 3600),
            terms: ItemTerms::PaymentPlan(due_plan(&missing, &bob_cash, &bob, dec!(10), 1)),
        };
        let healthy = CronItem {
            header: header(&core, &carol, 3600),
            terms: ItemTerms::PaymentPlan(due_plan(&carol_cash, &bob_cash, &bob, dec!(30), 1)),
        };
        let broken_number = broken.header.number;
        engine.register_item(broken).await.unwrap();
        engine.register_item(healthy).await.unwrap();

        let summary = engine.tick().await;
        assert_eq!(summary.payments, 1);
        assert_eq!(core.accounts().balance(&bob_cash).unwrap(), dec!(30));

        // The broken plan stays active for retry
        assert!(engine.item(broken_number).await.is_some());
    }

    #[tokio::test]
    async fn test_starved_pool_defers_work_without_error() {
        let dir = TempDir::new().unwrap();
        let core = open_core(&dir);
        let source = ScriptedNumbers::new([]);
        let engine = open_engine_with_source(&core, CronConfig::default(), source);

        let alice = NymId::new("alice");
        let bob = NymId::new("bob");
        register_recipient(&core, &bob, 11);

        let payer = AccountId::new("alice-cash");
        let payee_acct = AccountId::new("bob-cash");
        core.accounts().open_account(&payer, dec!(100)).unwrap();
        core.accounts().open_account(&payee_acct, dec!(0)).unwrap();

        let item = CronItem {
            header: ItemHeader {
                owner: alice.clone(),
                notary: NotaryId::new("notary.test"),
                number: 500,
                expires_at: Utc::now() + ChronoDuration::seconds(3600),
            },
            terms: ItemTerms::PaymentPlan(due_plan(&payer, &payee_acct, &bob, dec!(25), 1)),
        };
        engine.register_item(item).await.unwrap();

        let summary = engine.tick().await;
        assert_eq!(summary.refilled, 0);
        assert_eq!(summary.payments, 0);
        assert_eq!(core.accounts().balance(&payer).unwrap(), dec!(100));
        assert_eq!(engine.active_items().await, 1);
    }

    #[tokio::test]
    async fn test_contract_clause_notifies_all_parties() {
        let dir = TempDir::new().unwrap();
        let core = open_core(&dir);
        let engine = open_engine(&core, CronConfig::default());

        let alice = NymId::new("alice");
        let bob = NymId::new("bob");
        let carol = NymId::new("carol");
        register_recipient(&core, &bob, 11);
        register_recipient(&core, &carol, 12);

        let item = CronItem {
            header: header(&core, &alice, 3600),
            terms: ItemTerms::SmartContract(ContractTerms {
                parties: vec![bob.clone(), carol.clone()],
                clauses: vec![
                    ContractClause {
                        name: "margin-call".to_string(),
                        trigger_at: Utc::now() - ChronoDuration::seconds(1),
                        notice: "collateral below maintenance".to_string(),
                    },
                    ContractClause {
                        name: "maturity".to_string(),
                        trigger_at: Utc::now() + ChronoDuration::seconds(3600),
                        notice: "contract matured".to_string(),
                    },
                ],
            }),
        };
        let number = item.header.number;
        engine.register_item(item).await.unwrap();

        let summary = engine.tick().await;
        assert_eq!(summary.clauses, 1);

        for nym in [&bob, &carol] {
            let nymbox = core
                .storage()
                .load_box(nym, notary_core::BoxKind::Nymbox)
                .unwrap()
                .unwrap();
            assert_eq!(nymbox.len(), 1);
        }

        // One clause remains, so the item stays active
        let item = engine.item(number).await.unwrap();
        match item.terms {
            ItemTerms::SmartContract(contract) => assert_eq!(contract.clauses.len(), 1),
            _ => panic!("contract terms expected"),
        }
        let summary = engine.tick().await;
        assert_eq!(summary.clauses, 0);
    }

    #[tokio::test]
    async fn test_kill_item_respects_ownership() {
        let dir = TempDir::new().unwrap();
        let core = open_core(&dir);
        let engine = open_engine(&core, CronConfig::default());

        let alice = NymId::new("alice");
        let mallory = NymId::new("mallory");
        let payer = AccountId::new("alice-cash");
        let payee_acct = AccountId::new("bob-cash");

        let item = CronItem {
            header: header(&core, &alice, 3600),
            terms: ItemTerms::PaymentPlan(due_plan(
                &payer,
                &payee_acct,
                &NymId::new("bob"),
                dec!(10),
                1,
            )),
        };
        let number = item.header.number;
        engine.register_item(item).await.unwrap();

        assert!(!engine.kill_item(&mallory, number).await.unwrap());
        assert_eq!(engine.active_items().await, 1);

        assert!(engine.kill_item(&alice, number).await.unwrap());
        assert_eq!(engine.active_items().await, 0);
        assert!(core.storage().load_cron_items().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_exits_cleanly_on_shutdown_signal() {
        let dir = TempDir::new().unwrap();
        let core = open_core(&dir);
        let engine = Arc::new(open_engine(
            &core,
            CronConfig {
                tick_interval_ms: 10,
                refill_threshold: 1,
                ..CronConfig::default()
            },
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(engine.clone().run(shutdown_rx));

        // Give the loop time to complete at least one full tick
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.pool_size().await >= 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("run loop did not stop after the shutdown signal")
            .unwrap();
    }

    #[tokio::test]
    async fn test_engine_resumes_items_and_pool_from_storage() {
        let dir = TempDir::new().unwrap();
        let core = open_core(&dir);

        let payer = AccountId::new("alice-cash");
        let payee_acct = AccountId::new("bob-cash");
        core.accounts().open_account(&payer, dec!(100)).unwrap();
        core.accounts().open_account(&payee_acct, dec!(0)).unwrap();
        let bob = NymId::new("bob");
        register_recipient(&core, &bob, 11);

        {
            let engine = open_engine(
                &core,
                CronConfig {
                    refill_threshold: 4,
                    ..CronConfig::default()
                },
            );
            let alice = NymId::new("alice");
            let item = CronItem {
                header: header(&core, &alice, 3600),
                terms: ItemTerms::PaymentPlan(due_plan(&payer, &payee_acct, &bob, dec!(10), 3)),
            };
            engine.register_item(item).await.unwrap();
            engine.tick().await;
        }

        let engine = open_engine(
            &core,
            CronConfig {
                refill_threshold: 4,
                ..CronConfig::default()
            },
        );
        assert_eq!(engine.active_items().await, 1);
        // The refilled pool survived, less the number the installment consumed
        assert_eq!(engine.pool_size().await, 3);
    }
}
