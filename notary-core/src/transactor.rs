//! Transaction number issuance and accounting authority
//!
//! The sole issuer of transaction numbers and custodian of per-consumer
//! pools. Numbers are server-wide monotonically increasing, unique, and
//! never reused once issued. Every successful issuance is durably recorded
//! before the number is handed out; issuance is never rolled back even if
//! the requesting operation subsequently fails. Wasting a number is safe,
//! reusing one is not.

use crate::{
    types::TransactionNumber,
    Error, Result, Storage,
};
use parking_lot::Mutex;
use prometheus::IntCounter;
use std::collections::BTreeSet;
use std::sync::Arc;

/// The number authority
///
/// Interior mutex serializes the read-increment-persist sequence so that
/// concurrent `issue_next` calls can never observe or hand out the same
/// number twice.
pub struct NumberAuthority {
    storage: Arc<Storage>,

    /// Counts every grant at the source, so burned numbers and cron
    /// refills show up alongside delivery issuance
    issued_counter: Option<IntCounter>,

    inner: Mutex<Inner>,
}

struct Inner {
    /// Last number durably issued; the next grant is `last_issued + 1`
    last_issued: TransactionNumber,
}

impl NumberAuthority {
    /// Open the authority, resuming from the persisted watermark.
    ///
    /// `first_number` seeds the counter on a fresh database; the first
    /// issued number will be exactly `first_number`. When `issued_counter`
    /// is present it is incremented once per successful grant, whoever the
    /// caller is.
    pub fn open(
        storage: Arc<Storage>,
        first_number: TransactionNumber,
        issued_counter: Option<IntCounter>,
    ) -> Result<Self> {
        let last_issued = storage.load_counter()?.unwrap_or(first_number - 1);

        tracing::info!(last_issued, "Number authority opened");

        Ok(Self {
            storage,
            issued_counter,
            inner: Mutex::new(Inner { last_issued }),
        })
    }

    /// Issue the next unused transaction number.
    ///
    /// The watermark is durably advanced before the number is returned; on
    /// a persistence failure the caller must not proceed as if a number was
    /// granted.
    pub fn issue_next(&self) -> Result<TransactionNumber> {
        let mut inner = self.inner.lock();
        let candidate = inner.last_issued + 1;

        self.storage
            .store_counter(candidate)
            .map_err(|e| Error::Issuance(format!("Counter persistence failed: {}", e)))?;

        inner.last_issued = candidate;
        if let Some(counter) = &self.issued_counter {
            counter.inc();
        }
        Ok(candidate)
    }

    /// Last number issued; the durable watermark issuance resumes from
    pub fn last_issued(&self) -> TransactionNumber {
        self.inner.lock().last_issued
    }

    /// True if `number` is at or below the issued watermark
    pub fn verify_issued(&self, number: TransactionNumber) -> bool {
        number > 0 && number <= self.inner.lock().last_issued
    }

    /// Move an issued number into a consumer's available pool.
    ///
    /// Fails if the number was never issued. Callers allocate each number
    /// to exactly one consumer, so a number lives in at most one pool.
    pub fn allocate(&self, consumer: &str, number: TransactionNumber) -> Result<()> {
        let inner = self.inner.lock();

        if number <= 0 || number > inner.last_issued {
            return Err(Error::Issuance(format!(
                "Number {} was never issued",
                number
            )));
        }

        let mut pool = self.storage.load_pool(consumer)?;
        pool.insert(number);
        self.storage.save_pool(consumer, &pool)?;

        tracing::debug!(consumer, number, "Number allocated");
        Ok(())
    }

    /// Spend a number out of a consumer's pool.
    ///
    /// Returns false when the number is not currently held by the consumer:
    /// the anti-replay check used by every downstream operation that spends
    /// a number. A number is consumable at most once.
    pub fn consume(&self, consumer: &str, number: TransactionNumber) -> Result<bool> {
        let _inner = self.inner.lock();

        let mut pool = self.storage.load_pool(consumer)?;
        if !pool.remove(&number) {
            tracing::warn!(consumer, number, "Consume rejected: number not held");
            return Ok(false);
        }

        self.storage.save_pool(consumer, &pool)?;

        tracing::debug!(consumer, number, "Number consumed");
        Ok(true)
    }

    /// Snapshot of a consumer's available pool
    pub fn pool(&self, consumer: &str) -> Result<BTreeSet<TransactionNumber>> {
        let _inner = self.inner.lock();
        self.storage.load_pool(consumer)
    }
}
