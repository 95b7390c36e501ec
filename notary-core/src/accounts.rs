//! Custodial account ledger seam
//!
//! Cron item processing moves funds between custodial accounts through
//! this interface; debits reject overdrafts and transfers commit both
//! sides atomically.

use crate::{Error, Result, Storage};
use crate::types::AccountId;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Durable load/save of custodial account balances
pub trait AccountLedger: Send + Sync {
    /// Current balance
    fn balance(&self, account: &AccountId) -> Result<Decimal>;

    /// Add funds to an account
    fn credit(&self, account: &AccountId, amount: Decimal) -> Result<()>;

    /// Remove funds from an account; rejects overdrafts
    fn debit(&self, account: &AccountId, amount: Decimal) -> Result<()>;

    /// Move funds between two accounts atomically
    fn transfer(&self, from: &AccountId, to: &AccountId, amount: Decimal) -> Result<()>;
}

/// Storage-backed account ledger
pub struct StorageAccounts {
    storage: Arc<Storage>,

    /// Single-writer discipline over read-modify-write balance updates
    write_lock: Mutex<()>,
}

impl StorageAccounts {
    /// Create over opened storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    /// Open an account with an initial balance
    pub fn open_account(&self, account: &AccountId, initial: Decimal) -> Result<()> {
        let _guard = self.write_lock.lock();

        if initial < Decimal::ZERO {
            return Err(Error::Other("Initial balance must be non-negative".to_string()));
        }

        self.storage.put_balance(account, initial)?;
        tracing::info!(account = %account, %initial, "Account opened");
        Ok(())
    }

    fn load_required(&self, account: &AccountId) -> Result<Decimal> {
        self.storage
            .get_balance(account)?
            .ok_or_else(|| Error::AccountNotFound(account.to_string()))
    }
}

impl AccountLedger for StorageAccounts {
    fn balance(&self, account: &AccountId) -> Result<Decimal> {
        self.load_required(account)
    }

    fn credit(&self, account: &AccountId, amount: Decimal) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(Error::Other("Credit amount must be positive".to_string()));
        }

        let _guard = self.write_lock.lock();
        let balance = self.load_required(account)?;
        self.storage.put_balance(account, balance + amount)?;
        Ok(())
    }

    fn debit(&self, account: &AccountId, amount: Decimal) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(Error::Other("Debit amount must be positive".to_string()));
        }

        let _guard = self.write_lock.lock();
        let balance = self.load_required(account)?;
        if balance < amount {
            return Err(Error::InsufficientFunds(account.to_string()));
        }

        self.storage.put_balance(account, balance - amount)?;
        Ok(())
    }

    fn transfer(&self, from: &AccountId, to: &AccountId, amount: Decimal) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(Error::Other("Transfer amount must be positive".to_string()));
        }

        let _guard = self.write_lock.lock();

        let from_balance = self.load_required(from)?;
        let to_balance = self.load_required(to)?;

        if from_balance < amount {
            return Err(Error::InsufficientFunds(from.to_string()));
        }

        self.storage.put_balances_atomic(
            (from, from_balance - amount),
            (to, to_balance + amount),
        )?;

        tracing::debug!(from = %from, to = %to, %amount, "Funds transferred");
        Ok(())
    }
}
