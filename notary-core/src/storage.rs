//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `counter` - The durable transaction number watermark
//! - `pools` - Per-consumer available number pools (key: consumer id)
//! - `boxes` - Abbreviated box ledgers (key: owner || kind)
//! - `receipts` - Full box receipt bodies (key: owner || number)
//! - `identities` - Registered nym public keys (key: nym id)
//! - `balances` - Custodial account balances (key: account id)
//! - `cron` - Cron engine pool and serialized cron items

use crate::{
    error::{Error, Result},
    types::{AccountId, BoxKind, BoxLedger, BoxTransaction, NymId, TransactionNumber},
    Config,
};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, WriteOptions, DB};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Column family names
const CF_COUNTER: &str = "counter";
const CF_POOLS: &str = "pools";
const CF_BOXES: &str = "boxes";
const CF_RECEIPTS: &str = "receipts";
const CF_IDENTITIES: &str = "identities";
const CF_BALANCES: &str = "balances";
const CF_CRON: &str = "cron";

const COUNTER_KEY: &[u8] = b"transaction_number";
const CRON_POOL_KEY: &[u8] = b"pool";
const CRON_ITEM_PREFIX: &[u8] = b"item|";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,

    /// Sync counter writes to disk before acknowledging issuance
    sync_counter_writes: bool,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_COUNTER, Options::default()),
            ColumnFamilyDescriptor::new(CF_POOLS, Options::default()),
            ColumnFamilyDescriptor::new(CF_BOXES, Self::cf_options_compressed()),
            ColumnFamilyDescriptor::new(CF_RECEIPTS, Self::cf_options_compressed()),
            ColumnFamilyDescriptor::new(CF_IDENTITIES, Options::default()),
            ColumnFamilyDescriptor::new(CF_BALANCES, Options::default()),
            ColumnFamilyDescriptor::new(CF_CRON, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!("Opened RocksDB at {:?}", path);

        Ok(Self {
            db: Arc::new(db),
            sync_counter_writes: config.rocksdb.sync_counter_writes,
        })
    }

    fn cf_options_compressed() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // Transaction number counter

    /// Load the last issued transaction number, if any was ever issued
    pub fn load_counter(&self) -> Result<Option<TransactionNumber>> {
        let cf = self.cf_handle(CF_COUNTER)?;

        match self.db.get_cf(cf, COUNTER_KEY)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage("Corrupt counter value".to_string()))?;
                Ok(Some(TransactionNumber::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    /// Durably advance the transaction number watermark.
    ///
    /// Callers must not hand out the number unless this returns Ok.
    pub fn store_counter(&self, number: TransactionNumber) -> Result<()> {
        let cf = self.cf_handle(CF_COUNTER)?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_counter_writes);

        self.db
            .put_cf_opt(cf, COUNTER_KEY, number.to_be_bytes(), &write_opts)?;
        Ok(())
    }

    // Per-consumer number pools

    /// Load a consumer's available number pool
    pub fn load_pool(&self, consumer: &str) -> Result<BTreeSet<TransactionNumber>> {
        let cf = self.cf_handle(CF_POOLS)?;

        match self.db.get_cf(cf, consumer.as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(BTreeSet::new()),
        }
    }

    /// Persist a consumer's available number pool
    pub fn save_pool(&self, consumer: &str, pool: &BTreeSet<TransactionNumber>) -> Result<()> {
        let cf = self.cf_handle(CF_POOLS)?;
        let value = bincode::serialize(pool)?;
        self.db.put_cf(cf, consumer.as_bytes(), value)?;
        Ok(())
    }

    // Boxes and receipts

    fn box_key(owner: &NymId, kind: BoxKind) -> Vec<u8> {
        let mut key = owner.as_str().as_bytes().to_vec();
        key.push(b'|');
        key.push(kind as u8);
        key
    }

    fn receipt_key(owner: &NymId, number: TransactionNumber) -> Vec<u8> {
        let mut key = owner.as_str().as_bytes().to_vec();
        key.push(b'|');
        key.extend_from_slice(&number.to_be_bytes());
        key
    }

    /// Load a box ledger, if present
    pub fn load_box(&self, owner: &NymId, kind: BoxKind) -> Result<Option<BoxLedger>> {
        let cf = self.cf_handle(CF_BOXES)?;

        match self.db.get_cf(cf, Self::box_key(owner, kind))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Save a box ledger
    pub fn save_box(&self, ledger: &BoxLedger) -> Result<()> {
        let cf = self.cf_handle(CF_BOXES)?;
        let value = bincode::serialize(ledger)?;
        self.db
            .put_cf(cf, Self::box_key(&ledger.owner, ledger.kind), value)?;
        Ok(())
    }

    /// Save a box ledger together with the full receipt body, atomically.
    ///
    /// The box keeps only the abbreviated entry; the receipt carries the
    /// full transaction and must commit in the same write.
    pub fn save_box_with_receipt(
        &self,
        ledger: &BoxLedger,
        receipt: &BoxTransaction,
    ) -> Result<()> {
        let cf_boxes = self.cf_handle(CF_BOXES)?;
        let cf_receipts = self.cf_handle(CF_RECEIPTS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            cf_boxes,
            Self::box_key(&ledger.owner, ledger.kind),
            bincode::serialize(ledger)?,
        );
        batch.put_cf(
            cf_receipts,
            Self::receipt_key(&ledger.owner, receipt.number),
            bincode::serialize(receipt)?,
        );

        self.db.write(batch)?;

        tracing::debug!(
            owner = %ledger.owner,
            number = receipt.number,
            entries = ledger.len(),
            "Box and receipt committed"
        );

        Ok(())
    }

    /// Load the full receipt body for an abbreviated box entry
    pub fn load_receipt(
        &self,
        owner: &NymId,
        number: TransactionNumber,
    ) -> Result<BoxTransaction> {
        let cf = self.cf_handle(CF_RECEIPTS)?;

        let bytes = self
            .db
            .get_cf(cf, Self::receipt_key(owner, number))?
            .ok_or(Error::ReceiptNotFound(number))?;

        Ok(bincode::deserialize(&bytes)?)
    }

    // Identity directory

    /// Register a nym's public key
    pub fn put_identity(&self, nym: &NymId, public_key: &[u8; 32]) -> Result<()> {
        let cf = self.cf_handle(CF_IDENTITIES)?;
        self.db.put_cf(cf, nym.as_str().as_bytes(), public_key)?;
        Ok(())
    }

    /// Look up a nym's public key
    pub fn get_identity(&self, nym: &NymId) -> Result<Option<[u8; 32]>> {
        let cf = self.cf_handle(CF_IDENTITIES)?;

        match self.db.get_cf(cf, nym.as_str().as_bytes())? {
            Some(bytes) => {
                let key: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage("Corrupt identity record".to_string()))?;
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    // Account balances

    /// Read an account's balance
    pub fn get_balance(&self, account: &AccountId) -> Result<Option<Decimal>> {
        let cf = self.cf_handle(CF_BALANCES)?;

        match self.db.get_cf(cf, account.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write an account's balance
    pub fn put_balance(&self, account: &AccountId, balance: Decimal) -> Result<()> {
        let cf = self.cf_handle(CF_BALANCES)?;
        self.db
            .put_cf(cf, account.as_str().as_bytes(), bincode::serialize(&balance)?)?;
        Ok(())
    }

    /// Write two balances atomically (one funds transfer)
    pub fn put_balances_atomic(
        &self,
        debit: (&AccountId, Decimal),
        credit: (&AccountId, Decimal),
    ) -> Result<()> {
        let cf = self.cf_handle(CF_BALANCES)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf, debit.0.as_str().as_bytes(), bincode::serialize(&debit.1)?);
        batch.put_cf(
            cf,
            credit.0.as_str().as_bytes(),
            bincode::serialize(&credit.1)?,
        );

        self.db.write(batch)?;
        Ok(())
    }

    // Cron engine state

    /// Load the cron engine's private number pool
    pub fn load_cron_pool(&self) -> Result<BTreeSet<TransactionNumber>> {
        let cf = self.cf_handle(CF_CRON)?;

        match self.db.get_cf(cf, CRON_POOL_KEY)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(BTreeSet::new()),
        }
    }

    /// Persist the cron engine's private number pool
    pub fn save_cron_pool(&self, pool: &BTreeSet<TransactionNumber>) -> Result<()> {
        let cf = self.cf_handle(CF_CRON)?;
        self.db.put_cf(cf, CRON_POOL_KEY, bincode::serialize(pool)?)?;
        Ok(())
    }

    fn cron_item_key(number: TransactionNumber) -> Vec<u8> {
        let mut key = CRON_ITEM_PREFIX.to_vec();
        key.extend_from_slice(&number.to_be_bytes());
        key
    }

    /// Persist a serialized cron item under its transaction number
    pub fn put_cron_item(&self, number: TransactionNumber, bytes: &[u8]) -> Result<()> {
        let cf = self.cf_handle(CF_CRON)?;
        self.db.put_cf(cf, Self::cron_item_key(number), bytes)?;
        Ok(())
    }

    /// Remove a cron item
    pub fn delete_cron_item(&self, number: TransactionNumber) -> Result<()> {
        let cf = self.cf_handle(CF_CRON)?;
        self.db.delete_cf(cf, Self::cron_item_key(number))?;
        Ok(())
    }

    /// Load all persisted cron items, ascending by transaction number
    pub fn load_cron_items(&self) -> Result<Vec<(TransactionNumber, Vec<u8>)>> {
        let cf = self.cf_handle(CF_CRON)?;

        let iter = self.db.prefix_iterator_cf(cf, CRON_ITEM_PREFIX);

        let mut items = Vec::new();
        for entry in iter {
            let (key, value) = entry?;
            if !key.starts_with(CRON_ITEM_PREFIX) {
                continue;
            }

            let number_bytes: [u8; 8] = key[CRON_ITEM_PREFIX.len()..]
                .try_into()
                .map_err(|_| Error::Storage("Corrupt cron item key".to_string()))?;
            items.push((TransactionNumber::from_be_bytes(number_bytes), value.to_vec()));
        }

        items.sort_by_key(|(number, _)| *number);
        Ok(items)
    }
}
