//! Server core orchestration
//!
//! Owns one number authority, one delivery service, and one gatekeeper,
//! and exposes the gated operation entry points the request-handling layer
//! drives. The cron engine lives in its own crate and borrows the same
//! authority and delivery handles.

use crate::{
    accounts::StorageAccounts,
    crypto::{KeyPair, KeystreamEnvelope},
    delivery::{NotaryDeliveryService, Payload},
    gatekeeper::{Gatekeeper, Ticket},
    identity::StorageDirectory,
    metrics::Metrics,
    transactor::NumberAuthority,
    types::{NotaryId, NymId, ReceiptHandle},
    Config, Error, Result, Storage,
};
use std::future::Future;
use std::sync::Arc;

/// First transaction number granted on a fresh database
const FIRST_TRANSACTION_NUMBER: i64 = 1;

/// The notary server core
pub struct ServerCore {
    notary_id: NotaryId,
    storage: Arc<Storage>,
    authority: Arc<NumberAuthority>,
    delivery: Arc<NotaryDeliveryService>,
    gatekeeper: Arc<Gatekeeper>,
    accounts: Arc<StorageAccounts>,
    directory: Arc<StorageDirectory>,
    metrics: Metrics,
}

impl ServerCore {
    /// Open the server core with configuration and the server signing keys
    pub fn open(config: Config, keys: KeyPair) -> Result<Self> {
        let notary_id = NotaryId::new(config.notary_id.clone());
        let storage = Arc::new(Storage::open(&config)?);

        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Metrics registration failed: {}", e)))?;

        let authority = Arc::new(NumberAuthority::open(
            storage.clone(),
            FIRST_TRANSACTION_NUMBER,
            Some(metrics.numbers_issued.clone()),
        )?);
        let directory = Arc::new(StorageDirectory::new(storage.clone()));
        let accounts = Arc::new(StorageAccounts::new(storage.clone()));

        let keys = Arc::new(keys);
        let delivery = Arc::new(NotaryDeliveryService::new(
            notary_id.clone(),
            NymId::new(format!("server@{}", notary_id)),
            keys,
            authority.clone(),
            storage.clone(),
            directory.clone(),
            Arc::new(KeystreamEnvelope),
        ));

        tracing::info!(notary_id = %notary_id, "Server core opened");

        Ok(Self {
            notary_id,
            storage,
            authority,
            delivery,
            gatekeeper: Arc::new(Gatekeeper::new()),
            accounts,
            directory,
            metrics,
        })
    }

    /// Execute an operation under a gatekeeper ticket.
    ///
    /// Returns `Error::ShuttingDown` without running the operation if
    /// shutdown has already begun; otherwise the operation always runs to
    /// completion, even if shutdown begins meanwhile.
    pub async fn execute_gated<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ticket: Ticket = self.gatekeeper.acquire();
        if !ticket.is_valid() {
            return Err(Error::ShuttingDown);
        }

        operation().await
        // Ticket releases here, valid or not
    }

    /// Deliver an instrument or message, reporting the boolean outcome the
    /// request layer consumes. Failures are logged and counted.
    pub async fn deliver_instrument(
        &self,
        sender: &NymId,
        recipient: &NymId,
        payload: Payload,
        command: &str,
    ) -> bool {
        self.try_deliver(sender, recipient, payload, command)
            .await
            .is_ok()
    }

    /// Typed delivery entry point
    pub async fn try_deliver(
        &self,
        sender: &NymId,
        recipient: &NymId,
        payload: Payload,
        command: &str,
    ) -> Result<ReceiptHandle> {
        let timer = self.metrics.delivery_duration.start_timer();

        let result = self
            .execute_gated(|| self.delivery.deliver(sender, recipient, payload, command))
            .await;
        timer.observe_duration();

        match &result {
            Ok(handle) => {
                self.metrics.deliveries.inc();
                tracing::debug!(number = handle.number, recipient = %recipient, "Delivery recorded");
            }
            Err(e) => {
                self.metrics.delivery_failures.inc();
                tracing::warn!(recipient = %recipient, error = %e, "Delivery failed");
            }
        }

        result
    }

    /// Drain in-flight operations, refuse new ones, and flush storage
    pub async fn shutdown(&self) {
        tracing::info!(notary_id = %self.notary_id, "Server core shutting down");
        self.gatekeeper.shutdown().await;
        if let Err(e) = self.storage.flush() {
            tracing::warn!(error = %e, "Storage flush on shutdown failed");
        }
        tracing::info!("All in-flight operations drained");
    }

    /// Notary identifier this core signs as
    pub fn notary_id(&self) -> &NotaryId {
        &self.notary_id
    }

    /// Number authority handle
    pub fn authority(&self) -> Arc<NumberAuthority> {
        self.authority.clone()
    }

    /// Delivery service handle
    pub fn delivery(&self) -> Arc<NotaryDeliveryService> {
        self.delivery.clone()
    }

    /// Gatekeeper handle
    pub fn gatekeeper(&self) -> Arc<Gatekeeper> {
        self.gatekeeper.clone()
    }

    /// Custodial account ledger handle
    pub fn accounts(&self) -> Arc<StorageAccounts> {
        self.accounts.clone()
    }

    /// Identity directory handle
    pub fn directory(&self) -> Arc<StorageDirectory> {
        self.directory.clone()
    }

    /// Storage handle
    pub fn storage(&self) -> Arc<Storage> {
        self.storage.clone()
    }

    /// Metrics handle
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}
