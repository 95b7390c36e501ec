//! Guaranteed-delivery messaging into nymboxes
//!
//! Constructs a signed notice - either relaying an existing message
//! verbatim or synthesizing a server-authored message wrapping a sealed
//! payment instrument - and appends it as a new transaction into the
//! recipient's nymbox with a durable box receipt.
//!
//! Delivery is all-or-nothing per box: on any failure the operation aborts
//! cleanly with no box mutation. The transaction number issued in step one
//! is never refunded; numbers are burned, not recycled.

use crate::{
    crypto::{EnvelopeService, KeyPair},
    identity::IdentityDirectory,
    transactor::NumberAuthority,
    types::{
        BoxKind, BoxLedger, BoxTransaction, Instrument, NoticeKind, NoticeMessage, NotaryId,
        NymId, ReceiptHandle, Signature, TransactionNumber,
    },
    Error, Result, Storage,
};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Durable load/save of boxes and box receipts
pub trait BoxStore: Send + Sync {
    /// Load a box ledger, if present
    fn load_box(&self, owner: &NymId, kind: BoxKind) -> Result<Option<BoxLedger>>;

    /// Commit a box together with the full receipt body, atomically
    fn save_box_with_receipt(&self, ledger: &BoxLedger, receipt: &BoxTransaction) -> Result<()>;

    /// Load the full receipt body for an abbreviated entry
    fn load_receipt(&self, owner: &NymId, number: TransactionNumber) -> Result<BoxTransaction>;
}

impl BoxStore for Storage {
    fn load_box(&self, owner: &NymId, kind: BoxKind) -> Result<Option<BoxLedger>> {
        Storage::load_box(self, owner, kind)
    }

    fn save_box_with_receipt(&self, ledger: &BoxLedger, receipt: &BoxTransaction) -> Result<()> {
        Storage::save_box_with_receipt(self, ledger, receipt)
    }

    fn load_receipt(&self, owner: &NymId, number: TransactionNumber) -> Result<BoxTransaction> {
        Storage::load_receipt(self, owner, number)
    }
}

/// What gets dropped into the recipient's nymbox.
///
/// Exactly one of an existing message or a payment instrument; the sum
/// type makes the legacy both/neither contract violation unrepresentable.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Relay an existing signed message verbatim
    Message(NoticeMessage),

    /// Seal an instrument into a server-authored notice
    Instrument(Instrument),
}

/// Drops signed notices into recipient nymboxes with durable receipts
pub struct NotaryDeliveryService {
    notary_id: NotaryId,

    /// The nym the server itself signs synthesized notices as
    server_nym: NymId,

    server_keys: Arc<KeyPair>,
    authority: Arc<NumberAuthority>,
    boxes: Arc<dyn BoxStore>,
    identities: Arc<dyn IdentityDirectory>,
    envelope: Arc<dyn EnvelopeService>,

    /// Per-recipient serialization of nymbox appends
    recipient_locks: DashMap<NymId, Arc<Mutex<()>>>,
}

impl NotaryDeliveryService {
    /// Create a delivery service for one notary
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        notary_id: NotaryId,
        server_nym: NymId,
        server_keys: Arc<KeyPair>,
        authority: Arc<NumberAuthority>,
        boxes: Arc<dyn BoxStore>,
        identities: Arc<dyn IdentityDirectory>,
        envelope: Arc<dyn EnvelopeService>,
    ) -> Self {
        Self {
            notary_id,
            server_nym,
            server_keys,
            authority,
            boxes,
            identities,
            envelope,
            recipient_locks: DashMap::new(),
        }
    }

    /// Deliver a message or instrument into the recipient's nymbox.
    ///
    /// On success the nymbox strictly grows by one entry and a
    /// corresponding receipt is retrievable by the returned handle. On
    /// failure nothing is mutated, but the transaction number issued up
    /// front stays burned.
    pub async fn deliver(
        &self,
        sender: &NymId,
        recipient: &NymId,
        payload: Payload,
        command: &str,
    ) -> Result<ReceiptHandle> {
        if let Payload::Instrument(ref instrument) = payload {
            if !instrument.is_well_formed() {
                return Err(Error::Delivery(format!(
                    "Malformed instrument from {} to {}",
                    sender, recipient
                )));
            }
        }

        // Step 1: a fresh number. Issuance failure aborts before any other
        // side effect; from here on a failure burns the number.
        let number = self.authority.issue_next()?;

        // Step 2-3: the message, either relayed verbatim or synthesized
        // and sealed to the recipient's key.
        let (message, kind) = match payload {
            Payload::Message(message) => (message, NoticeKind::Message),
            Payload::Instrument(instrument) => {
                let message = self.synthesize_notice(recipient, &instrument, command)?;
                (message, NoticeKind::InstrumentNotice)
            }
        };

        // Steps 4-6 serialize per recipient so concurrent deliveries
        // append in completion order.
        let lock = self
            .recipient_locks
            .entry(recipient.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let committed = {
            let _guard = lock.lock().await;
            self.commit_notice(recipient, number, kind, &message)
        };
        drop(lock);
        // Evict the entry once idle; the map tracks recipients with
        // deliveries in flight, not every recipient ever seen
        self.recipient_locks
            .remove_if(recipient, |_, entry| Arc::strong_count(entry) == 1);
        committed?;

        tracing::info!(
            sender = %sender,
            recipient = %recipient,
            number,
            command,
            "Notice delivered to nymbox"
        );

        Ok(ReceiptHandle {
            owner: recipient.clone(),
            number,
        })
    }

    /// Fetch the full receipt body behind a delivery handle
    pub fn receipt(&self, handle: &ReceiptHandle) -> Result<BoxTransaction> {
        self.boxes.load_receipt(&handle.owner, handle.number)
    }

    /// Server public key boxes are verified against
    pub fn server_public_key(&self) -> [u8; 32] {
        self.server_keys.public_key()
    }

    /// Synthesize a server-authored notice sealing the instrument to the
    /// recipient's registered key. Any failure here aborts with no side
    /// effects beyond the already burned number.
    fn synthesize_notice(
        &self,
        recipient: &NymId,
        instrument: &Instrument,
        command: &str,
    ) -> Result<NoticeMessage> {
        let public_key = self
            .identities
            .load_public_key(recipient)?
            .ok_or_else(|| Error::IdentityNotFound(recipient.to_string()))?;

        if !self.identities.verify_identity(recipient)? {
            return Err(Error::Delivery(format!(
                "Identity record for {} failed verification",
                recipient
            )));
        }

        let sealed = self
            .envelope
            .seal(&public_key, &instrument.canonical_bytes())?;

        let mut message = NoticeMessage {
            sender: self.server_nym.clone(),
            recipient: recipient.clone(),
            notary: self.notary_id.clone(),
            command: command.to_string(),
            payload: sealed,
            timestamp_nanos: now_nanos(),
            signature: Signature::empty(),
        };
        message.signature = self.server_keys.sign(&message.signing_bytes());

        Ok(message)
    }

    /// Load and verify the recipient's nymbox, creating a fresh one on
    /// first delivery. A box that fails notary-id or signature checks is
    /// never trusted.
    fn load_or_create_nymbox(&self, recipient: &NymId) -> Result<BoxLedger> {
        match self.boxes.load_box(recipient, BoxKind::Nymbox)? {
            Some(nymbox) => {
                if nymbox.notary != self.notary_id {
                    return Err(Error::BoxIntegrity(format!(
                        "Nymbox for {} belongs to notary {}",
                        recipient, nymbox.notary
                    )));
                }
                if !nymbox.verify_signature(&self.server_keys.public_key()) {
                    return Err(Error::BoxIntegrity(format!(
                        "Nymbox signature for {} did not verify",
                        recipient
                    )));
                }
                Ok(nymbox)
            }
            None => Ok(BoxLedger::new(
                recipient.clone(),
                self.notary_id.clone(),
                BoxKind::Nymbox,
            )),
        }
    }

    /// Verify, append, re-sign, and atomically commit under the
    /// recipient's lock
    fn commit_notice(
        &self,
        recipient: &NymId,
        number: TransactionNumber,
        kind: NoticeKind,
        message: &NoticeMessage,
    ) -> Result<()> {
        let mut nymbox = self.load_or_create_nymbox(recipient)?;

        let transaction = self.build_transaction(number, kind, message);
        nymbox.push_entry(transaction.abbreviate());
        nymbox.signature = self.server_keys.sign(&nymbox.signing_bytes());

        self.boxes.save_box_with_receipt(&nymbox, &transaction)
    }

    fn build_transaction(
        &self,
        number: TransactionNumber,
        kind: NoticeKind,
        message: &NoticeMessage,
    ) -> BoxTransaction {
        let mut transaction = BoxTransaction {
            number,
            kind,
            reference_number: number,
            reference_payload: message.canonical_bytes(),
            timestamp_nanos: now_nanos(),
            signature: Signature::empty(),
        };
        transaction.signature = self.server_keys.sign(&transaction.signing_bytes());
        transaction
    }
}

fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}
