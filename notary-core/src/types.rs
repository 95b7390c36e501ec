//! Core types for the notary engine
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Memory safety (no unsafe code)
//! - Exact arithmetic (Decimal for money)

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A transaction number: a scarce, monotonically issued, single-use
/// integer token authorizing one ledger-affecting action.
///
/// Issued exclusively by the `NumberAuthority`; never reused once issued.
pub type TransactionNumber = i64;

/// Cryptographic identity (key pair holder) identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NymId(String);

impl NymId {
    /// Create new nym ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NymId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Notary server identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotaryId(String);

impl NotaryId {
    /// Create new notary ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Custodial account identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ISO 4217 currency code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Currency {
    /// US Dollar
    USD,
    /// Euro
    EUR,
    /// British Pound
    GBP,
    /// Swiss Franc
    CHF,
    /// Japanese Yen
    JPY,
}

impl Currency {
    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
            Currency::CHF => "CHF",
            Currency::JPY => "JPY",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "USD" => Some(Currency::USD),
            "EUR" => Some(Currency::EUR),
            "GBP" => Some(Currency::GBP),
            "CHF" => Some(Currency::CHF),
            "JPY" => Some(Currency::JPY),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Which box a ledger belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BoxKind {
    /// Incoming transfers awaiting acceptance
    Inbox = 1,
    /// Outgoing transfers awaiting counterparty action
    Outbox = 2,
    /// Guaranteed-delivery inbox for notices and number grants
    Nymbox = 3,
}

/// Transaction type within a box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NoticeKind {
    /// Plain relayed message
    Message = 1,
    /// Server-authored notice wrapping a sealed payment instrument
    InstrumentNotice = 2,
}

/// Digital signature (Ed25519)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Signature bytes (64 bytes)
    #[serde(with = "serde_bytes")]
    bytes: [u8; 64],
}

impl Signature {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self { bytes }
    }

    /// Empty placeholder signature (all zeroes)
    pub fn empty() -> Self {
        Self { bytes: [0u8; 64] }
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    /// Verify signature against a message and public key
    pub fn verify(&self, message: &[u8], public_key: &[u8; 32]) -> bool {
        use ed25519_dalek::{Signature as DalekSignature, Verifier, VerifyingKey};

        let signature = DalekSignature::from_bytes(&self.bytes);

        let verifying_key = match VerifyingKey::from_bytes(public_key) {
            Ok(key) => key,
            Err(_) => return false,
        };

        verifying_key.verify(message, &signature).is_ok()
    }
}

/// Kind of payment instrument carried inside an instrument notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum InstrumentKind {
    /// Cheque drawn on a custodial account
    Cheque = 1,
    /// Voucher backed by server-held funds
    Voucher = 2,
    /// Recurring payment plan terms
    PaymentPlan = 3,
    /// Smart contract terms
    SmartContract = 4,
    /// Dividend payout
    Dividend = 5,
    /// Receipt for a filled market trade
    TradeReceipt = 6,
    /// Receipt for an executed payment plan installment
    PaymentReceipt = 7,
    /// Smart contract clause notice
    ContractNotice = 8,
}

/// A payment instrument destined for a counterparty's nymbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    /// Instrument kind
    pub kind: InstrumentKind,

    /// Face amount
    pub amount: Decimal,

    /// Currency
    pub currency: Currency,

    /// Issuing nym
    pub sender: NymId,

    /// Intended recipient nym
    pub recipient: NymId,

    /// Serialized instrument terms (contract text)
    pub terms: String,
}

impl Instrument {
    /// Structural validity check performed before any delivery attempt
    pub fn is_well_formed(&self) -> bool {
        if self.terms.is_empty() {
            return false;
        }
        match self.kind {
            // Contract notices are informational and may carry no amount
            InstrumentKind::ContractNotice => self.amount >= Decimal::ZERO,
            _ => self.amount > Decimal::ZERO,
        }
    }

    /// Canonical bytes for sealing into an envelope
    pub fn canonical_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("serialization cannot fail")
    }
}

/// A signed message travelling between nyms through the notary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticeMessage {
    /// Sending nym (the notary itself for synthesized notices)
    pub sender: NymId,

    /// Recipient nym
    pub recipient: NymId,

    /// Notary the message is routed through
    pub notary: NotaryId,

    /// Command label (e.g. "outpaymentsMessage", "chequeNotice")
    pub command: String,

    /// Opaque payload: plaintext body or sealed envelope ciphertext
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    /// Creation timestamp (nanoseconds since Unix epoch)
    pub timestamp_nanos: i64,

    /// Sender signature over the signing bytes
    pub signature: Signature,
}

impl NoticeMessage {
    /// Bytes covered by the signature (everything except the signature itself)
    pub fn signing_bytes(&self) -> Vec<u8> {
        bincode::serialize(&(
            &self.sender,
            &self.recipient,
            &self.notary,
            &self.command,
            &self.payload,
            self.timestamp_nanos,
        ))
        .expect("serialization cannot fail")
    }

    /// Full serialized form carried as a box transaction's reference payload
    pub fn canonical_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("serialization cannot fail")
    }

    /// Verify the embedded signature
    pub fn verify_signature(&self, public_key: &[u8; 32]) -> bool {
        self.signature.verify(&self.signing_bytes(), public_key)
    }
}

/// Full transaction body dropped into a box
///
/// Immutable once signed and saved; only box membership changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxTransaction {
    /// Transaction number keying this entry in its box
    pub number: TransactionNumber,

    /// Notice kind
    pub kind: NoticeKind,

    /// Reference number (the number issued for this delivery)
    pub reference_number: TransactionNumber,

    /// Opaque reference payload (serialized message or sealed instrument)
    #[serde(with = "serde_bytes")]
    pub reference_payload: Vec<u8>,

    /// Creation timestamp (nanoseconds since Unix epoch)
    pub timestamp_nanos: i64,

    /// Server signature
    pub signature: Signature,
}

impl BoxTransaction {
    /// Bytes covered by the server signature
    pub fn signing_bytes(&self) -> Vec<u8> {
        bincode::serialize(&(
            self.number,
            self.kind,
            self.reference_number,
            &self.reference_payload,
            self.timestamp_nanos,
        ))
        .expect("serialization cannot fail")
    }

    /// Abbreviate for storage in the box index
    pub fn abbreviate(&self) -> AbbreviatedEntry {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(&self.reference_payload);

        AbbreviatedEntry {
            number: self.number,
            kind: self.kind,
            reference_number: self.reference_number,
            payload_hash: hasher.finalize().into(),
        }
    }
}

/// Abbreviated box entry: a pointer to a separately stored `BoxReceipt`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbbreviatedEntry {
    /// Transaction number (receipt lookup key)
    pub number: TransactionNumber,

    /// Notice kind
    pub kind: NoticeKind,

    /// Reference number of the full transaction
    pub reference_number: TransactionNumber,

    /// SHA-256 of the full reference payload (tamper evidence)
    pub payload_hash: [u8; 32],
}

/// An ordered box ledger for one identity at one notary
///
/// Holds only abbreviated entries; full bodies live as box receipts.
/// The server signature must validate before the box is trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxLedger {
    /// Owning nym
    pub owner: NymId,

    /// Notary this box lives at
    pub notary: NotaryId,

    /// Which box
    pub kind: BoxKind,

    /// Abbreviated entries, in append order, keyed by transaction number
    pub entries: Vec<AbbreviatedEntry>,

    /// Server signature over the signing bytes
    pub signature: Signature,
}

impl BoxLedger {
    /// Create a new empty, unsigned box
    pub fn new(owner: NymId, notary: NotaryId, kind: BoxKind) -> Self {
        Self {
            owner,
            notary,
            kind,
            entries: Vec::new(),
            signature: Signature::empty(),
        }
    }

    /// Bytes covered by the server signature
    pub fn signing_bytes(&self) -> Vec<u8> {
        bincode::serialize(&(&self.owner, &self.notary, self.kind, &self.entries))
            .expect("serialization cannot fail")
    }

    /// Verify the box signature against the server's public key
    pub fn verify_signature(&self, public_key: &[u8; 32]) -> bool {
        self.signature.verify(&self.signing_bytes(), public_key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the box holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if an entry with the given transaction number exists
    pub fn contains(&self, number: TransactionNumber) -> bool {
        self.entries.iter().any(|e| e.number == number)
    }

    /// Append an abbreviated entry
    pub fn push_entry(&mut self, entry: AbbreviatedEntry) {
        self.entries.push(entry);
    }
}

/// Handle identifying a stored box receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptHandle {
    /// Box owner the receipt was filed under
    pub owner: NymId,

    /// Transaction number of the receipt
    pub number: TransactionNumber,
}
