//! Cryptographic operations for the notary
//!
//! This module provides:
//! - Ed25519 key pair generation, signing, and verification
//! - SHA-256 hashing
//! - The envelope sealing seam used by guaranteed delivery

use crate::{Error, Result};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// Ed25519 key pair for signing
#[derive(Debug)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let signing_key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Load the signing seed from `path`, generating and persisting a new
    /// one on first run.
    ///
    /// Server identity must survive restarts: every nymbox the server has
    /// ever signed verifies against this key, so a process that came up
    /// with a fresh key would reject its own prior signatures.
    pub fn load_or_generate(path: &std::path::Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    Error::SignatureError(format!(
                        "Key file {} holds {} bytes; expected a 32-byte seed",
                        path.display(),
                        bytes.len()
                    ))
                })?;
                Ok(Self::from_seed(&seed))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let seed: [u8; 32] = rand::random();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        Error::SignatureError(format!(
                            "Cannot create key directory {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
                std::fs::write(path, seed).map_err(|e| {
                    Error::SignatureError(format!(
                        "Cannot write key file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                tracing::info!(path = %path.display(), "Generated new server signing key");
                Ok(Self::from_seed(&seed))
            }
            Err(e) => Err(Error::SignatureError(format!(
                "Cannot read key file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Get public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> crate::types::Signature {
        let signature = self.signing_key.sign(message);
        crate::types::Signature::from_bytes(signature.to_bytes())
    }

    /// Verify a signature
    pub fn verify(&self, message: &[u8], signature: &crate::types::Signature) -> Result<()> {
        let dalek_sig = DalekSignature::from_bytes(signature.as_bytes());
        self.verifying_key
            .verify(message, &dalek_sig)
            .map_err(|e| Error::SignatureError(format!("Verification failed: {}", e)))
    }
}

/// Verify a signature with a public key
pub fn verify_signature(
    message: &[u8],
    signature: &crate::types::Signature,
    public_key: &[u8; 32],
) -> bool {
    let dalek_sig = DalekSignature::from_bytes(signature.as_bytes());

    let verifying_key = match VerifyingKey::from_bytes(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };

    verifying_key.verify(message, &dalek_sig).is_ok()
}

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Seals a byte payload to a recipient's public key.
///
/// The delivery path treats sealing failure as opaque: it aborts the whole
/// operation without mutating any box.
pub trait EnvelopeService: Send + Sync {
    /// Seal plaintext to the recipient key, returning ciphertext
    fn seal(&self, recipient_key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Open ciphertext sealed to the given key
    fn open(&self, recipient_key: &[u8; 32], ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Symmetric keystream stand-in for an ECIES envelope.
///
/// Each seal draws a random 24-byte nonce and XORs the plaintext against
/// SHA-256 blocks of `recipient_key || nonce || counter`. Deployments supply
/// a real asymmetric `EnvelopeService` through the trait.
#[derive(Debug, Default)]
pub struct KeystreamEnvelope;

const ENVELOPE_NONCE_LEN: usize = 24;

impl KeystreamEnvelope {
    fn apply_keystream(key: &[u8; 32], nonce: &[u8], data: &mut [u8]) {
        for (block_index, chunk) in data.chunks_mut(32).enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(key);
            hasher.update(nonce);
            hasher.update((block_index as u64).to_be_bytes());
            let block: [u8; 32] = hasher.finalize().into();

            for (byte, key_byte) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= key_byte;
            }
        }
    }
}

impl EnvelopeService for KeystreamEnvelope {
    fn seal(&self, recipient_key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce: [u8; ENVELOPE_NONCE_LEN] = rand::random();

        let mut body = plaintext.to_vec();
        Self::apply_keystream(recipient_key, &nonce, &mut body);

        let mut ciphertext = Vec::with_capacity(ENVELOPE_NONCE_LEN + body.len());
        ciphertext.extend_from_slice(&nonce);
        ciphertext.extend_from_slice(&body);
        Ok(ciphertext)
    }

    fn open(&self, recipient_key: &[u8; 32], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < ENVELOPE_NONCE_LEN {
            return Err(Error::Envelope("Ciphertext too short".to_string()));
        }

        let (nonce, body) = ciphertext.split_at(ENVELOPE_NONCE_LEN);
        let mut plaintext = body.to_vec();
        Self::apply_keystream(recipient_key, nonce, &mut plaintext);
        Ok(plaintext)
    }
}
