//! Identity resolution seam
//!
//! Resolves a nym identifier to its public key material and validates the
//! identity record before anything is sealed to it.

use crate::{Error, Result, Storage};
use crate::types::NymId;
use std::sync::Arc;

/// Resolves nyms to public keys
pub trait IdentityDirectory: Send + Sync {
    /// Load a nym's public key, if registered
    fn load_public_key(&self, nym: &NymId) -> Result<Option<[u8; 32]>>;

    /// Validate the nym's identity record
    fn verify_identity(&self, nym: &NymId) -> Result<bool>;
}

/// Storage-backed directory of registered nyms
pub struct StorageDirectory {
    storage: Arc<Storage>,
}

impl StorageDirectory {
    /// Create over opened storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Register a nym's public key
    pub fn register_nym(&self, nym: &NymId, public_key: &[u8; 32]) -> Result<()> {
        // Reject key material that is not a valid Ed25519 point
        if ed25519_dalek::VerifyingKey::from_bytes(public_key).is_err() {
            return Err(Error::IdentityNotFound(format!(
                "Invalid public key for nym {}",
                nym
            )));
        }

        self.storage.put_identity(nym, public_key)?;
        tracing::info!(nym = %nym, "Nym registered");
        Ok(())
    }
}

impl IdentityDirectory for StorageDirectory {
    fn load_public_key(&self, nym: &NymId) -> Result<Option<[u8; 32]>> {
        self.storage.get_identity(nym)
    }

    fn verify_identity(&self, nym: &NymId) -> Result<bool> {
        match self.storage.get_identity(nym)? {
            Some(key) => Ok(ed25519_dalek::VerifyingKey::from_bytes(&key).is_ok()),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::Config;
    use tempfile::TempDir;

    fn test_directory() -> (StorageDirectory, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let storage = Arc::new(Storage::open(&config).unwrap());
        (StorageDirectory::new(storage), temp_dir)
    }

    #[test]
    fn test_register_and_resolve() {
        let (directory, _temp) = test_directory();
        let nym = NymId::new("alice");
        let keypair = KeyPair::generate();

        directory.register_nym(&nym, &keypair.public_key()).unwrap();

        assert_eq!(
            directory.load_public_key(&nym).unwrap(),
            Some(keypair.public_key())
        );
        assert!(directory.verify_identity(&nym).unwrap());
    }

    #[test]
    fn test_unknown_nym() {
        let (directory, _temp) = test_directory();
        let nym = NymId::new("nobody");

        assert_eq!(directory.load_public_key(&nym).unwrap(), None);
        assert!(!directory.verify_identity(&nym).unwrap());
    }
}
