//! Ephemeral per-session signing keys.
//!
//! Each session gets a fresh secp256k1 key when it opens. The key signs every
//! metered action without prompting the user and is destroyed when the session
//! closes. Its private material leaves memory only as [`KeyMaterial`], which
//! zeroes itself on drop.

use alloy_primitives::{Address, B256, Signature};
use alloy_signer_local::PrivateKeySigner;
use sessionsafe_chain_eip155::SignerLike;
use sessionsafe_types::session::KeyMaterial;
use std::fmt::{Debug, Formatter};

/// A session's ephemeral signing key.
pub struct EphemeralKey {
    signer: PrivateKeySigner,
}

impl EphemeralKey {
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Exports the private key for persistence.
    pub fn export(&self) -> KeyMaterial {
        KeyMaterial::new(self.signer.to_bytes().0)
    }

    /// Rebuilds a key from persisted material.
    pub fn import(material: &KeyMaterial) -> Result<Self, alloy_signer_local::LocalSignerError> {
        let bytes = B256::from(*material.as_bytes());
        let signer = PrivateKeySigner::from_bytes(&bytes)?;
        Ok(Self { signer })
    }

    pub async fn sign_hash(&self, hash: &B256) -> Result<Signature, alloy_signer::Error> {
        SignerLike::sign_hash(&self.signer, hash).await
    }
}

impl Debug for EphemeralKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Creates and destroys session keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct EphemeralKeyManager;

impl EphemeralKeyManager {
    /// Generates a fresh random key.
    pub fn create(&self) -> EphemeralKey {
        let signer = PrivateKeySigner::random();
        tracing::debug!(address = %signer.address(), "Ephemeral key created");
        EphemeralKey { signer }
    }

    /// Wipes a key. The underlying k256 secret zeroizes its scalar on drop.
    pub fn destroy(&self, key: EphemeralKey) {
        tracing::debug!(address = %key.address(), "Ephemeral key destroyed");
        drop(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessionsafe_chain_eip155::recover_signer;

    #[test]
    fn test_keys_are_unique() {
        let manager = EphemeralKeyManager;
        let a = manager.create();
        let b = manager.create();
        assert_ne!(a.address(), b.address());
    }

    #[tokio::test]
    async fn test_export_import_keeps_identity() {
        let manager = EphemeralKeyManager;
        let key = manager.create();
        let restored = EphemeralKey::import(&key.export()).unwrap();
        assert_eq!(restored.address(), key.address());

        let hash = B256::repeat_byte(0x42);
        let signature = restored.sign_hash(&hash).await.unwrap();
        assert_eq!(
            recover_signer(&hash, &signature.as_bytes()).unwrap(),
            key.address()
        );
        manager.destroy(key);
    }

    #[test]
    fn test_import_rejects_zero_key() {
        assert!(EphemeralKey::import(&KeyMaterial::new([0u8; 32])).is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let key = EphemeralKeyManager.create();
        let debug = format!("{key:?}");
        assert!(debug.contains("address"));
        assert!(!debug.contains(&alloy_primitives::hex::encode(key.export().as_bytes())));
    }
}
