//! Signer abstraction and signature recovery.

use alloy_primitives::{Address, B256, Signature, SignatureError};
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use std::sync::Arc;

/// A trait that abstracts signing operations, allowing both owned signers and Arc-wrapped signers.
///
/// Alloy's `Signer` trait is not implemented for `Arc<T>`, but session keys are
/// shared between the session manager and in-flight signing calls.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use alloy_signer_local::PrivateKeySigner;
/// use sessionsafe_chain_eip155::SignerLike;
///
/// let signer = Arc::new(PrivateKeySigner::random());
/// let signature = signer.sign_hash(&hash).await?;
/// ```
#[async_trait]
pub trait SignerLike {
    /// Returns the address of the signer.
    fn address(&self) -> Address;

    /// Signs the given hash.
    async fn sign_hash(&self, hash: &B256) -> Result<Signature, alloy_signer::Error>;
}

#[async_trait]
impl SignerLike for PrivateKeySigner {
    fn address(&self) -> Address {
        PrivateKeySigner::address(self)
    }

    async fn sign_hash(&self, hash: &B256) -> Result<Signature, alloy_signer::Error> {
        alloy_signer::Signer::sign_hash(self, hash).await
    }
}

#[async_trait]
impl<T: SignerLike + Send + Sync> SignerLike for Arc<T> {
    fn address(&self) -> Address {
        (**self).address()
    }

    async fn sign_hash(&self, hash: &B256) -> Result<Signature, alloy_signer::Error> {
        (**self).sign_hash(hash).await
    }
}

/// Recovers the address that produced a 65-byte `r || s || v` signature over `hash`.
pub fn recover_signer(hash: &B256, signature: &[u8]) -> Result<Address, SignatureError> {
    let signature = Signature::try_from(signature)?;
    signature.recover_address_from_prehash(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networks::KnownSessionSafe;
    use crate::typed_data::SessionDomain;
    use sessionsafe_types::session::{ActionEnvelope, SessionId};

    #[tokio::test]
    async fn test_sign_and_recover() {
        let key = PrivateKeySigner::random();
        let envelope = ActionEnvelope {
            session_id: SessionId::new([3u8; 32]),
            description: "Chat Message".into(),
            nonce: 0,
        };
        let hash = SessionDomain::sepolia().action_signing_hash(&envelope);
        let signature = SignerLike::sign_hash(&key, &hash).await.unwrap();
        let recovered = recover_signer(&hash, &signature.as_bytes()).unwrap();
        assert_eq!(recovered, SignerLike::address(&key));
    }

    #[tokio::test]
    async fn test_arc_signer() {
        let key = Arc::new(PrivateKeySigner::random());
        let hash = B256::repeat_byte(0x5a);
        let signature = key.sign_hash(&hash).await.unwrap();
        assert_eq!(
            recover_signer(&hash, &signature.as_bytes()).unwrap(),
            key.address()
        );
    }

    #[test]
    fn test_recover_rejects_short_signature() {
        assert!(recover_signer(&B256::ZERO, &[0u8; 12]).is_err());
    }
}
