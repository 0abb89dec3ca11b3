//! Action signing: silent signing with the session key, falling back to the
//! user's wallet.
//!
//! [`ActionSigner`] is the seam the session manager signs through. The default
//! [`DualSigner`] tries the session's ephemeral key first and only asks the
//! [`InteractiveSigner`] (a wallet that may prompt the user) when no session key
//! is available or it fails.

use alloy_primitives::{Address, B256, Bytes, Signature, SignatureError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sessionsafe_chain_eip155::{SessionDomain, SignerLike, recover_signer};
use sessionsafe_types::session::ActionEnvelope;

use crate::keys::EphemeralKey;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SigningError {
    /// The user declined the signature request.
    #[error("Signature request was rejected")]
    Rejected,
    /// No backend could produce a signature.
    #[error("No signer available: {0}")]
    Unavailable(String),
}

/// Which backend produced a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SigningBackend {
    /// The session's ephemeral key, without user interaction.
    Ephemeral,
    /// The user's primary wallet.
    Interactive,
}

/// A metered action together with its authorisation.
///
/// Serialized as the envelope sent to the counterparty:
/// `{sessionId, description, nonce, signature, signer, backend}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedAction {
    #[serde(flatten)]
    pub envelope: ActionEnvelope,
    /// 65-byte `r || s || v` signature.
    pub signature: Bytes,
    pub signer: Address,
    pub backend: SigningBackend,
}

/// Signs action envelopes under an EIP-712 domain.
#[async_trait]
pub trait ActionSigner: Send + Sync {
    /// The domain mixed into every signature.
    fn domain(&self) -> &SessionDomain;

    /// Signs `envelope`, using `key` when the session has one.
    async fn sign_action(
        &self,
        envelope: ActionEnvelope,
        key: Option<&EphemeralKey>,
    ) -> Result<SignedAction, SigningError>;
}

#[async_trait]
impl<T: ActionSigner + ?Sized> ActionSigner for std::sync::Arc<T> {
    fn domain(&self) -> &SessionDomain {
        (**self).domain()
    }

    async fn sign_action(
        &self,
        envelope: ActionEnvelope,
        key: Option<&EphemeralKey>,
    ) -> Result<SignedAction, SigningError> {
        (**self).sign_action(envelope, key).await
    }
}

/// The user's primary wallet. Signing may require explicit approval.
#[async_trait]
pub trait InteractiveSigner: Send + Sync {
    /// Signs the EIP-712 digest `hash` of `envelope`, returning the signing address.
    async fn sign_envelope(
        &self,
        envelope: &ActionEnvelope,
        hash: &B256,
    ) -> Result<(Address, Signature), SigningError>;
}

/// No wallet connected; interactive signing is always unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWallet;

#[async_trait]
impl InteractiveSigner for NoWallet {
    async fn sign_envelope(
        &self,
        _envelope: &ActionEnvelope,
        _hash: &B256,
    ) -> Result<(Address, Signature), SigningError> {
        Err(SigningError::Unavailable("no wallet connected".into()))
    }
}

/// Asks the user to approve a signature request.
#[async_trait]
pub trait ApprovalPrompt: Send + Sync {
    async fn approve(&self, envelope: &ActionEnvelope) -> bool;
}

/// A local signer gated by an approval prompt, the way a wallet popup gates
/// every signature.
#[derive(Debug, Clone)]
pub struct PromptingWallet<S, P> {
    signer: S,
    prompt: P,
}

impl<S, P> PromptingWallet<S, P> {
    pub fn new(signer: S, prompt: P) -> Self {
        Self { signer, prompt }
    }
}

#[async_trait]
impl<S, P> InteractiveSigner for PromptingWallet<S, P>
where
    S: SignerLike + Send + Sync,
    P: ApprovalPrompt,
{
    async fn sign_envelope(
        &self,
        envelope: &ActionEnvelope,
        hash: &B256,
    ) -> Result<(Address, Signature), SigningError> {
        if !self.prompt.approve(envelope).await {
            return Err(SigningError::Rejected);
        }
        let signature = self
            .signer
            .sign_hash(hash)
            .await
            .map_err(|e| SigningError::Unavailable(e.to_string()))?;
        Ok((self.signer.address(), signature))
    }
}

/// Signs with the session's ephemeral key only.
#[derive(Debug, Clone)]
pub struct SilentSigner {
    domain: SessionDomain,
}

impl SilentSigner {
    pub fn new(domain: SessionDomain) -> Self {
        Self { domain }
    }

    pub async fn sign(
        &self,
        envelope: ActionEnvelope,
        key: &EphemeralKey,
    ) -> Result<SignedAction, SigningError> {
        let hash = self.domain.action_signing_hash(&envelope);
        let signature = key
            .sign_hash(&hash)
            .await
            .map_err(|e| SigningError::Unavailable(e.to_string()))?;
        Ok(SignedAction {
            envelope,
            signature: Bytes::copy_from_slice(&signature.as_bytes()),
            signer: key.address(),
            backend: SigningBackend::Ephemeral,
        })
    }
}

/// Ephemeral key first, interactive wallet as fallback.
#[derive(Debug, Clone)]
pub struct DualSigner<I> {
    silent: SilentSigner,
    interactive: I,
}

impl<I> DualSigner<I> {
    pub fn new(domain: SessionDomain, interactive: I) -> Self {
        Self {
            silent: SilentSigner::new(domain),
            interactive,
        }
    }
}

#[async_trait]
impl<I: InteractiveSigner> ActionSigner for DualSigner<I> {
    fn domain(&self) -> &SessionDomain {
        &self.silent.domain
    }

    async fn sign_action(
        &self,
        envelope: ActionEnvelope,
        key: Option<&EphemeralKey>,
    ) -> Result<SignedAction, SigningError> {
        if let Some(key) = key {
            match self.silent.sign(envelope.clone(), key).await {
                Ok(signed) => return Ok(signed),
                Err(e) => {
                    tracing::warn!(error = %e, nonce = envelope.nonce, "Session key failed to sign, falling back to wallet")
                }
            }
        }
        let hash = self.silent.domain.action_signing_hash(&envelope);
        let (signer, signature) = self.interactive.sign_envelope(&envelope, &hash).await?;
        Ok(SignedAction {
            envelope,
            signature: Bytes::copy_from_slice(&signature.as_bytes()),
            signer,
            backend: SigningBackend::Interactive,
        })
    }
}

/// Recovers the address that signed `envelope` under `domain`.
pub fn recover_action_signer(
    domain: &SessionDomain,
    envelope: &ActionEnvelope,
    signature: &[u8],
) -> Result<Address, SignatureError> {
    let hash = domain.action_signing_hash(envelope);
    recover_signer(&hash, signature)
}
