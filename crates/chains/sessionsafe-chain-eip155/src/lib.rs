//! EIP-155 (EVM) chain support for SessionSafe metered sessions.
//!
//! This crate provides everything EVM-specific the session core needs:
//!
//! - **EIP-712 action signing**: a stable, domain-separated typed message for every
//!   metered action and for channel state proofs ([`typed_data`])
//! - **Signer abstraction**: [`SignerLike`] over local keys and shared signers
//! - **Two-phase settlement**: an alloy-backed [`SettlementChain`](sessionsafe_types::settlement::SettlementChain)
//!   implementation that withdraws collateral from the custody contract and pays the
//!   counterparty with an ERC-20 transfer (`settlement` feature)
//!
//! # Feature Flags
//!
//! - `settlement` - On-chain settlement provider (pulls in the alloy provider stack)
//! - `telemetry` - Tracing instrumentation
//!
//! # Example
//!
//! ```ignore
//! use alloy_signer_local::PrivateKeySigner;
//! use sessionsafe_chain_eip155::{KnownSessionSafe, SessionDomain, SignerLike};
//!
//! let domain = SessionDomain::sepolia();
//! let key = PrivateKeySigner::random();
//! let hash = domain.action_signing_hash(&envelope);
//! let signature = key.sign_hash(&hash).await?;
//! assert_eq!(recover_signer(&hash, &signature.as_bytes())?, key.address());
//! ```

pub mod chain;
pub mod signer;
pub mod typed_data;

mod networks;
pub use networks::*;

pub use signer::*;
pub use typed_data::*;
