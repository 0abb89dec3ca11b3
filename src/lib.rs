//! Metered sessions over on-chain collateral.
//!
//! A session is opened over a collateral deposit held by a custody contract.
//! Every metered action (a chat query, a game move, an API call) is authorised
//! by an EIP-712 signed, strictly ordered envelope and charged against a
//! running off-chain balance. Closing the session settles it with two on-chain
//! transactions: the collateral is withdrawn back to the user, then the amount
//! spent is paid to the counterparty.
//!
//! # Modules
//!
//! - [`session`] - [`SessionManager`](session::SessionManager), the session
//!   state machine and the only writer of the persisted record.
//! - [`signer`] - [`ActionSigner`](signer::ActionSigner) and the silent/interactive
//!   [`DualSigner`](signer::DualSigner).
//! - [`keys`] - Ephemeral per-session signing keys.
//! - [`settlement`] - [`SettlementCoordinator`](settlement::SettlementCoordinator),
//!   the two-phase settlement with observable progress.
//! - [`store`] - Atomic persistence of the session record.
//! - [`config`] - JSON configuration with environment variable substitution.
//! - [`error`] - Error types for the session core.
//! - `telemetry` - Tracing subscriber and OpenTelemetry export (`telemetry` feature).
//!
//! # Example
//!
//! ```no_run
//! use sessionsafe::session::SessionManager;
//! use sessionsafe::signer::{DualSigner, NoWallet};
//! use sessionsafe::store::MemorySessionStore;
//! use sessionsafe_chain_eip155::{KnownSessionSafe, SessionDomain};
//! use sessionsafe_types::amount::Amount;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let signer = DualSigner::new(SessionDomain::sepolia(), NoWallet);
//! let manager = SessionManager::new(MemorySessionStore::new(), signer);
//!
//! manager.open(Amount::parse("10")?).await?;
//! let signed = manager.record_action("QUERY: hello", Amount::parse("0.5")?).await?;
//! assert_eq!(signed.envelope.nonce, 0);
//!
//! let snapshot = manager.begin_close().await?;
//! assert_eq!(snapshot.spent.to_string(), "0.5");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod keys;
pub mod session;
pub mod settlement;
pub mod signer;
pub mod store;
#[cfg(feature = "telemetry")]
pub mod telemetry;

pub use error::{SessionError, SettlementError};
pub use session::SessionManager;
pub use settlement::SettlementCoordinator;
