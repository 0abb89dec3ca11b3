//! Error types returned by the session core.

use alloy_primitives::TxHash;
use sessionsafe_types::amount::{Amount, AmountParseError};
use sessionsafe_types::session::SessionStatus;
use sessionsafe_types::settlement::SettlementPhase;

use crate::signer::SigningError;
use crate::store::StoreError;

/// Errors from [`SessionManager`](crate::session::SessionManager) operations.
///
/// Every variant leaves the session exactly as it was before the call.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Amount, available: Amount },
    #[error("Signature request was rejected")]
    SigningRejected,
    #[error("No signer available: {0}")]
    SigningUnavailable(String),
    #[error("Cannot {operation} a session that is {status}")]
    InvalidTransition {
        operation: &'static str,
        status: SessionStatus,
    },
    #[error("A settlement phase is in flight")]
    SettlementInFlight,
    #[error("Collateral has already been withdrawn, the session can only be settled")]
    CollateralReleased,
    #[error("Withdrawal {0} is awaiting confirmation, the session can only be settled")]
    WithdrawalPending(TxHash),
    #[error("Collateral must be greater than zero")]
    InvalidAmount,
    #[error("Amount cannot be settled in token units: {0}")]
    AmountNotRepresentable(AmountParseError),
    #[error(transparent)]
    Persistence(#[from] StoreError),
    #[error("Persisted session record is corrupt: {0}")]
    CorruptRecord(String),
}

impl From<SigningError> for SessionError {
    fn from(value: SigningError) -> Self {
        match value {
            SigningError::Rejected => SessionError::SigningRejected,
            SigningError::Unavailable(reason) => SessionError::SigningUnavailable(reason),
        }
    }
}

/// Errors from [`SettlementCoordinator`](crate::settlement::SettlementCoordinator).
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("A settlement attempt is already in flight")]
    InFlight,
    #[error("Settlement {phase} failed: {reason}")]
    SettlementPhaseFailed {
        phase: SettlementPhase,
        reason: String,
    },
    #[error("Withdrawal {withdrawal} submitted but not confirmed: {reason}")]
    WithdrawalPending { withdrawal: TxHash, reason: String },
    #[error("Collateral withdrawn in {withdrawal} but the fee transfer failed: {reason}")]
    PartialSettlement { withdrawal: TxHash, reason: String },
    #[error("No confirmed withdrawal to resume the fee transfer from")]
    NoPartialSettlement,
}
