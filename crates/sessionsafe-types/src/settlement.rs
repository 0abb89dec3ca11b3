//! Two-phase settlement interface.
//!
//! A session is settled with exactly two on-chain operations in fixed order:
//!
//! 1. **Withdrawal** releases the entire collateral back to the user.
//! 2. **Fee transfer** pays the spent amount to the counterparty (skipped when nothing was spent).
//!
//! Chain crates implement [`SettlementChain`]; the session core drives it and
//! reports [`SettlementProgress`] to callers.

use alloy_primitives::TxHash;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::amount::Amount;
use crate::session::SessionId;

/// The numbers a settlement works from, frozen when the session starts closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseSnapshot {
    pub session_id: SessionId,
    pub collateral: Amount,
    pub balance: Amount,
    pub spent: Amount,
    /// Set once the withdrawal of this close attempt has been submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_withdrawal: Option<TxHash>,
    /// Set once the withdrawal of this close attempt has been confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub withdrawal: Option<TxHash>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SettlementPhase {
    Withdrawal,
    FeeTransfer,
}

impl Display for SettlementPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SettlementPhase::Withdrawal => f.write_str("withdrawal"),
            SettlementPhase::FeeTransfer => f.write_str("fee transfer"),
        }
    }
}

/// A confirmed settlement transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    pub tx_hash: TxHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
}

/// Result of a fully completed settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementOutcome {
    pub session_id: SessionId,
    /// Collateral released in the withdrawal phase.
    pub withdrawn: Amount,
    /// Amount transferred to the counterparty.
    pub fee_paid: Amount,
    /// What the user keeps: `withdrawn - fee_paid`.
    pub refund: Amount,
    pub withdrawal_tx: TxHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_tx: Option<TxHash>,
}

/// Observable progress of one settlement attempt.
///
/// Within an attempt the [`stage`](SettlementProgress::stage) never decreases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "camelCase")]
pub enum SettlementProgress {
    Idle,
    #[serde(rename_all = "camelCase")]
    WithdrawalSubmitted { withdrawal_tx: TxHash },
    #[serde(rename_all = "camelCase")]
    WithdrawalConfirmed { withdrawal_tx: TxHash },
    #[serde(rename_all = "camelCase")]
    FeeSubmitted { withdrawal_tx: TxHash, fee_tx: TxHash },
    #[serde(rename_all = "camelCase")]
    FeeConfirmed { withdrawal_tx: TxHash, fee_tx: TxHash },
    Settled(SettlementOutcome),
    Failed { phase: SettlementPhase, reason: String },
    #[serde(rename_all = "camelCase")]
    PartiallySettled { withdrawal_tx: TxHash, reason: String },
}

impl SettlementProgress {
    /// Ordinal position of this stage within an attempt.
    pub fn stage(&self) -> u8 {
        match self {
            SettlementProgress::Idle => 0,
            SettlementProgress::WithdrawalSubmitted { .. } => 1,
            SettlementProgress::WithdrawalConfirmed { .. } => 2,
            SettlementProgress::FeeSubmitted { .. } => 3,
            SettlementProgress::FeeConfirmed { .. } => 4,
            SettlementProgress::Settled(_)
            | SettlementProgress::Failed { .. }
            | SettlementProgress::PartiallySettled { .. } => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage() == 5
    }
}

/// The external ledger a session settles against.
///
/// Submission and confirmation are separate calls so progress can be reported
/// between them. Submitted transactions cannot be revoked.
#[async_trait::async_trait]
pub trait SettlementChain: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Submits the release of the entire `collateral` back to the user.
    async fn submit_withdrawal(&self, collateral: Amount) -> Result<TxHash, Self::Error>;

    /// Submits the transfer of `fee` from the user to the counterparty.
    async fn submit_fee_transfer(&self, fee: Amount) -> Result<TxHash, Self::Error>;

    /// Waits until `tx_hash` is confirmed; a reverted or timed out transaction is an error.
    async fn confirm(&self, tx_hash: TxHash) -> Result<SettlementReceipt, Self::Error>;
}

#[async_trait::async_trait]
impl<T: SettlementChain + ?Sized> SettlementChain for Arc<T> {
    type Error = T::Error;

    async fn submit_withdrawal(&self, collateral: Amount) -> Result<TxHash, Self::Error> {
        (**self).submit_withdrawal(collateral).await
    }

    async fn submit_fee_transfer(&self, fee: Amount) -> Result<TxHash, Self::Error> {
        (**self).submit_fee_transfer(fee).await
    }

    async fn confirm(&self, tx_hash: TxHash) -> Result<SettlementReceipt, Self::Error> {
        (**self).confirm(tx_hash).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_stages_are_ordered() {
        let tx = TxHash::repeat_byte(1);
        let fee = TxHash::repeat_byte(2);
        let stages = [
            SettlementProgress::Idle,
            SettlementProgress::WithdrawalSubmitted { withdrawal_tx: tx },
            SettlementProgress::WithdrawalConfirmed { withdrawal_tx: tx },
            SettlementProgress::FeeSubmitted { withdrawal_tx: tx, fee_tx: fee },
            SettlementProgress::FeeConfirmed { withdrawal_tx: tx, fee_tx: fee },
        ];
        for pair in stages.windows(2) {
            assert!(pair[0].stage() < pair[1].stage());
            assert!(!pair[1].is_terminal());
        }
        let failed = SettlementProgress::Failed {
            phase: SettlementPhase::Withdrawal,
            reason: "timeout".into(),
        };
        assert!(failed.is_terminal());
    }

    #[test]
    fn test_progress_json_is_tagged() {
        let progress = SettlementProgress::WithdrawalSubmitted {
            withdrawal_tx: TxHash::repeat_byte(1),
        };
        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["stage"], "withdrawalSubmitted");
        assert!(json["withdrawalTx"].is_string());
    }
}
