//! Two-phase settlement of a closing session.
//!
//! Phase 1 withdraws the entire collateral from custody and must be confirmed
//! before phase 2 transfers the spent amount to the counterparty. Progress is
//! published on a [`watch`] channel and only ever moves forward within an
//! attempt.
//!
//! Failure handling:
//!
//! - phase 1 cannot be submitted: the session is reopened and the caller may
//!   try again
//! - phase 1 was submitted but not confirmed: its hash is persisted, the
//!   session stays closing, and the next `start` confirms the same transaction
//! - phase 2 fails: the confirmed withdrawal is recorded, the session stays
//!   closing, and only [`SettlementCoordinator::resume_fee_transfer`] can
//!   finish it. Phase 1 is never submitted twice.

use alloy_primitives::TxHash;
use sessionsafe_types::settlement::{
    CloseSnapshot, SettlementChain, SettlementOutcome, SettlementPhase, SettlementProgress,
};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::SettlementError;
use crate::session::{SessionManager, SettlementGuard};
use crate::signer::ActionSigner;
use crate::store::SessionStore;

/// Drives settlement of the session owned by a [`SessionManager`].
pub struct SettlementCoordinator<C, S, A> {
    manager: Arc<SessionManager<S, A>>,
    chain: C,
    progress: watch::Sender<SettlementProgress>,
}

impl<C, S, A> SettlementCoordinator<C, S, A>
where
    C: SettlementChain,
    S: SessionStore,
    A: ActionSigner,
{
    pub fn new(manager: Arc<SessionManager<S, A>>, chain: C) -> Self {
        let (progress, _) = watch::channel(SettlementProgress::Idle);
        Self {
            manager,
            chain,
            progress,
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager<S, A>> {
        &self.manager
    }

    /// Subscribes to progress updates.
    pub fn progress(&self) -> watch::Receiver<SettlementProgress> {
        self.progress.subscribe()
    }

    /// Terminal progress of the last attempt, if it has finished.
    pub fn result(&self) -> Option<SettlementProgress> {
        let progress = self.progress.borrow();
        progress.is_terminal().then(|| progress.clone())
    }

    /// Closes the session (if still open) and settles it.
    ///
    /// A withdrawal submitted by an earlier attempt (possibly before a
    /// restart) is confirmed rather than submitted again. Refuses to submit
    /// anything if a previous attempt already confirmed the withdrawal; use
    /// [`resume_fee_transfer`](Self::resume_fee_transfer) then.
    pub async fn start(&self) -> Result<SettlementOutcome, SettlementError> {
        let guard = self
            .manager
            .try_begin_settlement()
            .ok_or(SettlementError::InFlight)?;
        let snapshot = self.manager.begin_close().await?;

        if let Some(withdrawal) = snapshot.withdrawal {
            let reason = "fee transfer still pending, resume it explicitly".to_string();
            self.publish(SettlementProgress::PartiallySettled {
                withdrawal_tx: withdrawal,
                reason: reason.clone(),
            });
            return Err(SettlementError::PartialSettlement { withdrawal, reason });
        }

        tracing::info!(
            session_id = %snapshot.session_id,
            collateral = %snapshot.collateral,
            spent = %snapshot.spent,
            pending = ?snapshot.pending_withdrawal,
            "Settlement started"
        );
        self.publish(SettlementProgress::Idle);

        let withdrawal = match snapshot.pending_withdrawal {
            Some(tx) => {
                tracing::info!(tx = %tx, "Confirming previously submitted withdrawal");
                self.publish(SettlementProgress::WithdrawalSubmitted { withdrawal_tx: tx });
                tx
            }
            None => self.submit_withdrawal(&guard, &snapshot).await?,
        };

        match self.chain.confirm(withdrawal).await {
            Ok(receipt) => {
                tracing::info!(tx = %withdrawal, block = ?receipt.block_number, "Withdrawal confirmed");
                self.publish(SettlementProgress::WithdrawalConfirmed {
                    withdrawal_tx: withdrawal,
                });
            }
            Err(e) => return Err(self.withdrawal_pending(withdrawal, e.to_string())),
        }

        if let Err(e) = self.manager.record_withdrawal(&guard, withdrawal).await {
            let reason = format!("confirmed withdrawal not persisted: {e}");
            tracing::warn!(tx = %withdrawal, reason = %reason, "Stopping before fee transfer");
            self.publish(SettlementProgress::PartiallySettled {
                withdrawal_tx: withdrawal,
                reason: reason.clone(),
            });
            return Err(SettlementError::PartialSettlement { withdrawal, reason });
        }

        self.pay_fee_and_finalize(&guard, &snapshot, withdrawal).await
    }

    /// Retries only the fee transfer of a partially settled session.
    pub async fn resume_fee_transfer(&self) -> Result<SettlementOutcome, SettlementError> {
        let guard = self
            .manager
            .try_begin_settlement()
            .ok_or(SettlementError::InFlight)?;
        let snapshot = self.manager.closing_snapshot(&guard).await?;
        let withdrawal = snapshot
            .withdrawal
            .ok_or(SettlementError::NoPartialSettlement)?;

        tracing::info!(session_id = %snapshot.session_id, withdrawal = %withdrawal, "Resuming fee transfer");
        self.publish(SettlementProgress::WithdrawalConfirmed {
            withdrawal_tx: withdrawal,
        });
        self.pay_fee_and_finalize(&guard, &snapshot, withdrawal).await
    }

    /// Submits phase 1 and persists its hash before anything else happens.
    async fn submit_withdrawal(
        &self,
        guard: &SettlementGuard,
        snapshot: &CloseSnapshot,
    ) -> Result<TxHash, SettlementError> {
        if let Err(reason) = self.ensure_settleable(snapshot) {
            return Err(self.fail_withdrawal(guard, reason).await);
        }
        let tx = match self.chain.submit_withdrawal(snapshot.collateral).await {
            Ok(tx) => tx,
            Err(e) => return Err(self.fail_withdrawal(guard, e.to_string()).await),
        };
        self.publish(SettlementProgress::WithdrawalSubmitted { withdrawal_tx: tx });
        if let Err(e) = self.manager.record_withdrawal_submitted(guard, tx).await {
            return Err(self.withdrawal_pending(tx, format!("submission not persisted: {e}")));
        }
        Ok(tx)
    }

    /// Both settlement amounts must convert to token base units before
    /// anything is submitted.
    fn ensure_settleable(&self, snapshot: &CloseSnapshot) -> Result<(), String> {
        let decimals = self.manager.token_decimals();
        snapshot
            .collateral
            .to_base_units(decimals)
            .and_then(|_| snapshot.spent.to_base_units(decimals))
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    /// A submitted withdrawal could not be confirmed or recorded. The session
    /// stays closing and the next [`start`](Self::start) confirms the same
    /// transaction.
    fn withdrawal_pending(&self, withdrawal: TxHash, reason: String) -> SettlementError {
        tracing::warn!(tx = %withdrawal, reason = %reason, "Withdrawal left pending");
        self.publish(SettlementProgress::Failed {
            phase: SettlementPhase::Withdrawal,
            reason: reason.clone(),
        });
        SettlementError::WithdrawalPending { withdrawal, reason }
    }

    async fn fail_withdrawal(&self, guard: &SettlementGuard, reason: String) -> SettlementError {
        tracing::warn!(reason = %reason, "Withdrawal failed, reopening session");
        self.publish(SettlementProgress::Failed {
            phase: SettlementPhase::Withdrawal,
            reason: reason.clone(),
        });
        match self.manager.abort_settlement(guard).await {
            Ok(_) => SettlementError::SettlementPhaseFailed {
                phase: SettlementPhase::Withdrawal,
                reason,
            },
            Err(e) => e.into(),
        }
    }

    async fn pay_fee_and_finalize(
        &self,
        guard: &SettlementGuard,
        snapshot: &CloseSnapshot,
        withdrawal: TxHash,
    ) -> Result<SettlementOutcome, SettlementError> {
        let fee_tx = if snapshot.spent.is_zero() {
            None
        } else {
            match self.transfer_fee(snapshot, withdrawal).await {
                Ok(tx) => Some(tx),
                Err(reason) => {
                    tracing::warn!(reason = %reason, withdrawal = %withdrawal, "Fee transfer failed after withdrawal");
                    self.publish(SettlementProgress::PartiallySettled {
                        withdrawal_tx: withdrawal,
                        reason: reason.clone(),
                    });
                    return Err(SettlementError::PartialSettlement { withdrawal, reason });
                }
            }
        };

        if let Err(e) = self.manager.finalize_settled(guard).await {
            self.publish(SettlementProgress::Failed {
                phase: SettlementPhase::FeeTransfer,
                reason: e.to_string(),
            });
            return Err(e.into());
        }

        let outcome = SettlementOutcome {
            session_id: snapshot.session_id,
            withdrawn: snapshot.collateral,
            fee_paid: snapshot.spent,
            refund: snapshot.balance,
            withdrawal_tx: withdrawal,
            fee_tx,
        };
        tracing::info!(
            session_id = %outcome.session_id,
            withdrawn = %outcome.withdrawn,
            fee = %outcome.fee_paid,
            refund = %outcome.refund,
            "Session settled"
        );
        self.publish(SettlementProgress::Settled(outcome));
        Ok(outcome)
    }

    async fn transfer_fee(
        &self,
        snapshot: &CloseSnapshot,
        withdrawal: TxHash,
    ) -> Result<TxHash, String> {
        let tx = self
            .chain
            .submit_fee_transfer(snapshot.spent)
            .await
            .map_err(|e| e.to_string())?;
        self.publish(SettlementProgress::FeeSubmitted {
            withdrawal_tx: withdrawal,
            fee_tx: tx,
        });
        let receipt = self.chain.confirm(tx).await.map_err(|e| e.to_string())?;
        tracing::info!(tx = %tx, block = ?receipt.block_number, "Fee transfer confirmed");
        self.publish(SettlementProgress::FeeConfirmed {
            withdrawal_tx: withdrawal,
            fee_tx: tx,
        });
        Ok(tx)
    }

    fn publish(&self, progress: SettlementProgress) {
        self.progress.send_replace(progress);
    }
}
