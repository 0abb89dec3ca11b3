//! The session state machine.
//!
//! ```text
//! Idle --open--> Open --begin_close--> Closing --finalize_close--> Closed --reset--> Idle
//!                  ^                      |
//!                  +------abort_close-----+
//! ```
//!
//! [`SessionManager`] is the single writer of session state. Every operation
//! holds the state lock for its whole duration, signing included, so
//! concurrent calls are serialised and nonces are handed out without gaps.
//! A transition is persisted before it is committed in memory: if the store
//! fails, the session is left exactly as it was.

use alloy_primitives::{Address, Bytes, TxHash};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sessionsafe_chain_eip155::SessionDomain;
use sessionsafe_types::amount::Amount;
use sessionsafe_types::session::{
    ActionEnvelope, ActionRecord, ChannelState, SessionId, SessionRecord, SessionStatus,
};
use sessionsafe_types::settlement::CloseSnapshot;
use sessionsafe_types::timestamp::UnixTimestamp;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use crate::error::SessionError;
use crate::keys::{EphemeralKey, EphemeralKeyManager};
use crate::signer::{ActionSigner, SignedAction};
use crate::store::SessionStore;

/// Decimals of the default collateral token (mock USDC).
pub const DEFAULT_TOKEN_DECIMALS: u8 = 6;

/// Read-only summary of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub collateral: Amount,
    pub balance: Amount,
    pub spent: Amount,
    pub nonce: u64,
    pub action_count: usize,
    /// Address of the session's ephemeral key.
    pub signer: Address,
}

/// A channel state signed with the session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedChannelState {
    #[serde(flatten)]
    pub state: ChannelState,
    pub signature: Bytes,
    pub signer: Address,
}

struct LiveSession {
    id: SessionId,
    collateral: Amount,
    balance: Amount,
    nonce: u64,
    actions: Vec<ActionRecord>,
    signer: Address,
    /// `None` once the session is closed.
    key: Option<EphemeralKey>,
    pending_withdrawal: Option<TxHash>,
    withdrawal: Option<TxHash>,
}

impl LiveSession {
    fn spent(&self) -> Amount {
        self.collateral.checked_sub(self.balance).unwrap_or_default()
    }

    fn record(&self, status: SessionStatus) -> SessionRecord {
        SessionRecord {
            version: SessionRecord::CURRENT_VERSION,
            session_id: self.id,
            status,
            collateral: self.collateral,
            balance: self.balance,
            nonce: self.nonce,
            actions: self.actions.clone(),
            signer: self.signer,
            signing_key: self.key.as_ref().map(EphemeralKey::export),
            pending_withdrawal: self.pending_withdrawal,
            withdrawal: self.withdrawal,
        }
    }

    fn snapshot(&self) -> CloseSnapshot {
        CloseSnapshot {
            session_id: self.id,
            collateral: self.collateral,
            balance: self.balance,
            spent: self.spent(),
            pending_withdrawal: self.pending_withdrawal,
            withdrawal: self.withdrawal,
        }
    }

    fn view(&self, status: SessionStatus) -> SessionView {
        SessionView {
            session_id: self.id,
            status,
            collateral: self.collateral,
            balance: self.balance,
            spent: self.spent(),
            nonce: self.nonce,
            action_count: self.actions.len(),
            signer: self.signer,
        }
    }
}

struct SessionState {
    status: SessionStatus,
    session: Option<LiveSession>,
}

impl SessionState {
    fn idle() -> Self {
        Self {
            status: SessionStatus::Idle,
            session: None,
        }
    }

    fn ensure(
        &self,
        operation: &'static str,
        allowed: &[SessionStatus],
    ) -> Result<(), SessionError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                operation,
                status: self.status,
            })
        }
    }

    /// The live session for `operation`, which must be allowed in the current status.
    fn live(
        &mut self,
        operation: &'static str,
        allowed: &[SessionStatus],
    ) -> Result<&mut LiveSession, SessionError> {
        self.ensure(operation, allowed)?;
        let status = self.status;
        self.session
            .as_mut()
            .ok_or(SessionError::InvalidTransition { operation, status })
    }
}

/// Proof that the caller owns the single settlement slot of a manager.
///
/// Released on drop.
#[derive(Debug)]
pub struct SettlementGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for SettlementGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Owns one metered session: its balance, nonce, action log and key.
pub struct SessionManager<S, A> {
    store: S,
    signer: A,
    keys: EphemeralKeyManager,
    token_decimals: u8,
    state: Mutex<SessionState>,
    settling: Arc<AtomicBool>,
}

impl<S, A> SessionManager<S, A>
where
    S: SessionStore,
    A: ActionSigner,
{
    /// Creates an idle manager. Anything already in `store` is left untouched
    /// until the next `open`.
    pub fn new(store: S, signer: A) -> Self {
        Self::with_state(store, signer, SessionState::idle())
    }

    fn with_state(store: S, signer: A, state: SessionState) -> Self {
        Self {
            store,
            signer,
            keys: EphemeralKeyManager,
            token_decimals: DEFAULT_TOKEN_DECIMALS,
            state: Mutex::new(state),
            settling: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Decimals used to express channel state balances in token base units.
    pub fn with_token_decimals(mut self, decimals: u8) -> Self {
        self.token_decimals = decimals;
        self
    }

    pub fn token_decimals(&self) -> u8 {
        self.token_decimals
    }

    /// Rejects amounts with more precision than the collateral token carries.
    fn ensure_settleable(&self, amount: Amount) -> Result<(), SessionError> {
        amount
            .to_base_units(self.token_decimals)
            .map(|_| ())
            .map_err(SessionError::AmountNotRepresentable)
    }

    /// Rebuilds the manager from whatever `store` holds.
    ///
    /// - no record: idle
    /// - an open or closing record: the exact session, with the same key
    /// - a closed record left behind by an interrupted close: cleared, idle
    /// - a record whose bookkeeping does not add up: [`SessionError::CorruptRecord`]
    pub fn restore(store: S, signer: A) -> Result<Self, SessionError> {
        let Some(record) = store.load()? else {
            return Ok(Self::new(store, signer));
        };
        if record.status == SessionStatus::Closed {
            tracing::info!(session_id = %record.session_id, "Clearing record of a closed session");
            store.clear()?;
            return Ok(Self::new(store, signer));
        }
        record
            .validate()
            .map_err(|e| SessionError::CorruptRecord(e.to_string()))?;
        let material = record
            .signing_key
            .as_ref()
            .ok_or_else(|| SessionError::CorruptRecord("missing signing key".into()))?;
        let key = EphemeralKey::import(material)
            .map_err(|e| SessionError::CorruptRecord(e.to_string()))?;
        if key.address() != record.signer {
            return Err(SessionError::CorruptRecord(format!(
                "signing key belongs to {}, record names {}",
                key.address(),
                record.signer
            )));
        }
        tracing::info!(
            session_id = %record.session_id,
            status = %record.status,
            nonce = record.nonce,
            balance = %record.balance,
            "Session restored"
        );
        let state = SessionState {
            status: record.status,
            session: Some(LiveSession {
                id: record.session_id,
                collateral: record.collateral,
                balance: record.balance,
                nonce: record.nonce,
                actions: record.actions,
                signer: record.signer,
                key: Some(key),
                pending_withdrawal: record.pending_withdrawal,
                withdrawal: record.withdrawal,
            }),
        };
        Ok(Self::with_state(store, signer, state))
    }

    /// Opens a new session over `collateral`.
    ///
    /// Locking the collateral on chain is the caller's job; this only starts
    /// the off-chain bookkeeping.
    pub async fn open(&self, collateral: Amount) -> Result<SessionView, SessionError> {
        let mut state = self.state.lock().await;
        state.ensure("open", &[SessionStatus::Idle])?;
        if collateral.is_zero() {
            return Err(SessionError::InvalidAmount);
        }
        self.ensure_settleable(collateral)?;

        let mut id = [0u8; 32];
        rand::rng().fill(&mut id);
        let key = self.keys.create();
        let session = LiveSession {
            id: SessionId::new(id),
            collateral,
            balance: collateral,
            nonce: 0,
            actions: Vec::new(),
            signer: key.address(),
            key: Some(key),
            pending_withdrawal: None,
            withdrawal: None,
        };
        self.store.save(&session.record(SessionStatus::Open))?;

        tracing::info!(session_id = %session.id, collateral = %collateral, signer = %session.signer, "Session opened");
        let view = session.view(SessionStatus::Open);
        state.status = SessionStatus::Open;
        state.session = Some(session);
        Ok(view)
    }

    /// Signs and records one metered action costing `cost`.
    ///
    /// Nothing changes unless the action is signed and persisted: a rejected
    /// signature leaves balance, nonce and log untouched.
    pub async fn record_action(
        &self,
        description: impl Into<String>,
        cost: Amount,
    ) -> Result<SignedAction, SessionError> {
        let mut state = self.state.lock().await;
        let session = state.live("record an action in", &[SessionStatus::Open])?;
        self.ensure_settleable(cost)?;

        let balance = session
            .balance
            .checked_sub(cost)
            .ok_or(SessionError::InsufficientBalance {
                requested: cost,
                available: session.balance,
            })?;
        let envelope = ActionEnvelope {
            session_id: session.id,
            description: description.into(),
            nonce: session.nonce,
        };

        let signed = match self
            .signer
            .sign_action(envelope, session.key.as_ref())
            .await
        {
            Ok(signed) => signed,
            Err(e) => {
                tracing::info!(session_id = %session.id, nonce = session.nonce, error = %e, "Action not signed");
                return Err(e.into());
            }
        };

        let entry = ActionRecord {
            nonce: session.nonce,
            description: signed.envelope.description.clone(),
            cost,
            signature: signed.signature.clone(),
            timestamp: UnixTimestamp::now(),
        };
        let mut record = session.record(SessionStatus::Open);
        record.actions.push(entry.clone());
        record.balance = balance;
        record.nonce += 1;
        self.store.save(&record)?;

        session.actions.push(entry);
        session.balance = balance;
        session.nonce += 1;
        tracing::info!(
            session_id = %session.id,
            nonce = signed.envelope.nonce,
            cost = %cost,
            balance = %balance,
            "Action recorded"
        );
        Ok(signed)
    }

    /// Starts closing the session and returns the numbers settlement works from.
    ///
    /// Calling it again while closing returns the same numbers.
    pub async fn begin_close(&self) -> Result<CloseSnapshot, SessionError> {
        let mut state = self.state.lock().await;
        let status = state.status;
        let session = state.live("close", &[SessionStatus::Open, SessionStatus::Closing])?;
        if status == SessionStatus::Open {
            self.store.save(&session.record(SessionStatus::Closing))?;
            tracing::info!(session_id = %session.id, spent = %session.spent(), "Session closing");
        }
        let snapshot = session.snapshot();
        state.status = SessionStatus::Closing;
        Ok(snapshot)
    }

    /// Ends a closing session: clears storage and wipes the key.
    pub async fn finalize_close(&self) -> Result<SessionView, SessionError> {
        if self.settlement_in_flight() {
            return Err(SessionError::SettlementInFlight);
        }
        self.finalize().await
    }

    /// Returns a closing session to open so it can keep spending.
    ///
    /// Refused once a collateral withdrawal has been submitted.
    pub async fn abort_close(&self) -> Result<SessionView, SessionError> {
        if self.settlement_in_flight() {
            return Err(SessionError::SettlementInFlight);
        }
        self.abort().await
    }

    /// Makes a closed manager ready for a new session.
    pub async fn reset(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        state.ensure("reset", &[SessionStatus::Closed])?;
        *state = SessionState::idle();
        Ok(())
    }

    /// Signs the current balance split with the session key.
    ///
    /// The user balance is what remains spendable, the server balance what has
    /// been spent; both are expressed in token base units.
    pub async fn sign_channel_state(&self) -> Result<SignedChannelState, SessionError> {
        let mut state = self.state.lock().await;
        let session = state.live(
            "sign the channel state of",
            &[SessionStatus::Open, SessionStatus::Closing],
        )?;
        let key = session
            .key
            .as_ref()
            .ok_or_else(|| SessionError::SigningUnavailable("session key missing".into()))?;
        let channel_state = ChannelState {
            session_id: session.id,
            nonce: session.nonce,
            user_balance: session.balance,
            server_balance: session.spent(),
        };
        let hash = self
            .signer
            .domain()
            .channel_state_signing_hash(&channel_state, self.token_decimals)
            .map_err(|e| SessionError::SigningUnavailable(e.to_string()))?;
        let signature = key
            .sign_hash(&hash)
            .await
            .map_err(|e| SessionError::SigningUnavailable(e.to_string()))?;
        Ok(SignedChannelState {
            state: channel_state,
            signature: Bytes::copy_from_slice(&signature.as_bytes()),
            signer: key.address(),
        })
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.lock().await.status
    }

    /// Summary of the current session; `None` while idle.
    pub async fn view(&self) -> Option<SessionView> {
        let state = self.state.lock().await;
        state.session.as_ref().map(|s| s.view(state.status))
    }

    /// The full action log, oldest first.
    pub async fn actions(&self) -> Vec<ActionRecord> {
        let state = self.state.lock().await;
        state
            .session
            .as_ref()
            .map(|s| s.actions.clone())
            .unwrap_or_default()
    }

    /// The latest `n` actions, newest first.
    pub async fn recent_actions(&self, n: usize) -> Vec<ActionRecord> {
        let state = self.state.lock().await;
        state
            .session
            .as_ref()
            .map(|s| s.actions.iter().rev().take(n).cloned().collect())
            .unwrap_or_default()
    }

    pub fn domain(&self) -> &SessionDomain {
        self.signer.domain()
    }

    pub fn settlement_in_flight(&self) -> bool {
        self.settling.load(Ordering::Acquire)
    }

    /// Claims the settlement slot, or `None` if an attempt is already running.
    pub fn try_begin_settlement(&self) -> Option<SettlementGuard> {
        self.settling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SettlementGuard {
                flag: self.settling.clone(),
            })
    }

    /// Snapshot of a closing session, without transitioning.
    pub(crate) async fn closing_snapshot(
        &self,
        _guard: &SettlementGuard,
    ) -> Result<CloseSnapshot, SessionError> {
        let mut state = self.state.lock().await;
        let session = state.live("resume settlement of", &[SessionStatus::Closing])?;
        Ok(session.snapshot())
    }

    /// Records the submitted collateral withdrawal of the current close attempt.
    ///
    /// The transaction is already on its way, so it is kept in memory even if
    /// persisting it fails; the error is still returned.
    pub(crate) async fn record_withdrawal_submitted(
        &self,
        _guard: &SettlementGuard,
        tx_hash: TxHash,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        let session = state.live("record a withdrawal for", &[SessionStatus::Closing])?;
        session.pending_withdrawal = Some(tx_hash);
        self.store.save(&session.record(SessionStatus::Closing))?;
        Ok(())
    }

    /// Records the confirmed collateral withdrawal of the current close attempt.
    ///
    /// Kept in memory even if persisting it fails, like the submission.
    pub(crate) async fn record_withdrawal(
        &self,
        _guard: &SettlementGuard,
        tx_hash: TxHash,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        let session = state.live("record a withdrawal for", &[SessionStatus::Closing])?;
        session.pending_withdrawal = None;
        session.withdrawal = Some(tx_hash);
        self.store.save(&session.record(SessionStatus::Closing))?;
        Ok(())
    }

    pub(crate) async fn finalize_settled(
        &self,
        _guard: &SettlementGuard,
    ) -> Result<SessionView, SessionError> {
        self.finalize().await
    }

    pub(crate) async fn abort_settlement(
        &self,
        _guard: &SettlementGuard,
    ) -> Result<SessionView, SessionError> {
        self.abort().await
    }

    async fn finalize(&self) -> Result<SessionView, SessionError> {
        let mut state = self.state.lock().await;
        let session = state.live("finalize", &[SessionStatus::Closing])?;
        self.store.clear()?;
        if let Some(key) = session.key.take() {
            self.keys.destroy(key);
        }
        tracing::info!(session_id = %session.id, spent = %session.spent(), "Session closed");
        let view = session.view(SessionStatus::Closed);
        state.status = SessionStatus::Closed;
        Ok(view)
    }

    async fn abort(&self) -> Result<SessionView, SessionError> {
        let mut state = self.state.lock().await;
        let session = state.live("abort closing", &[SessionStatus::Closing])?;
        if session.withdrawal.is_some() {
            return Err(SessionError::CollateralReleased);
        }
        if let Some(tx_hash) = session.pending_withdrawal {
            return Err(SessionError::WithdrawalPending(tx_hash));
        }
        self.store.save(&session.record(SessionStatus::Open))?;
        tracing::info!(session_id = %session.id, "Session reopened");
        let view = session.view(SessionStatus::Open);
        state.status = SessionStatus::Open;
        Ok(view)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::signer::{DualSigner, NoWallet, SigningError, recover_action_signer};
    use crate::store::{MemorySessionStore, StoreError};
    use async_trait::async_trait;
    use sessionsafe_chain_eip155::{KnownSessionSafe, recover_signer};
    use std::sync::atomic::AtomicUsize;

    pub(crate) fn amount(s: &str) -> Amount {
        Amount::parse(s).unwrap()
    }

    pub(crate) fn manager() -> SessionManager<Arc<MemorySessionStore>, DualSigner<NoWallet>> {
        SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            DualSigner::new(SessionDomain::sepolia(), NoWallet),
        )
    }

    /// Rejects every request, like a user dismissing the wallet popup.
    struct RejectingSigner {
        domain: SessionDomain,
    }

    #[async_trait]
    impl ActionSigner for RejectingSigner {
        fn domain(&self) -> &SessionDomain {
            &self.domain
        }

        async fn sign_action(
            &self,
            _envelope: ActionEnvelope,
            _key: Option<&EphemeralKey>,
        ) -> Result<SignedAction, SigningError> {
            Err(SigningError::Rejected)
        }
    }

    /// Store that fails every write after the first `allowed` saves.
    struct FlakyStore {
        inner: MemorySessionStore,
        allowed: usize,
        saves: AtomicUsize,
    }

    impl SessionStore for FlakyStore {
        fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
            if self.saves.fetch_add(1, Ordering::SeqCst) >= self.allowed {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.inner.save(record)
        }

        fn load(&self) -> Result<Option<SessionRecord>, StoreError> {
            self.inner.load()
        }

        fn clear(&self) -> Result<(), StoreError> {
            self.inner.clear()
        }
    }

    #[tokio::test]
    async fn test_three_chat_messages() {
        let manager = manager();
        manager.open(amount("100.00")).await.unwrap();
        for _ in 0..3 {
            manager
                .record_action("Chat Message", amount("0.02"))
                .await
                .unwrap();
        }
        let view = manager.view().await.unwrap();
        assert_eq!(view.balance, amount("99.94"));
        assert_eq!(view.spent, amount("0.06"));
        assert_eq!(view.nonce, 3);
        assert_eq!(manager.actions().await.len(), 3);
    }

    #[tokio::test]
    async fn test_rejection_changes_nothing() {
        let store = Arc::new(MemorySessionStore::new());
        let manager = SessionManager::new(
            store.clone(),
            RejectingSigner {
                domain: SessionDomain::sepolia(),
            },
        );
        manager.open(amount("10.00")).await.unwrap();
        let before = store.load().unwrap();

        let result = manager.record_action("MOVE: e4", amount("0.05")).await;
        assert!(matches!(result, Err(SessionError::SigningRejected)));

        let view = manager.view().await.unwrap();
        assert_eq!(view.balance, amount("10.00"));
        assert_eq!(view.nonce, 0);
        assert!(manager.actions().await.is_empty());
        assert_eq!(store.load().unwrap(), before);
    }

    #[tokio::test]
    async fn test_insufficient_balance() {
        let manager = manager();
        manager.open(amount("1.00")).await.unwrap();
        manager.record_action("Trade", amount("0.60")).await.unwrap();
        let result = manager.record_action("Trade", amount("0.60")).await;
        match result {
            Err(SessionError::InsufficientBalance {
                requested,
                available,
            }) => {
                assert_eq!(requested, amount("0.60"));
                assert_eq!(available, amount("0.40"));
            }
            other => panic!("unexpected {other:?}"),
        }
        // Spending the exact remainder is allowed.
        manager.record_action("Trade", amount("0.40")).await.unwrap();
        assert_eq!(manager.view().await.unwrap().balance, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_zero_cost_action_consumes_nonce() {
        let manager = manager();
        manager.open(amount("5")).await.unwrap();
        let signed = manager.record_action("Ping", Amount::ZERO).await.unwrap();
        assert_eq!(signed.envelope.nonce, 0);
        let view = manager.view().await.unwrap();
        assert_eq!(view.nonce, 1);
        assert_eq!(view.balance, amount("5"));
    }

    #[tokio::test]
    async fn test_open_rejects_zero_collateral() {
        let manager = manager();
        let result = manager.open(Amount::ZERO).await;
        assert!(matches!(result, Err(SessionError::InvalidAmount)));
        assert_eq!(manager.status().await, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_open_only_from_idle() {
        let manager = manager();
        manager.open(amount("10")).await.unwrap();
        let result = manager.open(amount("10")).await;
        assert!(matches!(
            result,
            Err(SessionError::InvalidTransition {
                status: SessionStatus::Open,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_actions_refused_outside_open() {
        let manager = manager();
        assert!(matches!(
            manager.record_action("x", amount("0.01")).await,
            Err(SessionError::InvalidTransition {
                status: SessionStatus::Idle,
                ..
            })
        ));
        manager.open(amount("10")).await.unwrap();
        manager.begin_close().await.unwrap();
        assert!(matches!(
            manager.record_action("x", amount("0.01")).await,
            Err(SessionError::InvalidTransition {
                status: SessionStatus::Closing,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_signatures_recover_to_session_key() {
        let manager = manager();
        let view = manager.open(amount("10")).await.unwrap();
        let signed = manager.record_action("API Call", amount("0.01")).await.unwrap();
        assert_eq!(signed.signer, view.signer);
        let recovered =
            recover_action_signer(manager.domain(), &signed.envelope, &signed.signature).unwrap();
        assert_eq!(recovered, view.signer);
        assert_eq!(manager.actions().await[0].signature, signed.signature);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_actions_get_distinct_nonces() {
        let manager = Arc::new(manager());
        manager.open(amount("100")).await.unwrap();

        let handles = (0..20)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .record_action(format!("API Call {i}"), amount("0.25"))
                        .await
                })
            })
            .collect::<Vec<_>>();
        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap().unwrap().envelope.nonce);
        }
        nonces.sort_unstable();
        assert_eq!(nonces, (0..20).collect::<Vec<u64>>());

        let actions = manager.actions().await;
        for (i, action) in actions.iter().enumerate() {
            assert_eq!(action.nonce, i as u64);
        }
        assert_eq!(manager.view().await.unwrap().balance, amount("95"));
    }

    #[tokio::test]
    async fn test_recent_actions_newest_first() {
        let manager = manager();
        manager.open(amount("10")).await.unwrap();
        for i in 0..5 {
            manager
                .record_action(format!("Message {i}"), amount("0.01"))
                .await
                .unwrap();
        }
        let recent = manager.recent_actions(2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].description, "Message 4");
        assert_eq!(recent[1].description, "Message 3");
        assert_eq!(manager.recent_actions(50).await.len(), 5);
    }

    #[tokio::test]
    async fn test_begin_close_is_idempotent() {
        let manager = manager();
        manager.open(amount("50.00")).await.unwrap();
        manager.record_action("Trade", amount("12.34")).await.unwrap();

        let first = manager.begin_close().await.unwrap();
        assert_eq!(first.collateral, amount("50.00"));
        assert_eq!(first.balance, amount("37.66"));
        assert_eq!(first.spent, amount("12.34"));
        assert_eq!(manager.begin_close().await.unwrap(), first);
        assert_eq!(manager.status().await, SessionStatus::Closing);
    }

    #[tokio::test]
    async fn test_abort_close_reopens() {
        let manager = manager();
        manager.open(amount("10")).await.unwrap();
        manager.begin_close().await.unwrap();
        let view = manager.abort_close().await.unwrap();
        assert_eq!(view.status, SessionStatus::Open);
        manager.record_action("More", amount("1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_finalize_and_reset() {
        let store = Arc::new(MemorySessionStore::new());
        let manager = SessionManager::new(
            store.clone(),
            DualSigner::new(SessionDomain::sepolia(), NoWallet),
        );
        assert!(matches!(
            manager.finalize_close().await,
            Err(SessionError::InvalidTransition { .. })
        ));
        manager.open(amount("10")).await.unwrap();
        manager.record_action("x", amount("2")).await.unwrap();
        manager.begin_close().await.unwrap();

        let view = manager.finalize_close().await.unwrap();
        assert_eq!(view.status, SessionStatus::Closed);
        assert_eq!(view.spent, amount("2"));
        assert!(store.load().unwrap().is_none());
        assert!(matches!(
            manager.sign_channel_state().await,
            Err(SessionError::InvalidTransition { .. })
        ));
        assert!(matches!(
            manager.begin_close().await,
            Err(SessionError::InvalidTransition { .. })
        ));

        manager.reset().await.unwrap();
        assert_eq!(manager.status().await, SessionStatus::Idle);
        assert!(manager.view().await.is_none());
        let next = manager.open(amount("3")).await.unwrap();
        assert_ne!(next.session_id, view.session_id);
        assert_ne!(next.signer, view.signer);
    }

    #[tokio::test]
    async fn test_in_flight_settlement_blocks_close_operations() {
        let manager = manager();
        manager.open(amount("10")).await.unwrap();
        manager.begin_close().await.unwrap();

        let guard = manager.try_begin_settlement().unwrap();
        assert!(manager.try_begin_settlement().is_none());
        assert!(matches!(
            manager.finalize_close().await,
            Err(SessionError::SettlementInFlight)
        ));
        assert!(matches!(
            manager.abort_close().await,
            Err(SessionError::SettlementInFlight)
        ));
        drop(guard);
        assert!(!manager.settlement_in_flight());
        manager.abort_close().await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_refused_after_withdrawal() {
        let manager = manager();
        manager.open(amount("10")).await.unwrap();
        manager.begin_close().await.unwrap();
        {
            let guard = manager.try_begin_settlement().unwrap();
            manager
                .record_withdrawal(&guard, TxHash::repeat_byte(0xaa))
                .await
                .unwrap();
        }
        assert!(matches!(
            manager.abort_close().await,
            Err(SessionError::CollateralReleased)
        ));
        assert_eq!(
            manager.begin_close().await.unwrap().withdrawal,
            Some(TxHash::repeat_byte(0xaa))
        );
    }

    #[tokio::test]
    async fn test_abort_refused_while_withdrawal_pending() {
        let store = Arc::new(MemorySessionStore::new());
        let signer = || DualSigner::new(SessionDomain::sepolia(), NoWallet);
        let manager = SessionManager::new(store.clone(), signer());
        manager.open(amount("10")).await.unwrap();
        manager.begin_close().await.unwrap();
        {
            let guard = manager.try_begin_settlement().unwrap();
            manager
                .record_withdrawal_submitted(&guard, TxHash::repeat_byte(0xbb))
                .await
                .unwrap();
        }
        assert!(matches!(
            manager.abort_close().await,
            Err(SessionError::WithdrawalPending(tx)) if tx == TxHash::repeat_byte(0xbb)
        ));

        let restored = SessionManager::restore(store, signer()).unwrap();
        let snapshot = restored.begin_close().await.unwrap();
        assert_eq!(snapshot.pending_withdrawal, Some(TxHash::repeat_byte(0xbb)));
        assert_eq!(snapshot.withdrawal, None);
    }

    #[tokio::test]
    async fn test_amounts_finer_than_token_are_refused() {
        let store = Arc::new(MemorySessionStore::new());
        let manager = SessionManager::new(
            store.clone(),
            RejectingSigner {
                domain: SessionDomain::sepolia(),
            },
        );
        assert!(matches!(
            manager.open(amount("1.0000001")).await,
            Err(SessionError::AmountNotRepresentable(_))
        ));
        assert_eq!(manager.status().await, SessionStatus::Idle);

        manager.open(amount("10.000000")).await.unwrap();
        let before = store.load().unwrap();
        // Checked before signing: the rejecting signer is never reached.
        assert!(matches!(
            manager.record_action("Chat", amount("0.0000001")).await,
            Err(SessionError::AmountNotRepresentable(_))
        ));
        let view = manager.view().await.unwrap();
        assert_eq!(view.nonce, 0);
        assert_eq!(view.balance, amount("10"));
        assert_eq!(store.load().unwrap(), before);
    }

    #[tokio::test]
    async fn test_token_decimals_bound_precision() {
        let manager = manager().with_token_decimals(18);
        assert_eq!(manager.token_decimals(), 18);
        manager.open(amount("10")).await.unwrap();
        manager
            .record_action("Chat", amount("0.0000001"))
            .await
            .unwrap();
        assert_eq!(
            manager.view().await.unwrap().spent,
            amount("0.0000001")
        );
    }

    #[tokio::test]
    async fn test_persistence_failure_leaves_state() {
        let store = FlakyStore {
            inner: MemorySessionStore::new(),
            allowed: 2,
            saves: AtomicUsize::new(0),
        };
        let manager =
            SessionManager::new(store, DualSigner::new(SessionDomain::sepolia(), NoWallet));
        manager.open(amount("10")).await.unwrap();
        manager.record_action("ok", amount("1")).await.unwrap();

        let result = manager.record_action("lost", amount("1")).await;
        assert!(matches!(result, Err(SessionError::Persistence(_))));
        let view = manager.view().await.unwrap();
        assert_eq!(view.balance, amount("9"));
        assert_eq!(view.nonce, 1);

        assert!(manager.begin_close().await.is_err());
        assert_eq!(manager.status().await, SessionStatus::Open);
    }

    #[tokio::test]
    async fn test_restore_rebuilds_session() {
        let store = Arc::new(MemorySessionStore::new());
        let signer = || DualSigner::new(SessionDomain::sepolia(), NoWallet);
        let original = SessionManager::new(store.clone(), signer());
        original.open(amount("20.00")).await.unwrap();
        original.record_action("API Call", amount("0.50")).await.unwrap();
        original.record_action("API Call", amount("0.25")).await.unwrap();
        let before = original.view().await.unwrap();
        let actions = original.actions().await;
        drop(original);

        let restored = SessionManager::restore(store.clone(), signer()).unwrap();
        assert_eq!(restored.view().await.unwrap(), before);
        assert_eq!(restored.actions().await, actions);

        let signed = restored.record_action("API Call", amount("0.25")).await.unwrap();
        assert_eq!(signed.envelope.nonce, 2);
        assert_eq!(signed.signer, before.signer);
    }

    #[tokio::test]
    async fn test_restore_closing_session() {
        let store = Arc::new(MemorySessionStore::new());
        let signer = || DualSigner::new(SessionDomain::sepolia(), NoWallet);
        let original = SessionManager::new(store.clone(), signer());
        original.open(amount("5")).await.unwrap();
        let snapshot = original.begin_close().await.unwrap();
        drop(original);

        let restored = SessionManager::restore(store, signer()).unwrap();
        assert_eq!(restored.status().await, SessionStatus::Closing);
        assert_eq!(restored.begin_close().await.unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_restore_empty_store_is_idle() {
        let manager = SessionManager::restore(
            MemorySessionStore::new(),
            DualSigner::new(SessionDomain::sepolia(), NoWallet),
        )
        .unwrap();
        assert_eq!(manager.status().await, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_restore_clears_closed_record() {
        let store = Arc::new(MemorySessionStore::new());
        let original = SessionManager::new(
            store.clone(),
            DualSigner::new(SessionDomain::sepolia(), NoWallet),
        );
        original.open(amount("5")).await.unwrap();
        let mut record = store.load().unwrap().unwrap();
        record.status = SessionStatus::Closed;
        store.save(&record).unwrap();

        let restored = SessionManager::restore(
            store.clone(),
            DualSigner::new(SessionDomain::sepolia(), NoWallet),
        )
        .unwrap();
        assert_eq!(restored.status().await, SessionStatus::Idle);
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_rejects_tampered_balance() {
        let store = Arc::new(MemorySessionStore::new());
        let original = SessionManager::new(
            store.clone(),
            DualSigner::new(SessionDomain::sepolia(), NoWallet),
        );
        original.open(amount("5")).await.unwrap();
        original.record_action("x", amount("1")).await.unwrap();
        let mut record = store.load().unwrap().unwrap();
        record.balance = amount("5");
        store.save(&record).unwrap();

        let result = SessionManager::restore(
            store,
            DualSigner::new(SessionDomain::sepolia(), NoWallet),
        );
        assert!(matches!(result, Err(SessionError::CorruptRecord(_))));
    }

    #[tokio::test]
    async fn test_restore_rejects_foreign_key() {
        let store = Arc::new(MemorySessionStore::new());
        let original = SessionManager::new(
            store.clone(),
            DualSigner::new(SessionDomain::sepolia(), NoWallet),
        );
        original.open(amount("5")).await.unwrap();
        let mut record = store.load().unwrap().unwrap();
        record.signer = Address::repeat_byte(0x99);
        store.save(&record).unwrap();

        let result = SessionManager::restore(
            store,
            DualSigner::new(SessionDomain::sepolia(), NoWallet),
        );
        assert!(matches!(result, Err(SessionError::CorruptRecord(_))));
    }

    #[tokio::test]
    async fn test_channel_state_signature() {
        let manager = manager();
        let view = manager.open(amount("10.00")).await.unwrap();
        manager.record_action("Chat Message", amount("0.02")).await.unwrap();

        let signed = manager.sign_channel_state().await.unwrap();
        assert_eq!(signed.state.nonce, 1);
        assert_eq!(signed.state.user_balance, amount("9.98"));
        assert_eq!(signed.state.server_balance, amount("0.02"));
        assert_eq!(signed.signer, view.signer);

        let hash = manager
            .domain()
            .channel_state_signing_hash(&signed.state, DEFAULT_TOKEN_DECIMALS)
            .unwrap();
        assert_eq!(recover_signer(&hash, &signed.signature).unwrap(), view.signer);
        // Signing does not touch the session.
        assert_eq!(manager.view().await.unwrap().nonce, 1);
    }
}
