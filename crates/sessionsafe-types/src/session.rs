//! Session identity, status and the persisted session record.
//!
//! [`SessionRecord`] is the single snapshot written by the session manager on
//! every transition. It is deliberately flat and versioned so a restarted
//! process can rebuild the exact state, and [`SessionRecord::validate`] checks
//! the bookkeeping invariants before a record is trusted.

use alloy_primitives::{Address, B256, Bytes, TxHash, hex};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use zeroize::Zeroizing;

use crate::amount::Amount;
use crate::timestamp::UnixTimestamp;

/// Opaque 32-byte session identifier, rendered as `0x`-prefixed hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(B256);

impl SessionId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(B256::from(bytes))
    }

    pub fn as_b256(&self) -> B256 {
        self.0
    }
}

impl From<B256> for SessionId {
    fn from(value: B256) -> Self {
        Self(value)
    }
}

impl FromStr for SessionId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        B256::from_str(s).map(Self)
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Idle,
    Open,
    Closing,
    Closed,
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Open => "open",
            SessionStatus::Closing => "closing",
            SessionStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One entry of the append-only action log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    /// Nonce the action was signed under; equals its index in the log.
    pub nonce: u64,
    pub description: String,
    pub cost: Amount,
    /// Signature over the action envelope (65 bytes for secp256k1).
    pub signature: Bytes,
    pub timestamp: UnixTimestamp,
}

/// The message every metered action is authorised by.
///
/// The counterparty accepts an envelope only if its nonce is exactly one
/// greater than the last nonce it saw for the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEnvelope {
    pub session_id: SessionId,
    pub description: String,
    pub nonce: u64,
}

/// Balance split of a session as of `nonce` signed actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelState {
    pub session_id: SessionId,
    pub nonce: u64,
    /// What remains spendable by the user.
    pub user_balance: Amount,
    /// What the counterparty has earned so far.
    pub server_balance: Amount,
}

/// Raw 32-byte private key material for a session's ephemeral key.
///
/// Zeroed on drop, hex-encoded on the wire, never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial(Zeroizing<[u8; 32]>);

impl KeyMaterial {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Debug for KeyMaterial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

impl Serialize for KeyMaterial {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(hex::encode_prefixed(self.0.as_slice()));
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for KeyMaterial {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Zeroizing::new(String::deserialize(deserializer)?);
        let mut bytes = Zeroizing::new([0u8; 32]);
        let digits = s.strip_prefix("0x").unwrap_or(s.as_str());
        hex::decode_to_slice(digits, bytes.as_mut_slice())
            .map_err(|_| serde::de::Error::custom("key material must be 32 hex-encoded bytes"))?;
        Ok(KeyMaterial(bytes))
    }
}

/// Persisted snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub version: u32,
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub collateral: Amount,
    pub balance: Amount,
    pub nonce: u64,
    pub actions: Vec<ActionRecord>,
    /// Address of the session's ephemeral key.
    pub signer: Address,
    /// Present only while the session is not closed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<KeyMaterial>,
    /// Submitted but not yet confirmed collateral withdrawal. A restarted
    /// process confirms this transaction instead of submitting another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_withdrawal: Option<TxHash>,
    /// Confirmed collateral withdrawal of the current close attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub withdrawal: Option<TxHash>,
}

/// A persisted record whose bookkeeping does not add up.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordInvariantError {
    #[error("Unsupported record version {0}")]
    UnsupportedVersion(u32),
    #[error("Nonce {nonce} does not match {actions} logged actions")]
    NonceMismatch { nonce: u64, actions: usize },
    #[error("Action at position {position} carries nonce {nonce}")]
    OutOfOrderAction { position: usize, nonce: u64 },
    #[error("Balance {balance} plus logged costs {spent} does not equal collateral {collateral}")]
    BalanceMismatch {
        collateral: Amount,
        balance: Amount,
        spent: Amount,
    },
    #[error("Session in status {0} has no signing key")]
    MissingSigningKey(SessionStatus),
    #[error("Session in status {0} cannot carry a withdrawal")]
    UnexpectedWithdrawal(SessionStatus),
    #[error("Records are only kept for open or closing sessions, found {0}")]
    UnexpectedStatus(SessionStatus),
}

impl SessionRecord {
    pub const CURRENT_VERSION: u32 = 1;

    /// Amount spent so far: `collateral - balance`.
    pub fn spent(&self) -> Amount {
        self.collateral.checked_sub(self.balance).unwrap_or_default()
    }

    /// Checks every bookkeeping invariant of a live session record.
    pub fn validate(&self) -> Result<(), RecordInvariantError> {
        if self.version != Self::CURRENT_VERSION {
            return Err(RecordInvariantError::UnsupportedVersion(self.version));
        }
        if !matches!(self.status, SessionStatus::Open | SessionStatus::Closing) {
            return Err(RecordInvariantError::UnexpectedStatus(self.status));
        }
        if self.signing_key.is_none() {
            return Err(RecordInvariantError::MissingSigningKey(self.status));
        }
        let withdrawing = self.withdrawal.is_some() || self.pending_withdrawal.is_some();
        if withdrawing && self.status != SessionStatus::Closing {
            return Err(RecordInvariantError::UnexpectedWithdrawal(self.status));
        }
        if self.nonce != self.actions.len() as u64 {
            return Err(RecordInvariantError::NonceMismatch {
                nonce: self.nonce,
                actions: self.actions.len(),
            });
        }
        let mut spent = Amount::ZERO;
        for (position, action) in self.actions.iter().enumerate() {
            if action.nonce != position as u64 {
                return Err(RecordInvariantError::OutOfOrderAction {
                    position,
                    nonce: action.nonce,
                });
            }
            spent = spent.checked_add(action.cost).ok_or(
                RecordInvariantError::BalanceMismatch {
                    collateral: self.collateral,
                    balance: self.balance,
                    spent,
                },
            )?;
        }
        let adds_up = self
            .balance
            .checked_add(spent)
            .is_some_and(|total| total == self.collateral);
        if !adds_up {
            return Err(RecordInvariantError::BalanceMismatch {
                collateral: self.collateral,
                balance: self.balance,
                spent,
            });
        }
        Ok(())
    }
}
