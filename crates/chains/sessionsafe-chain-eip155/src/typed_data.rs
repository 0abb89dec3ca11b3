//! EIP-712 typed data for metered actions and channel state proofs.
//!
//! Every signed payload mixes in a [`SessionDomain`] (protocol name, version,
//! numeric chain id and verifying contract), so a signature produced for one
//! session, protocol or network cannot be replayed against another.
//!
//! The typed structs are:
//!
//! ```text
//! MeteredAction(bytes32 sessionId,string description,uint256 nonce)
//! ChannelState(bytes32 sessionId,uint256 nonce,uint256 userBalance,uint256 serverBalance)
//! ```

use alloy_primitives::{Address, B256, U256};
use alloy_sol_types::{Eip712Domain, SolStruct, eip712_domain, sol};
use serde::{Deserialize, Serialize};
use sessionsafe_types::amount::AmountParseError;
use sessionsafe_types::session::{self, ActionEnvelope};

sol!(
    /// Solidity-compatible struct for a single metered action.
    ///
    /// The counterparty reconstructs this struct from the envelope it receives
    /// to verify the signature, so field order and types are part of the wire format.
    #[derive(Debug)]
    struct MeteredAction {
        bytes32 sessionId;
        string description;
        uint256 nonce;
    }

    /// Balance split of a session, signed as a proof of the off-chain state.
    #[derive(Debug)]
    struct ChannelState {
        bytes32 sessionId;
        uint256 nonce;
        uint256 userBalance;
        uint256 serverBalance;
    }
);

/// EIP-712 domain parameters for session signatures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDomain {
    /// Protocol name, e.g. `"YellowSession"`.
    pub name: String,
    /// Protocol version, e.g. `"1"`.
    pub version: String,
    /// Numeric EIP-155 chain id.
    pub chain_id: u64,
    /// The counterparty contract that verifies signatures.
    pub verifying_contract: Address,
}

impl SessionDomain {
    pub fn eip712(&self) -> Eip712Domain {
        eip712_domain! {
            name: self.name.clone(),
            version: self.version.clone(),
            chain_id: self.chain_id,
            verifying_contract: self.verifying_contract,
        }
    }

    /// Digest the signer commits to for a metered action.
    pub fn action_signing_hash(&self, envelope: &ActionEnvelope) -> B256 {
        let action = MeteredAction {
            sessionId: envelope.session_id.as_b256(),
            description: envelope.description.clone(),
            nonce: U256::from(envelope.nonce),
        };
        action.eip712_signing_hash(&self.eip712())
    }

    /// Digest the signer commits to for a channel state proof.
    ///
    /// Balances are expressed in base units of a token with `decimals` places.
    pub fn channel_state_signing_hash(
        &self,
        state: &session::ChannelState,
        decimals: u8,
    ) -> Result<B256, AmountParseError> {
        let sol_state = ChannelState {
            sessionId: state.session_id.as_b256(),
            nonce: U256::from(state.nonce),
            userBalance: U256::from(state.user_balance.to_base_units(decimals)?),
            serverBalance: U256::from(state.server_balance.to_base_units(decimals)?),
        };
        Ok(sol_state.eip712_signing_hash(&self.eip712()))
    }
}
