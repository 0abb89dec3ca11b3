//! Settlement configuration for an EVM chain.
//!
//! ```json
//! {
//!   "chainId": 11155111,
//!   "rpc": [{ "http": "https://ethereum-sepolia-rpc.publicnode.com", "rateLimit": 10 }],
//!   "signer": "$USER_WALLET_KEY",
//!   "custodyContract": "0x4e4E5c6c5A5ED45D437FAf7279fAC23D24e48890",
//!   "token": "0x6dE0e73966474a1564d5E582e833E7B296a46D1F",
//!   "tokenDecimals": 6,
//!   "counterparty": "$COUNTERPARTY_ADDRESS"
//! }
//! ```

use alloy_primitives::{Address, B256};
use serde::Deserialize;
use sessionsafe_types::config::{LiteralOrEnv, RpcConfig};
use std::fmt::{Debug, Formatter};
use std::str::FromStr;

use crate::chain::{Eip155ChainReference, Eip155TokenDeployment};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip155SettlementConfig {
    pub chain_id: Eip155ChainReference,
    /// RPC endpoints, tried in order with fallback.
    pub rpc: Vec<RpcConfig>,
    /// The user's wallet key; it owns the collateral and pays the fee.
    pub signer: LiteralOrEnv<EvmPrivateKey>,
    /// SessionSafe custody contract holding the collateral.
    pub custody_contract: Address,
    /// Collateral token contract.
    pub token: Address,
    #[serde(default = "eip155_settlement_config::default_token_decimals")]
    pub token_decimals: u8,
    /// Receiver of the session fee.
    pub counterparty: LiteralOrEnv<Address>,
    /// Whether the chain supports EIP-1559 gas pricing.
    #[serde(default = "eip155_settlement_config::default_eip1559")]
    pub eip1559: bool,
    /// Block confirmations required before a phase counts as confirmed.
    #[serde(default = "eip155_settlement_config::default_confirmations")]
    pub confirmations: u64,
    /// How long to wait till the transaction receipt is available.
    #[serde(default = "eip155_settlement_config::default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
}

impl Eip155SettlementConfig {
    pub fn token_deployment(&self) -> Eip155TokenDeployment {
        Eip155TokenDeployment {
            chain_reference: self.chain_id,
            address: self.token,
            decimals: self.token_decimals,
        }
    }
}

mod eip155_settlement_config {
    pub fn default_token_decimals() -> u8 {
        6
    }
    pub fn default_eip1559() -> bool {
        true
    }
    pub fn default_confirmations() -> u64 {
        1
    }
    pub fn default_receipt_timeout_secs() -> u64 {
        30
    }
}

/// A validated EVM private key (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EvmPrivateKey(B256);

impl EvmPrivateKey {
    /// Get the raw 32 bytes of the private key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_ref()
    }
}

impl Debug for EvmPrivateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("EvmPrivateKey(..)")
    }
}

impl FromStr for EvmPrivateKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        B256::from_str(s)
            .map(Self)
            .map_err(|e| format!("Invalid evm private key: {}", e))
    }
}
