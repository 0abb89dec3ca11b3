//! Chain and token identifiers for EVM networks.

use alloy_primitives::{Address, U256};
use sessionsafe_types::amount::{Amount, AmountParseError};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// The CAIP-2 namespace for EVM-compatible chains.
pub const EIP155_NAMESPACE: &str = "eip155";

/// A numeric chain ID for EVM-compatible networks.
///
/// ```
/// use sessionsafe_chain_eip155::chain::Eip155ChainReference;
///
/// let sepolia = Eip155ChainReference::new(11155111);
/// assert_eq!(sepolia.as_caip2(), "eip155:11155111");
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Eip155ChainReference(u64);

impl Eip155ChainReference {
    /// Creates a new chain reference from a numeric chain ID.
    pub fn new(chain_id: u64) -> Self {
        Self(chain_id)
    }

    /// Returns the numeric chain ID.
    pub fn inner(&self) -> u64 {
        self.0
    }

    pub fn as_caip2(&self) -> String {
        format!("{EIP155_NAMESPACE}:{}", self.0)
    }
}

impl Display for Eip155ChainReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Information about a token deployment on an EVM chain.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip155TokenDeployment {
    /// The chain this token is deployed on.
    pub chain_reference: Eip155ChainReference,
    /// The token contract address.
    pub address: Address,
    /// Number of decimal places for the token (e.g., 6 for USDC, 18 for most ERC-20s).
    pub decimals: u8,
}

impl Eip155TokenDeployment {
    /// Converts a human-readable amount into token base units.
    ///
    /// Fails if `amount` carries more fractional digits than the token supports.
    pub fn base_units(&self, amount: Amount) -> Result<U256, AmountParseError> {
        amount.to_base_units(self.decimals).map(U256::from)
    }
}
