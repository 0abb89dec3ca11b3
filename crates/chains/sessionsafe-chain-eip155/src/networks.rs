//! Well-known SessionSafe deployments.

use alloy_primitives::{Address, address};

use crate::chain::{Eip155ChainReference, Eip155TokenDeployment};
use crate::typed_data::SessionDomain;

/// EIP-712 protocol name mixed into every session signature.
pub const SESSION_PROTOCOL_NAME: &str = "YellowSession";
/// EIP-712 protocol version.
pub const SESSION_PROTOCOL_VERSION: &str = "1";

/// SessionSafe custody contract on Sepolia.
pub const SEPOLIA_SESSION_SAFE: Address = address!("0x4e4E5c6c5A5ED45D437FAf7279fAC23D24e48890");
/// Mock USDC token on Sepolia.
pub const SEPOLIA_MOCK_USDC: Address = address!("0x6dE0e73966474a1564d5E582e833E7B296a46D1F");

/// Per-network instances of a type for networks SessionSafe is deployed on.
///
/// ```
/// use sessionsafe_chain_eip155::{KnownSessionSafe, SessionDomain};
///
/// let domain = SessionDomain::sepolia();
/// assert_eq!(domain.chain_id, 11155111);
/// ```
pub trait KnownSessionSafe<A = Self> {
    /// Returns the instance for Ethereum Sepolia (eip155:11155111)
    fn sepolia() -> A;
}

impl KnownSessionSafe for Eip155ChainReference {
    fn sepolia() -> Self {
        Eip155ChainReference::new(11155111)
    }
}

impl KnownSessionSafe for SessionDomain {
    fn sepolia() -> Self {
        SessionDomain {
            name: SESSION_PROTOCOL_NAME.to_string(),
            version: SESSION_PROTOCOL_VERSION.to_string(),
            chain_id: Eip155ChainReference::sepolia().inner(),
            verifying_contract: SEPOLIA_SESSION_SAFE,
        }
    }
}

/// The collateral token. Mock USDC uses 6 decimals.
impl KnownSessionSafe for Eip155TokenDeployment {
    fn sepolia() -> Self {
        Eip155TokenDeployment {
            chain_reference: Eip155ChainReference::sepolia(),
            address: SEPOLIA_MOCK_USDC,
            decimals: 6,
        }
    }
}
