//! EVM chain plumbing for session settlement.
//!
//! # Key Types
//!
//! - [`Eip155ChainReference`] - A numeric chain ID for EVM networks (e.g., `11155111` for Sepolia)
//! - [`Eip155TokenDeployment`] - The collateral token: address and decimals
//! - [`Eip155SettlementProvider`] - Submits and confirms the two settlement transactions
//!   (`settlement` feature)

#[cfg(feature = "settlement")]
pub mod config;

#[cfg(feature = "settlement")]
pub mod provider;
#[cfg(feature = "settlement")]
pub use provider::*;

pub mod contracts;

pub mod types;
pub use types::*;
