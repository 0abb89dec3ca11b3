//! Configuration loading.
//!
//! The configuration is a JSON file whose path comes from `SESSIONSAFE_CONFIG`
//! (default `sessionsafe.json`). A `.env` file is loaded first, so any value
//! written as `$VAR` or `${VAR}` can come from either place.
//!
//! ```json
//! {
//!   "storage": { "path": "./data/session.json" },
//!   "domain": {
//!     "name": "YellowSession",
//!     "version": "1",
//!     "chainId": 11155111,
//!     "verifyingContract": "0x4e4E5c6c5A5ED45D437FAf7279fAC23D24e48890"
//!   },
//!   "chain": {
//!     "chainId": 11155111,
//!     "rpc": [{ "http": "$SEPOLIA_RPC_URL", "rateLimit": 10 }],
//!     "signer": "$USER_WALLET_KEY",
//!     "custodyContract": "0x4e4E5c6c5A5ED45D437FAf7279fAC23D24e48890",
//!     "token": "0x6dE0e73966474a1564d5E582e833E7B296a46D1F",
//!     "counterparty": "$COUNTERPARTY_ADDRESS"
//!   }
//! }
//! ```

use serde::Deserialize;
use sessionsafe_chain_eip155::chain::config::Eip155SettlementConfig;
use sessionsafe_chain_eip155::chain::Eip155SettlementProvider;
use sessionsafe_chain_eip155::{KnownSessionSafe, SessionDomain};
use sessionsafe_types::config::FromConfig;
use std::fs;
use std::path::{Path, PathBuf};

use crate::session::DEFAULT_TOKEN_DECIMALS;
use crate::store::FileSessionStore;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "SESSIONSAFE_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    storage: StorageConfig,
    #[serde(default = "config_defaults::default_domain")]
    domain: SessionDomain,
    /// Settlement chain; without it sessions can be metered but not settled.
    #[serde(default)]
    chain: Option<Eip155SettlementConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Where the session record is kept.
    #[serde(default = "config_defaults::default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: config_defaults::default_storage_path(),
        }
    }
}

mod config_defaults {
    use super::*;

    pub fn default_domain() -> SessionDomain {
        SessionDomain::sepolia()
    }

    pub fn default_storage_path() -> PathBuf {
        PathBuf::from("sessionsafe-session.json")
    }

    pub fn default_config_path() -> PathBuf {
        PathBuf::from("sessionsafe.json")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            domain: config_defaults::default_domain(),
            chain: None,
        }
    }
}

impl Config {
    /// Loads `.env`, then the configuration file named by `SESSIONSAFE_CONFIG`.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(config_defaults::default_config_path);
        Self::load_from_path(path)
    }

    /// Load configuration from a specific path.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    pub fn domain(&self) -> &SessionDomain {
        &self.domain
    }

    pub fn chain(&self) -> Option<&Eip155SettlementConfig> {
        self.chain.as_ref()
    }

    /// Decimals of the collateral token, from the chain section when present.
    pub fn token_decimals(&self) -> u8 {
        self.chain
            .as_ref()
            .map(|c| c.token_decimals)
            .unwrap_or(DEFAULT_TOKEN_DECIMALS)
    }

    pub fn session_store(&self) -> FileSessionStore {
        FileSessionStore::new(self.storage.path.clone())
    }

    /// Connects the settlement provider, if a chain is configured.
    pub async fn settlement_provider(
        &self,
    ) -> Result<Option<Eip155SettlementProvider>, Box<dyn std::error::Error>> {
        match &self.chain {
            Some(chain) => Ok(Some(Eip155SettlementProvider::from_config(chain).await?)),
            None => Ok(None),
        }
    }
}
