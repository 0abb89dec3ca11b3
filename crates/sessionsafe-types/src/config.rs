//! Configuration building blocks shared by the session core and chain crates.
//!
//! The [`LiteralOrEnv`] wrapper lets any configuration value be given either as a
//! literal or as a reference to an environment variable, which keeps wallet keys
//! out of configuration files:
//!
//! ```json
//! {
//!   "rpc": [{ "http": "https://ethereum-sepolia-rpc.publicnode.com" }],
//!   "signer": "$USER_WALLET_KEY",
//!   "counterparty": "${COUNTERPARTY_ADDRESS}"
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::str::FromStr;
use url::Url;

/// Asynchronously constructs `Self` from its configuration type.
///
/// Fails if the configuration is invalid or a required connection cannot be set up.
#[async_trait::async_trait]
pub trait FromConfig<TConfig>
where
    Self: Sized,
{
    async fn from_config(config: &TConfig) -> Result<Self, Box<dyn std::error::Error>>;
}

/// A single RPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcConfig {
    /// HTTP URL for the RPC endpoint.
    pub http: Url,
    /// Requests per second allowed against this endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
}

/// A value that is resolved from the environment during deserialization.
///
/// Accepts a literal (`"0xcafe..."`), `"$VAR"` or `"${VAR}"`.
#[derive(Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn from_literal(value: T) -> Self {
        Self(value)
    }

    pub fn inner(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }

    /// Returns the variable name if `s` is `$VAR` or `${VAR}`.
    fn parse_env_var_syntax(s: &str) -> Option<&str> {
        if let Some(braced) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
            return Some(braced);
        }
        let name = s.strip_prefix('$')?;
        let valid = !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_');
        valid.then_some(name)
    }
}

/// Values wrapped here are frequently secrets; never print them.
impl<T> Debug for LiteralOrEnv<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("LiteralOrEnv(..)")
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        let value = match Self::parse_env_var_syntax(&s).map(str::to_owned) {
            Some(var_name) => std::env::var(&var_name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "Environment variable '{var_name}' not found (referenced as '{s}')"
                ))
            })?,
            None => s,
        };

        let parsed = value
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("Failed to parse value: {e}")))?;

        Ok(LiteralOrEnv(parsed))
    }
}

impl<T> Serialize for LiteralOrEnv<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_syntax() {
        assert_eq!(LiteralOrEnv::<u64>::parse_env_var_syntax("$FOO_1"), Some("FOO_1"));
        assert_eq!(LiteralOrEnv::<u64>::parse_env_var_syntax("${FOO}"), Some("FOO"));
        assert_eq!(LiteralOrEnv::<u64>::parse_env_var_syntax("$"), None);
        assert_eq!(LiteralOrEnv::<u64>::parse_env_var_syntax("$FOO-BAR"), None);
        assert_eq!(LiteralOrEnv::<u64>::parse_env_var_syntax("FOO"), None);
    }

    #[test]
    fn test_deserialize_literal() {
        let value: LiteralOrEnv<u64> = serde_json::from_str("\"11155111\"").unwrap();
        assert_eq!(*value, 11155111);
    }

    #[test]
    fn test_deserialize_missing_env_var() {
        let result =
            serde_json::from_str::<LiteralOrEnv<u64>>("\"$SESSIONSAFE_SURELY_UNSET_VARIABLE\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_redacts() {
        let value = LiteralOrEnv::from_literal("secret".to_string());
        assert_eq!(format!("{value:?}"), "LiteralOrEnv(..)");
    }
}
