//! Exact decimal amounts for collateral, balances and action costs.
//!
//! [`Amount`] wraps a [`Decimal`] and is non-negative by construction, so a
//! negative cost can never reach the session state machine. Arithmetic is exact:
//! `100.00 - 3 * 0.02` is `99.94`, not a float approximation.
//!
//! # Supported Formats
//!
//! - Plain numbers: `"100"`, `"0.02"`
//! - With currency symbols: `"$10.50"`
//! - With thousand separators: `"1,000.00"`
//!
//! # Example
//!
//! ```rust
//! use sessionsafe_types::amount::Amount;
//!
//! let amount = Amount::parse("$10.50").unwrap();
//! assert_eq!(amount.scale(), 2);
//! assert_eq!(amount.mantissa(), 1050);
//! ```

use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::LazyLock;

/// A non-negative monetary amount with exact decimal precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(Decimal);

/// Errors that can occur when parsing or constructing an [`Amount`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AmountParseError {
    /// The input string could not be parsed as a number.
    #[error("Invalid number format")]
    InvalidFormat,
    /// The value is above the allowed maximum.
    #[error("Amount must not exceed {}", constants::MAX_STR)]
    OutOfRange,
    /// Negative values are not allowed.
    #[error("Negative value is not allowed")]
    Negative,
    /// The input has more decimal places than the token supports.
    #[error("Too big of a precision: {money} vs {token} on token")]
    WrongPrecision {
        /// Decimal places in the input.
        money: u32,
        /// Decimal places supported by the token.
        token: u32,
    },
}

mod constants {
    use super::*;

    pub const MAX_STR: &str = "999999999";

    pub static MAX: LazyLock<Decimal> =
        LazyLock::new(|| Decimal::from_str(MAX_STR).expect("valid decimal"));

    pub static NON_NUMERIC: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^\d\.\-]+").expect("valid regex"));
}

impl Amount {
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    /// Wraps a decimal, rejecting negative and out-of-range values.
    pub fn new(value: Decimal) -> Result<Self, AmountParseError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(AmountParseError::Negative);
        }
        if value > *constants::MAX {
            return Err(AmountParseError::OutOfRange);
        }
        Ok(Amount(value))
    }

    /// Parses a human-readable currency string.
    ///
    /// Currency symbols, thousand separators, and whitespace are stripped
    /// before parsing.
    pub fn parse(input: &str) -> Result<Self, AmountParseError> {
        let cleaned = constants::NON_NUMERIC.replace_all(input, "");
        let parsed = Decimal::from_str(&cleaned).map_err(|_| AmountParseError::InvalidFormat)?;
        Amount::new(parsed)
    }

    /// Number of decimal places carried by the value.
    pub fn scale(&self) -> u32 {
        self.0.scale()
    }

    /// The value as an unsigned integer without decimal point: `"12.34"` is `1234`.
    pub fn mantissa(&self) -> u128 {
        self.0.mantissa().unsigned_abs()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// `self - rhs`, or `None` when the result would be negative.
    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        let value = self.0.checked_sub(rhs.0)?;
        if value.is_sign_negative() && !value.is_zero() {
            None
        } else {
            Some(Amount(value))
        }
    }

    /// `self + rhs`, or `None` on decimal overflow.
    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    /// Converts to integer base units of a token with `decimals` places.
    ///
    /// Fails with [`AmountParseError::WrongPrecision`] rather than rounding.
    pub fn to_base_units(&self, decimals: u8) -> Result<u128, AmountParseError> {
        let normalized = self.0.normalize();
        let scale = normalized.scale();
        let token_scale = decimals as u32;
        if scale > token_scale {
            return Err(AmountParseError::WrongPrecision {
                money: scale,
                token: token_scale,
            });
        }
        let multiplier = 10u128
            .checked_pow(token_scale - scale)
            .ok_or(AmountParseError::OutOfRange)?;
        normalized
            .mantissa()
            .unsigned_abs()
            .checked_mul(multiplier)
            .ok_or(AmountParseError::OutOfRange)
    }
}

impl FromStr for Amount {
    type Err = AmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse(s)
    }
}

impl TryFrom<&str> for Amount {
    type Error = AmountParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Amount::from_str(value)
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = AmountParseError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Amount::new(value)
    }
}

impl From<u32> for Amount {
    fn from(value: u32) -> Self {
        Amount(Decimal::from(value))
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

/// Serialized as a decimal string so no precision is lost in JSON.
impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let decimal = Decimal::from_str(&s).map_err(serde::de::Error::custom)?;
        Amount::new(decimal).map_err(serde::de::Error::custom)
    }
}
