//! Amount type for turning user-entered money strings into integer minor units.
//!
//! This module provides the `Amount` type which wraps a count of minor units (cents) and handles
//! parsing values that may or may not include a currency sign and thousands separators.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

/// Number of minor units in one major unit.
const MINOR_PER_MAJOR: i64 = 100;

/// Represents an amount of money as integer minor units.
///
/// Digits beyond the second decimal place are truncated toward zero.
///
/// # Examples
///
/// ```
/// # use spendbook::model::Amount;
/// # use std::str::FromStr;
/// let amount = Amount::from_str("$1,000.50").unwrap();
/// assert_eq!(amount.minor_units(), 100050);
/// assert_eq!(amount.to_string(), "1000.50");
/// ```
///
/// ```
/// # use spendbook::model::Amount;
/// # use std::str::FromStr;
/// let amount = Amount::from_str("7.999").unwrap();
/// assert_eq!(amount.minor_units(), 799);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i64);

impl Amount {
    /// Creates an amount from minor units.
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Returns the number of minor units.
    pub fn minor_units(&self) -> i64 {
        self.0
    }

    /// Returns true if the amount is strictly positive.
    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }
}

/// An error that can occur when parsing strings into `Amount` values.
pub struct AmountError(String);

impl Debug for AmountError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for AmountError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "invalid amount: {}", self.0)
    }
}

impl std::error::Error for AmountError {}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AmountError("empty string".to_string()));
        }

        // Drop currency signs, spaces and thousands separators
        let cleaned: String = trimmed
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
            .collect();

        let value = Decimal::from_str(&cleaned).map_err(|e| AmountError(format!("'{s}': {e}")))?;
        let minor = value
            .checked_mul(Decimal::from(MINOR_PER_MAJOR))
            .ok_or_else(|| AmountError(format!("'{s}' is out of range")))?
            .trunc()
            .to_i64()
            .ok_or_else(|| AmountError(format!("'{s}' is out of range")))?;
        Ok(Amount(minor))
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let per = MINOR_PER_MAJOR.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / per, abs % per)
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Amount::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl From<Amount> for i64 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        assert_eq!(Amount::from_str("50").unwrap().minor_units(), 5000);
        assert_eq!(Amount::from_str("50.5").unwrap().minor_units(), 5050);
        assert_eq!(Amount::from_str("0.07").unwrap().minor_units(), 7);
    }

    #[test]
    fn test_parse_with_sign_and_commas() {
        assert_eq!(Amount::from_str("$1,234,567.89").unwrap().minor_units(), 123456789);
        assert_eq!(Amount::from_str("1 000.10").unwrap().minor_units(), 100010);
    }

    #[test]
    fn test_parse_truncates_extra_digits() {
        assert_eq!(Amount::from_str("1.239").unwrap().minor_units(), 123);
        assert_eq!(Amount::from_str("-1.239").unwrap().minor_units(), -123);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Amount::from_str("").is_err());
        assert!(Amount::from_str("abc").is_err());
        assert!(Amount::from_str("1.2.3").is_err());
        // too large for the decimal type once scaled to minor units
        assert!(Amount::from_str("79228162514264337593543950335").is_err());
        assert!(Amount::from_str("100000000000000000000").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Amount::from_minor(5).to_string(), "0.05");
        assert_eq!(Amount::from_minor(123456).to_string(), "1234.56");
        assert_eq!(Amount::from_minor(-250).to_string(), "-2.50");
        assert_eq!(Amount::from_minor(0).to_string(), "0.00");
    }

    #[test]
    fn test_serde() {
        let amount = Amount::from_minor(1999);
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"19.99\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
    }

    #[test]
    fn test_is_positive() {
        assert!(Amount::from_minor(1).is_positive());
        assert!(!Amount::from_minor(0).is_positive());
        assert!(!Amount::from_minor(-1).is_positive());
    }
}
