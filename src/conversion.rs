//! Currency conversion between a user's display currency and the reference (storage) currency.
//!
//! `rate` is the number of display-currency units per reference unit, so
//! `to_base(amount, rate) = amount / rate` and `from_base(amount, rate) = amount * rate`. Amounts are
//! integer minor units and every conversion truncates toward zero. Conversion is lossy: for rates
//! ≥ 1 a `from_base` → `to_base` round-trip is off by at most one minor unit.

use crate::error::{Error, Result};
use crate::store::CurrencyTable;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// A validated, strictly positive exchange rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rate(Decimal);

impl Rate {
    /// The identity rate of the reference currency.
    pub const ONE: Rate = Rate(Decimal::ONE);

    /// Validates a raw rate as stored in the currency table.
    ///
    /// # Errors
    /// - `ConversionFailure` if the rate is not finite or not strictly positive.
    pub fn new(raw: f64) -> Result<Self> {
        let value = Decimal::from_f64(raw)
            .ok_or_else(|| Error::ConversionFailure(format!("rate {raw} is not representable")))?;
        if value <= Decimal::ZERO {
            return Err(Error::ConversionFailure(format!(
                "rate {raw} must be greater than zero"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl Display for Rate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Display-currency minor units → reference minor units.
pub fn to_base(amount: i64, rate: Rate) -> Result<i64> {
    let converted = Decimal::from(amount)
        .checked_div(rate.0)
        .ok_or_else(|| overflow(amount, rate))?;
    truncate(converted).ok_or_else(|| overflow(amount, rate))
}

/// Reference minor units → display-currency minor units.
pub fn from_base(amount: i64, rate: Rate) -> Result<i64> {
    let converted = Decimal::from(amount)
        .checked_mul(rate.0)
        .ok_or_else(|| overflow(amount, rate))?;
    truncate(converted).ok_or_else(|| overflow(amount, rate))
}

fn truncate(value: Decimal) -> Option<i64> {
    value.trunc().to_i64()
}

fn overflow(amount: i64, rate: Rate) -> Error {
    Error::ConversionFailure(format!("{amount} at rate {rate} is out of range"))
}

/// Resolves rates from the currency table and applies them.
#[derive(Clone)]
pub struct ConversionService {
    currencies: Arc<dyn CurrencyTable>,
}

impl ConversionService {
    pub fn new(currencies: Arc<dyn CurrencyTable>) -> Self {
        Self { currencies }
    }

    /// Looks up the current rate of `currency_id`.
    ///
    /// # Errors
    /// - `CurrencyNotFound` if the table has no such currency.
    /// - `ConversionFailure` if the stored rate is unusable.
    pub async fn rate(&self, currency_id: i64) -> Result<Rate> {
        let currency = self.currencies.currency(currency_id).await?;
        Rate::new(currency.rate)
    }

    /// Converts `amount` in the display currency `currency_id` to reference minor units.
    pub async fn to_base(&self, amount: i64, currency_id: i64) -> Result<i64> {
        to_base(amount, self.rate(currency_id).await?)
    }

    /// Converts reference minor units to the display currency `currency_id`.
    pub async fn from_base(&self, amount: i64, currency_id: i64) -> Result<i64> {
        from_base(amount, self.rate(currency_id).await?)
    }
}
