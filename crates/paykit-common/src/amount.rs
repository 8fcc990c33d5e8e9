//! Payment amounts
//!
//! An [`Amount`] is the validated triple of a decimal value, a currency tag
//! and a [`Denomination`]. The engine only ever does arithmetic on amounts of
//! like currency and denomination; converting between `BASE` and `MAIN` is a
//! plugin concern.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Currency tag used when none is supplied
pub const DEFAULT_CURRENCY: &str = "BTC";

/// Amount error
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Value does not parse as a decimal number
    #[error("Invalid amount: `{0}`")]
    InvalidAmount(String),
    /// Negative amounts are not representable
    #[error("Amount must not be negative: `{0}`")]
    NegativeAmount(Decimal),
    /// Base-denominated values are integer counts of the smallest unit
    #[error("Base amount must be an integer: `{0}`")]
    FractionalBaseAmount(Decimal),
    /// Currency tag is empty
    #[error("Currency must not be empty")]
    EmptyCurrency,
    /// Arithmetic over amounts of different currencies
    #[error("Currency mismatch: `{0}` and `{1}`")]
    CurrencyMismatch(String, String),
    /// Arithmetic over amounts of different denominations
    #[error("Denomination mismatch: `{0}` and `{1}`")]
    DenominationMismatch(Denomination, Denomination),
    /// Amount overflow
    #[error("Amount overflow")]
    Overflow,
}

/// Denomination of an [`Amount`]
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Denomination {
    /// Integer count of the smallest unit of the currency
    #[default]
    Base,
    /// Main unit of the currency
    Main,
}

impl fmt::Display for Denomination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denomination::Base => write!(f, "BASE"),
            Denomination::Main => write!(f, "MAIN"),
        }
    }
}

impl FromStr for Denomination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BASE" => Ok(Denomination::Base),
            "MAIN" => Ok(Denomination::Main),
            _ => Err(Error::InvalidAmount(s.to_string())),
        }
    }
}

/// Validated amount with its currency tag and denomination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    amount: Decimal,
    currency: String,
    denomination: Denomination,
}

impl Amount {
    /// Parse and validate an amount from its decimal-string form
    ///
    /// `currency` defaults to [`DEFAULT_CURRENCY`] and `denomination` to
    /// [`Denomination::Base`] when not supplied.
    pub fn new(
        amount: &str,
        currency: Option<&str>,
        denomination: Option<Denomination>,
    ) -> Result<Self, Error> {
        let value: Decimal = amount
            .trim()
            .parse()
            .map_err(|_| Error::InvalidAmount(amount.to_string()))?;
        Self::from_decimal(
            value,
            currency.unwrap_or(DEFAULT_CURRENCY),
            denomination.unwrap_or_default(),
        )
    }

    /// Validate an already-parsed decimal value
    pub fn from_decimal(
        value: Decimal,
        currency: &str,
        denomination: Denomination,
    ) -> Result<Self, Error> {
        if currency.trim().is_empty() {
            return Err(Error::EmptyCurrency);
        }
        if value.is_sign_negative() && !value.is_zero() {
            return Err(Error::NegativeAmount(value));
        }
        if denomination == Denomination::Base && !value.fract().is_zero() {
            return Err(Error::FractionalBaseAmount(value));
        }
        Ok(Self {
            amount: value.normalize(),
            currency: currency.to_string(),
            denomination,
        })
    }

    /// Decimal value
    pub fn value(&self) -> Decimal {
        self.amount
    }

    /// Currency tag
    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Denomination
    pub fn denomination(&self) -> Denomination {
        self.denomination
    }

    /// Whether the value is zero
    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    fn ensure_like(&self, other: &Amount) -> Result<(), Error> {
        if self.currency != other.currency {
            return Err(Error::CurrencyMismatch(
                self.currency.clone(),
                other.currency.clone(),
            ));
        }
        if self.denomination != other.denomination {
            return Err(Error::DenominationMismatch(
                self.denomination,
                other.denomination,
            ));
        }
        Ok(())
    }

    /// Sum of two like amounts
    pub fn checked_add(&self, other: &Amount) -> Result<Amount, Error> {
        self.ensure_like(other)?;
        let value = self
            .amount
            .checked_add(other.amount)
            .ok_or(Error::Overflow)?;
        Amount::from_decimal(value, &self.currency, self.denomination)
    }

    /// Difference of two like amounts, refusing to go negative
    pub fn checked_sub(&self, other: &Amount) -> Result<Amount, Error> {
        self.ensure_like(other)?;
        let value = self
            .amount
            .checked_sub(other.amount)
            .ok_or(Error::Overflow)?;
        Amount::from_decimal(value, &self.currency, self.denomination)
    }

    /// Whether this amount covers `expected`
    pub fn meets(&self, expected: &Amount) -> Result<bool, Error> {
        self.ensure_like(expected)?;
        Ok(self.amount >= expected.amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.amount, self.currency, self.denomination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let amount = Amount::new("100", None, None).unwrap();
        assert_eq!(amount.value(), Decimal::from(100));
        assert_eq!(amount.currency(), "BTC");
        assert_eq!(amount.denomination(), Denomination::Base);
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            Amount::new("abc", None, None),
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            Amount::new("-5", None, None),
            Err(Error::NegativeAmount(_))
        ));
        assert!(matches!(
            Amount::new("0.5", None, None),
            Err(Error::FractionalBaseAmount(_))
        ));
        assert!(matches!(
            Amount::new("1", Some(""), None),
            Err(Error::EmptyCurrency)
        ));
        // Fractions are fine in the main denomination
        Amount::new("0.5", None, Some(Denomination::Main)).unwrap();
    }

    #[test]
    fn test_checked_add() {
        let a = Amount::new("60", None, None).unwrap();
        let b = Amount::new("40", None, None).unwrap();
        let sum = a.checked_add(&b).unwrap();
        assert_eq!(sum.value(), Decimal::from(100));

        let eur = Amount::new("40", Some("EUR"), None).unwrap();
        assert!(matches!(
            a.checked_add(&eur),
            Err(Error::CurrencyMismatch(_, _))
        ));

        let main = Amount::new("40", None, Some(Denomination::Main)).unwrap();
        assert!(matches!(
            a.checked_add(&main),
            Err(Error::DenominationMismatch(_, _))
        ));
    }

    #[test]
    fn test_meets() {
        let expected = Amount::new("100", None, None).unwrap();
        let received = Amount::new("100", None, None).unwrap();
        assert!(received.meets(&expected).unwrap());
        let short = Amount::new("90", None, None).unwrap();
        assert!(!short.meets(&expected).unwrap());
    }

    #[test]
    fn test_serde_round_trip() {
        let amount = Amount::new("100", Some("BTC"), Some(Denomination::Base)).unwrap();
        let json = serde_json::to_value(&amount).unwrap();
        assert_eq!(json["amount"], "100");
        assert_eq!(json["currency"], "BTC");
        assert_eq!(json["denomination"], "BASE");
        let back: Amount = serde_json::from_value(json).unwrap();
        assert_eq!(back, amount);
    }
}
