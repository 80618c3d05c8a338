use crate::error::EngineError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// A non-negative fiat or stablecoin amount.
///
/// Wraps `rust_decimal::Decimal` so amounts are never handled as floats and
/// keep the scale they were created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(value: Decimal) -> Result<Self, EngineError> {
        if value.is_sign_negative() && !value.is_zero() {
            Err(EngineError::ValidationError(format!(
                "Amount must not be negative: {value}"
            )))
        } else {
            Ok(Self(value))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn scale(&self) -> u32 {
        self.0.scale()
    }

    /// Converts to integer base units of a token with `decimals` precision.
    ///
    /// Fails rather than truncating when the amount carries more fractional
    /// digits than the token supports.
    pub fn to_base_units(&self, decimals: u8) -> Result<u128, EngineError> {
        let decimals = u32::from(decimals);
        let normalized = self.0.normalize();
        let scale = normalized.scale();
        if scale > decimals {
            return Err(EngineError::Structural(format!(
                "{} cannot be represented with {decimals} token decimals",
                self.0
            )));
        }
        let mantissa = u128::try_from(normalized.mantissa()).map_err(|_| {
            EngineError::ValidationError(format!("Negative amount {}", self.0))
        })?;
        10u128
            .checked_pow(decimals - scale)
            .and_then(|factor| mantissa.checked_mul(factor))
            .ok_or_else(|| {
                EngineError::Structural(format!(
                    "{} overflows token base units at {decimals} decimals",
                    self.0
                ))
            })
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = EngineError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Add for Amount {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Amount {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

/// Share of a payment held in custody, between 0 and 100 inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct CustodyPercent(Decimal);

impl CustodyPercent {
    pub const NONE: Self = Self(Decimal::ZERO);
    pub const FULL: Self = Self(Decimal::ONE_HUNDRED);

    pub fn new(value: Decimal) -> Result<Self, EngineError> {
        if value < Decimal::ZERO || value > Decimal::ONE_HUNDRED {
            Err(EngineError::ValidationError(format!(
                "Custody percentage must be within 0..=100, got {value}"
            )))
        } else {
            Ok(Self(value))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for CustodyPercent {
    type Error = EngineError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CustodyPercent> for Decimal {
    fn from(percent: CustodyPercent) -> Self {
        percent.0
    }
}
