//! Atomic currency amounts.
//!
//! The host chain denominates balances, rewards and fees in integer atomic
//! units (10⁸ per coin). Every ledger computation stays in integer space; the
//! only floating point input is a percentage, which is converted once into
//! basis points by [`basis_points`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

/// Number of decimal places of one coin.
pub const ATOMIC_DECIMALS: u32 = 8;

/// Raw atomic unit type.
pub type Atomic = u128;

/// One full coin in atomic units.
pub const ATOMIC_PER_COIN: Atomic = 10u128.pow(ATOMIC_DECIMALS);

/// Denominator of a basis point value (10000 = 100%).
pub const BPS_DENOMINATOR: u128 = 10_000;

/// Converts a percentage (0–100, two decimals significant) into basis points.
///
/// Rounds half away from zero, matching the single rounding step of the
/// allocation formulas. Negative or non-finite inputs map to zero.
pub fn basis_points(percent: f64) -> u128 {
    if !percent.is_finite() || percent <= 0.0 {
        return 0;
    }
    (percent * 100.0).round() as u128
}

/// An amount of coin in atomic units.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(pub Atomic);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Create a new amount from atomic units
    pub const fn from_atomic(atomic: Atomic) -> Self {
        Self(atomic)
    }

    /// Create an amount from whole coins
    pub const fn from_coins(coins: u64) -> Self {
        Self((coins as u128) * ATOMIC_PER_COIN)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Get raw atomic units
    pub const fn atomic(&self) -> Atomic {
        self.0
    }

    pub fn checked_add(&self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(&self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn checked_mul(&self, scalar: u128) -> Option<Amount> {
        self.0.checked_mul(scalar).map(Amount)
    }

    pub fn checked_div(&self, scalar: u128) -> Option<Amount> {
        if scalar == 0 {
            None
        } else {
            Some(Amount(self.0 / scalar))
        }
    }

    pub fn saturating_add(&self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(&self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// `self * bps / 10000`, truncating. `None` on overflow.
    pub fn checked_bps(&self, bps: u128) -> Option<Amount> {
        self.0
            .checked_mul(bps)
            .map(|scaled| Amount(scaled / BPS_DENOMINATOR))
    }

    /// `self * numerator / denominator`, truncating. `None` on overflow or a
    /// zero denominator.
    pub fn checked_mul_div(&self, numerator: Amount, denominator: Amount) -> Option<Amount> {
        if denominator.is_zero() {
            return None;
        }
        self.0
            .checked_mul(numerator.0)
            .map(|scaled| Amount(scaled / denominator.0))
    }

    /// Apply a signed atomic delta, flooring at zero.
    pub fn offset_floor(&self, delta: i128) -> Amount {
        if delta >= 0 {
            Amount(self.0.saturating_add(delta as u128))
        } else {
            Amount(self.0.saturating_sub(delta.unsigned_abs()))
        }
    }

    /// Render with a fixed number of decimals, trailing zeros trimmed.
    pub fn format_units(&self, decimals: u32) -> String {
        let unit = 10u128.pow(decimals);
        let whole = self.0 / unit;
        let fractional = self.0 % unit;
        if fractional == 0 {
            return whole.to_string();
        }
        let digits = format!("{fractional:0width$}", width = decimals as usize);
        format!("{whole}.{}", digits.trim_end_matches('0'))
    }

    /// Parse from decimal string (e.g., "1.5" = 150000000 atomic units)
    pub fn from_str_coins(s: &str) -> Result<Self, AmountParseError> {
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        let whole: u128 = whole
            .parse()
            .map_err(|_| AmountParseError::Invalid(s.to_string()))?;
        if frac.len() > ATOMIC_DECIMALS as usize {
            return Err(AmountParseError::TooPrecise(s.to_string()));
        }
        let fractional: u128 = if frac.is_empty() {
            0
        } else {
            let padded = format!("{frac:0<width$}", width = ATOMIC_DECIMALS as usize);
            padded
                .parse()
                .map_err(|_| AmountParseError::Invalid(s.to_string()))?
        };
        whole
            .checked_mul(ATOMIC_PER_COIN)
            .and_then(|w| w.checked_add(fractional))
            .map(Amount)
            .ok_or_else(|| AmountParseError::Invalid(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountParseError {
    #[error("invalid amount: {0}")]
    Invalid(String),
    #[error("too many decimal places (max 8): {0}")]
    TooPrecise(String),
}

impl FromStr for Amount {
    type Err = AmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_coins(s.trim())
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format_units(ATOMIC_DECIMALS))
    }
}

impl Add for Amount {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for Amount {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self(self.0 - other.0)
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, other: Self) {
        self.0 -= other.0;
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Amount::zero(), |acc, a| acc.saturating_add(a))
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Self {
        iter.fold(Amount::zero(), |acc, a| acc.saturating_add(*a))
    }
}

impl From<u64> for Amount {
    fn from(v: u64) -> Self {
        Amount(v as u128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basis_points_rounds_half_up() {
        assert_eq!(basis_points(50.0), 5_000);
        assert_eq!(basis_points(12.34), 1_234);
        assert_eq!(basis_points(0.125), 13);
        assert_eq!(basis_points(0.004), 0);
        assert_eq!(basis_points(-3.0), 0);
        assert_eq!(basis_points(f64::NAN), 0);
    }

    #[test]
    fn bps_and_mul_div_truncate() {
        let net = Amount(100_000_000);
        assert_eq!(net.checked_bps(5_000), Some(Amount(50_000_000)));
        assert_eq!(Amount(7).checked_bps(3_333), Some(Amount(2)));
        assert_eq!(
            Amount(50_000_000).checked_mul_div(Amount(60), Amount(100)),
            Some(Amount(30_000_000))
        );
        assert_eq!(Amount(1).checked_mul_div(Amount(1), Amount::ZERO), None);
        assert_eq!(Amount(u128::MAX).checked_bps(2), None);
    }

    #[test]
    fn offset_floor_never_goes_negative() {
        assert_eq!(Amount(100).offset_floor(-250), Amount::ZERO);
        assert_eq!(Amount(100).offset_floor(-40), Amount(60));
        assert_eq!(Amount(100).offset_floor(25), Amount(125));
    }

    #[test]
    fn display_and_parse() {
        assert_eq!(Amount::from_coins(3).to_string(), "3");
        assert_eq!(Amount(150_000_000).to_string(), "1.5");
        assert_eq!(Amount(1).to_string(), "0.00000001");
        assert_eq!("1.5".parse::<Amount>(), Ok(Amount(150_000_000)));
        assert_eq!("42".parse::<Amount>(), Ok(Amount::from_coins(42)));
        assert!(matches!(
            "0.000000001".parse::<Amount>(),
            Err(AmountParseError::TooPrecise(_))
        ));
        assert!("abc".parse::<Amount>().is_err());
    }

    #[test]
    fn serializes_transparently() {
        let json = serde_json::to_string(&Amount(123)).unwrap();
        assert_eq!(json, "123");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Amount(123));
    }
}
