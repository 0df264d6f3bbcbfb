//! Fixed-point US dollar amounts.
//!
//! Budget arithmetic runs on integer micro-dollars so that sums such as
//! `0.10 + 0.20` compare equal to `0.30`. On the wire an amount is a plain
//! JSON number of dollars.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

const MICROS_PER_DOLLAR: i64 = 1_000_000;

/// An amount of US dollars with micro-dollar precision.
///
/// Arithmetic saturates at the bounds of the underlying `i64`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Usd(i64);

impl Usd {
    pub const ZERO: Usd = Usd(0);

    /// Build from micro-dollars.
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Build from a dollar amount, rounding to the nearest micro-dollar.
    pub fn from_dollars(dollars: f64) -> Self {
        Self((dollars * MICROS_PER_DOLLAR as f64).round() as i64)
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    pub fn dollars(self) -> f64 {
        self.0 as f64 / MICROS_PER_DOLLAR as f64
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Subtraction that never goes below zero.
    pub fn saturating_sub(self, other: Usd) -> Usd {
        Usd((self.0 - other.0).max(0))
    }
}

impl Add for Usd {
    type Output = Usd;

    fn add(self, rhs: Usd) -> Usd {
        Usd(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Usd {
    fn add_assign(&mut self, rhs: Usd) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for Usd {
    type Output = Usd;

    fn sub(self, rhs: Usd) -> Usd {
        Usd(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for Usd {
    fn sub_assign(&mut self, rhs: Usd) {
        self.0 = self.0.saturating_sub(rhs.0);
    }
}

impl Sum for Usd {
    fn sum<I: Iterator<Item = Usd>>(iter: I) -> Usd {
        iter.fold(Usd::ZERO, Add::add)
    }
}

impl fmt::Display for Usd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.2}", self.dollars())
    }
}

impl Serialize for Usd {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.dollars())
    }
}

impl<'de> Deserialize<'de> for Usd {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let dollars = f64::deserialize(deserializer)?;
        Ok(Usd::from_dollars(dollars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_decimal_sums() {
        let total = Usd::from_dollars(0.10) + Usd::from_dollars(0.20);
        assert_eq!(total, Usd::from_dollars(0.30));
    }

    #[test]
    fn test_saturating_sub() {
        let a = Usd::from_dollars(1.0);
        let b = Usd::from_dollars(2.5);
        assert_eq!(a.saturating_sub(b), Usd::ZERO);
        assert_eq!(b.saturating_sub(a), Usd::from_dollars(1.5));
    }

    #[test]
    fn test_serde_as_dollars() {
        let json = serde_json::to_string(&Usd::from_dollars(5.25)).unwrap();
        assert_eq!(json, "5.25");
        let parsed: Usd = serde_json::from_str("0.3").unwrap();
        assert_eq!(parsed, Usd::from_micros(300_000));
    }

    #[test]
    fn test_arithmetic_saturates() {
        let huge = Usd::from_dollars(1e300);
        assert_eq!(huge, Usd::from_micros(i64::MAX));
        assert_eq!(huge + Usd::from_dollars(1.0), Usd::from_micros(i64::MAX));

        let mut total = huge;
        total += huge;
        assert_eq!(total, Usd::from_micros(i64::MAX));

        let floor = Usd::from_micros(i64::MIN) - Usd::from_dollars(1.0);
        assert_eq!(floor, Usd::from_micros(i64::MIN));
    }

    #[test]
    fn test_display() {
        assert_eq!(Usd::from_dollars(0.5).to_string(), "$0.50");
    }

    #[test]
    fn test_sum() {
        let total: Usd = [0.1, 0.2, 0.3].iter().map(|d| Usd::from_dollars(*d)).sum();
        assert_eq!(total, Usd::from_dollars(0.6));
    }
}
