//! Fixed-point quantities.
//!
//! Quantities are decimal, never binary floating point, so that repeated
//! receipts, issues and duty computations cannot drift.

use core::iter::Sum;
use core::ops::{Add, Neg, Sub};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};

/// Maximum number of fractional digits a quantity may carry.
pub const QUANTITY_MAX_SCALE: u32 = 6;

/// Largest magnitude a quantity may reach (10^15). Keeping every stored
/// quantity below it means sums over a ledger cannot overflow `Decimal`.
pub const QUANTITY_MAX: Decimal = Decimal::from_parts(2_764_472_320, 232_830, 0, false, 0);

/// Signed fixed-point quantity.
///
/// The type itself allows negative values (deltas, variances); the ledger
/// components enforce the non-negativity of balances and usage counters.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Quantity(Decimal);

impl Quantity {
    pub const ZERO: Quantity = Quantity(Decimal::ZERO);

    /// Validate scale and magnitude, then wrap.
    pub fn new(value: Decimal) -> LedgerResult<Self> {
        let normalized = value.normalize();
        if normalized.scale() > QUANTITY_MAX_SCALE {
            return Err(LedgerError::validation(format!(
                "quantity {value} has more than {QUANTITY_MAX_SCALE} fractional digits"
            )));
        }
        let quantity = Self(normalized);
        if !quantity.is_within_bounds() {
            return Err(LedgerError::validation(format!(
                "quantity {value} exceeds the maximum of {QUANTITY_MAX}"
            )));
        }
        Ok(quantity)
    }

    /// Whole units.
    pub fn units(n: i64) -> Self {
        Self(Decimal::from(n))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }

    /// `|self| <= QUANTITY_MAX`. Always true for values built by [`Quantity::new`].
    pub fn is_within_bounds(&self) -> bool {
        self.0.abs() <= QUANTITY_MAX
    }

    /// `self + other`, or `None` if the sum leaves `±QUANTITY_MAX`.
    pub fn checked_add(self, other: Quantity) -> Option<Quantity> {
        self.0
            .checked_add(other.0)
            .map(Self)
            .filter(Quantity::is_within_bounds)
    }

    /// `self - other`, or `None` if the result would be negative.
    pub fn checked_sub_non_negative(self, other: Quantity) -> Option<Quantity> {
        self.0
            .checked_sub(other.0)
            .filter(|result| *result >= Decimal::ZERO)
            .map(Self)
    }

    /// `self - other` floored at zero.
    pub fn saturating_sub(self, other: Quantity) -> Quantity {
        self.checked_sub_non_negative(other).unwrap_or(Quantity::ZERO)
    }
}

impl TryFrom<Decimal> for Quantity {
    type Error = LedgerError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Quantity> for Decimal {
    fn from(value: Quantity) -> Self {
        value.0
    }
}

impl core::fmt::Display for Quantity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity(self.0 + rhs.0)
    }
}

impl Sub for Quantity {
    type Output = Quantity;

    fn sub(self, rhs: Quantity) -> Quantity {
        Quantity(self.0 - rhs.0)
    }
}

impl Neg for Quantity {
    type Output = Quantity;

    fn neg(self) -> Quantity {
        Quantity(-self.0)
    }
}

impl Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Self {
        iter.fold(Quantity::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Quantity> for Quantity {
    fn sum<I: Iterator<Item = &'a Quantity>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

/// `part / whole * 100`, rounded to two decimals; zero when `whole` is zero.
pub fn percent(part: Decimal, whole: Decimal) -> Decimal {
    if whole.is_zero() {
        return Decimal::ZERO;
    }
    (part / whole * Decimal::ONE_HUNDRED).round_dp(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rejects_excess_precision() {
        assert!(Quantity::new(dec!(1.123456)).is_ok());
        assert!(matches!(
            Quantity::new(dec!(1.1234567)),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn trailing_zeros_do_not_count_as_precision() {
        let q = Quantity::new(dec!(2.50000000)).unwrap();
        assert_eq!(q, Quantity::new(dec!(2.5)).unwrap());
    }

    #[test]
    fn non_negative_subtraction() {
        let ten = Quantity::units(10);
        assert_eq!(ten.checked_sub_non_negative(Quantity::units(4)), Some(Quantity::units(6)));
        assert_eq!(ten.checked_sub_non_negative(Quantity::units(11)), None);
        assert_eq!(ten.saturating_sub(Quantity::units(11)), Quantity::ZERO);
    }

    #[test]
    fn magnitude_is_capped() {
        assert!(Quantity::new(QUANTITY_MAX).is_ok());
        assert!(matches!(
            Quantity::new(Decimal::MAX),
            Err(LedgerError::Validation(_))
        ));
        assert!(Quantity::new(-QUANTITY_MAX - Decimal::ONE).is_err());
        assert!(!Quantity::units(i64::MAX).is_within_bounds());
    }

    #[test]
    fn checked_add_stops_at_the_cap() {
        let max = Quantity::new(QUANTITY_MAX).unwrap();
        assert_eq!(max.checked_add(Quantity::ZERO), Some(max));
        assert_eq!(max.checked_add(Quantity::units(1)), None);
        assert_eq!(
            Quantity::units(2).checked_add(Quantity::units(3)),
            Some(Quantity::units(5))
        );
        assert_eq!(Quantity::units(i64::MAX).checked_add(Quantity::units(i64::MAX)), None);
    }

    #[test]
    fn percent_handles_zero_whole() {
        assert_eq!(percent(dec!(5), Decimal::ZERO), Decimal::ZERO);
        assert_eq!(percent(dec!(1), dec!(3)), dec!(33.33));
    }

    #[test]
    fn serializes_through_decimal() {
        let q = Quantity::new(dec!(12.5)).unwrap();
        let json = serde_json::to_string(&q).unwrap();
        let back: Quantity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, q);
    }

    proptest! {
        #[test]
        fn repeated_fractional_receipts_do_not_drift(
            steps in prop::collection::vec(1i64..10_000i64, 1..200)
        ) {
            // Each step is in ten-thousandths; summing them must be exact.
            let mut total = Quantity::ZERO;
            let mut expected: i64 = 0;
            for s in &steps {
                total = total + Quantity::new(Decimal::new(*s, 4)).unwrap();
                expected += *s;
            }
            prop_assert_eq!(total.value(), Decimal::new(expected, 4));
        }
    }
}
