//! Monetary amounts in the smallest currency unit.

use core::iter::Sum;
use core::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

use crate::value_object::ValueObject;

/// Amount of money in cents (single-currency; EUR in practice).
///
/// Arithmetic saturates instead of wrapping: a running total that could
/// overflow `i64` is already a data error, and saturating keeps the threshold
/// comparison meaningful.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl ValueObject for Money {}

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Whole currency units (e.g. `from_units(100)` is 100.00).
    pub const fn from_units(units: i64) -> Self {
        Self(units.saturating_mul(100))
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Unit price × quantity.
    pub const fn times(self, quantity: u32) -> Self {
        Self(self.0.saturating_mul(quantity as i64))
    }

    /// `self - other`, floored at zero.
    pub fn remaining_to(self, target: Money) -> Money {
        if target.0 > self.0 {
            Money(target.0 - self.0)
        } else {
            Money::ZERO
        }
    }

    /// Quantity-weighted average unit price, rounded half away from zero.
    ///
    /// Returns `None` when the total quantity is zero.
    pub fn weighted_average<I>(parts: I) -> Option<Money>
    where
        I: IntoIterator<Item = (Money, u32)>,
    {
        let (total, quantity) = parts
            .into_iter()
            .fold((0i128, 0i128), |(total, qty), (price, q)| {
                (total + price.0 as i128 * q as i128, qty + q as i128)
            });
        if quantity == 0 {
            return None;
        }
        let doubled = total * 2;
        let rounded = if doubled >= 0 {
            (doubled + quantity) / (2 * quantity)
        } else {
            -((-doubled + quantity) / (2 * quantity))
        };
        Some(Money(rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64))
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        *self = *self + rhs;
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        *self = *self - rhs;
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}
