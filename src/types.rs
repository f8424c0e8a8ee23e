// 1.0: all the primitives live here. nothing in the engine works without these types.
// IDs, prices, sizes, quote amounts, timestamps. each is a newtype so the compiler catches type mixups.
// quote values are 6-decimal minor units, base sizes are 18-decimal minor units.

use crate::fixed::{BASE_UNIT, QUOTE_UNIT};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MarketId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId(pub u64);

// Long = buy side, profits when price goes up. Short = sell side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn sign(&self) -> i128 {
        match self {
            Side::Long => 1,
            Side::Short => -1,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

// 1.1: signed size in base minor units: positive = long, negative = short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignedSize(i128);

impl SignedSize {
    pub fn new(size: i128) -> Self {
        Self(size)
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn from_side(side: Side, abs_size: u128) -> Self {
        Self(side.sign() * to_i128(abs_size))
    }

    pub fn value(&self) -> i128 {
        self.0
    }

    pub fn abs(&self) -> u128 {
        self.0.unsigned_abs()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_long(&self) -> bool {
        self.0 > 0
    }

    pub fn is_short(&self) -> bool {
        self.0 < 0
    }

    pub fn side(&self) -> Option<Side> {
        if self.is_long() {
            Some(Side::Long)
        } else if self.is_short() {
            Some(Side::Short)
        } else {
            None
        }
    }

    pub fn add(&self, delta: i128) -> Self {
        Self(self.0 + delta)
    }
}

impl fmt::Display for SignedSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 0 {
            write!(f, "-")?;
        }
        write_fixed(f, self.0.unsigned_abs(), BASE_UNIT, 18)
    }
}

// 1.2: price in 6-decimal quote units per one whole unit of base. always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Price(u64);

impl Price {
    #[must_use]
    pub fn new(raw: u64) -> Option<Self> {
        if raw > 0 {
            Some(Self(raw))
        } else {
            None
        }
    }

    pub fn new_unchecked(raw: u64) -> Self {
        debug_assert!(raw > 0);
        Self(raw)
    }

    /// Exact conversion from a human price, e.g. `dec!(10.5)`. Rejects
    /// non-positive values and anything finer than 6 decimals.
    pub fn from_decimal(value: Decimal) -> Option<Self> {
        scale_exact(value, Decimal::from(QUOTE_UNIT as u64))
            .and_then(|raw| raw.to_u64())
            .and_then(Self::new)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn to_decimal(&self) -> Decimal {
        Decimal::from_i128_with_scale(i128::from(self.0), 6)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_fixed(f, u128::from(self.0), QUOTE_UNIT as u128, 6)
    }
}

// 1.3: quote currency amount in 6-decimal minor units. collateral, margin, pnl all use this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct Quote(i128);

impl Quote {
    pub fn new(raw: i128) -> Self {
        Self(raw)
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn from_decimal(value: Decimal) -> Option<Self> {
        scale_exact(value, Decimal::from(QUOTE_UNIT as u64))
            .and_then(|raw| raw.to_i128())
            .map(Self)
    }

    pub fn raw(&self) -> i128 {
        self.0
    }

    pub fn to_decimal(&self) -> Option<Decimal> {
        Decimal::try_from_i128_with_scale(self.0, 6).ok()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }

    pub fn add(&self, other: Quote) -> Self {
        Self(self.0 + other.0)
    }

    pub fn sub(&self, other: Quote) -> Self {
        Self(self.0 - other.0)
    }

    pub fn negate(&self) -> Self {
        Self(-self.0)
    }

    pub fn min(self, other: Quote) -> Self {
        Self(self.0.min(other.0))
    }

    pub fn max(self, other: Quote) -> Self {
        Self(self.0.max(other.0))
    }

    /// Negative values collapse to zero.
    pub fn floor_zero(&self) -> Self {
        Self(self.0.max(0))
    }

    pub(crate) fn unsigned(&self) -> u128 {
        self.0.max(0) as u128
    }
}

impl fmt::Display for Quote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 0 {
            write!(f, "-")?;
        }
        write_fixed(f, self.0.unsigned_abs(), QUOTE_UNIT as u128, 6)
    }
}

impl PartialOrd for Quote {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quote {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Sum for Quote {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), |acc, q| acc.add(q))
    }
}

impl<'a> Sum<&'a Quote> for Quote {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), |acc, q| acc.add(*q))
    }
}

// 1.4: basis points. 100 bps = 1%.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bps(pub u32);

impl Bps {
    pub fn new(bps: u32) -> Self {
        Self(bps)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn as_fraction(&self) -> Decimal {
        Decimal::new(i64::from(self.0), 4)
    }
}

// 1.5: millisecond timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }

    pub fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn minus_secs(&self, secs: u64) -> Self {
        let window = i64::try_from(secs).unwrap_or(i64::MAX).saturating_mul(1000);
        Self(self.0.saturating_sub(window))
    }
}

/// Whole units of base (e.g. `dec!(2.5)`) to 18-decimal minor units.
pub fn base_units(value: Decimal) -> Option<u128> {
    scale_exact(value, Decimal::from(BASE_UNIT as u64)).and_then(|raw| raw.to_u128())
}

pub(crate) fn to_i128(value: u128) -> i128 {
    i128::try_from(value).unwrap_or(i128::MAX)
}

fn scale_exact(value: Decimal, unit: Decimal) -> Option<Decimal> {
    let scaled = value.checked_mul(unit)?;
    if scaled.fract().is_zero() {
        Some(scaled)
    } else {
        None
    }
}

fn write_fixed(f: &mut fmt::Formatter<'_>, raw: u128, unit: u128, decimals: usize) -> fmt::Result {
    let whole = raw / unit;
    let frac = raw % unit;
    if frac == 0 {
        write!(f, "{whole}")
    } else {
        let digits = format!("{frac:0decimals$}");
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}
