//! Fixed-point math for 6-decimal quote and 18-decimal base amounts.
//!
//! Every quote × base product is divided by 10^18 to get back to quote
//! precision. Intermediate products are computed as `U256` so large
//! positions never overflow before the division.

pub use primitive_types::U256;

use crate::types::{to_i128, Bps, Price, Quote};

/// Quote precision (6 decimals)
pub const QUOTE_DECIMALS: u32 = 6;
pub const QUOTE_UNIT: i128 = 1_000_000;

/// Base precision (18 decimals)
pub const BASE_DECIMALS: u32 = 18;
pub const BASE_UNIT: u128 = 1_000_000_000_000_000_000;

pub const BPS_DENOMINATOR: u128 = 10_000;

/// (a * b) / d as (quotient, remainder). None if d is zero or the quotient
/// does not fit in u128.
fn mul_div(a: u128, b: u128, d: u128) -> Option<(u128, u128)> {
    if d == 0 {
        return None;
    }
    // two u128 factors always fit in 256 bits
    let (quot, rem) = (U256::from(a) * U256::from(b)).div_mod(U256::from(d));
    narrow(quot).map(|q| (q, rem.low_u128()))
}

/// Back to u128 when the value fits.
pub fn narrow(value: U256) -> Option<u128> {
    if value > U256::from(u128::MAX) {
        None
    } else {
        Some(value.low_u128())
    }
}

#[inline]
pub fn mul_div_floor(a: u128, b: u128, d: u128) -> Option<u128> {
    mul_div(a, b, d).map(|(q, _)| q)
}

#[inline]
pub fn mul_div_ceil(a: u128, b: u128, d: u128) -> Option<u128> {
    mul_div(a, b, d).and_then(|(q, r)| if r == 0 { Some(q) } else { q.checked_add(1) })
}

fn quote_from(raw: Option<u128>) -> Quote {
    Quote::new(to_i128(raw.unwrap_or(u128::MAX)))
}

/// size × price / 10^18, rounded down.
pub fn notional(amount: u128, price: Price) -> Quote {
    quote_from(mul_div_floor(amount, u128::from(price.raw()), BASE_UNIT))
}

/// size × price / 10^18, rounded up. Used when reserving funds.
pub fn notional_ceil(amount: u128, price: Price) -> Quote {
    quote_from(mul_div_ceil(amount, u128::from(price.raw()), BASE_UNIT))
}

/// Margin for `amount` at `price` under `bps`, rounded up so any non-zero
/// exposure locks at least one minor unit.
pub fn margin_requirement(amount: u128, price: Price, bps: Bps) -> Quote {
    let scaled_price = u128::from(price.raw()) * u128::from(bps.value());
    quote_from(mul_div_ceil(amount, scaled_price, BASE_UNIT * BPS_DENOMINATOR))
}

/// Non-negative `amount` × bps / 10_000, rounded down.
pub fn apply_bps(amount: Quote, bps: Bps) -> Quote {
    quote_from(mul_div_floor(amount.unsigned(), u128::from(bps.value()), BPS_DENOMINATOR))
}

/// total × part / whole, rounded down. `whole` must be non-zero.
pub fn pro_rata(total: Quote, part: u128, whole: u128) -> Quote {
    if part >= whole {
        return total;
    }
    quote_from(mul_div_floor(total.unsigned(), part, whole))
}

/// PnL of `signed_qty` opened at `entry` and closed at `exit`, rounded toward
/// negative infinity so losses are never understated.
pub fn pnl(signed_qty: i128, entry: Price, exit: Price) -> Quote {
    let diff = i128::from(exit.raw()) - i128::from(entry.raw());
    if signed_qty == 0 || diff == 0 {
        return Quote::zero();
    }
    let qty = signed_qty.unsigned_abs();
    let move_abs = diff.unsigned_abs();
    if (signed_qty > 0) == (diff > 0) {
        Quote::new(to_i128(mul_div_floor(qty, move_abs, BASE_UNIT).unwrap_or(u128::MAX)))
    } else {
        Quote::new(-to_i128(mul_div_ceil(qty, move_abs, BASE_UNIT).unwrap_or(u128::MAX)))
    }
}

/// Volume-weighted entry: (s0·e0 + d·p) / (s0 + d), rounded down.
pub fn weighted_entry(s0: u128, e0: Price, d: u128, p: Price) -> Price {
    let total = U256::from(s0) + U256::from(d);
    if total.is_zero() {
        return p;
    }
    let sum = U256::from(s0) * U256::from(e0.raw()) + U256::from(d) * U256::from(p.raw());
    let raw = narrow(sum / total).unwrap_or(u128::MAX);
    Price::new(u64::try_from(raw).unwrap_or(u64::MAX)).unwrap_or(p)
}

/// Volume-weighted average price from Σ(price·size) and Σsize, rounded half up.
pub fn vwap_price(weighted_sum: U256, volume: U256) -> Option<Price> {
    if volume.is_zero() {
        return None;
    }
    let (raw, rem) = weighted_sum.div_mod(volume);
    let rounded = if rem >= volume - rem { raw + U256::one() } else { raw };
    narrow(rounded)
        .and_then(|raw| u64::try_from(raw).ok())
        .and_then(Price::new)
}

/// Price moved up (or down) by `bps`, rounded toward the original price.
pub fn shift_price(price: Price, bps: Bps, up: bool) -> Price {
    let raw = u128::from(price.raw());
    let delta = raw * u128::from(bps.value()) / BPS_DENOMINATOR;
    let shifted = if up { raw + delta } else { raw.saturating_sub(delta) };
    Price::new(u64::try_from(shifted).unwrap_or(u64::MAX)).unwrap_or(price)
}

pub fn mid_price(bid: Price, ask: Price) -> Price {
    let raw = (u128::from(bid.raw()) + u128::from(ask.raw())) / 2;
    Price::new(u64::try_from(raw).unwrap_or(u64::MAX)).unwrap_or(bid)
}
