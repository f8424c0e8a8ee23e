// 4.0: open position tracking and the netting algorithm.
// a position's margin bucket lives inside the record, so removing the record
// is the only way to clear the bucket.

use crate::fixed::{pnl, pro_rata, weighted_entry};
use crate::margin::{initial_margin, MarginParams};
use crate::types::{MarketId, Price, Quote, Side, SignedSize, Timestamp};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub market_id: MarketId,
    pub size: SignedSize,
    pub entry_price: Price,
    pub margin: Quote,
    pub realized_pnl: Quote,
    pub opened_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Position {
    pub fn new(
        market_id: MarketId,
        size: SignedSize,
        entry_price: Price,
        margin: Quote,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            market_id,
            size,
            entry_price,
            margin,
            realized_pnl: Quote::zero(),
            opened_at: timestamp,
            updated_at: timestamp,
        }
    }

    pub fn side(&self) -> Option<Side> {
        self.size.side()
    }

    // 4.1: paper gains/losses at the mark
    pub fn unrealized_pnl(&self, mark_price: Price) -> Quote {
        pnl(self.size.value(), self.entry_price, mark_price)
    }

    pub fn notional_value(&self, mark_price: Price) -> Quote {
        crate::fixed::notional(self.size.abs(), mark_price)
    }
}

// 4.2: the five ways a fill can combine with an existing position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Netting {
    Open,
    Increase,
    PartialClose,
    FullClose,
    Flip,
}

impl Netting {
    pub fn classify(existing: SignedSize, delta: i128) -> Self {
        let s0 = existing.value();
        if s0 == 0 {
            return Netting::Open;
        }
        if (s0 > 0) == (delta > 0) {
            return Netting::Increase;
        }
        let closing = delta.unsigned_abs();
        let held = existing.abs();
        if closing < held {
            Netting::PartialClose
        } else if closing == held {
            Netting::FullClose
        } else {
            Netting::Flip
        }
    }

    pub fn reduces_exposure(&self) -> bool {
        matches!(self, Netting::PartialClose | Netting::FullClose)
    }
}

/// Outcome of netting a fill into a position. Pure data: nothing is applied
/// until the ledger commits it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NettingPlan {
    pub branch: Netting,
    pub new_position: Option<Position>,
    pub realized_pnl: Quote,
    pub margin_released: Quote,
    pub margin_locked: Quote,
    pub closed_size: u128,
}

impl NettingPlan {
    /// Net change to the account's locked margin.
    pub fn margin_delta(&self) -> Quote {
        self.margin_locked.sub(self.margin_released)
    }
}

// 4.3: the netting algorithm. S0/E0 existing, D/P the fill.
pub fn plan_netting(
    market_id: MarketId,
    existing: Option<&Position>,
    delta: i128,
    price: Price,
    params: &MarginParams,
    timestamp: Timestamp,
) -> NettingPlan {
    let current = existing.map(|p| p.size).unwrap_or_default();
    let branch = Netting::classify(current, delta);
    let fill_side = if delta > 0 { Side::Long } else { Side::Short };
    let fill_abs = delta.unsigned_abs();

    match (branch, existing) {
        (Netting::Open, _) | (_, None) => {
            let size = SignedSize::new(delta);
            let margin = initial_margin(fill_abs, price, fill_side, params);
            NettingPlan {
                branch: Netting::Open,
                new_position: Some(Position::new(market_id, size, price, margin, timestamp)),
                realized_pnl: Quote::zero(),
                margin_released: Quote::zero(),
                margin_locked: margin,
                closed_size: 0,
            }
        }
        (Netting::Increase, Some(position)) => {
            let new_size = position.size.add(delta);
            let entry = weighted_entry(position.size.abs(), position.entry_price, fill_abs, price);
            let margin = initial_margin(new_size.abs(), entry, fill_side, params);
            let mut updated = position.clone();
            updated.size = new_size;
            updated.entry_price = entry;
            updated.margin = margin;
            updated.updated_at = timestamp;
            NettingPlan {
                branch,
                new_position: Some(updated),
                realized_pnl: Quote::zero(),
                margin_released: position.margin,
                margin_locked: margin,
                closed_size: 0,
            }
        }
        (Netting::PartialClose, Some(position)) => {
            let held = position.size.abs();
            let realized = closing_pnl(position, fill_abs, price);
            let released = pro_rata(position.margin, fill_abs, held);
            let mut updated = position.clone();
            updated.size = position.size.add(delta);
            updated.margin = position.margin.sub(released);
            updated.realized_pnl = position.realized_pnl.add(realized);
            updated.updated_at = timestamp;
            NettingPlan {
                branch,
                new_position: Some(updated),
                realized_pnl: realized,
                margin_released: released,
                margin_locked: Quote::zero(),
                closed_size: fill_abs,
            }
        }
        (Netting::FullClose, Some(position)) => NettingPlan {
            branch,
            new_position: None,
            realized_pnl: closing_pnl(position, fill_abs, price),
            margin_released: position.margin,
            margin_locked: Quote::zero(),
            closed_size: fill_abs,
        },
        (Netting::Flip, Some(position)) => {
            let held = position.size.abs();
            let realized = closing_pnl(position, held, price);
            let remainder = fill_abs - held;
            let size = SignedSize::from_side(fill_side, remainder);
            let margin = initial_margin(remainder, price, fill_side, params);
            NettingPlan {
                branch,
                new_position: Some(Position::new(market_id, size, price, margin, timestamp)),
                realized_pnl: realized,
                margin_released: position.margin,
                margin_locked: margin,
                closed_size: held,
            }
        }
    }
}

// pnl on the closed slice keeps the sign of the original position
fn closing_pnl(position: &Position, closed: u128, exit: Price) -> Quote {
    let signed = match position.side() {
        Some(Side::Short) => -crate::types::to_i128(closed),
        _ => crate::types::to_i128(closed),
    };
    pnl(signed, position.entry_price, exit)
}
