//! Liquidation conditions and the loss waterfall.
//!
//! A position is liquidatable when its margin plus unrealized PnL at the mark
//! falls below the side-specific maintenance requirement. Losses from a
//! forced close are absorbed in three tiers: the position's own margin, then
//! the account's free collateral, then the system (insurance fund first, the
//! rest recorded as deficit).

use crate::fixed::apply_bps;
use crate::margin::{maintenance_margin, MarginParams};
use crate::position::Position;
use crate::types::{AccountId, Bps, MarketId, Price, Quote, SignedSize, Timestamp};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationParams {
    /// Charged on the margin released by the forced close.
    pub penalty_bps: Bps,
}

impl Default for LiquidationParams {
    fn default() -> Self {
        Self {
            penalty_bps: Bps::new(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiquidationStatus {
    Safe {
        equity: Quote,
        maintenance: Quote,
    },
    Liquidatable {
        equity: Quote,
        maintenance: Quote,
        shortfall: Quote,
    },
}

impl LiquidationStatus {
    pub fn is_liquidatable(&self) -> bool {
        matches!(self, LiquidationStatus::Liquidatable { .. })
    }
}

/// margin + uPnL(mark) against notional(mark) × maintenance bps of the side.
pub fn evaluate_liquidation(position: &Position, mark: Price, params: &MarginParams) -> LiquidationStatus {
    let Some(side) = position.side() else {
        return LiquidationStatus::Safe {
            equity: position.margin,
            maintenance: Quote::zero(),
        };
    };
    let equity = position.margin.add(position.unrealized_pnl(mark));
    let maintenance = maintenance_margin(position.size.abs(), mark, side, params);

    if equity < maintenance {
        LiquidationStatus::Liquidatable {
            equity,
            maintenance,
            shortfall: maintenance.sub(equity),
        }
    } else {
        LiquidationStatus::Safe { equity, maintenance }
    }
}

pub fn is_liquidatable(position: &Position, mark: Price, params: &MarginParams) -> bool {
    evaluate_liquidation(position, mark, params).is_liquidatable()
}

pub fn liquidation_penalty(margin_released: Quote, params: &LiquidationParams) -> Quote {
    apply_bps(margin_released, params.penalty_bps)
}

/// Auditable breakdown of one liquidation's loss.
///
/// `covered_from_margin + covered_from_available + socialized == expected_loss`
/// always holds, and `insurance_covered + deficit == socialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LossAllocation {
    pub trading_loss: Quote,
    pub penalty: Quote,
    pub expected_loss: Quote,
    pub covered_from_margin: Quote,
    pub covered_from_available: Quote,
    pub socialized: Quote,
    pub insurance_covered: Quote,
    pub deficit: Quote,
}

impl LossAllocation {
    /// Account-funded part of the loss.
    pub fn charged_to_account(&self) -> Quote {
        self.covered_from_margin.add(self.covered_from_available)
    }

    pub fn is_balanced(&self) -> bool {
        self.charged_to_account().add(self.socialized) == self.expected_loss
            && self.insurance_covered.add(self.deficit) == self.socialized
    }

    pub fn merge(&mut self, other: &LossAllocation) {
        self.trading_loss = self.trading_loss.add(other.trading_loss);
        self.penalty = self.penalty.add(other.penalty);
        self.expected_loss = self.expected_loss.add(other.expected_loss);
        self.covered_from_margin = self.covered_from_margin.add(other.covered_from_margin);
        self.covered_from_available = self.covered_from_available.add(other.covered_from_available);
        self.socialized = self.socialized.add(other.socialized);
        self.insurance_covered = self.insurance_covered.add(other.insurance_covered);
        self.deficit = self.deficit.add(other.deficit);
    }
}

/// Splits `trading_loss + penalty` over the three tiers. `free_collateral` is
/// the account's collateral minus all other locked and reserved margin, taken
/// after the released margin is returned, so it already contains
/// `margin_released`.
pub fn allocate_loss(
    trading_loss: Quote,
    penalty: Quote,
    margin_released: Quote,
    free_collateral: Quote,
) -> LossAllocation {
    let trading_loss = trading_loss.floor_zero();
    let penalty = penalty.floor_zero();
    let expected_loss = trading_loss.add(penalty);

    let covered_from_margin = expected_loss.min(margin_released.floor_zero());
    let remaining = expected_loss.sub(covered_from_margin);
    let spare = free_collateral.sub(covered_from_margin).floor_zero();
    let covered_from_available = remaining.min(spare);
    let socialized = remaining.sub(covered_from_available);

    LossAllocation {
        trading_loss,
        penalty,
        expected_loss,
        covered_from_margin,
        covered_from_available,
        socialized,
        insurance_covered: Quote::zero(),
        deficit: socialized,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsuranceFund {
    pub balance: Quote,
    pub total_deposits: Quote,
    pub total_payouts: Quote,
}

impl InsuranceFund {
    pub fn new(initial_balance: Quote) -> Self {
        Self {
            balance: initial_balance,
            total_deposits: initial_balance,
            total_payouts: Quote::zero(),
        }
    }

    pub fn deposit(&mut self, amount: Quote) {
        self.balance = self.balance.add(amount);
        self.total_deposits = self.total_deposits.add(amount);
    }

    pub fn cover_bad_debt(&mut self, amount: Quote) -> Quote {
        let covered = amount.min(self.balance).floor_zero();
        self.balance = self.balance.sub(covered);
        self.total_payouts = self.total_payouts.add(covered);
        covered
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationReason {
    /// Found by the post-trade or manual scan.
    MaintenanceBreach,
    /// Requested against a specific account by a liquidator.
    LiquidatorRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationRecord {
    pub account_id: AccountId,
    pub market_id: MarketId,
    /// Signed size that was force-closed.
    pub size: SignedSize,
    pub entry_price: Price,
    /// Average execution price of the forced order.
    pub liquidation_price: Price,
    pub margin_lost: Quote,
    pub realized_pnl: Quote,
    pub liquidator: Option<AccountId>,
    pub reason: LiquidationReason,
    pub allocation: LossAllocation,
    pub timestamp: Timestamp,
}
