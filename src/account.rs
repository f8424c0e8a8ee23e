//! Account and collateral state.
//!
//! An account holds quote collateral, reserved margin for resting orders, one
//! position per market and spot base balances. Locked margin is the sum of
//! the positions' margin buckets and the active-market index is the key set
//! of the position map, so neither can drift from the positions themselves.

use crate::liquidation::LiquidationRecord;
use crate::position::Position;
use crate::types::{AccountId, MarketId, OrderId, Price, Quote, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Spot base holdings for one market, in 18-decimal base units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpotBalance {
    pub free: u128,
    /// Committed to resting spot sell orders.
    pub held: u128,
}

impl SpotBalance {
    pub fn total(&self) -> u128 {
        self.free.saturating_add(self.held)
    }

    pub fn is_empty(&self) -> bool {
        self.free == 0 && self.held == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub collateral: Quote,
    pub margin_reserved: Quote,
    pub positions: BTreeMap<MarketId, Position>,
    pub pending_orders: BTreeSet<OrderId>,
    pub spot: BTreeMap<MarketId, SpotBalance>,
    pub liquidations: Vec<LiquidationRecord>,
    pub total_deposited: Quote,
    pub total_withdrawn: Quote,
    pub realized_pnl: Quote,
    pub created_at: Timestamp,
}

impl Account {
    pub fn new(id: AccountId, timestamp: Timestamp) -> Self {
        Self {
            id,
            collateral: Quote::zero(),
            margin_reserved: Quote::zero(),
            positions: BTreeMap::new(),
            pending_orders: BTreeSet::new(),
            spot: BTreeMap::new(),
            liquidations: Vec::new(),
            total_deposited: Quote::zero(),
            total_withdrawn: Quote::zero(),
            realized_pnl: Quote::zero(),
            created_at: timestamp,
        }
    }

    pub fn margin_locked(&self) -> Quote {
        self.positions.values().map(|p| p.margin).sum()
    }

    pub fn margin_in_market(&self, market_id: MarketId) -> Quote {
        self.positions.get(&market_id).map(|p| p.margin).unwrap_or_default()
    }

    /// collateral - locked - reserved
    pub fn available(&self) -> Quote {
        self.collateral.sub(self.margin_locked()).sub(self.margin_reserved)
    }

    pub fn active_markets(&self) -> impl Iterator<Item = MarketId> + '_ {
        self.positions.keys().copied()
    }

    pub fn deposit(&mut self, amount: Quote) {
        self.collateral = self.collateral.add(amount);
        self.total_deposited = self.total_deposited.add(amount);
    }

    pub fn withdraw(&mut self, amount: Quote) -> Result<(), AccountError> {
        let available = self.available();
        if amount > available {
            return Err(AccountError::InsufficientCollateral {
                requested: amount,
                available,
            });
        }
        self.collateral = self.collateral.sub(amount);
        self.total_withdrawn = self.total_withdrawn.add(amount);
        Ok(())
    }

    pub fn reserve(&mut self, amount: Quote) -> Result<(), AccountError> {
        let available = self.available();
        if amount > available {
            return Err(AccountError::InsufficientCollateral {
                requested: amount,
                available,
            });
        }
        self.margin_reserved = self.margin_reserved.add(amount);
        Ok(())
    }

    /// Releases reserved margin, clamping at zero. Returns the part of
    /// `amount` that was not actually reserved.
    pub fn release(&mut self, amount: Quote) -> Quote {
        let released = amount.min(self.margin_reserved);
        self.margin_reserved = self.margin_reserved.sub(released);
        amount.sub(released)
    }

    pub fn apply_pnl(&mut self, pnl: Quote) {
        self.collateral = self.collateral.add(pnl);
        self.realized_pnl = self.realized_pnl.add(pnl);
    }

    pub fn charge(&mut self, amount: Quote) {
        self.collateral = self.collateral.sub(amount);
    }

    pub fn position(&self, market_id: MarketId) -> Option<&Position> {
        self.positions.get(&market_id)
    }

    /// Stores `position`, or clears the market when `None`.
    pub fn set_position(&mut self, market_id: MarketId, position: Option<Position>) {
        match position {
            Some(position) if !position.size.is_zero() => {
                self.positions.insert(market_id, position);
            }
            _ => {
                self.clear_position(market_id);
            }
        }
    }

    /// Removes the position, its margin bucket and the market from the active
    /// index in one step.
    pub fn clear_position(&mut self, market_id: MarketId) -> Option<Position> {
        self.positions.remove(&market_id)
    }

    pub fn unrealized_pnl(&self, marks: &BTreeMap<MarketId, Price>) -> Quote {
        self.positions
            .iter()
            .filter_map(|(market_id, position)| marks.get(market_id).map(|mark| position.unrealized_pnl(*mark)))
            .sum()
    }

    pub fn spot_balance(&self, market_id: MarketId) -> SpotBalance {
        self.spot.get(&market_id).copied().unwrap_or_default()
    }

    pub fn deposit_base(&mut self, market_id: MarketId, amount: u128) {
        let balance = self.spot.entry(market_id).or_default();
        balance.free = balance.free.saturating_add(amount);
    }

    pub fn withdraw_base(&mut self, market_id: MarketId, amount: u128) -> Result<(), AccountError> {
        let free = self.spot_balance(market_id).free;
        if amount > free {
            return Err(AccountError::InsufficientBase {
                market_id,
                requested: amount,
                available: free,
            });
        }
        self.update_spot(market_id, |b| b.free -= amount);
        Ok(())
    }

    /// Moves free base into the held bucket for a resting sell.
    pub fn hold_base(&mut self, market_id: MarketId, amount: u128) -> Result<(), AccountError> {
        let free = self.spot_balance(market_id).free;
        if amount > free {
            return Err(AccountError::InsufficientBase {
                market_id,
                requested: amount,
                available: free,
            });
        }
        self.update_spot(market_id, |b| {
            b.free -= amount;
            b.held += amount;
        });
        Ok(())
    }

    /// Returns held base to free, clamped at what is held.
    pub fn unhold_base(&mut self, market_id: MarketId, amount: u128) {
        self.update_spot(market_id, |b| {
            let moved = amount.min(b.held);
            b.held -= moved;
            b.free += moved;
        });
    }

    /// Delivers held base out of the account.
    pub fn take_held_base(&mut self, market_id: MarketId, amount: u128) -> Result<(), AccountError> {
        let held = self.spot_balance(market_id).held;
        if amount > held {
            return Err(AccountError::InsufficientBase {
                market_id,
                requested: amount,
                available: held,
            });
        }
        self.update_spot(market_id, |b| b.held -= amount);
        Ok(())
    }

    fn update_spot(&mut self, market_id: MarketId, f: impl FnOnce(&mut SpotBalance)) {
        let balance = self.spot.entry(market_id).or_default();
        f(balance);
        if balance.is_empty() {
            self.spot.remove(&market_id);
        }
    }

    /// Structural invariants that must hold after every committed operation.
    pub fn check_invariants(&self) -> Result<(), AccountError> {
        if self.margin_reserved.is_negative() {
            return Err(AccountError::Invariant(format!(
                "negative reserved margin {}",
                self.margin_reserved
            )));
        }
        for (market_id, position) in &self.positions {
            if position.market_id != *market_id {
                return Err(AccountError::Invariant(format!(
                    "position keyed under {market_id:?} belongs to {:?}",
                    position.market_id
                )));
            }
            if position.size.is_zero() || !position.margin.is_positive() {
                return Err(AccountError::Invariant(format!(
                    "position in {market_id:?} has size {} and margin {}",
                    position.size, position.margin
                )));
            }
        }
        let locked = self.margin_locked();
        if self.collateral < locked.add(self.margin_reserved) {
            return Err(AccountError::Invariant(format!(
                "collateral {} below locked {} + reserved {}",
                self.collateral, locked, self.margin_reserved
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    #[error("Insufficient collateral: requested {requested}, available {available}")]
    InsufficientCollateral { requested: Quote, available: Quote },

    #[error("Insufficient margin: required {required}, available {available}")]
    InsufficientMargin { required: Quote, available: Quote },

    #[error("Insufficient base in market {market_id:?}: requested {requested}, available {available}")]
    InsufficientBase {
        market_id: MarketId,
        requested: u128,
        available: u128,
    },

    #[error("Account invariant violated: {0}")]
    Invariant(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::QUOTE_UNIT;
    use crate::types::SignedSize;

    fn usd(whole: i128) -> Quote {
        Quote::new(whole * QUOTE_UNIT)
    }

    fn test_account() -> Account {
        let mut account = Account::new(AccountId(1), Timestamp::from_millis(0));
        account.deposit(usd(10_000));
        account
    }

    fn test_position(market_id: MarketId, margin: Quote) -> Position {
        Position::new(
            market_id,
            SignedSize::new(1_000),
            Price::new_unchecked(50_000_000_000),
            margin,
            Timestamp::from_millis(0),
        )
    }

    #[test]
    fn account_deposit_withdraw() {
        let mut account = test_account();
        account.deposit(usd(5_000));
        assert_eq!(account.collateral, usd(15_000));

        account.withdraw(usd(3_000)).unwrap();
        assert_eq!(account.collateral, usd(12_000));
        assert_eq!(account.total_deposited, usd(15_000));
        assert_eq!(account.total_withdrawn, usd(3_000));
    }

    #[test]
    fn withdraw_respects_locked_and_reserved() {
        let mut account = test_account();
        account.set_position(MarketId(1), Some(test_position(MarketId(1), usd(4_000))));
        account.reserve(usd(5_000)).unwrap();
        assert_eq!(account.available(), usd(1_000));

        let result = account.withdraw(usd(1_001));
        assert!(matches!(result, Err(AccountError::InsufficientCollateral { .. })));
        account.withdraw(usd(1_000)).unwrap();
        assert_eq!(account.available(), Quote::zero());
    }

    #[test]
    fn release_clamps_and_reports_excess() {
        let mut account = test_account();
        account.reserve(usd(100)).unwrap();
        assert_eq!(account.release(usd(40)), Quote::zero());
        assert_eq!(account.release(usd(100)), usd(40));
        assert_eq!(account.margin_reserved, Quote::zero());
    }

    #[test]
    fn clear_position_drops_bucket_and_index() {
        let mut account = test_account();
        account.set_position(MarketId(7), Some(test_position(MarketId(7), usd(500))));
        assert_eq!(account.margin_in_market(MarketId(7)), usd(500));
        assert_eq!(account.active_markets().collect::<Vec<_>>(), vec![MarketId(7)]);

        account.set_position(MarketId(7), None);
        assert_eq!(account.margin_in_market(MarketId(7)), Quote::zero());
        assert_eq!(account.margin_locked(), Quote::zero());
        assert_eq!(account.active_markets().count(), 0);
        assert!(account.check_invariants().is_ok());
    }

    #[test]
    fn spot_hold_and_deliver() {
        let mut account = test_account();
        account.deposit_base(MarketId(2), 100);
        account.hold_base(MarketId(2), 60).unwrap();
        assert_eq!(account.spot_balance(MarketId(2)), SpotBalance { free: 40, held: 60 });

        account.take_held_base(MarketId(2), 50).unwrap();
        account.unhold_base(MarketId(2), 50);
        assert_eq!(account.spot_balance(MarketId(2)), SpotBalance { free: 50, held: 0 });

        assert!(account.withdraw_base(MarketId(2), 51).is_err());
        account.withdraw_base(MarketId(2), 50).unwrap();
        assert!(account.spot.is_empty());
    }

    #[test]
    fn invariant_check_flags_undercollateralized() {
        let mut account = test_account();
        account.set_position(MarketId(1), Some(test_position(MarketId(1), usd(9_000))));
        assert!(account.check_invariants().is_ok());
        account.charge(usd(2_000));
        assert!(matches!(account.check_invariants(), Err(AccountError::Invariant(_))));
    }
}
