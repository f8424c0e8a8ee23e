//! Liquidation detection and execution.

use super::core::Engine;
use super::orders::OrderRequest;
use super::results::{EngineError, LiquidationResult};
use crate::events::{BadDebtEvent, CancelReason, EventPayload, LiquidationEvent, LiquidationSkippedEvent};
use crate::ledger::PositionUpdate;
use crate::liquidation::{is_liquidatable, LiquidationReason, LiquidationRecord};
use crate::order::{OrderClass, OrderKind, OrderOrigin};
use crate::types::{AccountId, MarketId, SignedSize};
use tracing::{info, warn};

impl Engine {
    /// Liquidate every account in `market_id` whose position is below
    /// maintenance at the current mark price.
    pub fn scan_liquidations(&mut self, market_id: MarketId) -> Result<Vec<LiquidationResult>, EngineError> {
        self.transact(|engine| {
            engine.market(market_id)?;
            engine.run_liquidation_scan(market_id)
        })
    }

    /// Liquidate one account's position on request of `liquidator`. Fails
    /// unless the position is below maintenance at the current mark.
    pub fn liquidate_account(
        &mut self,
        liquidator: AccountId,
        account_id: AccountId,
        market_id: MarketId,
    ) -> Result<LiquidationResult, EngineError> {
        self.transact(|engine| {
            engine.ledger.account(liquidator)?;
            let market = engine.market(market_id)?;
            let mark = market.mark_price(engine.current_time);
            let position = engine
                .ledger
                .account(account_id)?
                .position(market_id)
                .ok_or(EngineError::NoPosition { account_id, market_id })?;
            if !is_liquidatable(position, mark.price, &market.config.margin_params) {
                return Err(EngineError::NotLiquidatable { account_id, market_id });
            }

            engine.liquidation_in_progress = true;
            let result = engine.liquidate_position(
                account_id,
                market_id,
                LiquidationReason::LiquidatorRequest,
                Some(liquidator),
            );
            engine.liquidation_in_progress = false;
            result?.ok_or(EngineError::NoLiquidity(market_id))
        })
    }

    // 9.1: runs after every margin placement that filled. the flag keeps
    // forced orders from starting another scan.
    pub(super) fn run_liquidation_scan(&mut self, market_id: MarketId) -> Result<Vec<LiquidationResult>, EngineError> {
        if self.liquidation_in_progress {
            return Ok(Vec::new());
        }
        self.liquidation_in_progress = true;
        let result = self.scan_market(market_id);
        self.liquidation_in_progress = false;
        result
    }

    fn scan_market(&mut self, market_id: MarketId) -> Result<Vec<LiquidationResult>, EngineError> {
        let candidates: Vec<AccountId> = self
            .ledger
            .accounts()
            .filter(|account| account.position(market_id).is_some())
            .map(|account| account.id)
            .collect();

        let mut results = Vec::new();
        for account_id in candidates {
            // each liquidation trades, so the mark is re-read per account
            let market = self.market(market_id)?;
            let mark = market.mark_price(self.current_time);
            let Some(position) = self.ledger.account(account_id)?.position(market_id) else {
                continue;
            };
            if !is_liquidatable(position, mark.price, &market.config.margin_params) {
                continue;
            }
            if let Some(result) =
                self.liquidate_position(account_id, market_id, LiquidationReason::MaintenanceBreach, None)?
            {
                results.push(result);
            }
        }
        Ok(results)
    }

    // 9.2: cancel the account's orders, force an opposite market order for
    // the whole position, then push the realized loss through the waterfall.
    fn liquidate_position(
        &mut self,
        account_id: AccountId,
        market_id: MarketId,
        reason: LiquidationReason,
        liquidator: Option<AccountId>,
    ) -> Result<Option<LiquidationResult>, EngineError> {
        let now = self.current_time;
        let market = self.market(market_id)?;
        let mark = market.mark_price(now);
        let liquidation_params = market.config.liquidation_params.clone();
        let position = self
            .ledger
            .account(account_id)?
            .position(market_id)
            .cloned()
            .ok_or(EngineError::NoPosition { account_id, market_id })?;
        let Some(side) = position.side() else {
            return Ok(None);
        };

        warn!(
            account = ?account_id,
            market = ?market_id,
            size = %position.size,
            mark = %mark.price,
            source = ?mark.source,
            ?reason,
            "liquidating position"
        );
        self.cancel_account_orders(account_id, CancelReason::Liquidation)?;

        let forced_side = side.opposite();
        let has_liquidity = !self
            .market(market_id)?
            .book(OrderClass::Margin)
            .side_is_empty(side);
        let updates = if has_liquidity {
            let (order, outcome) = self.execute_order(OrderRequest {
                account_id,
                market_id,
                side: forced_side,
                kind: OrderKind::Market,
                class: OrderClass::Margin,
                origin: OrderOrigin::Liquidation,
                amount: position.size.abs(),
            })?;
            Some((order.average_price(), outcome.taker_updates))
        } else {
            None
        };

        let Some((average_price, combined)) =
            updates.and_then(|(average, updates)| combine_updates(&updates).map(|u| (average, u)))
        else {
            warn!(account = ?account_id, market = ?market_id, size = %position.size, "no liquidity for forced close");
            self.emit_event(EventPayload::LiquidationSkipped(LiquidationSkippedEvent {
                market_id,
                account_id,
                size: position.size,
                mark_price: mark.price,
            }));
            return Ok(None);
        };

        let allocation = self.ledger.liquidate(&combined, &liquidation_params)?;
        let liquidation_price = average_price.unwrap_or(combined.price);
        let remaining_size = self
            .ledger
            .account(account_id)?
            .position(market_id)
            .map(|p| p.size)
            .unwrap_or_default();
        let closed_size = SignedSize::from_side(side, combined.closed_size);

        self.ledger.record_liquidation(LiquidationRecord {
            account_id,
            market_id,
            size: closed_size,
            entry_price: position.entry_price,
            liquidation_price,
            margin_lost: allocation.covered_from_margin,
            realized_pnl: combined.realized_pnl,
            liquidator,
            reason,
            allocation,
            timestamp: now,
        })?;

        self.emit_event(EventPayload::Liquidation(LiquidationEvent {
            market_id,
            account_id,
            liquidated_size: closed_size,
            liquidation_price,
            mark_price: mark.price,
            mark_source: mark.source,
            allocation,
            liquidator_account: liquidator,
            reason,
        }));
        if allocation.socialized.is_positive() {
            self.emit_event(EventPayload::BadDebt(BadDebtEvent {
                market_id,
                account_id,
                debt_amount: allocation.socialized,
                covered_by_insurance: allocation.insurance_covered,
                socialized_loss: allocation.deficit,
            }));
        }

        info!(
            account = ?account_id,
            market = ?market_id,
            closed = %closed_size,
            remaining = %remaining_size,
            price = %liquidation_price,
            expected_loss = %allocation.expected_loss,
            socialized = %allocation.socialized,
            "liquidation complete"
        );

        Ok(Some(LiquidationResult {
            account_id,
            market_id,
            closed_size,
            remaining_size,
            liquidation_price,
            mark_price: mark,
            realized_pnl: combined.realized_pnl,
            allocation,
            liquidator,
        }))
    }
}

/// Folds the per-fill updates of one forced order into a single update so the
/// waterfall runs once over the total released margin and realized PnL.
fn combine_updates(updates: &[PositionUpdate]) -> Option<PositionUpdate> {
    let (first, rest) = updates.split_first()?;
    let mut combined = first.clone();
    for update in rest {
        combined.branch = update.branch;
        combined.size_delta += update.size_delta;
        combined.price = update.price;
        combined.realized_pnl = combined.realized_pnl.add(update.realized_pnl);
        combined.margin_released = combined.margin_released.add(update.margin_released);
        combined.margin_locked = update.margin_locked;
        combined.closed_size += update.closed_size;
        combined.position = update.position.clone();
        combined.release_excess = combined.release_excess.add(update.release_excess);
    }
    Some(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::fixed::{BASE_UNIT, QUOTE_UNIT};
    use crate::margin::MarginParams;
    use crate::market::MarketConfig;
    use crate::types::{Bps, Price, Quote, Side};

    const ONE: u128 = BASE_UNIT;

    fn usd(whole: i128) -> Quote {
        Quote::new(whole * QUOTE_UNIT)
    }

    fn price(whole: u64) -> Price {
        Price::new_unchecked(whole * 1_000_000)
    }

    fn setup_engine() -> Engine {
        let mut engine = Engine::new(EngineConfig::default());
        let mut config = MarketConfig::eth_perp();
        config.margin_params = MarginParams::symmetric(Bps::new(1_000), Bps::new(500));
        config.mark_price_params.vwap_enabled = false;
        engine.add_market(config).unwrap();
        engine
    }

    fn funded(engine: &mut Engine, amount: i128) -> AccountId {
        let id = engine.create_account();
        engine.deposit(id, usd(amount)).unwrap();
        id
    }

    /// Long 10 @ $100 for `trader` against `seller`.
    fn open_long(engine: &mut Engine, trader: AccountId, seller: AccountId) {
        let market = MarketId(1);
        engine
            .place_limit_order(seller, market, Side::Short, 10 * ONE, price(100), OrderClass::Margin)
            .unwrap();
        engine
            .place_limit_order(trader, market, Side::Long, 10 * ONE, price(100), OrderClass::Margin)
            .unwrap();
    }

    #[test]
    fn healthy_position_is_not_liquidated() {
        let mut engine = setup_engine();
        let trader = funded(&mut engine, 100);
        let seller = funded(&mut engine, 1_000);
        let keeper = funded(&mut engine, 1);
        open_long(&mut engine, trader, seller);

        let err = engine.liquidate_account(keeper, trader, MarketId(1)).unwrap_err();
        assert!(matches!(err, EngineError::NotLiquidatable { .. }));
        assert!(engine.scan_liquidations(MarketId(1)).unwrap().is_empty());
    }

    #[test]
    fn zero_liquidity_leaves_position_untouched() {
        let mut engine = setup_engine();
        let trader = funded(&mut engine, 100);
        let seller = funded(&mut engine, 1_000);
        open_long(&mut engine, trader, seller);

        // a trade at $80 empties the book and drags the mark down
        let bidder = funded(&mut engine, 1_000);
        let hitter = funded(&mut engine, 1_000);
        engine
            .place_limit_order(bidder, MarketId(1), Side::Long, ONE, price(80), OrderClass::Margin)
            .unwrap();
        let result = engine
            .place_market_order(hitter, MarketId(1), Side::Short, ONE, OrderClass::Margin)
            .unwrap();
        assert_eq!(result.filled_size, ONE);
        assert!(result.liquidations.is_empty());

        let position = engine.account(trader).unwrap().position(MarketId(1)).unwrap();
        assert_eq!(position.size.value(), 10 * ONE as i128);
        assert!(engine
            .events()
            .any(|e| matches!(e.payload, EventPayload::LiquidationSkipped(_))));
        assert!(engine.scan_liquidations(MarketId(1)).unwrap().is_empty());
    }
}
