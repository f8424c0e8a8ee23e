//! Read-only views over engine state.

use super::core::Engine;
use super::results::EngineError;
use crate::ledger::SolvencyReport;
use crate::liquidation::LiquidationRecord;
use crate::margin::MarginSummary;
use crate::mark_price::{MarkPrice, VwapResult, VwapViews};
use crate::order::{BookDepth, Order, OrderClass};
use crate::position::Position;
use crate::types::{AccountId, MarketId, OrderId, Price, Quote};
use std::collections::BTreeMap;

impl Engine {
    pub fn best_bid(&self, market_id: MarketId) -> Result<Option<Price>, EngineError> {
        Ok(self.market(market_id)?.margin_book.best_bid())
    }

    pub fn best_ask(&self, market_id: MarketId) -> Result<Option<Price>, EngineError> {
        Ok(self.market(market_id)?.margin_book.best_ask())
    }

    pub fn mark_price(&self, market_id: MarketId) -> Result<MarkPrice, EngineError> {
        Ok(self.market(market_id)?.mark_price(self.current_time))
    }

    /// Current mark price of every market.
    pub fn mark_prices(&self) -> BTreeMap<MarketId, Price> {
        self.markets
            .iter()
            .map(|(id, market)| (*id, market.mark_price(self.current_time).price))
            .collect()
    }

    /// Aggregated price levels, best first, up to `levels` per side.
    pub fn order_book_depth(
        &self,
        market_id: MarketId,
        class: OrderClass,
        levels: usize,
    ) -> Result<BookDepth, EngineError> {
        Ok(self.market(market_id)?.book(class).depth(levels))
    }

    pub fn calculate_vwap(&self, market_id: MarketId, window_secs: u64) -> Result<VwapResult, EngineError> {
        Ok(self.market(market_id)?.calculate_vwap(window_secs, self.current_time))
    }

    pub fn vwap_views(&self, market_id: MarketId) -> Result<VwapViews, EngineError> {
        Ok(self.market(market_id)?.vwap_views(self.current_time))
    }

    pub fn user_positions(&self, account_id: AccountId) -> Result<Vec<Position>, EngineError> {
        Ok(self.account(account_id)?.positions.values().cloned().collect())
    }

    pub fn margin_summary(&self, account_id: AccountId) -> Result<MarginSummary, EngineError> {
        Ok(self.ledger.margin_summary(account_id, &self.mark_prices())?)
    }

    /// Active orders of an account across all markets, oldest first per market.
    pub fn user_orders(&self, account_id: AccountId) -> Result<Vec<&Order>, EngineError> {
        let account = self.account(account_id)?;
        Ok(account
            .pending_orders
            .iter()
            .filter_map(|order_id| self.order(*order_id))
            .collect())
    }

    /// Active orders and recently filled or cancelled ones.
    pub fn order(&self, order_id: OrderId) -> Option<&Order> {
        match self.order_markets.get(&order_id) {
            Some(market_id) => self.markets.get(market_id)?.orders.get(&order_id),
            None => self.order_history.get(order_id),
        }
    }

    pub fn liquidation_history(&self) -> &[LiquidationRecord] {
        self.ledger.liquidation_history()
    }

    pub fn insurance_fund_balance(&self) -> Quote {
        self.ledger.insurance_fund().balance
    }

    pub fn socialized_deficit(&self) -> Quote {
        self.ledger.socialized_deficit()
    }

    pub fn solvency(&self) -> SolvencyReport {
        self.ledger.solvency(&self.mark_prices())
    }
}
