//! Market configuration and state.
//!
//! A market owns a margin book, a spot book, the arena of its active orders,
//! and its trade history. All matching and pricing state for one market
//! lives here and is passed explicitly into engine operations.

use crate::engine::ErrorKind;
use crate::liquidation::LiquidationParams;
use crate::margin::{MarginParams, MarginParamsError};
use crate::mark_price::{resolve_mark_price, MarkPrice, MarkPriceParams, Trade, TradeBuffer, VwapResult, VwapViews};
use crate::order::{Order, OrderBook, OrderClass};
use crate::types::{AccountId, MarketId, OrderId, Price, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Market status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MarketStatus {
    /// Market is open for trading
    #[default]
    Active,
    /// Trading paused
    Paused,
    /// Market has settled; no further orders
    Settled,
}

/// Static market configuration (immutable after creation)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketConfig {
    pub id: MarketId,
    /// Human-readable name (e.g., "ETH-PERP")
    pub name: String,
    pub base_asset: String,
    pub quote_asset: String,
    /// Accept spot orders alongside margin orders
    pub spot_enabled: bool,
    /// Minimum order size in base units
    pub min_order_size: u128,
    pub margin_params: MarginParams,
    pub mark_price_params: MarkPriceParams,
    pub liquidation_params: LiquidationParams,
}

impl MarketConfig {
    pub fn new(id: MarketId, name: &str, base_asset: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            base_asset: base_asset.to_string(),
            quote_asset: "USD".to_string(),
            spot_enabled: false,
            min_order_size: 1,
            margin_params: MarginParams::default(),
            mark_price_params: MarkPriceParams::default(),
            liquidation_params: LiquidationParams::default(),
        }
    }

    pub fn eth_perp() -> Self {
        Self::new(MarketId(1), "ETH-PERP", "ETH")
    }

    pub fn with_spot(mut self) -> Self {
        self.spot_enabled = true;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.margin_params.validate()?;
        if self.min_order_size == 0 {
            return Err(ConfigError::InvalidMarket {
                reason: "minimum order size must be positive".to_string(),
            });
        }
        if self.mark_price_params.trade_buffer_capacity == 0 {
            return Err(ConfigError::InvalidMarkPrice {
                reason: "trade buffer needs capacity".to_string(),
            });
        }
        if self.mark_price_params.vwap_window_secs == 0 {
            return Err(ConfigError::InvalidMarkPrice {
                reason: "VWAP window must be positive".to_string(),
            });
        }
        if self.liquidation_params.penalty_bps.value() > 10_000 {
            return Err(ConfigError::InvalidLiquidation {
                reason: "penalty above 100%".to_string(),
            });
        }
        Ok(())
    }

    /// Validate an order size
    pub fn validate_size(&self, size: u128) -> Result<(), MarketError> {
        if size == 0 {
            return Err(MarketError::ZeroAmount);
        }
        if size < self.min_order_size {
            return Err(MarketError::OrderTooSmall {
                size,
                minimum: self.min_order_size,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid margin parameters: {0}")]
    InvalidMargin(#[from] MarginParamsError),

    #[error("invalid market: {reason}")]
    InvalidMarket { reason: String },

    #[error("invalid mark price settings: {reason}")]
    InvalidMarkPrice { reason: String },

    #[error("invalid liquidation settings: {reason}")]
    InvalidLiquidation { reason: String },
}

/// Dynamic market state (changes during trading)
#[derive(Debug, Clone)]
pub struct MarketState {
    pub config: MarketConfig,
    pub status: MarketStatus,
    pub margin_book: OrderBook,
    pub spot_book: OrderBook,
    /// Active orders. Filled and cancelled ones move to the engine's history.
    pub orders: HashMap<OrderId, Order>,
    pub trades: TradeBuffer,
    pub open_interest: u128,
    pub volume: u128,
    next_sequence: u64,
    pub last_updated: Timestamp,
}

impl MarketState {
    pub fn new(config: MarketConfig, timestamp: Timestamp) -> Self {
        let trades = TradeBuffer::new(config.mark_price_params.trade_buffer_capacity);
        Self {
            margin_book: OrderBook::new(config.id),
            spot_book: OrderBook::new(config.id),
            config,
            status: MarketStatus::Active,
            orders: HashMap::new(),
            trades,
            open_interest: 0,
            volume: 0,
            next_sequence: 1,
            last_updated: timestamp,
        }
    }

    pub fn id(&self) -> MarketId {
        self.config.id
    }

    pub fn is_active(&self) -> bool {
        self.status == MarketStatus::Active
    }

    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    pub fn book(&self, class: OrderClass) -> &OrderBook {
        match class {
            OrderClass::Margin => &self.margin_book,
            OrderClass::Spot => &self.spot_book,
        }
    }

    pub fn book_mut(&mut self, class: OrderClass) -> &mut OrderBook {
        match class {
            OrderClass::Margin => &mut self.margin_book,
            OrderClass::Spot => &mut self.spot_book,
        }
    }

    /// Rejects orders the market cannot take in its current state.
    pub fn check_accepts(&self, class: OrderClass) -> Result<(), MarketError> {
        if !self.is_active() {
            return Err(MarketError::MarketNotActive(self.id()));
        }
        if class == OrderClass::Spot && !self.config.spot_enabled {
            return Err(MarketError::SpotDisabled(self.id()));
        }
        Ok(())
    }

    pub fn record_trade(&mut self, trade: Trade) {
        self.volume = self.volume.saturating_add(trade.amount);
        self.last_updated = trade.timestamp;
        self.trades.record(trade);
    }

    pub fn last_trade_price(&self) -> Option<Price> {
        self.trades.last_price()
    }

    pub fn calculate_vwap(&self, window_secs: u64, now: Timestamp) -> VwapResult {
        self.trades.vwap(window_secs, now, self.config.mark_price_params.min_vwap_volume)
    }

    pub fn vwap_views(&self, now: Timestamp) -> VwapViews {
        self.trades.vwap_views(now, self.config.mark_price_params.min_vwap_volume)
    }

    /// Mark price from the default VWAP window and the margin book.
    pub fn mark_price(&self, now: Timestamp) -> MarkPrice {
        let params = &self.config.mark_price_params;
        let vwap = self.calculate_vwap(params.vwap_window_secs, now);
        resolve_mark_price(
            &vwap,
            self.margin_book.best_bid(),
            self.margin_book.best_ask(),
            self.last_trade_price(),
            params,
        )
    }

    pub fn orders_of(&self, account_id: AccountId) -> impl Iterator<Item = &Order> {
        self.orders.values().filter(move |o| o.account_id == account_id)
    }

    pub fn active_orders_of(&self, account_id: AccountId) -> Vec<OrderId> {
        let mut ids: Vec<(u64, OrderId)> = self
            .orders_of(account_id)
            .filter(|o| o.status.is_active())
            .map(|o| (o.sequence, o.id))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarketError {
    #[error("Amount must be greater than zero")]
    ZeroAmount,

    #[error("Price must be greater than zero")]
    ZeroPrice,

    #[error("Order size {size} below minimum {minimum}")]
    OrderTooSmall { size: u128, minimum: u128 },

    #[error("Market {0:?} is not active")]
    MarketNotActive(MarketId),

    #[error("Market {0:?} does not accept spot orders")]
    SpotDisabled(MarketId),

    #[error("Market {0:?} already exists")]
    DuplicateMarket(MarketId),

    #[error("Invalid market configuration: {0}")]
    Config(#[from] ConfigError),
}

impl MarketError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MarketError::ZeroAmount
            | MarketError::ZeroPrice
            | MarketError::OrderTooSmall { .. }
            | MarketError::DuplicateMarket(_)
            | MarketError::Config(_) => ErrorKind::Validation,
            MarketError::MarketNotActive(_) | MarketError::SpotDisabled(_) => ErrorKind::MarketMismatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bps;

    #[test]
    fn default_config_is_valid() {
        let config = MarketConfig::eth_perp();
        assert_eq!(config.name, "ETH-PERP");
        assert!(config.validate().is_ok());
        assert!(!config.spot_enabled);
        assert!(config.clone().with_spot().spot_enabled);
    }

    #[test]
    fn invalid_configs_rejected() {
        let mut config = MarketConfig::eth_perp();
        config.margin_params.short_maintenance = Bps::new(100);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidMargin(_))));

        let mut config = MarketConfig::eth_perp();
        config.mark_price_params.trade_buffer_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidMarkPrice { .. })));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = MarketConfig::eth_perp().with_spot();
        let json = serde_json::to_string(&config).unwrap();
        let back: MarketConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn validate_size() {
        let mut config = MarketConfig::eth_perp();
        config.min_order_size = 10;
        assert_eq!(config.validate_size(0), Err(MarketError::ZeroAmount));
        assert!(matches!(config.validate_size(9), Err(MarketError::OrderTooSmall { .. })));
        assert!(config.validate_size(10).is_ok());
    }

    #[test]
    fn spot_orders_need_spot_enabled() {
        let state = MarketState::new(MarketConfig::eth_perp(), Timestamp::from_millis(0));
        assert!(state.check_accepts(OrderClass::Margin).is_ok());
        let err = state.check_accepts(OrderClass::Spot).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MarketMismatch);

        let mut paused = MarketState::new(MarketConfig::eth_perp().with_spot(), Timestamp::from_millis(0));
        assert!(paused.check_accepts(OrderClass::Spot).is_ok());
        paused.status = MarketStatus::Paused;
        assert_eq!(paused.check_accepts(OrderClass::Margin), Err(MarketError::MarketNotActive(MarketId(1))));
    }

    #[test]
    fn fresh_market_marks_at_default() {
        let state = MarketState::new(MarketConfig::eth_perp(), Timestamp::from_millis(0));
        let mark = state.mark_price(Timestamp::from_millis(0));
        assert_eq!(mark.price, state.config.mark_price_params.default_price);
    }
}
