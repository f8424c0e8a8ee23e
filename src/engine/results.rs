// 8.0.2: result types and errors for engine operations.

use crate::ledger::{LedgerError, SettlementFailure};
use crate::liquidation::LossAllocation;
use crate::market::{ConfigError, MarketError};
use crate::mark_price::MarkPrice;
use crate::order::{Fill, OrderStatus};
use crate::types::{AccountId, MarketId, OrderId, Price, Quote, SignedSize};
use serde::{Deserialize, Serialize};

/// Coarse classification every concrete error maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    Authorization,
    InsufficientCollateral,
    NoLiquidity,
    MarketMismatch,
    InternalInvariant,
}

#[derive(Debug, Clone)]
pub struct OrderResult {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub filled_size: u128,
    pub remaining_size: u128,
    pub average_price: Option<Price>,
    pub margin_reserved: Quote,
    pub is_posted: bool,
    pub fills: Vec<Fill>,
    /// Liquidations triggered by this order's fills.
    pub liquidations: Vec<LiquidationResult>,
}

#[derive(Debug, Clone)]
pub struct LiquidationResult {
    pub account_id: AccountId,
    pub market_id: MarketId,
    pub closed_size: SignedSize,
    pub remaining_size: SignedSize,
    pub liquidation_price: Price,
    pub mark_price: MarkPrice,
    pub realized_pnl: Quote,
    pub allocation: LossAllocation,
    pub liquidator: Option<AccountId>,
}

impl LiquidationResult {
    pub fn is_full(&self) -> bool {
        self.remaining_size.is_zero()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Market {0:?} not found")]
    MarketNotFound(MarketId),

    #[error("Order {0:?} not found")]
    OrderNotFound(OrderId),

    #[error("Account {account_id:?} does not own order {order_id:?}")]
    NotOrderOwner { order_id: OrderId, account_id: AccountId },

    #[error("No liquidity to fill market order in {0:?}")]
    NoLiquidity(MarketId),

    #[error("Account {account_id:?} has no position in {market_id:?}")]
    NoPosition { account_id: AccountId, market_id: MarketId },

    #[error("Account {account_id:?} is not liquidatable in {market_id:?}")]
    NotLiquidatable { account_id: AccountId, market_id: MarketId },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Market error: {0}")]
    Market(#[from] MarketError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementFailure),

    #[error("Engine invariant violated: {0}")]
    Invariant(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::MarketNotFound(_) => ErrorKind::MarketMismatch,
            EngineError::OrderNotFound(_)
            | EngineError::NoPosition { .. }
            | EngineError::NotLiquidatable { .. }
            | EngineError::Config(_) => ErrorKind::Validation,
            EngineError::NotOrderOwner { .. } => ErrorKind::Authorization,
            EngineError::NoLiquidity(_) => ErrorKind::NoLiquidity,
            EngineError::Ledger(e) => e.kind(),
            EngineError::Market(e) => e.kind(),
            EngineError::Settlement(e) => e.error.kind(),
            EngineError::Invariant(_) => ErrorKind::InternalInvariant,
        }
    }
}
