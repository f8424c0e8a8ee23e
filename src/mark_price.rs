// 13.0: mark price derivation. VWAP over a bounded trade history, with a fixed
// fallback chain when recent volume is too thin: mid, one-sided book, last
// trade, configured default. the same function serves matching and liquidation.

use crate::fixed::{mid_price, narrow, shift_price, vwap_price, BASE_UNIT, U256};
use crate::types::{AccountId, Bps, Price, Timestamp};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPriceParams {
    pub vwap_enabled: bool,
    pub vwap_window_secs: u64,
    /// Minimum base volume in the window for the VWAP to count.
    pub min_vwap_volume: u128,
    pub bid_premium: Bps,
    pub ask_discount: Bps,
    pub default_price: Price,
    pub trade_buffer_capacity: usize,
}

impl Default for MarkPriceParams {
    fn default() -> Self {
        Self {
            vwap_enabled: true,
            vwap_window_secs: 300,
            min_vwap_volume: BASE_UNIT,
            bid_premium: Bps::new(100),
            ask_discount: Bps::new(100),
            default_price: Price::new_unchecked(1_000_000),
            trade_buffer_capacity: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub buyer: AccountId,
    pub seller: AccountId,
    pub price: Price,
    pub amount: u128,
    pub timestamp: Timestamp,
}

// 13.1: fixed-capacity ring. once full the oldest trade is overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeBuffer {
    trades: Vec<Trade>,
    head: usize,
    capacity: usize,
    total_recorded: u64,
}

impl TradeBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            trades: Vec::with_capacity(capacity),
            head: 0,
            capacity,
            total_recorded: 0,
        }
    }

    pub fn record(&mut self, trade: Trade) {
        if self.trades.len() < self.capacity {
            self.trades.push(trade);
        } else {
            self.trades[self.head] = trade;
            self.head = (self.head + 1) % self.capacity;
        }
        self.total_recorded += 1;
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Trade> {
        let (newer, older) = self.trades.split_at(self.head);
        older.iter().chain(newer.iter())
    }

    pub fn last(&self) -> Option<&Trade> {
        if self.trades.len() < self.capacity {
            self.trades.last()
        } else {
            self.trades.get((self.head + self.capacity - 1) % self.capacity)
        }
    }

    pub fn last_price(&self) -> Option<Price> {
        self.last().map(|t| t.price)
    }

    // 13.2: VWAP over trades with timestamp >= now - window
    pub fn vwap(&self, window_secs: u64, now: Timestamp, min_volume: u128) -> VwapResult {
        let start = now.minus_secs(window_secs);
        let mut weighted = U256::zero();
        let mut volume = U256::zero();
        let mut trade_count = 0usize;

        // a full ring of u128 × u64 terms stays far below 2^256
        for trade in self.iter().filter(|t| t.timestamp >= start) {
            weighted += U256::from(trade.amount) * U256::from(trade.price.raw());
            volume += U256::from(trade.amount);
            trade_count += 1;
        }

        let price = vwap_price(weighted, volume);
        let volume = narrow(volume).unwrap_or(u128::MAX);
        let is_valid = price.is_some() && trade_count >= 1 && volume >= min_volume;

        VwapResult {
            window_secs,
            price,
            volume,
            trade_count,
            is_valid,
        }
    }

    pub fn vwap_views(&self, now: Timestamp, min_volume: u128) -> VwapViews {
        VwapViews {
            m5: self.vwap(5 * 60, now, min_volume),
            m15: self.vwap(15 * 60, now, min_volume),
            h1: self.vwap(60 * 60, now, min_volume),
            h4: self.vwap(4 * 60 * 60, now, min_volume),
            h24: self.vwap(24 * 60 * 60, now, min_volume),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VwapResult {
    pub window_secs: u64,
    pub price: Option<Price>,
    pub volume: u128,
    pub trade_count: usize,
    pub is_valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VwapViews {
    pub m5: VwapResult,
    pub m15: VwapResult,
    pub h1: VwapResult,
    pub h4: VwapResult,
    pub h24: VwapResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkSource {
    Vwap,
    Mid,
    BidPremium,
    AskDiscount,
    LastTrade,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPrice {
    pub price: Price,
    pub source: MarkSource,
}

// 13.3: fallback chain, first match wins
pub fn resolve_mark_price(
    vwap: &VwapResult,
    best_bid: Option<Price>,
    best_ask: Option<Price>,
    last_trade: Option<Price>,
    params: &MarkPriceParams,
) -> MarkPrice {
    if params.vwap_enabled && vwap.is_valid {
        if let Some(price) = vwap.price {
            return MarkPrice { price, source: MarkSource::Vwap };
        }
    }

    match (best_bid, best_ask, last_trade) {
        (Some(bid), Some(ask), _) => MarkPrice {
            price: mid_price(bid, ask),
            source: MarkSource::Mid,
        },
        (Some(_), None, Some(last)) | (None, Some(_), Some(last)) => MarkPrice {
            price: last,
            source: MarkSource::LastTrade,
        },
        (Some(bid), None, None) => MarkPrice {
            price: shift_price(bid, params.bid_premium, true),
            source: MarkSource::BidPremium,
        },
        (None, Some(ask), None) => MarkPrice {
            price: shift_price(ask, params.ask_discount, false),
            source: MarkSource::AskDiscount,
        },
        (None, None, Some(last)) => MarkPrice {
            price: last,
            source: MarkSource::LastTrade,
        },
        (None, None, None) => MarkPrice {
            price: params.default_price,
            source: MarkSource::Default,
        },
    }
}
