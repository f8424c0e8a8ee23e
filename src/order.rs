//! Order types and order book implementation.
//!
//! Limit orders rest with price-time priority; market orders execute
//! immediately against the opposite side. The book holds only index entries
//! keyed by price and sequence number; full order records live in the
//! market's order arena.

use crate::events::CancelReason;
use crate::fixed::{mul_div_floor, notional, pro_rata, BASE_UNIT};
use crate::types::{AccountId, MarketId, OrderId, Price, Quote, Side, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Limit(Price),
    /// Executes against resting liquidity, never rests.
    Market,
}

/// Which book the order trades in. Spot and margin orders never match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderClass {
    Margin,
    Spot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderOrigin {
    User,
    /// Synthetic order closing a liquidated position.
    Liquidation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Partial,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Partial)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

/// A trading order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub account_id: AccountId,
    pub market_id: MarketId,
    pub side: Side,
    pub kind: OrderKind,
    pub class: OrderClass,
    pub origin: OrderOrigin,
    pub amount: u128,
    pub remaining: u128,
    pub filled: u128,
    /// Σ floor(qty × price) over fills.
    pub fill_notional: Quote,
    /// Quote reserved at placement.
    pub margin_reserved: Quote,
    /// Part of the reservation already returned.
    pub reserve_released: Quote,
    /// Leading fill quantity that reduces an existing position. It was
    /// never reserved for, so those fills release nothing.
    pub reserve_offset: u128,
    /// Opening quantity after the offset over which the reservation is
    /// released.
    pub reserve_basis: u128,
    /// Spot base still held for this sell order.
    pub base_held: u128,
    pub status: OrderStatus,
    pub cancel_reason: Option<CancelReason>,
    pub sequence: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: OrderId,
        account_id: AccountId,
        market_id: MarketId,
        side: Side,
        kind: OrderKind,
        class: OrderClass,
        origin: OrderOrigin,
        amount: u128,
        sequence: u64,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id,
            account_id,
            market_id,
            side,
            kind,
            class,
            origin,
            amount,
            remaining: amount,
            filled: 0,
            fill_notional: Quote::zero(),
            margin_reserved: Quote::zero(),
            reserve_released: Quote::zero(),
            reserve_offset: 0,
            reserve_basis: amount,
            base_held: 0,
            status: OrderStatus::Pending,
            cancel_reason: None,
            sequence,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    pub fn limit_price(&self) -> Option<Price> {
        match self.kind {
            OrderKind::Limit(price) => Some(price),
            OrderKind::Market => None,
        }
    }

    pub fn is_filled(&self) -> bool {
        self.remaining == 0
    }

    /// Whether this order would trade against a resting order at `price`.
    pub fn crosses(&self, price: Price) -> bool {
        match (self.kind, self.side) {
            (OrderKind::Market, _) => true,
            (OrderKind::Limit(limit), Side::Long) => limit >= price,
            (OrderKind::Limit(limit), Side::Short) => limit <= price,
        }
    }

    pub fn unreleased_reservation(&self) -> Quote {
        self.margin_reserved.sub(self.reserve_released).floor_zero()
    }

    /// Reservation slice freed if `quantity` more fills now. Cumulative over
    /// the order's life so rounding never accumulates: the last fill of the
    /// basis returns exactly what is left.
    pub fn release_for_fill(&self, quantity: u128) -> Quote {
        let filled_after = self.filled.saturating_add(quantity);
        let opened = filled_after.saturating_sub(self.reserve_offset);
        let target = if opened == 0 {
            Quote::zero()
        } else if self.reserve_basis == 0 || opened >= self.reserve_basis {
            self.margin_reserved
        } else {
            pro_rata(self.margin_reserved, opened, self.reserve_basis)
        };
        target.sub(self.reserve_released).floor_zero()
    }

    pub fn apply_fill(&mut self, quantity: u128, price: Price, released: Quote, timestamp: Timestamp) {
        debug_assert!(quantity <= self.remaining, "cannot fill more than remaining");
        self.remaining -= quantity;
        self.filled += quantity;
        self.fill_notional = self.fill_notional.add(notional(quantity, price));
        self.reserve_released = self.reserve_released.add(released);
        self.base_held = self.base_held.saturating_sub(quantity);
        self.status = if self.remaining == 0 {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };
        self.updated_at = timestamp;
    }

    /// Moves an active order to Cancelled. Returns false for terminal orders.
    pub fn cancel(&mut self, reason: CancelReason, timestamp: Timestamp) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = OrderStatus::Cancelled;
        self.cancel_reason = Some(reason);
        self.updated_at = timestamp;
        true
    }

    /// Hands out whatever reservation and held base remain.
    pub fn take_leftovers(&mut self) -> (Quote, u128) {
        let quote = self.unreleased_reservation();
        let base = self.base_held;
        self.reserve_released = self.margin_reserved;
        self.base_held = 0;
        (quote, base)
    }

    pub fn average_price(&self) -> Option<Price> {
        if self.filled == 0 {
            return None;
        }
        let raw = mul_div_floor(self.fill_notional.raw().max(0) as u128, BASE_UNIT, self.filled)?;
        u64::try_from(raw).ok().and_then(Price::new)
    }
}

/// Terminal orders kept for lookups after they leave their market. Once
/// full, the oldest order is evicted.
#[derive(Debug, Clone)]
pub struct OrderHistory {
    orders: HashMap<OrderId, Order>,
    fifo: VecDeque<OrderId>,
    capacity: usize,
}

impl OrderHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            orders: HashMap::new(),
            fifo: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, order_id: OrderId) -> Option<&Order> {
        self.orders.get(&order_id)
    }

    pub fn len(&self) -> usize {
        self.fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stores a terminal order and returns the one evicted to make room.
    pub fn push(&mut self, order: Order) -> Option<Order> {
        let evicted = if self.fifo.len() >= self.capacity {
            self.fifo.pop_front().and_then(|id| self.orders.remove(&id))
        } else {
            None
        };
        self.fifo.push_back(order.id);
        self.orders.insert(order.id, order);
        evicted
    }

    /// Reverts the newest `push` of `order_id`, putting back what it evicted.
    pub fn unpush(&mut self, order_id: OrderId, evicted: Option<Order>) {
        if self.fifo.back() == Some(&order_id) {
            self.fifo.pop_back();
            self.orders.remove(&order_id);
        }
        if let Some(order) = evicted {
            self.fifo.push_front(order.id);
            self.orders.insert(order.id, order);
        }
    }
}

/// Resting order as seen by the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookEntry {
    pub order_id: OrderId,
    pub account_id: AccountId,
    pub side: Side,
    pub price: Price,
    pub remaining: u128,
}

/// A single price level in the order book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Price,
    pub total_size: u128,
    pub order_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDepth {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BookKey {
    Bid(Reverse<Price>, u64),
    Ask(Price, u64),
}

/// Central Limit Order Book (CLOB)
#[derive(Debug, Clone)]
pub struct OrderBook {
    pub market_id: MarketId,
    /// Highest price first, then earliest sequence
    bids: BTreeMap<(Reverse<Price>, u64), BookEntry>,
    /// Lowest price first, then earliest sequence
    asks: BTreeMap<(Price, u64), BookEntry>,
    order_index: HashMap<OrderId, BookKey>,
}

impl OrderBook {
    pub fn new(market_id: MarketId) -> Self {
        Self {
            market_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            order_index: HashMap::new(),
        }
    }

    pub fn best_bid(&self) -> Option<Price> {
        self.bids.values().next().map(|e| e.price)
    }

    pub fn best_ask(&self) -> Option<Price> {
        self.asks.values().next().map(|e| e.price)
    }

    /// Best resting order a taker on `taker_side` would meet.
    pub fn best_opposite(&self, taker_side: Side) -> Option<BookEntry> {
        match taker_side {
            Side::Long => self.asks.values().next().copied(),
            Side::Short => self.bids.values().next().copied(),
        }
    }

    pub fn insert(&mut self, order: &Order) -> bool {
        let Some(price) = order.limit_price() else {
            return false;
        };
        let entry = BookEntry {
            order_id: order.id,
            account_id: order.account_id,
            side: order.side,
            price,
            remaining: order.remaining,
        };
        let key = match order.side {
            Side::Long => {
                self.bids.insert((Reverse(price), order.sequence), entry);
                BookKey::Bid(Reverse(price), order.sequence)
            }
            Side::Short => {
                self.asks.insert((price, order.sequence), entry);
                BookKey::Ask(price, order.sequence)
            }
        };
        self.order_index.insert(order.id, key);
        true
    }

    pub fn remove(&mut self, order_id: OrderId) -> Option<BookEntry> {
        match self.order_index.remove(&order_id)? {
            BookKey::Bid(price, seq) => self.bids.remove(&(price, seq)),
            BookKey::Ask(price, seq) => self.asks.remove(&(price, seq)),
        }
    }

    pub fn get(&self, order_id: OrderId) -> Option<&BookEntry> {
        match self.order_index.get(&order_id)? {
            BookKey::Bid(price, seq) => self.bids.get(&(*price, *seq)),
            BookKey::Ask(price, seq) => self.asks.get(&(*price, *seq)),
        }
    }

    pub fn contains(&self, order_id: OrderId) -> bool {
        self.order_index.contains_key(&order_id)
    }

    /// Decrements a resting order, removing it once empty. Returns what is
    /// left on the book.
    pub fn reduce(&mut self, order_id: OrderId, quantity: u128) -> Option<u128> {
        let key = *self.order_index.get(&order_id)?;
        let entry = match key {
            BookKey::Bid(price, seq) => self.bids.get_mut(&(price, seq)),
            BookKey::Ask(price, seq) => self.asks.get_mut(&(price, seq)),
        }?;
        entry.remaining = entry.remaining.saturating_sub(quantity);
        let left = entry.remaining;
        if left == 0 {
            self.remove(order_id);
        }
        Some(left)
    }

    /// (price, size) per order a taker would walk through, up to `amount`.
    pub fn sweep(&self, taker_side: Side, amount: u128) -> Vec<(Price, u128)> {
        match taker_side {
            Side::Long => sweep_entries(self.asks.values(), amount),
            Side::Short => sweep_entries(self.bids.values(), amount),
        }
    }

    pub fn bid_levels(&self, max_levels: usize) -> Vec<PriceLevel> {
        aggregate(self.bids.values(), max_levels)
    }

    pub fn ask_levels(&self, max_levels: usize) -> Vec<PriceLevel> {
        aggregate(self.asks.values(), max_levels)
    }

    pub fn depth(&self, max_levels: usize) -> BookDepth {
        BookDepth {
            bids: self.bid_levels(max_levels),
            asks: self.ask_levels(max_levels),
        }
    }

    /// Check if the book is crossed (best bid >= best ask)
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    pub fn order_count(&self) -> usize {
        self.bids.len() + self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn side_is_empty(&self, side: Side) -> bool {
        match side {
            Side::Long => self.bids.is_empty(),
            Side::Short => self.asks.is_empty(),
        }
    }
}

fn sweep_entries<'a>(entries: impl Iterator<Item = &'a BookEntry>, amount: u128) -> Vec<(Price, u128)> {
    let mut left = amount;
    let mut out = Vec::new();
    for entry in entries {
        if left == 0 {
            break;
        }
        let take = entry.remaining.min(left);
        out.push((entry.price, take));
        left -= take;
    }
    out
}

fn aggregate<'a>(entries: impl Iterator<Item = &'a BookEntry>, max_levels: usize) -> Vec<PriceLevel> {
    let mut levels: Vec<PriceLevel> = Vec::new();
    for entry in entries {
        match levels.last_mut() {
            Some(level) if level.price == entry.price => {
                level.total_size = level.total_size.saturating_add(entry.remaining);
                level.order_count += 1;
            }
            _ => {
                if levels.len() >= max_levels {
                    break;
                }
                levels.push(PriceLevel {
                    price: entry.price,
                    total_size: entry.remaining,
                    order_count: 1,
                });
            }
        }
    }
    levels
}

/// A fill (execution) between two orders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    pub maker_order_id: OrderId,
    pub maker_account_id: AccountId,
    pub taker_order_id: OrderId,
    pub taker_account_id: AccountId,
    pub price: Price,
    pub quantity: u128,
    pub taker_side: Side,
    pub class: OrderClass,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price(whole: u64) -> Price {
        Price::new_unchecked(whole * 1_000_000)
    }

    fn limit(id: u64, side: Side, px: u64, amount: u128) -> Order {
        Order::new(
            OrderId(id),
            AccountId(id),
            MarketId(1),
            side,
            OrderKind::Limit(price(px)),
            OrderClass::Margin,
            OrderOrigin::User,
            amount,
            id,
            Timestamp::from_millis(id as i64),
        )
    }

    #[test]
    fn bids_prefer_price_then_time() {
        let mut book = OrderBook::new(MarketId(1));
        book.insert(&limit(1, Side::Long, 100, 5));
        book.insert(&limit(2, Side::Long, 101, 5));
        book.insert(&limit(3, Side::Long, 101, 5));

        assert_eq!(book.best_bid(), Some(price(101)));
        // same price: earliest sequence first
        assert_eq!(book.best_opposite(Side::Short).unwrap().order_id, OrderId(2));
    }

    #[test]
    fn asks_prefer_lowest_then_time() {
        let mut book = OrderBook::new(MarketId(1));
        book.insert(&limit(1, Side::Short, 102, 5));
        book.insert(&limit(2, Side::Short, 101, 5));
        book.insert(&limit(3, Side::Short, 101, 5));

        assert_eq!(book.best_ask(), Some(price(101)));
        assert_eq!(book.best_opposite(Side::Long).unwrap().order_id, OrderId(2));
        assert!(!book.is_crossed());
    }

    #[test]
    fn reduce_removes_when_empty() {
        let mut book = OrderBook::new(MarketId(1));
        book.insert(&limit(1, Side::Short, 100, 5));
        assert_eq!(book.reduce(OrderId(1), 2), Some(3));
        assert_eq!(book.reduce(OrderId(1), 3), Some(0));
        assert!(!book.contains(OrderId(1)));
        assert!(book.is_empty());
        assert_eq!(book.best_ask(), None);
    }

    #[test]
    fn levels_aggregate_by_price() {
        let mut book = OrderBook::new(MarketId(1));
        book.insert(&limit(1, Side::Long, 100, 5));
        book.insert(&limit(2, Side::Long, 100, 7));
        book.insert(&limit(3, Side::Long, 99, 1));
        book.insert(&limit(4, Side::Short, 103, 2));

        let depth = book.depth(1);
        assert_eq!(depth.bids, vec![PriceLevel { price: price(100), total_size: 12, order_count: 2 }]);
        assert_eq!(depth.asks.len(), 1);
        assert_eq!(book.bid_levels(5).len(), 2);
    }

    #[test]
    fn sweep_walks_opposite_side() {
        let mut book = OrderBook::new(MarketId(1));
        book.insert(&limit(1, Side::Short, 10, 4));
        book.insert(&limit(2, Side::Short, 11, 4));
        assert_eq!(book.sweep(Side::Long, 6), vec![(price(10), 4), (price(11), 2)]);
        assert_eq!(book.sweep(Side::Long, 100).iter().map(|(_, q)| q).sum::<u128>(), 8);
        assert!(book.sweep(Side::Short, 5).is_empty());
    }

    #[test]
    fn cumulative_release_returns_exact_remainder() {
        let mut order = limit(1, Side::Long, 10, 3);
        order.margin_reserved = Quote::new(100);

        let first = order.release_for_fill(1);
        assert_eq!(first, Quote::new(33));
        order.apply_fill(1, price(10), first, Timestamp::from_millis(1));
        assert_eq!(order.status, OrderStatus::Partial);

        let second = order.release_for_fill(1);
        assert_eq!(second, Quote::new(33));
        order.apply_fill(1, price(10), second, Timestamp::from_millis(2));

        let last = order.release_for_fill(1);
        assert_eq!(last, Quote::new(34));
        order.apply_fill(1, price(10), last, Timestamp::from_millis(3));
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.unreleased_reservation(), Quote::zero());
    }

    #[test]
    fn reducing_fills_release_nothing() {
        // 2 of 5 close an existing position, 3 open and carry the reservation
        let mut order = limit(1, Side::Short, 10, 5);
        order.margin_reserved = Quote::new(90);
        order.reserve_offset = 2;
        order.reserve_basis = 3;

        assert_eq!(order.release_for_fill(2), Quote::zero());
        order.apply_fill(2, price(10), Quote::zero(), Timestamp::from_millis(1));
        assert_eq!(order.unreleased_reservation(), Quote::new(90));

        // straddles the boundary: one closing, one opening
        order.apply_fill(1, price(10), Quote::zero(), Timestamp::from_millis(2));
        let straddle = order.release_for_fill(1);
        assert_eq!(straddle, Quote::new(30));
        order.apply_fill(1, price(10), straddle, Timestamp::from_millis(3));

        let last = order.release_for_fill(1);
        assert_eq!(last, Quote::new(60));
    }

    #[test]
    fn history_evicts_oldest_and_unwinds() {
        let mut history = OrderHistory::new(2);
        assert_eq!(history.push(limit(1, Side::Long, 10, 1)).map(|o| o.id), None);
        history.push(limit(2, Side::Long, 10, 1));
        let evicted = history.push(limit(3, Side::Long, 10, 1));
        assert_eq!(evicted.as_ref().map(|o| o.id), Some(OrderId(1)));
        assert_eq!(history.len(), 2);
        assert!(history.get(OrderId(1)).is_none());

        history.unpush(OrderId(3), evicted);
        assert!(history.get(OrderId(3)).is_none());
        assert!(history.get(OrderId(1)).is_some());
        assert_eq!(history.len(), 2);

        // a later push still evicts in insertion order
        let evicted = history.push(limit(4, Side::Long, 10, 1));
        assert_eq!(evicted.map(|o| o.id), Some(OrderId(1)));
    }

    #[test]
    fn cancel_is_noop_on_terminal_orders() {
        let mut order = limit(1, Side::Long, 10, 3);
        assert!(order.cancel(CancelReason::UserRequested, Timestamp::from_millis(1)));
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(!order.cancel(CancelReason::UserRequested, Timestamp::from_millis(2)));
    }

    #[test]
    fn average_fill_price() {
        let mut order = limit(1, Side::Long, 12, 2 * BASE_UNIT);
        order.apply_fill(BASE_UNIT, price(10), Quote::zero(), Timestamp::from_millis(1));
        order.apply_fill(BASE_UNIT, price(12), Quote::zero(), Timestamp::from_millis(2));
        assert_eq!(order.average_price(), Some(price(11)));
    }

    #[test]
    fn crossing_rules() {
        let bid = limit(1, Side::Long, 10, 1);
        assert!(bid.crosses(price(10)));
        assert!(bid.crosses(price(9)));
        assert!(!bid.crosses(price(11)));
        let ask = limit(2, Side::Short, 10, 1);
        assert!(ask.crosses(price(11)));
        assert!(!ask.crosses(price(9)));
    }
}
