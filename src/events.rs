// 11.0: every state change produces an event. used for audit trails and for
// tests that need to see what happened inside a match. the EventPayload enum
// lists all event types.

use crate::liquidation::{LiquidationReason, LossAllocation};
use crate::mark_price::MarkSource;
use crate::order::OrderClass;
use crate::position::Netting;
use crate::types::{AccountId, MarketId, OrderId, Price, Quote, Side, SignedSize, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    // Trade events
    Fill(FillEvent),
    OrderPlaced(OrderPlacedEvent),
    OrderCanceled(OrderCanceledEvent),
    PositionUpdated(PositionUpdatedEvent),

    // Account events
    Deposit(DepositEvent),
    Withdrawal(WithdrawalEvent),
    WithdrawalRejected(WithdrawalRejectedEvent),
    BaseTransfer(BaseTransferEvent),

    // Risk events
    Liquidation(LiquidationEvent),
    BadDebt(BadDebtEvent),
    MarginAnomaly(MarginAnomalyEvent),
    LiquidationSkipped(LiquidationSkippedEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub market_id: MarketId,
    pub class: OrderClass,
    pub taker_order_id: OrderId,
    pub maker_order_id: OrderId,
    pub taker_account_id: AccountId,
    pub maker_account_id: AccountId,
    pub taker_side: Side,
    pub quantity: u128,
    pub price: Price,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlacedEvent {
    pub market_id: MarketId,
    pub order_id: OrderId,
    pub account_id: AccountId,
    pub side: Side,
    pub class: OrderClass,
    pub amount: u128,
    pub price: Option<Price>,
    pub margin_reserved: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCanceledEvent {
    pub market_id: MarketId,
    pub order_id: OrderId,
    pub account_id: AccountId,
    pub reason: CancelReason,
    pub remaining: u128,
    pub released: Quote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    UserRequested,
    InsufficientMargin,
    /// Market order remainder with nothing left to match.
    Unfilled,
    Liquidation,
    MarketSettled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdatedEvent {
    pub market_id: MarketId,
    pub account_id: AccountId,
    pub branch: Netting,
    pub new_size: SignedSize,
    pub entry_price: Option<Price>,
    pub realized_pnl: Quote,
    pub margin: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositEvent {
    pub account_id: AccountId,
    pub amount: Quote,
    pub new_balance: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalEvent {
    pub account_id: AccountId,
    pub amount: Quote,
    pub new_balance: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRejectedEvent {
    pub account_id: AccountId,
    pub amount: Quote,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseTransferEvent {
    pub account_id: AccountId,
    pub market_id: MarketId,
    /// Positive for deposits, negative for withdrawals.
    pub amount: i128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub market_id: MarketId,
    pub account_id: AccountId,
    pub liquidated_size: SignedSize,
    pub liquidation_price: Price,
    pub mark_price: Price,
    pub mark_source: MarkSource,
    pub allocation: LossAllocation,
    pub liquidator_account: Option<AccountId>,
    pub reason: LiquidationReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadDebtEvent {
    pub market_id: MarketId,
    pub account_id: AccountId,
    pub debt_amount: Quote,
    pub covered_by_insurance: Quote,
    pub socialized_loss: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginAnomalyEvent {
    pub account_id: AccountId,
    pub order_id: Option<OrderId>,
    pub excess: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationSkippedEvent {
    pub market_id: MarketId,
    pub account_id: AccountId,
    pub size: SignedSize,
    pub mark_price: Price,
}

/// Bounded in-memory audit log; the oldest events drop off first.
#[derive(Debug, Clone)]
pub struct EventLog {
    events: VecDeque<Event>,
    next_id: u64,
    max_events: usize,
    /// Events of the open transaction, published on commit.
    staged: Option<Vec<Event>>,
}

impl EventLog {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::new(),
            next_id: 1,
            max_events,
            staged: None,
        }
    }

    pub fn emit(&mut self, timestamp: Timestamp, payload: EventPayload) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        let event = Event::new(id, timestamp, payload);
        match self.staged.as_mut() {
            Some(staged) => staged.push(event),
            None => self.publish(event),
        }
        id
    }

    fn publish(&mut self, event: Event) {
        self.events.push_back(event);
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
    }

    pub(crate) fn begin(&mut self) {
        self.staged.get_or_insert_with(Vec::new);
    }

    pub(crate) fn commit(&mut self) {
        for event in self.staged.take().unwrap_or_default() {
            self.publish(event);
        }
    }

    /// Drops the staged events and hands their ids out again.
    pub(crate) fn rollback(&mut self) {
        if let Some(staged) = self.staged.take() {
            self.next_id -= staged.len() as u64;
        }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Event> {
        self.events.iter()
    }

    pub fn recent(&self, count: usize) -> Vec<&Event> {
        let start = self.events.len().saturating_sub(count);
        self.events.range(start..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
