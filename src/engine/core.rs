// 8.0 engine/core.rs: main engine. holds all markets, the ledger and the event log.

use super::config::EngineConfig;
use super::results::EngineError;
use crate::account::Account;
use crate::events::{
    BaseTransferEvent, CancelReason, DepositEvent, Event, EventId, EventLog, EventPayload, MarginAnomalyEvent,
    OrderCanceledEvent, WithdrawalEvent, WithdrawalRejectedEvent,
};
use crate::ledger::Ledger;
use crate::market::{MarketConfig, MarketError, MarketState, MarketStatus};
use crate::order::{Order, OrderClass, OrderHistory, OrderStatus};
use crate::types::{to_i128, AccountId, MarketId, OrderId, Quote, Timestamp};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, error, info};

/** 8.1: main engine struct. all state lives here */
#[derive(Debug, Clone)]
pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) markets: BTreeMap<MarketId, MarketState>,
    pub(super) ledger: Ledger,
    /// Which market each active order lives in.
    pub(super) order_markets: HashMap<OrderId, MarketId>,
    pub(super) order_history: OrderHistory,
    pub(super) events: EventLog,
    pub(super) next_order_id: u64,
    pub(super) current_time: Timestamp,
    /// Set while a liquidation is executing its forced orders.
    pub(super) liquidation_in_progress: bool,
    checkpoint: Option<Checkpoint>,
}

// 8.2: undo record of the open transaction. markets are copied on first
// mutable access; routes and archived orders are replayed backwards.
#[derive(Debug, Clone)]
struct Checkpoint {
    markets: BTreeMap<MarketId, MarketState>,
    routes: Vec<(OrderId, Option<MarketId>)>,
    archived: Vec<(OrderId, Option<Order>)>,
    next_order_id: u64,
    liquidation_in_progress: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            ledger: Ledger::new(config.insurance_seed),
            events: EventLog::new(config.max_events),
            order_history: OrderHistory::new(config.max_order_history),
            config,
            markets: BTreeMap::new(),
            order_markets: HashMap::new(),
            next_order_id: 1,
            current_time: Timestamp::from_millis(0),
            liquidation_in_progress: false,
            checkpoint: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn set_time(&mut self, timestamp: Timestamp) {
        self.current_time = timestamp;
    }

    pub fn time(&self) -> Timestamp {
        self.current_time
    }

    pub fn advance_time(&mut self, millis: i64) {
        self.current_time = Timestamp::from_millis(self.current_time.as_millis() + millis);
    }

    /// Moves the clock to wall time. Never moves it backwards.
    pub fn sync_clock(&mut self) -> Timestamp {
        self.current_time = self.current_time.max(Timestamp::now());
        self.current_time
    }

    // 8.3: atomic operations. everything the operation touches is journaled
    // and restored if the operation, or the invariant check after it, fails.
    pub(super) fn transact<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        if self.checkpoint.is_some() {
            return op(self);
        }
        self.begin();
        let result = op(self).and_then(|value| {
            self.verify()?;
            Ok(value)
        });
        match &result {
            Ok(_) => self.commit(),
            Err(e) => {
                debug!(error = %e, kind = ?e.kind(), "operation reverted");
                self.rollback();
            }
        }
        result
    }

    fn begin(&mut self) {
        self.checkpoint = Some(Checkpoint {
            markets: BTreeMap::new(),
            routes: Vec::new(),
            archived: Vec::new(),
            next_order_id: self.next_order_id,
            liquidation_in_progress: self.liquidation_in_progress,
        });
        self.ledger.begin();
        self.events.begin();
    }

    fn commit(&mut self) {
        self.checkpoint = None;
        self.ledger.commit();
        self.events.commit();
    }

    fn rollback(&mut self) {
        if let Some(checkpoint) = self.checkpoint.take() {
            self.markets.extend(checkpoint.markets);
            for (order_id, prior) in checkpoint.routes.into_iter().rev() {
                match prior {
                    Some(market_id) => self.order_markets.insert(order_id, market_id),
                    None => self.order_markets.remove(&order_id),
                };
            }
            for (order_id, evicted) in checkpoint.archived.into_iter().rev() {
                self.order_history.unpush(order_id, evicted);
            }
            self.next_order_id = checkpoint.next_order_id;
            self.liquidation_in_progress = checkpoint.liquidation_in_progress;
        }
        self.ledger.rollback();
        self.events.rollback();
    }

    fn verify(&self) -> Result<(), EngineError> {
        if self.config.check_invariants {
            self.check_invariants()
        } else {
            Ok(())
        }
    }

    pub fn add_market(&mut self, config: MarketConfig) -> Result<MarketId, EngineError> {
        config.validate()?;
        let market_id = config.id;
        if self.markets.contains_key(&market_id) {
            return Err(MarketError::DuplicateMarket(market_id).into());
        }
        info!(market = ?market_id, name = %config.name, spot = config.spot_enabled, "market added");
        self.markets.insert(market_id, MarketState::new(config, self.current_time));
        Ok(market_id)
    }

    pub fn market(&self, market_id: MarketId) -> Result<&MarketState, EngineError> {
        self.markets.get(&market_id).ok_or(EngineError::MarketNotFound(market_id))
    }

    pub(super) fn market_mut(&mut self, market_id: MarketId) -> Result<&mut MarketState, EngineError> {
        let market = self.markets.get_mut(&market_id).ok_or(EngineError::MarketNotFound(market_id))?;
        if let Some(checkpoint) = self.checkpoint.as_mut() {
            checkpoint.markets.entry(market_id).or_insert_with(|| market.clone());
        }
        Ok(market)
    }

    /// Points `order_id` at a market, or forgets it with `None`.
    pub(super) fn route(&mut self, order_id: OrderId, market_id: Option<MarketId>) {
        let prior = match market_id {
            Some(market_id) => self.order_markets.insert(order_id, market_id),
            None => self.order_markets.remove(&order_id),
        };
        if let Some(checkpoint) = self.checkpoint.as_mut() {
            checkpoint.routes.push((order_id, prior));
        }
    }

    /// Moves a terminal order out of its market into the bounded history.
    fn archive(&mut self, market_id: MarketId, order_id: OrderId) -> Result<(), EngineError> {
        let order = self
            .market_mut(market_id)?
            .orders
            .remove(&order_id)
            .ok_or(EngineError::OrderNotFound(order_id))?;
        self.route(order_id, None);
        let evicted = self.order_history.push(order);
        if let Some(checkpoint) = self.checkpoint.as_mut() {
            checkpoint.archived.push((order_id, evicted));
        }
        Ok(())
    }

    pub fn markets(&self) -> impl Iterator<Item = &MarketState> {
        self.markets.values()
    }

    pub fn pause_market(&mut self, market_id: MarketId) -> Result<(), EngineError> {
        self.set_market_status(market_id, MarketStatus::Paused)
    }

    pub fn resume_market(&mut self, market_id: MarketId) -> Result<(), EngineError> {
        self.set_market_status(market_id, MarketStatus::Active)
    }

    /// Closes a market for good. Resting orders are cancelled and their
    /// reservations returned; open positions stay on the ledger.
    pub fn settle_market(&mut self, market_id: MarketId) -> Result<(), EngineError> {
        self.transact(|engine| {
            let resting: Vec<OrderId> = {
                let market = engine.market(market_id)?;
                let mut ids: Vec<(u64, OrderId)> = market.orders.values().map(|o| (o.sequence, o.id)).collect();
                ids.sort_unstable();
                ids.into_iter().map(|(_, id)| id).collect()
            };
            for order_id in resting {
                engine.cancel_resting(market_id, order_id, CancelReason::MarketSettled)?;
            }
            engine.market_mut(market_id)?.status = MarketStatus::Settled;
            info!(market = ?market_id, "market settled");
            Ok(())
        })
    }

    fn set_market_status(&mut self, market_id: MarketId, status: MarketStatus) -> Result<(), EngineError> {
        let market = self.market_mut(market_id)?;
        if market.status == MarketStatus::Settled {
            return Err(MarketError::MarketNotActive(market_id).into());
        }
        market.status = status;
        info!(market = ?market_id, ?status, "market status changed");
        Ok(())
    }

    pub fn create_account(&mut self) -> AccountId {
        let id = self.ledger.create_account(self.current_time);
        info!(account = ?id, "account created");
        id
    }

    pub fn account(&self, account_id: AccountId) -> Result<&Account, EngineError> {
        Ok(self.ledger.account(account_id)?)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.ledger.accounts()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn deposit(&mut self, account_id: AccountId, amount: Quote) -> Result<Quote, EngineError> {
        self.transact(|engine| {
            let new_balance = engine.ledger.deposit(account_id, amount)?;
            info!(account = ?account_id, amount = %amount, "deposit");
            engine.emit_event(EventPayload::Deposit(DepositEvent {
                account_id,
                amount,
                new_balance,
            }));
            Ok(new_balance)
        })
    }

    // blocked while locked and reserved margin cover the amount
    pub fn withdraw(&mut self, account_id: AccountId, amount: Quote) -> Result<Quote, EngineError> {
        let result = self.transact(|engine| {
            let new_balance = engine.ledger.withdraw(account_id, amount)?;
            info!(account = ?account_id, amount = %amount, "withdrawal");
            engine.emit_event(EventPayload::Withdrawal(WithdrawalEvent {
                account_id,
                amount,
                new_balance,
            }));
            Ok(new_balance)
        });

        if let Err(e) = &result {
            // Emit rejection event for audit
            self.emit_event(EventPayload::WithdrawalRejected(WithdrawalRejectedEvent {
                account_id,
                amount,
                reason: e.to_string(),
            }));
        }
        result
    }

    pub fn deposit_base(&mut self, account_id: AccountId, market_id: MarketId, amount: u128) -> Result<(), EngineError> {
        self.transact(|engine| {
            engine.market(market_id)?;
            engine.ledger.deposit_base(account_id, market_id, amount)?;
            engine.emit_event(EventPayload::BaseTransfer(BaseTransferEvent {
                account_id,
                market_id,
                amount: to_i128(amount),
            }));
            Ok(())
        })
    }

    pub fn withdraw_base(&mut self, account_id: AccountId, market_id: MarketId, amount: u128) -> Result<(), EngineError> {
        self.transact(|engine| {
            engine.market(market_id)?;
            engine.ledger.withdraw_base(account_id, market_id, amount)?;
            engine.emit_event(EventPayload::BaseTransfer(BaseTransferEvent {
                account_id,
                market_id,
                amount: -to_i128(amount),
            }));
            Ok(())
        })
    }

    pub fn fund_insurance(&mut self, amount: Quote) -> Result<(), EngineError> {
        self.transact(|engine| {
            engine.ledger.fund_insurance(amount)?;
            info!(amount = %amount, "insurance fund topped up");
            Ok(())
        })
    }

    /// Cancels an active order sitting in `market_id`, returning its unspent
    /// reservation and held base. Terminal orders are left alone.
    pub(super) fn cancel_resting(
        &mut self,
        market_id: MarketId,
        order_id: OrderId,
        reason: CancelReason,
    ) -> Result<bool, EngineError> {
        let now = self.current_time;
        let market = self.market_mut(market_id)?;
        let order = market.orders.get_mut(&order_id).ok_or(EngineError::OrderNotFound(order_id))?;
        if !order.cancel(reason, now) {
            return Ok(false);
        }
        let (quote, base) = order.take_leftovers();
        let (account_id, class, remaining) = (order.account_id, order.class, order.remaining);
        market.book_mut(class).remove(order_id);

        self.retire(account_id, market_id, order_id, quote, base)?;

        debug!(order = ?order_id, account = ?account_id, ?reason, released = %quote, "order cancelled");
        self.emit_event(EventPayload::OrderCanceled(OrderCanceledEvent {
            market_id,
            order_id,
            account_id,
            reason,
            remaining,
            released: quote,
        }));
        Ok(true)
    }

    /// Returns a terminal order's unspent reservation and held base, drops it
    /// from the account's pending set and archives it.
    pub(super) fn retire(
        &mut self,
        account_id: AccountId,
        market_id: MarketId,
        order_id: OrderId,
        quote: Quote,
        base: u128,
    ) -> Result<(), EngineError> {
        if quote.is_positive() {
            let excess = self.ledger.release_margin(account_id, quote)?;
            if excess.is_positive() {
                self.emit_event(EventPayload::MarginAnomaly(MarginAnomalyEvent {
                    account_id,
                    order_id: Some(order_id),
                    excess,
                }));
            }
        }
        if base > 0 {
            self.ledger.unhold_base(account_id, market_id, base)?;
        }
        self.ledger.account_mut(account_id)?.pending_orders.remove(&order_id);
        self.archive(market_id, order_id)
    }

    pub fn events(&self) -> impl DoubleEndedIterator<Item = &Event> {
        self.events.iter()
    }

    pub fn recent_events(&self, count: usize) -> Vec<&Event> {
        self.events.recent(count)
    }

    pub(super) fn emit_event(&mut self, payload: EventPayload) -> EventId {
        self.events.emit(self.current_time, payload)
    }

    /// Ledger invariants plus agreement between each book, the order arena,
    /// the order routes and the accounts' pending order sets.
    pub fn check_invariants(&self) -> Result<(), EngineError> {
        self.ledger.check_invariants()?;

        let mut pending: BTreeMap<AccountId, BTreeSet<OrderId>> = BTreeMap::new();
        let mut arena = 0usize;
        for market in self.markets.values() {
            let mut active = [0usize; 2];
            for order in market.orders.values() {
                if !order.status.is_active() {
                    return Err(invariant(format!("terminal order {:?} left in the arena", order.id)));
                }
                if self.order_markets.get(&order.id) != Some(&market.id()) {
                    return Err(invariant(format!("order {:?} is not routed to {:?}", order.id, market.id())));
                }
                let book = market.book(order.class);
                let resting = book.get(order.id).map(|entry| entry.remaining);
                if resting != Some(order.remaining) {
                    return Err(invariant(format!(
                        "order {:?} remaining {} but book holds {:?}",
                        order.id, order.remaining, resting
                    )));
                }
                if order.status == OrderStatus::Pending && order.filled > 0 {
                    return Err(invariant(format!("pending order {:?} has fills", order.id)));
                }
                active[order.class as usize] += 1;
                pending.entry(order.account_id).or_default().insert(order.id);
            }
            for class in [OrderClass::Margin, OrderClass::Spot] {
                if market.book(class).order_count() != active[class as usize] {
                    return Err(invariant(format!("{class:?} book of {:?} holds stale orders", market.id())));
                }
                if market.book(class).is_crossed() {
                    return Err(invariant(format!("{class:?} book of {:?} is crossed", market.id())));
                }
            }
            arena += market.orders.len();
        }
        if self.order_markets.len() != arena {
            return Err(invariant(format!("{} order routes for {arena} active orders", self.order_markets.len())));
        }

        for account in self.ledger.accounts() {
            let expected = pending.remove(&account.id).unwrap_or_default();
            if account.pending_orders != expected {
                return Err(invariant(format!("pending orders of {:?} out of sync", account.id)));
            }
        }
        Ok(())
    }
}

fn invariant(message: String) -> EngineError {
    error!(%message, "engine invariant violated");
    EngineError::Invariant(message)
}
