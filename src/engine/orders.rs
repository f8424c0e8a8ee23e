//! Order management and execution.

use super::core::Engine;
use super::results::{EngineError, OrderResult};
use crate::events::{
    CancelReason, EventPayload, FillEvent, MarginAnomalyEvent, OrderPlacedEvent, PositionUpdatedEvent,
};
use crate::fixed::{margin_requirement, notional_ceil};
use crate::ledger::{FillLeg, FillRole, PositionUpdate, SettlementFailure, SettlementMode, SpotSettlement};
use crate::mark_price::Trade;
use crate::market::MarketError;
use crate::order::{Fill, Order, OrderClass, OrderKind, OrderOrigin};
use crate::types::{AccountId, MarketId, OrderId, Price, Quote, Side};
use tracing::{debug, info, warn};

/// Everything needed to place one order.
#[derive(Debug, Clone, Copy)]
pub(super) struct OrderRequest {
    pub account_id: AccountId,
    pub market_id: MarketId,
    pub side: Side,
    pub kind: OrderKind,
    pub class: OrderClass,
    pub origin: OrderOrigin,
    pub amount: u128,
}

/// What one run of the matching loop produced.
#[derive(Debug, Default)]
pub(super) struct MatchOutcome {
    pub fills: Vec<Fill>,
    /// Taker-side position updates, in fill order.
    pub taker_updates: Vec<PositionUpdate>,
    pub taker_failure: Option<SettlementFailure>,
}

/// Funds set aside at placement.
struct Reservation {
    quote: Quote,
    /// Leading quantity that only reduces the current position.
    offset: u128,
    /// Quantity after the offset that the reservation covers.
    basis: u128,
    base: u128,
}

enum Settled {
    Margin(PositionUpdate, PositionUpdate),
    Spot(SpotSettlement),
}

impl Engine {
    fn next_order_id(&mut self) -> OrderId {
        let id = OrderId(self.next_order_id);
        self.next_order_id += 1;
        id
    }

    /// Place a limit order. Crossing liquidity is taken immediately and the
    /// remainder rests on the book.
    pub fn place_limit_order(
        &mut self,
        account_id: AccountId,
        market_id: MarketId,
        side: Side,
        amount: u128,
        price: Price,
        class: OrderClass,
    ) -> Result<OrderResult, EngineError> {
        self.transact(|engine| {
            engine.place_order(OrderRequest {
                account_id,
                market_id,
                side,
                kind: OrderKind::Limit(price),
                class,
                origin: OrderOrigin::User,
                amount,
            })
        })
    }

    /// Place a market order. Fills what the opposite side can absorb and
    /// cancels the rest.
    pub fn place_market_order(
        &mut self,
        account_id: AccountId,
        market_id: MarketId,
        side: Side,
        amount: u128,
        class: OrderClass,
    ) -> Result<OrderResult, EngineError> {
        self.transact(|engine| {
            engine.place_order(OrderRequest {
                account_id,
                market_id,
                side,
                kind: OrderKind::Market,
                class,
                origin: OrderOrigin::User,
                amount,
            })
        })
    }

    /// Cancel an order. Returns false when the order was already terminal.
    pub fn cancel_order(&mut self, account_id: AccountId, order_id: OrderId) -> Result<bool, EngineError> {
        self.transact(|engine| {
            let order = engine.order(order_id).ok_or(EngineError::OrderNotFound(order_id))?;
            if order.account_id != account_id {
                return Err(EngineError::NotOrderOwner { order_id, account_id });
            }
            match engine.order_markets.get(&order_id).copied() {
                Some(market_id) => engine.cancel_resting(market_id, order_id, CancelReason::UserRequested),
                None => Ok(false),
            }
        })
    }

    /// Cancels every active order of `account_id` in every market.
    pub(super) fn cancel_account_orders(
        &mut self,
        account_id: AccountId,
        reason: CancelReason,
    ) -> Result<usize, EngineError> {
        let targets: Vec<(MarketId, OrderId)> = self
            .markets
            .values()
            .flat_map(|market| {
                market
                    .active_orders_of(account_id)
                    .into_iter()
                    .map(move |order_id| (market.id(), order_id))
            })
            .collect();
        let mut cancelled = 0;
        for (market_id, order_id) in targets {
            if self.cancel_resting(market_id, order_id, reason)? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    fn place_order(&mut self, request: OrderRequest) -> Result<OrderResult, EngineError> {
        let (order, outcome) = self.execute_order(request)?;

        let liquidations = if !outcome.fills.is_empty() && request.class == OrderClass::Margin {
            self.run_liquidation_scan(request.market_id)?
        } else {
            Vec::new()
        };

        Ok(OrderResult {
            order_id: order.id,
            status: order.status,
            filled_size: order.filled,
            remaining_size: order.remaining,
            average_price: order.average_price(),
            margin_reserved: order.margin_reserved,
            is_posted: order.status.is_active(),
            fills: outcome.fills,
            liquidations,
        })
    }

    // 8.4: validate, reserve, match, then rest or cancel the remainder.
    // returns the order as it stands once matching is over.
    pub(super) fn execute_order(&mut self, request: OrderRequest) -> Result<(Order, MatchOutcome), EngineError> {
        let now = self.current_time;
        let OrderRequest {
            account_id,
            market_id,
            side,
            kind,
            class,
            origin,
            amount,
        } = request;

        self.ledger.account(account_id)?;
        let market = self.market(market_id)?;
        market.check_accepts(class)?;
        if origin == OrderOrigin::User {
            market.config.validate_size(amount)?;
        }
        if let OrderKind::Limit(price) = kind {
            if price.raw() == 0 {
                return Err(MarketError::ZeroPrice.into());
            }
        }

        let reservation = self.plan_reservation(&request)?;
        if reservation.quote.is_positive() {
            self.ledger.reserve_margin(account_id, reservation.quote)?;
        }
        if reservation.base > 0 {
            self.ledger.hold_base(account_id, market_id, reservation.base)?;
        }

        let order_id = self.next_order_id();
        let market = self.market_mut(market_id)?;
        let sequence = market.next_sequence();
        let mut order = Order::new(order_id, account_id, market_id, side, kind, class, origin, amount, sequence, now);
        order.margin_reserved = reservation.quote;
        order.reserve_offset = reservation.offset;
        order.reserve_basis = reservation.basis;
        order.base_held = reservation.base;
        market.orders.insert(order_id, order);
        self.route(order_id, Some(market_id));
        self.ledger.account_mut(account_id)?.pending_orders.insert(order_id);

        info!(
            order = ?order_id,
            account = ?account_id,
            market = ?market_id,
            ?side,
            ?class,
            ?origin,
            amount,
            reserved = %reservation.quote,
            reducing = reservation.offset,
            "order placed"
        );
        self.emit_event(EventPayload::OrderPlaced(OrderPlacedEvent {
            market_id,
            order_id,
            account_id,
            side,
            class,
            amount,
            price: match kind {
                OrderKind::Limit(price) => Some(price),
                OrderKind::Market => None,
            },
            margin_reserved: reservation.quote,
        }));

        let outcome = self.match_order(market_id, order_id)?;
        self.finish_order(market_id, order_id, &outcome)?;
        // the history keeps at least the order just archived
        let order = self.order(order_id).cloned().ok_or(EngineError::OrderNotFound(order_id))?;
        Ok((order, outcome))
    }

    // 8.5: margin orders reserve initial margin only for the part that adds
    // exposure; reducing the current position needs none and comes first.
    // market orders are priced along the levels they will sweep.
    fn plan_reservation(&self, request: &OrderRequest) -> Result<Reservation, EngineError> {
        if request.origin == OrderOrigin::Liquidation {
            return Ok(Reservation {
                quote: Quote::zero(),
                offset: 0,
                basis: request.amount,
                base: 0,
            });
        }

        let market = self.market(request.market_id)?;
        let path = match request.kind {
            OrderKind::Limit(price) => vec![(price, request.amount)],
            OrderKind::Market => {
                let path = market.book(request.class).sweep(request.side, request.amount);
                if path.is_empty() {
                    return Err(EngineError::NoLiquidity(request.market_id));
                }
                path
            }
        };
        let basis: u128 = path.iter().map(|(_, size)| size).sum();

        let reservation = match (request.class, request.side) {
            (OrderClass::Margin, side) => {
                let bps = market.config.margin_params.initial_bps(side);
                let offset = self.reducible(request.account_id, request.market_id, side)?.min(basis);
                let mut reducible = offset;
                let mut quote = Quote::zero();
                for (price, size) in path {
                    let reducing = size.min(reducible);
                    reducible -= reducing;
                    if size > reducing {
                        quote = quote.add(margin_requirement(size - reducing, price, bps));
                    }
                }
                Reservation {
                    quote,
                    offset,
                    basis: basis - offset,
                    base: 0,
                }
            }
            (OrderClass::Spot, Side::Long) => Reservation {
                quote: path.iter().map(|&(price, size)| notional_ceil(size, price)).sum(),
                offset: 0,
                basis,
                base: 0,
            },
            (OrderClass::Spot, Side::Short) => Reservation {
                quote: Quote::zero(),
                offset: 0,
                basis,
                base: basis,
            },
        };
        Ok(reservation)
    }

    /// Size of the current position an order on `side` would close.
    fn reducible(&self, account_id: AccountId, market_id: MarketId, side: Side) -> Result<u128, EngineError> {
        let position = self.ledger.account(account_id)?.position(market_id);
        Ok(match position {
            Some(position) if position.side() == Some(side.opposite()) => position.size.abs(),
            _ => 0,
        })
    }

    // 8.6: price-time matching against the opposite side of the order's own
    // book. the maker's price is the trade price.
    pub(super) fn match_order(&mut self, market_id: MarketId, order_id: OrderId) -> Result<MatchOutcome, EngineError> {
        let now = self.current_time;
        let mut outcome = MatchOutcome::default();

        loop {
            let market = self.market(market_id)?;
            let taker = market.orders.get(&order_id).ok_or(EngineError::OrderNotFound(order_id))?;
            if taker.remaining == 0 || !taker.status.is_active() {
                break;
            }
            let Some(entry) = market.book(taker.class).best_opposite(taker.side) else {
                break;
            };
            if !taker.crosses(entry.price) {
                break;
            }
            let maker = market
                .orders
                .get(&entry.order_id)
                .ok_or_else(|| EngineError::Invariant(format!("book entry {:?} has no order", entry.order_id)))?;

            let quantity = taker.remaining.min(entry.remaining);
            let price = entry.price;
            let class = taker.class;
            let params = market.config.margin_params.clone();
            let taker_leg = FillLeg {
                account_id: taker.account_id,
                side: taker.side,
                release: taker.release_for_fill(quantity),
                mode: match taker.origin {
                    OrderOrigin::User => SettlementMode::Normal,
                    OrderOrigin::Liquidation => SettlementMode::Liquidation,
                },
            };
            let maker_leg = FillLeg {
                account_id: maker.account_id,
                side: maker.side,
                release: maker.release_for_fill(quantity),
                mode: SettlementMode::Normal,
            };
            let maker_order_id = maker.id;

            let settled = match class {
                OrderClass::Margin => self
                    .ledger
                    .settle_fill(market_id, taker_leg, maker_leg, quantity, price, &params, now)
                    .map(|(taker_update, maker_update)| Settled::Margin(taker_update, maker_update)),
                OrderClass::Spot => self
                    .ledger
                    .settle_spot(market_id, taker_leg, maker_leg, quantity, price)
                    .map(Settled::Spot),
            };

            let settled = match settled {
                Ok(settled) => settled,
                Err(failure) if failure.role == FillRole::Maker => {
                    warn!(
                        order = ?maker_order_id,
                        account = ?maker_leg.account_id,
                        error = %failure.error,
                        "maker cannot settle, cancelling"
                    );
                    self.cancel_resting(market_id, maker_order_id, CancelReason::InsufficientMargin)?;
                    continue;
                }
                Err(failure) => {
                    warn!(
                        order = ?order_id,
                        account = ?taker_leg.account_id,
                        error = %failure.error,
                        "taker cannot settle, stopping match"
                    );
                    outcome.taker_failure = Some(failure);
                    break;
                }
            };

            let market = self.market_mut(market_id)?;
            if let Some(order) = market.orders.get_mut(&order_id) {
                order.apply_fill(quantity, price, taker_leg.release, now);
            }
            let maker_filled = match market.orders.get_mut(&maker_order_id) {
                Some(order) => {
                    order.apply_fill(quantity, price, maker_leg.release, now);
                    order.is_filled()
                }
                None => false,
            };
            market.book_mut(class).reduce(maker_order_id, quantity);
            let (buyer, seller) = match taker_leg.side {
                Side::Long => (taker_leg.account_id, maker_leg.account_id),
                Side::Short => (maker_leg.account_id, taker_leg.account_id),
            };
            market.record_trade(Trade {
                buyer,
                seller,
                price,
                amount: quantity,
                timestamp: now,
            });

            debug!(
                market = ?market_id,
                taker = ?order_id,
                maker = ?maker_order_id,
                quantity,
                price = %price,
                "orders matched"
            );
            let fill = Fill {
                maker_order_id,
                maker_account_id: maker_leg.account_id,
                taker_order_id: order_id,
                taker_account_id: taker_leg.account_id,
                price,
                quantity,
                taker_side: taker_leg.side,
                class,
            };
            self.emit_event(EventPayload::Fill(FillEvent {
                market_id,
                class,
                taker_order_id: order_id,
                maker_order_id,
                taker_account_id: taker_leg.account_id,
                maker_account_id: maker_leg.account_id,
                taker_side: taker_leg.side,
                quantity,
                price,
            }));
            outcome.fills.push(fill);

            if maker_filled {
                let (quote, base) = self.take_leftovers(market_id, maker_order_id)?;
                self.retire(maker_leg.account_id, market_id, maker_order_id, quote, base)?;
            }

            match settled {
                Settled::Margin(taker_update, maker_update) => {
                    self.track_open_interest(market_id, &[&taker_update, &maker_update])?;
                    for (update, leg_order) in [(&taker_update, order_id), (&maker_update, maker_order_id)] {
                        self.emit_release_excess(update.account_id, leg_order, update.release_excess);
                        self.emit_position_update(update);
                    }
                    outcome.taker_updates.push(taker_update);
                }
                Settled::Spot(settlement) => {
                    let (buyer_order, seller_order) = match taker_leg.side {
                        Side::Long => (order_id, maker_order_id),
                        Side::Short => (maker_order_id, order_id),
                    };
                    self.emit_release_excess(settlement.buyer, buyer_order, settlement.buyer_excess);
                    self.emit_release_excess(settlement.seller, seller_order, settlement.seller_excess);
                }
            }
        }

        Ok(outcome)
    }

    /// Rests a limit remainder or cancels whatever the order could not fill.
    fn finish_order(&mut self, market_id: MarketId, order_id: OrderId, outcome: &MatchOutcome) -> Result<(), EngineError> {
        let market = self.market(market_id)?;
        let order = market.orders.get(&order_id).ok_or(EngineError::OrderNotFound(order_id))?;
        let account_id = order.account_id;

        if order.is_filled() {
            let (quote, base) = self.take_leftovers(market_id, order_id)?;
            return self.retire(account_id, market_id, order_id, quote, base);
        }

        match (order.kind, &outcome.taker_failure) {
            (_, Some(_)) => {
                self.cancel_resting(market_id, order_id, CancelReason::InsufficientMargin)?;
            }
            (OrderKind::Market, None) => {
                self.cancel_resting(market_id, order_id, CancelReason::Unfilled)?;
            }
            (OrderKind::Limit(price), None) => {
                let market = self.market_mut(market_id)?;
                let order = market.orders.get(&order_id).ok_or(EngineError::OrderNotFound(order_id))?.clone();
                market.book_mut(order.class).insert(&order);
                debug!(order = ?order_id, price = %price, remaining = order.remaining, "order resting");
            }
        }
        Ok(())
    }

    fn take_leftovers(&mut self, market_id: MarketId, order_id: OrderId) -> Result<(Quote, u128), EngineError> {
        let order = self
            .market_mut(market_id)?
            .orders
            .get_mut(&order_id)
            .ok_or(EngineError::OrderNotFound(order_id))?;
        Ok(order.take_leftovers())
    }

    /// Open interest counts the long side of every position.
    fn track_open_interest(&mut self, market_id: MarketId, updates: &[&PositionUpdate]) -> Result<(), EngineError> {
        let market = self.market_mut(market_id)?;
        for update in updates {
            let after = update.position.as_ref().map(|p| p.size.value()).unwrap_or(0);
            let before = after - update.size_delta;
            let long_after = after.max(0) as u128;
            let long_before = before.max(0) as u128;
            market.open_interest = (market.open_interest + long_after).saturating_sub(long_before);
        }
        Ok(())
    }

    fn emit_release_excess(&mut self, account_id: AccountId, order_id: OrderId, excess: Quote) {
        if excess.is_positive() {
            self.emit_event(EventPayload::MarginAnomaly(MarginAnomalyEvent {
                account_id,
                order_id: Some(order_id),
                excess,
            }));
        }
    }

    fn emit_position_update(&mut self, update: &PositionUpdate) {
        self.emit_event(EventPayload::PositionUpdated(PositionUpdatedEvent {
            market_id: update.market_id,
            account_id: update.account_id,
            branch: update.branch,
            new_size: update.position.as_ref().map(|p| p.size).unwrap_or_default(),
            entry_price: update.position.as_ref().map(|p| p.entry_price),
            realized_pnl: update.realized_pnl,
            margin: update.position.as_ref().map(|p| p.margin).unwrap_or_default(),
        }));
    }
}
