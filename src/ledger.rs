//! Collateral ledger.
//!
//! Owns every account and the system-level loss buckets (insurance fund and
//! socialized deficit). Matching talks to accounts only through this type:
//! reservations, position netting per fill, spot settlement and the
//! liquidation waterfall.

use crate::account::{Account, AccountError};
use crate::engine::ErrorKind;
use crate::fixed::notional;
use crate::liquidation::{
    allocate_loss, liquidation_penalty, InsuranceFund, LiquidationParams, LiquidationRecord, LossAllocation,
};
use crate::margin::{MarginParams, MarginSummary};
use crate::position::{plan_netting, Netting, Position};
use crate::types::{to_i128, AccountId, MarketId, Price, Quote, Side, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementMode {
    /// Fails when the result would leave the account undercollateralized.
    Normal,
    /// Never fails; realized PnL is left for the loss waterfall.
    Liquidation,
}

/// Result of netting one fill into one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionUpdate {
    pub account_id: AccountId,
    pub market_id: MarketId,
    pub branch: Netting,
    pub size_delta: i128,
    pub price: Price,
    /// Applied to collateral in normal mode, deferred in liquidation mode.
    pub realized_pnl: Quote,
    pub margin_released: Quote,
    pub margin_locked: Quote,
    pub closed_size: u128,
    /// Entry price of the position before this fill, if any.
    pub prior_entry: Option<Price>,
    pub position: Option<Position>,
    /// Reservation the leg asked to release beyond what was reserved.
    pub release_excess: Quote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillRole {
    Taker,
    Maker,
}

/// One side of a fill as seen by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillLeg {
    pub account_id: AccountId,
    pub side: Side,
    /// Slice of the order's reservation freed by this fill.
    pub release: Quote,
    pub mode: SettlementMode,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{role:?} settlement failed: {error}")]
pub struct SettlementFailure {
    pub role: FillRole,
    pub error: LedgerError,
}

/// Spot fill outcome: quote paid by the buyer and received by the seller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpotSettlement {
    pub buyer: AccountId,
    pub seller: AccountId,
    pub quantity: u128,
    pub quote_amount: Quote,
    /// Reservation the buyer's order asked to release beyond what was reserved.
    pub buyer_excess: Quote,
    /// Same for the seller's order.
    pub seller_excess: Quote,
}

/// Aggregate balance sheet used by solvency checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolvencyReport {
    pub total_collateral: Quote,
    pub insurance_balance: Quote,
    pub deficit: Quote,
    pub unrealized_pnl: Quote,
    pub net_deposits: Quote,
    pub insurance_contributions: Quote,
}

impl SolvencyReport {
    /// Left side minus right side of the conservation identity. Zero up to
    /// per-position PnL rounding.
    pub fn gap(&self) -> Quote {
        self.total_collateral
            .add(self.insurance_balance)
            .sub(self.deficit)
            .add(self.unrealized_pnl)
            .sub(self.net_deposits)
            .sub(self.insurance_contributions)
    }
}

// 7.1: undo journal. accounts are copied the first time a transaction
// touches them; the scalars are small enough to copy up front.
#[derive(Debug, Clone)]
struct Journal {
    /// None marks an account created inside the transaction.
    accounts: BTreeMap<AccountId, Option<Account>>,
    insurance_fund: InsuranceFund,
    insurance_contributions: Quote,
    deficit: Quote,
    anomalies: u64,
    history_len: usize,
    next_account_id: u64,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    accounts: BTreeMap<AccountId, Account>,
    insurance_fund: InsuranceFund,
    insurance_contributions: Quote,
    deficit: Quote,
    anomalies: u64,
    liquidation_history: Vec<LiquidationRecord>,
    next_account_id: u64,
    journal: Option<Journal>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(Quote::zero())
    }
}

impl Ledger {
    pub fn new(insurance_seed: Quote) -> Self {
        Self {
            accounts: BTreeMap::new(),
            insurance_fund: InsuranceFund::new(insurance_seed),
            insurance_contributions: insurance_seed,
            deficit: Quote::zero(),
            anomalies: 0,
            liquidation_history: Vec::new(),
            next_account_id: 1,
            journal: None,
        }
    }

    /// Starts journaling changes so `rollback` can undo them.
    pub(crate) fn begin(&mut self) {
        self.journal = Some(Journal {
            accounts: BTreeMap::new(),
            insurance_fund: self.insurance_fund.clone(),
            insurance_contributions: self.insurance_contributions,
            deficit: self.deficit,
            anomalies: self.anomalies,
            history_len: self.liquidation_history.len(),
            next_account_id: self.next_account_id,
        });
    }

    pub(crate) fn commit(&mut self) {
        self.journal = None;
    }

    pub(crate) fn rollback(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        debug!(accounts = journal.accounts.len(), "ledger rolled back");
        for (id, prior) in journal.accounts {
            match prior {
                Some(account) => {
                    self.accounts.insert(id, account);
                }
                None => {
                    self.accounts.remove(&id);
                }
            }
        }
        self.insurance_fund = journal.insurance_fund;
        self.insurance_contributions = journal.insurance_contributions;
        self.deficit = journal.deficit;
        self.anomalies = journal.anomalies;
        self.liquidation_history.truncate(journal.history_len);
        self.next_account_id = journal.next_account_id;
    }

    /// Copies the account into the open journal on first touch.
    fn touch(&mut self, account_id: AccountId) {
        if let Some(journal) = self.journal.as_mut() {
            let accounts = &self.accounts;
            journal
                .accounts
                .entry(account_id)
                .or_insert_with(|| accounts.get(&account_id).cloned());
        }
    }

    fn store(&mut self, account: Account) {
        self.touch(account.id);
        self.accounts.insert(account.id, account);
    }

    pub fn create_account(&mut self, timestamp: Timestamp) -> AccountId {
        let id = AccountId(self.next_account_id);
        self.next_account_id += 1;
        self.store(Account::new(id, timestamp));
        id
    }

    pub fn account(&self, account_id: AccountId) -> Result<&Account, LedgerError> {
        self.accounts.get(&account_id).ok_or(LedgerError::AccountNotFound(account_id))
    }

    pub(crate) fn account_mut(&mut self, account_id: AccountId) -> Result<&mut Account, LedgerError> {
        if !self.accounts.contains_key(&account_id) {
            return Err(LedgerError::AccountNotFound(account_id));
        }
        self.touch(account_id);
        self.accounts.get_mut(&account_id).ok_or(LedgerError::AccountNotFound(account_id))
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    pub fn contains(&self, account_id: AccountId) -> bool {
        self.accounts.contains_key(&account_id)
    }

    pub fn insurance_fund(&self) -> &InsuranceFund {
        &self.insurance_fund
    }

    pub fn socialized_deficit(&self) -> Quote {
        self.deficit
    }

    pub fn anomaly_count(&self) -> u64 {
        self.anomalies
    }

    pub fn liquidation_history(&self) -> &[LiquidationRecord] {
        &self.liquidation_history
    }

    pub fn fund_insurance(&mut self, amount: Quote) -> Result<(), LedgerError> {
        require_positive(amount)?;
        self.insurance_fund.deposit(amount);
        self.insurance_contributions = self.insurance_contributions.add(amount);
        Ok(())
    }

    pub fn deposit(&mut self, account_id: AccountId, amount: Quote) -> Result<Quote, LedgerError> {
        require_positive(amount)?;
        let account = self.account_mut(account_id)?;
        account.deposit(amount);
        info!(account = ?account_id, amount = %amount, collateral = %account.collateral, "deposit");
        Ok(account.collateral)
    }

    pub fn withdraw(&mut self, account_id: AccountId, amount: Quote) -> Result<Quote, LedgerError> {
        require_positive(amount)?;
        let account = self.account_mut(account_id)?;
        account.withdraw(amount)?;
        info!(account = ?account_id, amount = %amount, collateral = %account.collateral, "withdrawal");
        Ok(account.collateral)
    }

    pub fn deposit_base(&mut self, account_id: AccountId, market_id: MarketId, amount: u128) -> Result<(), LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        self.account_mut(account_id)?.deposit_base(market_id, amount);
        info!(account = ?account_id, market = ?market_id, amount, "base deposit");
        Ok(())
    }

    pub fn withdraw_base(&mut self, account_id: AccountId, market_id: MarketId, amount: u128) -> Result<(), LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        self.account_mut(account_id)?.withdraw_base(market_id, amount)?;
        info!(account = ?account_id, market = ?market_id, amount, "base withdrawal");
        Ok(())
    }

    pub fn reserve_margin(&mut self, account_id: AccountId, amount: Quote) -> Result<(), LedgerError> {
        if amount.is_negative() {
            return Err(LedgerError::NegativeAmount(amount));
        }
        self.account_mut(account_id)?.reserve(amount)?;
        Ok(())
    }

    /// Frees reserved margin. Over-release is clamped at zero and counted as
    /// an anomaly; the excess is returned.
    pub fn release_margin(&mut self, account_id: AccountId, amount: Quote) -> Result<Quote, LedgerError> {
        if amount.is_negative() {
            return Err(LedgerError::NegativeAmount(amount));
        }
        let excess = self.account_mut(account_id)?.release(amount);
        self.note_release_excess(account_id, excess);
        Ok(excess)
    }

    pub fn hold_base(&mut self, account_id: AccountId, market_id: MarketId, amount: u128) -> Result<(), LedgerError> {
        self.account_mut(account_id)?.hold_base(market_id, amount)?;
        Ok(())
    }

    pub fn unhold_base(&mut self, account_id: AccountId, market_id: MarketId, amount: u128) -> Result<(), LedgerError> {
        self.account_mut(account_id)?.unhold_base(market_id, amount);
        Ok(())
    }

    fn note_release_excess(&mut self, account_id: AccountId, excess: Quote) {
        if excess.is_positive() {
            self.anomalies += 1;
            warn!(account = ?account_id, excess = %excess, "margin over-release clamped at zero");
        }
    }

    /// Nets `size_delta` at `price` into the account's position in `market_id`.
    #[allow(clippy::too_many_arguments)]
    pub fn update_position(
        &mut self,
        account_id: AccountId,
        market_id: MarketId,
        size_delta: i128,
        price: Price,
        params: &MarginParams,
        mode: SettlementMode,
        timestamp: Timestamp,
    ) -> Result<PositionUpdate, LedgerError> {
        if size_delta == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        let account = self.account_mut(account_id)?;
        let mut staged = account.clone();
        let update = net_fill(&mut staged, market_id, size_delta, price, params, mode, timestamp)?;
        *account = staged;
        Ok(update)
    }

    /// Settles both sides of a margin fill. Both accounts are updated on
    /// copies and committed together; on failure nothing changes and the
    /// failing side is reported.
    #[allow(clippy::too_many_arguments)]
    pub fn settle_fill(
        &mut self,
        market_id: MarketId,
        taker: FillLeg,
        maker: FillLeg,
        quantity: u128,
        price: Price,
        params: &MarginParams,
        timestamp: Timestamp,
    ) -> Result<(PositionUpdate, PositionUpdate), SettlementFailure> {
        let delta = to_i128(quantity);
        let apply = |account: &mut Account, leg: &FillLeg, role: FillRole| {
            let excess = account.release(leg.release);
            net_fill(account, market_id, leg.side.sign() * delta, price, params, leg.mode, timestamp)
                .map(|mut update| {
                    update.release_excess = excess;
                    update
                })
                .map_err(|error| SettlementFailure { role, error })
        };

        let mut taker_account = self
            .account(taker.account_id)
            .map_err(|error| SettlementFailure { role: FillRole::Taker, error })?
            .clone();

        let (taker_update, maker_update) = if taker.account_id == maker.account_id {
            let taker_update = apply(&mut taker_account, &taker, FillRole::Taker)?;
            let maker_update = apply(&mut taker_account, &maker, FillRole::Maker)?;
            self.store(taker_account);
            (taker_update, maker_update)
        } else {
            let mut maker_account = self
                .account(maker.account_id)
                .map_err(|error| SettlementFailure { role: FillRole::Maker, error })?
                .clone();
            let taker_update = apply(&mut taker_account, &taker, FillRole::Taker)?;
            let maker_update = apply(&mut maker_account, &maker, FillRole::Maker)?;
            self.store(taker_account);
            self.store(maker_account);
            (taker_update, maker_update)
        };

        self.note_release_excess(taker.account_id, taker_update.release_excess);
        self.note_release_excess(maker.account_id, maker_update.release_excess);
        debug!(
            market = ?market_id,
            taker = ?taker.account_id,
            maker = ?maker.account_id,
            quantity,
            price = %price,
            "fill settled"
        );
        Ok((taker_update, maker_update))
    }

    /// Settles a spot fill: quote moves buyer to seller, base moves from the
    /// seller's held balance to the buyer's free balance. No positions are
    /// touched.
    pub fn settle_spot(
        &mut self,
        market_id: MarketId,
        taker: FillLeg,
        maker: FillLeg,
        quantity: u128,
        price: Price,
    ) -> Result<SpotSettlement, SettlementFailure> {
        let (buyer, seller, buyer_role, seller_role) = match taker.side {
            Side::Long => (taker, maker, FillRole::Taker, FillRole::Maker),
            Side::Short => (maker, taker, FillRole::Maker, FillRole::Taker),
        };
        let quote_amount = notional(quantity, price);

        let mut staged: BTreeMap<AccountId, Account> = BTreeMap::new();
        for (leg, role) in [(buyer, buyer_role), (seller, seller_role)] {
            if !staged.contains_key(&leg.account_id) {
                let account = self
                    .account(leg.account_id)
                    .map_err(|error| SettlementFailure { role, error })?
                    .clone();
                staged.insert(leg.account_id, account);
            }
        }

        let mut seller_excess = Quote::zero();
        if let Some(account) = staged.get_mut(&seller.account_id) {
            seller_excess = account.release(seller.release);
            account
                .take_held_base(market_id, quantity)
                .map_err(|e| SettlementFailure { role: seller_role, error: e.into() })?;
            account.collateral = account.collateral.add(quote_amount);
        }
        let mut buyer_excess = Quote::zero();
        if let Some(account) = staged.get_mut(&buyer.account_id) {
            buyer_excess = account.release(buyer.release);
            account.collateral = account.collateral.sub(quote_amount);
            account.deposit_base(market_id, quantity);
            let required = account.margin_locked().add(account.margin_reserved);
            if account.collateral < required {
                return Err(SettlementFailure {
                    role: buyer_role,
                    error: AccountError::InsufficientCollateral {
                        requested: quote_amount,
                        available: account.collateral.add(quote_amount).sub(required),
                    }
                    .into(),
                });
            }
        }

        for account in staged.into_values() {
            self.store(account);
        }
        self.note_release_excess(buyer.account_id, buyer_excess);
        self.note_release_excess(seller.account_id, seller_excess);
        debug!(market = ?market_id, buyer = ?buyer.account_id, seller = ?seller.account_id, quantity, price = %price, "spot fill settled");

        Ok(SpotSettlement {
            buyer: buyer.account_id,
            seller: seller.account_id,
            quantity,
            quote_amount,
            buyer_excess,
            seller_excess,
        })
    }

    /// Runs the loss waterfall for a fill netted in liquidation mode and
    /// returns the auditable split.
    pub fn liquidate(
        &mut self,
        update: &PositionUpdate,
        params: &LiquidationParams,
    ) -> Result<LossAllocation, LedgerError> {
        let account = self.account_mut(update.account_id)?;

        let pnl = update.realized_pnl;
        let trading_loss = if pnl.is_positive() {
            account.apply_pnl(pnl);
            Quote::zero()
        } else {
            account.realized_pnl = account.realized_pnl.add(pnl);
            pnl.negate()
        };

        let penalty = liquidation_penalty(update.margin_released, params);
        let mut allocation = allocate_loss(trading_loss, penalty, update.margin_released, account.available());
        account.charge(allocation.charged_to_account());

        self.insurance_fund.deposit(penalty);
        if allocation.socialized.is_positive() {
            let covered = self.insurance_fund.cover_bad_debt(allocation.socialized);
            allocation.insurance_covered = covered;
            allocation.deficit = allocation.socialized.sub(covered);
            self.deficit = self.deficit.add(allocation.deficit);
            warn!(
                account = ?update.account_id,
                market = ?update.market_id,
                socialized = %allocation.socialized,
                insurance = %covered,
                deficit = %allocation.deficit,
                "liquidation loss socialized"
            );
        }

        if !allocation.is_balanced() {
            error!(account = ?update.account_id, ?allocation, "loss waterfall does not sum to expected loss");
            return Err(LedgerError::Invariant(format!(
                "waterfall {} + {} + {} != {}",
                allocation.covered_from_margin,
                allocation.covered_from_available,
                allocation.socialized,
                allocation.expected_loss
            )));
        }
        Ok(allocation)
    }

    pub fn record_liquidation(&mut self, record: LiquidationRecord) -> Result<(), LedgerError> {
        info!(
            account = ?record.account_id,
            market = ?record.market_id,
            size = %record.size,
            price = %record.liquidation_price,
            expected_loss = %record.allocation.expected_loss,
            "liquidation recorded"
        );
        self.account_mut(record.account_id)?.liquidations.push(record.clone());
        self.liquidation_history.push(record);
        Ok(())
    }

    pub fn margin_summary(
        &self,
        account_id: AccountId,
        marks: &BTreeMap<MarketId, Price>,
    ) -> Result<MarginSummary, LedgerError> {
        let account = self.account(account_id)?;
        let unrealized_pnl = account.unrealized_pnl(marks);
        Ok(MarginSummary {
            collateral: account.collateral,
            margin_used: account.margin_locked(),
            margin_reserved: account.margin_reserved,
            available: account.available(),
            unrealized_pnl,
            equity: account.collateral.add(unrealized_pnl),
        })
    }

    pub fn solvency(&self, marks: &BTreeMap<MarketId, Price>) -> SolvencyReport {
        let mut report = SolvencyReport {
            total_collateral: Quote::zero(),
            insurance_balance: self.insurance_fund.balance,
            deficit: self.deficit,
            unrealized_pnl: Quote::zero(),
            net_deposits: Quote::zero(),
            insurance_contributions: self.insurance_contributions,
        };
        for account in self.accounts.values() {
            report.total_collateral = report.total_collateral.add(account.collateral);
            report.unrealized_pnl = report.unrealized_pnl.add(account.unrealized_pnl(marks));
            report.net_deposits = report
                .net_deposits
                .add(account.total_deposited)
                .sub(account.total_withdrawn);
        }
        report
    }

    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        for account in self.accounts.values() {
            if let Err(e) = account.check_invariants() {
                error!(account = ?account.id, error = %e, "ledger invariant violated");
                return Err(e.into());
            }
        }
        if self.deficit.is_negative() || self.insurance_fund.balance.is_negative() {
            error!(deficit = %self.deficit, insurance = %self.insurance_fund.balance, "negative system bucket");
            return Err(LedgerError::Invariant("negative insurance or deficit".to_string()));
        }
        Ok(())
    }
}

fn require_positive(amount: Quote) -> Result<(), LedgerError> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(LedgerError::ZeroAmount)
    }
}

// plan against the current position, check feasibility, then commit
fn net_fill(
    account: &mut Account,
    market_id: MarketId,
    size_delta: i128,
    price: Price,
    params: &MarginParams,
    mode: SettlementMode,
    timestamp: Timestamp,
) -> Result<PositionUpdate, LedgerError> {
    let existing = account.position(market_id);
    let prior_entry = existing.map(|p| p.entry_price);
    let plan = plan_netting(market_id, existing, size_delta, price, params, timestamp);

    if mode == SettlementMode::Normal {
        let collateral = account.collateral.add(plan.realized_pnl);
        let required = account
            .margin_locked()
            .add(plan.margin_delta())
            .add(account.margin_reserved);
        if collateral < required {
            return Err(AccountError::InsufficientMargin {
                required,
                available: collateral,
            }
            .into());
        }
        account.apply_pnl(plan.realized_pnl);
    }

    account.set_position(market_id, plan.new_position.clone());

    Ok(PositionUpdate {
        account_id: account.id,
        market_id,
        branch: plan.branch,
        size_delta,
        price,
        realized_pnl: plan.realized_pnl,
        margin_released: plan.margin_released,
        margin_locked: plan.margin_locked,
        closed_size: plan.closed_size,
        prior_entry,
        position: plan.new_position,
        release_excess: Quote::zero(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Account {0:?} not found")]
    AccountNotFound(AccountId),

    #[error("Amount must be greater than zero")]
    ZeroAmount,

    #[error("Amount must not be negative: {0}")]
    NegativeAmount(Quote),

    #[error("Account error: {0}")]
    Account(#[from] AccountError),

    #[error("Ledger invariant violated: {0}")]
    Invariant(String),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::AccountNotFound(_) | LedgerError::ZeroAmount | LedgerError::NegativeAmount(_) => {
                ErrorKind::Validation
            }
            LedgerError::Account(AccountError::Invariant(_)) | LedgerError::Invariant(_) => {
                ErrorKind::InternalInvariant
            }
            LedgerError::Account(_) => ErrorKind::InsufficientCollateral,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::{BASE_UNIT, QUOTE_UNIT};
    use crate::types::Bps;

    const ONE: u128 = BASE_UNIT;

    fn usd(whole: i128) -> Quote {
        Quote::new(whole * QUOTE_UNIT)
    }

    fn price(whole: u64) -> Price {
        Price::new_unchecked(whole * 1_000_000)
    }

    fn full_margin() -> MarginParams {
        MarginParams::symmetric(Bps::new(10_000), Bps::new(500))
    }

    fn leg(account_id: AccountId, side: Side, release: Quote) -> FillLeg {
        FillLeg {
            account_id,
            side,
            release,
            mode: SettlementMode::Normal,
        }
    }

    fn funded(ledger: &mut Ledger, amount: Quote) -> AccountId {
        let id = ledger.create_account(Timestamp::from_millis(0));
        ledger.deposit(id, amount).unwrap();
        id
    }

    #[test]
    fn zero_amounts_are_validation_errors() {
        let mut ledger = Ledger::default();
        let id = ledger.create_account(Timestamp::from_millis(0));
        let err = ledger.deposit(id, Quote::zero()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = ledger.withdraw(id, Quote::zero()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn withdraw_blocked_by_reservation() {
        let mut ledger = Ledger::default();
        let id = funded(&mut ledger, usd(1_000));
        ledger.reserve_margin(id, usd(900)).unwrap();
        let err = ledger.withdraw(id, usd(101)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientCollateral);
        assert_eq!(ledger.withdraw(id, usd(100)).unwrap(), usd(900));
    }

    #[test]
    fn over_release_is_an_anomaly() {
        let mut ledger = Ledger::default();
        let id = funded(&mut ledger, usd(1_000));
        ledger.reserve_margin(id, usd(10)).unwrap();
        assert_eq!(ledger.release_margin(id, usd(15)).unwrap(), usd(5));
        assert_eq!(ledger.anomaly_count(), 1);
        assert_eq!(ledger.account(id).unwrap().margin_reserved, Quote::zero());
    }

    #[test]
    fn settle_fill_moves_reservation_into_positions() {
        let mut ledger = Ledger::default();
        let a = funded(&mut ledger, usd(1_000));
        let b = funded(&mut ledger, usd(1_000));
        ledger.reserve_margin(a, usd(1_000)).unwrap();
        ledger.reserve_margin(b, usd(1_000)).unwrap();

        let (taker, maker) = ledger
            .settle_fill(
                MarketId(1),
                leg(b, Side::Short, usd(1_000)),
                leg(a, Side::Long, usd(1_000)),
                100 * ONE,
                price(10),
                &full_margin(),
                Timestamp::from_millis(1),
            )
            .unwrap();
        assert_eq!(taker.branch, Netting::Open);
        assert_eq!(maker.branch, Netting::Open);

        for id in [a, b] {
            let account = ledger.account(id).unwrap();
            assert_eq!(account.margin_locked(), usd(1_000));
            assert_eq!(account.margin_reserved, Quote::zero());
        }
        assert_eq!(ledger.account(a).unwrap().position(MarketId(1)).unwrap().size.value(), 100 * ONE as i128);
        assert_eq!(ledger.account(b).unwrap().position(MarketId(1)).unwrap().size.value(), -(100 * ONE as i128));
    }

    #[test]
    fn settle_fill_is_all_or_nothing() {
        let mut ledger = Ledger::default();
        let rich = funded(&mut ledger, usd(1_000));
        let poor = funded(&mut ledger, usd(10));
        let before_rich = ledger.account(rich).unwrap().clone();

        let failure = ledger
            .settle_fill(
                MarketId(1),
                leg(rich, Side::Long, Quote::zero()),
                leg(poor, Side::Short, Quote::zero()),
                10 * ONE,
                price(10),
                &full_margin(),
                Timestamp::from_millis(1),
            )
            .unwrap_err();
        assert_eq!(failure.role, FillRole::Maker);
        assert_eq!(failure.error.kind(), ErrorKind::InsufficientCollateral);

        let after_rich = ledger.account(rich).unwrap();
        assert_eq!(after_rich.collateral, before_rich.collateral);
        assert!(after_rich.positions.is_empty());
    }

    #[test]
    fn normal_close_realizes_pnl() {
        let mut ledger = Ledger::default();
        let id = funded(&mut ledger, usd(1_000));
        let params = MarginParams::default();
        ledger
            .update_position(id, MarketId(1), 10 * ONE as i128, price(50), &params, SettlementMode::Normal, Timestamp::from_millis(0))
            .unwrap();
        let update = ledger
            .update_position(id, MarketId(1), -(10 * ONE as i128), price(55), &params, SettlementMode::Normal, Timestamp::from_millis(1))
            .unwrap();
        assert_eq!(update.branch, Netting::FullClose);
        assert_eq!(update.realized_pnl, usd(50));

        let account = ledger.account(id).unwrap();
        assert_eq!(account.collateral, usd(1_050));
        assert_eq!(account.margin_locked(), Quote::zero());
        assert_eq!(account.active_markets().count(), 0);
    }

    #[test]
    fn liquidation_mode_defers_pnl_and_never_fails() {
        let mut ledger = Ledger::default();
        let id = funded(&mut ledger, usd(100));
        let params = MarginParams::symmetric(Bps::new(1_000), Bps::new(500));
        ledger
            .update_position(id, MarketId(1), 10 * ONE as i128, price(100), &params, SettlementMode::Normal, Timestamp::from_millis(0))
            .unwrap();

        // closing at 80 loses 200 against 100 collateral
        let update = ledger
            .update_position(id, MarketId(1), -(10 * ONE as i128), price(80), &params, SettlementMode::Liquidation, Timestamp::from_millis(1))
            .unwrap();
        assert_eq!(update.realized_pnl, usd(-200));
        assert_eq!(ledger.account(id).unwrap().collateral, usd(100));

        let allocation = ledger.liquidate(&update, &LiquidationParams::default()).unwrap();
        assert_eq!(allocation.trading_loss, usd(200));
        assert_eq!(allocation.penalty, usd(5));
        assert_eq!(allocation.covered_from_margin, usd(100));
        assert_eq!(allocation.covered_from_available, Quote::zero());
        assert_eq!(allocation.socialized, usd(105));
        assert_eq!(allocation.insurance_covered, usd(5));
        assert_eq!(allocation.deficit, usd(100));
        assert_eq!(ledger.account(id).unwrap().collateral, Quote::zero());
        assert_eq!(ledger.socialized_deficit(), usd(100));
    }

    #[test]
    fn spot_settlement_moves_quote_and_base() {
        let mut ledger = Ledger::default();
        let buyer = funded(&mut ledger, usd(100));
        let seller = ledger.create_account(Timestamp::from_millis(0));
        ledger.deposit_base(seller, MarketId(3), 5 * ONE).unwrap();
        ledger.hold_base(seller, MarketId(3), 5 * ONE).unwrap();
        ledger.reserve_margin(buyer, usd(20)).unwrap();

        let settlement = ledger
            .settle_spot(
                MarketId(3),
                leg(buyer, Side::Long, usd(20)),
                leg(seller, Side::Short, Quote::zero()),
                2 * ONE,
                price(10),
            )
            .unwrap();
        assert_eq!(settlement.quote_amount, usd(20));

        let b = ledger.account(buyer).unwrap();
        assert_eq!(b.collateral, usd(80));
        assert_eq!(b.margin_reserved, Quote::zero());
        assert_eq!(b.spot_balance(MarketId(3)).free, 2 * ONE);
        assert!(b.positions.is_empty());

        let s = ledger.account(seller).unwrap();
        assert_eq!(s.collateral, usd(20));
        assert_eq!(s.spot_balance(MarketId(3)).held, 3 * ONE);
    }

    #[test]
    fn spot_excess_is_attributed_per_side() {
        let mut ledger = Ledger::default();
        let buyer = funded(&mut ledger, usd(100));
        let seller = funded(&mut ledger, usd(100));
        ledger.deposit_base(seller, MarketId(3), ONE).unwrap();
        ledger.hold_base(seller, MarketId(3), ONE).unwrap();
        ledger.reserve_margin(buyer, usd(10)).unwrap();

        // the seller asks to release $4 it never reserved
        let settlement = ledger
            .settle_spot(
                MarketId(3),
                leg(seller, Side::Short, usd(4)),
                leg(buyer, Side::Long, usd(10)),
                ONE,
                price(10),
            )
            .unwrap();
        assert_eq!(settlement.buyer_excess, Quote::zero());
        assert_eq!(settlement.seller_excess, usd(4));
        assert_eq!(ledger.anomaly_count(), 1);
    }

    #[test]
    fn rollback_restores_touched_accounts_only() {
        let mut ledger = Ledger::new(usd(50));
        let first = funded(&mut ledger, usd(100));
        let second = funded(&mut ledger, usd(100));

        ledger.begin();
        ledger.deposit(first, usd(25)).unwrap();
        ledger.fund_insurance(usd(5)).unwrap();
        let created = ledger.create_account(Timestamp::from_millis(1));
        ledger.rollback();

        assert_eq!(ledger.account(first).unwrap().collateral, usd(100));
        assert_eq!(ledger.account(second).unwrap().collateral, usd(100));
        assert_eq!(ledger.insurance_fund().balance, usd(50));
        assert!(!ledger.contains(created));
        assert_eq!(ledger.create_account(Timestamp::from_millis(2)), created);

        ledger.begin();
        ledger.deposit(second, usd(1)).unwrap();
        ledger.commit();
        ledger.rollback();
        assert_eq!(ledger.account(second).unwrap().collateral, usd(101));
    }

    #[test]
    fn solvency_gap_is_zero_after_trading() {
        let mut ledger = Ledger::new(usd(50));
        let a = funded(&mut ledger, usd(1_000));
        let b = funded(&mut ledger, usd(1_000));
        ledger
            .settle_fill(
                MarketId(1),
                leg(a, Side::Long, Quote::zero()),
                leg(b, Side::Short, Quote::zero()),
                10 * ONE,
                price(10),
                &full_margin(),
                Timestamp::from_millis(1),
            )
            .unwrap();
        let marks = BTreeMap::from([(MarketId(1), price(12))]);
        assert_eq!(ledger.solvency(&marks).gap(), Quote::zero());
        assert!(ledger.check_invariants().is_ok());
    }
}
