//! Solvency invariant tests.
//!
//! These tests verify that collateral is conserved and that every engine
//! invariant holds after any sequence of accepted or rejected operations.

use perps_margin::fixed::{BASE_UNIT, QUOTE_UNIT};
use perps_margin::*;
use proptest::prelude::*;

const ONE: u128 = BASE_UNIT;
const MARKET: MarketId = MarketId(1);

fn usd(whole: i128) -> Quote {
    Quote::new(whole * QUOTE_UNIT)
}

fn px(whole: u64) -> Price {
    Price::new_unchecked(whole * 1_000_000)
}

fn setup_engine() -> Engine {
    let mut engine = Engine::new(EngineConfig::default());
    let mut config = MarketConfig::eth_perp().with_spot();
    config.margin_params = MarginParams::symmetric(Bps::new(1_000), Bps::new(500));
    engine.add_market(config).unwrap();
    engine
}

fn funded(engine: &mut Engine, amount: i128) -> AccountId {
    let id = engine.create_account();
    engine.deposit(id, usd(amount)).unwrap();
    id
}

mod collateral {
    use super::*;

    #[test]
    fn deposit_and_withdraw() {
        let mut engine = setup_engine();
        let trader = funded(&mut engine, 1_000);

        assert_eq!(engine.withdraw(trader, usd(400)).unwrap(), usd(600));
        let account = engine.account(trader).unwrap();
        assert_eq!(account.collateral, usd(600));
        assert_eq!(account.total_deposited, usd(1_000));
        assert_eq!(account.total_withdrawn, usd(400));

        let kinds: Vec<_> = engine
            .events()
            .filter_map(|e| match &e.payload {
                EventPayload::Deposit(d) => Some(("deposit", d.amount)),
                EventPayload::Withdrawal(w) => Some(("withdrawal", w.amount)),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![("deposit", usd(1_000)), ("withdrawal", usd(400))]);
        assert_eq!(engine.solvency().gap(), Quote::zero());
    }

    #[test]
    fn rejected_withdrawal_is_logged_and_reverted() {
        let mut engine = setup_engine();
        let trader = funded(&mut engine, 100);

        let err = engine.withdraw(trader, usd(150)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientCollateral);
        assert_eq!(engine.account(trader).unwrap().collateral, usd(100));
        assert_eq!(engine.account(trader).unwrap().total_withdrawn, Quote::zero());

        let last = engine.events().next_back().unwrap();
        match &last.payload {
            EventPayload::WithdrawalRejected(rejected) => {
                assert_eq!(rejected.account_id, trader);
                assert_eq!(rejected.amount, usd(150));
                assert!(!rejected.reason.is_empty());
            }
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[test]
    fn invalid_amounts_and_accounts() {
        let mut engine = setup_engine();
        let trader = funded(&mut engine, 100);

        let err = engine.deposit(trader, Quote::zero()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = engine.deposit(trader, usd(-5)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = engine.withdraw(trader, Quote::zero()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = engine.deposit(AccountId(99), usd(10)).unwrap_err();
        assert!(matches!(err, EngineError::Ledger(LedgerError::AccountNotFound(AccountId(99)))));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(engine.account(trader).unwrap().collateral, usd(100));
    }

    #[test]
    fn reservations_and_positions_block_withdrawal() {
        let mut engine = setup_engine();
        let trader = funded(&mut engine, 100);
        let maker = funded(&mut engine, 1_000);

        // bid 1 @ $500 reserves $50
        let resting = engine
            .place_limit_order(trader, MARKET, Side::Long, ONE, px(500), OrderClass::Margin)
            .unwrap();
        assert_eq!(resting.margin_reserved, usd(50));
        assert!(engine.withdraw(trader, usd(60)).is_err());
        assert_eq!(engine.account(trader).unwrap().available(), usd(50));

        // the fill turns the reservation into locked margin
        engine
            .place_market_order(maker, MARKET, Side::Short, ONE, OrderClass::Margin)
            .unwrap();
        let summary = engine.margin_summary(trader).unwrap();
        assert_eq!(summary.margin_used, usd(50));
        assert_eq!(summary.margin_reserved, Quote::zero());
        assert!(engine.withdraw(trader, usd(51)).is_err());
        assert_eq!(engine.withdraw(trader, usd(50)).unwrap(), usd(50));
        assert!(engine.check_invariants().is_ok());
    }

    #[test]
    fn base_balances() {
        let mut engine = setup_engine();
        let trader = engine.create_account();

        engine.deposit_base(trader, MARKET, 2 * ONE).unwrap();
        let err = engine.withdraw_base(trader, MARKET, 3 * ONE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientCollateral);
        engine.withdraw_base(trader, MARKET, ONE).unwrap();
        assert_eq!(engine.account(trader).unwrap().spot_balance(MARKET).free, ONE);

        assert!(matches!(
            engine.deposit_base(trader, MarketId(7), ONE),
            Err(EngineError::MarketNotFound(MarketId(7)))
        ));
        assert_eq!(engine.deposit_base(trader, MARKET, 0).unwrap_err().kind(), ErrorKind::Validation);

        let transfers: Vec<i128> = engine
            .events()
            .filter_map(|e| match &e.payload {
                EventPayload::BaseTransfer(t) => Some(t.amount),
                _ => None,
            })
            .collect();
        assert_eq!(transfers, vec![(2 * ONE) as i128, -(ONE as i128)]);
    }

    #[test]
    fn held_base_cannot_be_withdrawn() {
        let mut engine = setup_engine();
        let trader = engine.create_account();
        engine.deposit_base(trader, MARKET, ONE).unwrap();
        engine
            .place_limit_order(trader, MARKET, Side::Short, ONE, px(100), OrderClass::Spot)
            .unwrap();

        let balance = engine.account(trader).unwrap().spot_balance(MARKET);
        assert_eq!(balance.free, 0);
        assert_eq!(balance.held, ONE);
        assert!(engine.withdraw_base(trader, MARKET, ONE).is_err());
    }

    #[test]
    fn insurance_contributions_are_tracked() {
        let mut engine = Engine::new(EngineConfig {
            insurance_seed: usd(1_000),
            ..EngineConfig::default()
        });
        engine.add_market(MarketConfig::eth_perp()).unwrap();
        assert_eq!(engine.insurance_fund_balance(), usd(1_000));

        engine.fund_insurance(usd(500)).unwrap();
        assert_eq!(engine.insurance_fund_balance(), usd(1_500));
        assert_eq!(engine.fund_insurance(Quote::zero()).unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(engine.solvency().gap(), Quote::zero());
    }
}

#[derive(Debug, Clone)]
enum Op {
    Limit { trader: usize, side: Side, price: u64, tenths: u128 },
    Market { trader: usize, side: Side, tenths: u128 },
    Cancel { trader: usize, nth: usize },
    Withdraw { trader: usize, dollars: i128 },
    Advance { secs: i64 },
}

fn side_strategy() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Long), Just(Side::Short)]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..4usize, side_strategy(), 95u64..=105u64, 1u128..=50u128)
            .prop_map(|(trader, side, price, tenths)| Op::Limit { trader, side, price, tenths }),
        2 => (0..4usize, side_strategy(), 1u128..=50u128)
            .prop_map(|(trader, side, tenths)| Op::Market { trader, side, tenths }),
        1 => (0..4usize, 0..8usize).prop_map(|(trader, nth)| Op::Cancel { trader, nth }),
        1 => (0..4usize, 1i128..=500i128).prop_map(|(trader, dollars)| Op::Withdraw { trader, dollars }),
        1 => (1i64..=120i64).prop_map(|secs| Op::Advance { secs }),
    ]
}

fn apply(engine: &mut Engine, traders: &[AccountId], op: &Op) {
    // rejected operations are expected; they must leave no trace
    let _ = match *op {
        Op::Limit { trader, side, price, tenths } => engine
            .place_limit_order(traders[trader], MARKET, side, tenths * ONE / 10, px(price), OrderClass::Margin)
            .map(|_| ()),
        Op::Market { trader, side, tenths } => engine
            .place_market_order(traders[trader], MARKET, side, tenths * ONE / 10, OrderClass::Margin)
            .map(|_| ()),
        Op::Cancel { trader, nth } => {
            let order_id = engine
                .user_orders(traders[trader])
                .ok()
                .and_then(|orders| orders.get(nth).map(|o| o.id));
            match order_id {
                Some(id) => engine.cancel_order(traders[trader], id).map(|_| ()),
                None => Ok(()),
            }
        }
        Op::Withdraw { trader, dollars } => engine.withdraw(traders[trader], usd(dollars)).map(|_| ()),
        Op::Advance { secs } => {
            engine.advance_time(secs * 1_000);
            Ok(())
        }
    };
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Collateral, insurance, deficit and unrealized PnL always account for
    /// every dollar deposited, and the engine invariants hold throughout.
    #[test]
    fn random_operations_conserve_collateral(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let mut engine = setup_engine();
        engine.fund_insurance(usd(100)).unwrap();
        let traders: Vec<AccountId> = (0..4).map(|_| funded(&mut engine, 2_000)).collect();

        for (step, op) in ops.iter().enumerate() {
            apply(&mut engine, &traders, op);

            prop_assert!(engine.check_invariants().is_ok(), "invariants broken after {:?}", op);
            // weighted entries round to the micro-dollar, one cent per step is ample
            let gap = engine.solvency().gap();
            let bound = 10_000 * (step as i128 + 1);
            prop_assert!(gap.raw().abs() <= bound, "solvency gap {} after {:?}", gap, op);
        }
    }

    /// Open interest equals both the total long and the total short size.
    #[test]
    fn open_interest_always_balanced(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let mut engine = setup_engine();
        let traders: Vec<AccountId> = (0..4).map(|_| funded(&mut engine, 2_000)).collect();

        for op in &ops {
            apply(&mut engine, &traders, op);
        }

        let (mut longs, mut shorts) = (0u128, 0u128);
        for account in engine.accounts() {
            if let Some(position) = account.position(MARKET) {
                match position.side() {
                    Some(Side::Long) => longs += position.size.abs(),
                    Some(Side::Short) => shorts += position.size.abs(),
                    None => {}
                }
            }
        }
        prop_assert_eq!(longs, shorts);
        prop_assert_eq!(engine.market(MARKET).unwrap().open_interest, longs);
    }

    /// Cancelling twice never releases a reservation twice.
    #[test]
    fn cancel_never_double_releases(price in 90u64..110u64, tenths in 1u128..=50u128) {
        let mut engine = setup_engine();
        let trader = funded(&mut engine, 1_000);
        let placed = engine
            .place_limit_order(trader, MARKET, Side::Long, tenths * ONE / 10, px(price), OrderClass::Margin)
            .unwrap();
        prop_assert!(placed.margin_reserved.is_positive());

        prop_assert!(engine.cancel_order(trader, placed.order_id).unwrap());
        prop_assert!(!engine.cancel_order(trader, placed.order_id).unwrap());
        let account = engine.account(trader).unwrap();
        prop_assert_eq!(account.margin_reserved, Quote::zero());
        prop_assert_eq!(account.collateral, usd(1_000));
    }
}
