//! Property tests over random decision streams.

use chrono::Utc;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::sync::Arc;

use hydra::engine::ExecutionCoordinator;
use hydra::exchange::{FillMode, SimulatedExchange};
use hydra::signals::simulated::SimulatedMarket;
use hydra::storage::MemoryOrderStore;
use hydra::strategy::risk::RiskGovernor;
use hydra::types::{Action, Decision, HaltCause, PortfolioState, RiskLimits, Verdict};

use crate::harness::{make_execution_settings, make_gateway_retry, SYMBOL};

struct Rig {
    market: Arc<SimulatedMarket>,
    exchange: Arc<SimulatedExchange>,
    governor: RiskGovernor,
    coordinator: ExecutionCoordinator,
}

fn make_rig() -> Rig {
    let market = Arc::new(SimulatedMarket::with_fixed_price(SYMBOL, dec!(100)));
    let exchange = Arc::new(SimulatedExchange::new(market.clone(), dec!(10000), FillMode::Immediate));
    let governor = RiskGovernor::new(RiskLimits::default());
    let coordinator = ExecutionCoordinator::new(
        exchange.clone(),
        Arc::new(MemoryOrderStore::new()),
        governor.clone(),
        make_gateway_retry(1),
        make_execution_settings(),
        PortfolioState::new(dec!(10000)),
    );
    Rig {
        market,
        exchange,
        governor,
        coordinator,
    }
}

fn make_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn make_decision(cycle: u64, action: Action, size: Decimal) -> Decision {
    Decision {
        cycle_id: cycle,
        symbol: SYMBOL.into(),
        action,
        target_size: size,
        confidence: 0.8,
        rationale: Vec::new(),
        view_built_at: Utc::now(),
    }
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        4 => Just(Action::Buy),
        2 => Just(Action::Sell),
        1 => Just(Action::Close),
        1 => Just(Action::Hold),
    ]
}

/// (action, size in whole units, price in whole quote units)
fn step_strategy() -> impl Strategy<Value = (Action, u32, u32)> {
    (action_strategy(), 1u32..80, 60u32..140)
}

/// Evaluate and, if approved, execute one step at `price`.
async fn run_step(rig: &Rig, cycle: u64, action: Action, size: u32, price: u32) -> Verdict {
    let price = Decimal::from(price);
    rig.market.set_price(SYMBOL, price);
    let marks = BTreeMap::from([(SYMBOL.to_string(), price)]);
    let snapshot = rig.coordinator.snapshot(marks).await;
    let decision = make_decision(cycle, action, Decimal::from(size));
    let verdict = rig.governor.evaluate(&decision, &snapshot, Some(price));
    if let Some(approved) = verdict.approved_size() {
        rig.coordinator.execute(&decision, approved, None).await.unwrap();
    }
    verdict
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_exposure_never_exceeds_limit(steps in prop::collection::vec(step_strategy(), 1..25)) {
        let runtime = make_runtime();
        runtime.block_on(async {
            let rig = make_rig();
            let limit = RiskLimits::default().max_position_size;
            for (i, (action, size, price)) in steps.into_iter().enumerate() {
                run_step(&rig, i as u64 + 1, action, size, price).await;
                let portfolio = rig.coordinator.portfolio().await;
                // Weighted entry prices carry division residue past the 8th place.
                assert!(
                    portfolio.exposure().round_dp(8) <= limit,
                    "exposure {} over limit {} after step {}",
                    portfolio.exposure(),
                    limit,
                    i
                );
                assert!(portfolio.held(SYMBOL) >= Decimal::ZERO);
            }
        });
    }

    #[test]
    fn test_no_orders_after_halt(
        before in prop::collection::vec(step_strategy(), 0..10),
        after in prop::collection::vec(step_strategy(), 1..10),
    ) {
        let runtime = make_runtime();
        runtime.block_on(async {
            let rig = make_rig();
            let mut cycle = 0u64;
            for (action, size, price) in before {
                cycle += 1;
                run_step(&rig, cycle, action, size, price).await;
            }

            rig.governor.halt(HaltCause::External { source: "property".into() }, Utc::now());
            let submitted = rig.exchange.submission_count();
            let held = rig.coordinator.portfolio().await.held(SYMBOL);

            for (action, size, price) in after {
                cycle += 1;
                let verdict = run_step(&rig, cycle, action, size, price).await;
                assert!(verdict.is_vetoed());

                // Bypassing the governor's verdict still places nothing.
                let decision = make_decision(cycle, action, Decimal::from(size));
                let out = rig.coordinator.execute(&decision, Decimal::from(size), None).await.unwrap();
                assert_eq!(out.filled_quantity, Decimal::ZERO);
            }

            assert_eq!(rig.exchange.submission_count(), submitted);
            assert_eq!(rig.coordinator.portfolio().await.held(SYMBOL), held);
        });
    }
}
