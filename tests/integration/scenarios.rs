//! End-to-end cycle scenarios: risk transitions, stale data, failure
//! accounting and the kill switch.

use chrono::Utc;
use rust_decimal_macros::dec;
use std::time::Duration;

use hydra::engine::{KillSwitchMonitor, StopReason};
use hydra::strategy::BrainConfig;
use hydra::types::{Action, CycleOutcome, RiskLimits, RiskState, SignalSource, Verdict, VetoReason};

use crate::harness::{Harness, HarnessOptions, SYMBOL};

#[tokio::test]
async fn test_fresh_bullish_view_buys_full_budget() {
    let mut h = Harness::start();
    h.set_price(100.0);

    let record = h.cycle().await;
    assert_eq!(record.outcome, CycleOutcome::Executed);
    assert_eq!(record.decision.as_ref().unwrap().action, Action::Buy);
    let execution = record.execution.unwrap();
    assert_eq!(execution.filled_quantity, dec!(50));
    assert_eq!(execution.orders.len(), 2);

    let portfolio = h.orchestrator.coordinator().portfolio().await;
    assert_eq!(portfolio.held("BTCUSDT"), dec!(50));
    assert_eq!(portfolio.cash, dec!(5000));
    assert_eq!(h.forensic.records().len(), 1);
}

#[tokio::test]
async fn test_drawdown_halts_and_vetoes_same_cycle_buy() {
    let mut h = Harness::start();
    h.set_price(100.0);
    h.cycle().await;

    // 50 units bought at 100; at 70 equity is 8500, a 15% drawdown.
    h.set_price(70.0);
    let record = h.cycle().await;

    assert_eq!(record.risk_state_before, RiskState::Active);
    assert_eq!(record.risk_state_after, RiskState::Halted);
    assert_eq!(record.transitions.len(), 1);
    assert_eq!(record.transitions[0].to, RiskState::Halted);
    assert!(record.transitions[0].reason.contains("drawdown"));
    assert_eq!(record.decision.as_ref().unwrap().action, Action::Buy);
    assert!(matches!(
        record.verdict,
        Some(Verdict::Vetoed {
            reason: VetoReason::Halted { .. }
        })
    ));
    assert_eq!(record.outcome, CycleOutcome::Vetoed);

    let logged = h.forensic.records();
    assert_eq!(logged.len(), 2);
    assert_eq!(logged[1], record);
    assert_eq!(h.exchange.order_count(), 2);

    let summary = h.orchestrator.run(Some(5), &h.cancel).await.unwrap();
    assert_eq!(summary.cycles_run, 0);
    assert_eq!(summary.stop, StopReason::Halted);
}

#[tokio::test]
async fn test_stale_sentiment_weighs_less() {
    let mut fresh = Harness::start();
    fresh.set_price(100.0);
    fresh.set_sentiment(0.6, 0.8, Utc::now());
    let fresh_record = fresh.cycle().await;

    let mut stale = Harness::start();
    stale.set_price(100.0);
    stale.set_sentiment(0.6, 0.8, Utc::now() - chrono::Duration::hours(3));
    let stale_record = stale.cycle().await;

    let fresh_decision = fresh_record.decision.unwrap();
    let stale_decision = stale_record.decision.unwrap();
    let fresh_conf = fresh_decision.rationale_confidence(SignalSource::Sentiment).unwrap();
    let stale_conf = stale_decision.rationale_confidence(SignalSource::Sentiment).unwrap();

    assert!(stale_conf > 0.0);
    assert!(stale_conf < fresh_conf);
    assert!(stale_decision.confidence < fresh_decision.confidence);
    assert!(stale_record.view.unwrap().sentiment_decay < 1.0);
    // Technical data was fresh, so the view itself is not stale.
    assert!(!stale_record.stale);
}

#[tokio::test]
async fn test_stale_technical_falls_back_to_cached_view() {
    let mut h = Harness::new(HarnessOptions {
        technical_max_age: chrono::Duration::milliseconds(150),
        ..HarnessOptions::default()
    });
    h.set_price(100.0);
    let first = h.cycle().await;
    assert!(!first.stale);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let second = h.cycle().await;

    assert!(second.stale);
    let view = second.view.unwrap();
    assert!(view.stale);
    assert_eq!(view.cycle_id, second.cycle_id);
    assert!(view.ages.technical_ms >= 300);
    assert!(second.decision.is_some());
    assert_ne!(second.outcome, CycleOutcome::Skipped);
    assert_eq!(h.orchestrator.state().consecutive_failures, 0);
}

#[tokio::test]
async fn test_stale_view_never_buys_past_exposure_limit() {
    let mut h = Harness::new(HarnessOptions {
        technical_max_age: chrono::Duration::milliseconds(150),
        brain: BrainConfig {
            risk_per_trade_pct: 0.3,
            ..BrainConfig::default()
        },
        ..HarnessOptions::default()
    });
    h.set_price(100.0);
    let first = h.cycle().await;
    assert_eq!(first.execution.unwrap().filled_quantity, dec!(30));
    let orders = h.exchange.order_count();

    // Technical data goes stale while the market doubles; the cached view
    // still reads 100.
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.market.set_price(SYMBOL, dec!(200));
    let second = h.cycle().await;

    assert!(second.stale);
    assert_eq!(second.decision.as_ref().unwrap().action, Action::Buy);
    assert!(matches!(
        second.verdict,
        Some(Verdict::Vetoed {
            reason: VetoReason::StaleView { .. }
        })
    ));
    assert_eq!(h.exchange.order_count(), orders);
    let portfolio = h.orchestrator.coordinator().portfolio().await;
    assert!(portfolio.exposure() <= RiskLimits::default().max_position_size);
    assert_eq!(portfolio.held(SYMBOL), dec!(30));
}

#[tokio::test]
async fn test_throttle_then_recovery_after_cooldown() {
    let mut h = Harness::new(HarnessOptions {
        limits: RiskLimits {
            cooldown_secs: 1,
            ..RiskLimits::default()
        },
        ..HarnessOptions::default()
    });
    h.set_price(100.0);
    h.cycle().await;

    // 2.5% daily loss: past the soft limit, short of the hard ones.
    h.set_price(95.0);
    let throttled = h.cycle().await;
    assert_eq!(throttled.risk_state_after, RiskState::Throttled);
    assert_eq!(throttled.transitions[0].from, RiskState::Active);

    let holding = h.cycle().await;
    assert!(holding.transitions.is_empty());
    assert_eq!(holding.risk_state_after, RiskState::Throttled);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let recovered = h.cycle().await;
    assert_eq!(recovered.transitions.len(), 1);
    assert_eq!(recovered.transitions[0].to, RiskState::Active);
    assert_eq!(recovered.risk_state_after, RiskState::Active);
}

#[tokio::test]
async fn test_consecutive_failures_trip_kill_switch() {
    let mut h = Harness::start();
    h.set_price(100.0);
    h.exchange.fail_next_submits(1_000);

    let summary = h.orchestrator.run(Some(10), &h.cancel).await.unwrap();
    assert_eq!(summary.cycles_run, 3);
    assert_eq!(summary.stop, StopReason::Halted);
    assert_eq!(summary.final_state, RiskState::Halted);
    assert_eq!(h.exchange.order_count(), 0);

    let records = h.forensic.records();
    assert!(records.iter().all(|r| r.outcome == CycleOutcome::Failed));
    assert!(records[2].transitions[0].reason.contains("consecutive"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.notifier.notices().len(), 3);
}

#[tokio::test]
async fn test_kill_file_blocks_all_orders() {
    let mut h = Harness::start();
    h.set_price(100.0);
    let path = std::env::temp_dir().join(format!("hydra_stop_{}", uuid::Uuid::new_v4()));
    std::fs::write(&path, b"operator stop").unwrap();

    let handle = KillSwitchMonitor::new(&path, h.governor.clone(), Duration::from_millis(5)).spawn(h.cancel.child_token());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let record = h.cycle().await;
    assert_eq!(record.risk_state_before, RiskState::Halted);
    assert_eq!(record.outcome, CycleOutcome::Vetoed);
    assert!(record.execution.is_none());
    assert_eq!(h.exchange.submission_count(), 0);

    h.cancel.cancel();
    handle.await.unwrap();
    let _ = std::fs::remove_file(path);
}
