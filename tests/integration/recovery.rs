//! Crash and restart behaviour: write-ahead orders, lost acknowledgements
//! and persisted kill-switch state.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use hydra::engine::ExecutionCoordinator;
use hydra::exchange::{ExchangeGateway, FillMode, SimulatedExchange};
use hydra::signals::simulated::SimulatedMarket;
use hydra::storage::{load_state, OrderStore, SqliteOrderStore};
use hydra::strategy::risk::RiskGovernor;
use hydra::types::{Action, Decision, Order, OrderKey, OrderStatus, RiskLimits, RiskState, Side};

use crate::harness::{make_execution_settings, make_gateway_retry, Harness, HarnessOptions, SYMBOL};

fn make_decision(cycle: u64, size: Decimal) -> Decision {
    Decision {
        cycle_id: cycle,
        symbol: SYMBOL.into(),
        action: Action::Buy,
        target_size: size,
        confidence: 0.9,
        rationale: Vec::new(),
        view_built_at: Utc::now(),
    }
}

fn make_db_url() -> (std::path::PathBuf, String) {
    let path = std::env::temp_dir().join(format!("hydra_recovery_{}.db", uuid::Uuid::new_v4()));
    let url = format!("sqlite://{}", path.display());
    (path, url)
}

fn make_exchange() -> Arc<SimulatedExchange> {
    let market = Arc::new(SimulatedMarket::with_fixed_price(SYMBOL, dec!(100)));
    Arc::new(SimulatedExchange::new(market, dec!(10000), FillMode::Immediate))
}

async fn make_coordinator(
    exchange: Arc<SimulatedExchange>,
    store: Arc<SqliteOrderStore>,
    attempts: u32,
) -> ExecutionCoordinator {
    ExecutionCoordinator::restore(
        exchange,
        store,
        RiskGovernor::new(RiskLimits::default()),
        make_gateway_retry(attempts),
        make_execution_settings(),
        dec!(10000),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_crash_between_submit_and_ack_settles_once() {
    let (path, url) = make_db_url();
    let exchange = make_exchange();

    // The previous process wrote ahead, submitted, then died before
    // recording the acknowledgement.
    {
        let store = SqliteOrderStore::connect(&url).await.unwrap();
        let key = OrderKey::new(7, SYMBOL, Action::Buy, 0);
        store
            .commit(&Order::pending(&key, Side::Buy, dec!(10), Utc::now()), None)
            .await
            .unwrap();
        exchange
            .submit_order(&key.to_string(), SYMBOL, Side::Buy, dec!(10))
            .await
            .unwrap();
    }

    let store = Arc::new(SqliteOrderStore::connect(&url).await.unwrap());
    let coordinator = make_coordinator(exchange.clone(), store.clone(), 2).await;
    let report = coordinator.reconcile_open_orders(None).await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.resolved, 1);
    assert_eq!(report.unresolved, 0);

    let order = store.get("hx-7-BTCUSDT-buy-0").await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    let portfolio = coordinator.portfolio().await;
    assert_eq!(portfolio.held(SYMBOL), dec!(10));
    assert_eq!(portfolio.cash, dec!(9000));

    // Replaying the interrupted cycle finds the order terminal and adds nothing.
    let replay = coordinator.execute(&make_decision(7, dec!(10)), dec!(10), None).await.unwrap();
    assert_eq!(replay.filled_quantity, dec!(10));
    assert_eq!(exchange.order_count(), 1);
    assert_eq!(exchange.submission_count(), 1);
    assert_eq!(coordinator.portfolio().await.held(SYMBOL), dec!(10));
    assert!(coordinator.verify_positions().await.unwrap().is_empty());

    // A second reconciliation has nothing left to do.
    assert_eq!(coordinator.reconcile_open_orders(None).await.unwrap().checked, 0);
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn test_write_ahead_without_submission_is_cancelled() {
    let (path, url) = make_db_url();
    let exchange = make_exchange();
    {
        let store = SqliteOrderStore::connect(&url).await.unwrap();
        let key = OrderKey::new(3, SYMBOL, Action::Buy, 0);
        store
            .commit(&Order::pending(&key, Side::Buy, dec!(5), Utc::now()), None)
            .await
            .unwrap();
    }

    let store = Arc::new(SqliteOrderStore::connect(&url).await.unwrap());
    let coordinator = make_coordinator(exchange.clone(), store.clone(), 2).await;
    let report = coordinator.reconcile_open_orders(None).await.unwrap();
    assert_eq!(report.cancelled, 1);

    let order = store.get("hx-3-BTCUSDT-buy-0").await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(coordinator.portfolio().await.held(SYMBOL), Decimal::ZERO);
    assert_eq!(exchange.order_count(), 0);
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn test_lost_ack_recovered_on_restart() {
    let (path, url) = make_db_url();
    let exchange = make_exchange();
    exchange.lose_next_acks(1);

    {
        let store = Arc::new(SqliteOrderStore::connect(&url).await.unwrap());
        let coordinator = make_coordinator(exchange.clone(), store.clone(), 1).await;
        let out = coordinator.execute(&make_decision(2, dec!(10)), dec!(10), None).await.unwrap();
        assert!(out.failed);
        assert_eq!(out.effective_action, Action::Hold);
        assert_eq!(out.open_order_ids, vec!["hx-2-BTCUSDT-buy-0".to_string()]);
        assert_eq!(coordinator.portfolio().await.held(SYMBOL), Decimal::ZERO);
    }

    let store = Arc::new(SqliteOrderStore::connect(&url).await.unwrap());
    let coordinator = make_coordinator(exchange.clone(), store.clone(), 1).await;
    let report = coordinator.reconcile_open_orders(None).await.unwrap();
    assert_eq!(report.resolved, 1);

    let order = store.get("hx-2-BTCUSDT-buy-0").await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(coordinator.portfolio().await.held(SYMBOL), dec!(10));
    assert!(coordinator.verify_positions().await.unwrap().is_empty());
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn test_lost_ack_retried_under_same_key() {
    let (path, url) = make_db_url();
    let exchange = make_exchange();
    exchange.lose_next_acks(1);

    let store = Arc::new(SqliteOrderStore::connect(&url).await.unwrap());
    let coordinator = make_coordinator(exchange.clone(), store.clone(), 3).await;
    let out = coordinator.execute(&make_decision(5, dec!(10)), dec!(10), None).await.unwrap();

    assert!(!out.failed);
    assert_eq!(out.filled_quantity, dec!(10));
    assert_eq!(exchange.submission_count(), 2);
    assert_eq!(exchange.order_count(), 1);
    let order = store.get("hx-5-BTCUSDT-buy-0").await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.retry_count, 1);
    assert_eq!(coordinator.portfolio().await.held(SYMBOL), dec!(10));
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn test_sim_restart_resumes_venue_ledger() {
    let (path, url) = make_db_url();
    {
        let store = Arc::new(SqliteOrderStore::connect(&url).await.unwrap());
        let coordinator = make_coordinator(make_exchange(), store, 1).await;
        let out = coordinator.execute(&make_decision(1, dec!(10)), dec!(10), None).await.unwrap();
        assert_eq!(out.filled_quantity, dec!(10));
    }

    // New process: the in-process venue is rebuilt from the persisted
    // portfolio and the walk resumes at the entry price.
    let store = Arc::new(SqliteOrderStore::connect(&url).await.unwrap());
    let restored = store.load_portfolio().await.unwrap().unwrap();
    assert_eq!(restored.held(SYMBOL), dec!(10));
    let market = Arc::new(SimulatedMarket::new(42));
    market.resume_at(SYMBOL, restored.position(SYMBOL).unwrap().entry_price);
    let exchange = Arc::new(SimulatedExchange::with_ledger(market, &restored, FillMode::Immediate));

    let coordinator = make_coordinator(exchange.clone(), store.clone(), 1).await;
    assert!(coordinator.verify_positions().await.unwrap().is_empty());

    let close = Decision {
        action: Action::Close,
        ..make_decision(2, dec!(10))
    };
    let out = coordinator.execute(&close, dec!(10), None).await.unwrap();
    assert!(!out.failed);
    assert_eq!(out.filled_quantity, dec!(10));
    let portfolio = coordinator.portfolio().await;
    assert_eq!(portfolio.held(SYMBOL), Decimal::ZERO);
    assert_eq!(portfolio.cash, dec!(10000));
    assert!(coordinator.verify_positions().await.unwrap().is_empty());
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn test_halted_state_survives_restart() {
    let path = std::env::temp_dir().join(format!("hydra_state_{}.json", uuid::Uuid::new_v4()));
    let state_file = path.display().to_string();

    let mut h = Harness::new(HarnessOptions {
        state_file: Some(state_file.clone()),
        ..HarnessOptions::default()
    });
    h.set_price(100.0);
    h.cycle().await;
    h.set_price(70.0);
    let record = h.cycle().await;
    assert_eq!(record.risk_state_after, RiskState::Halted);

    let saved = load_state(Some(&state_file)).unwrap().unwrap();
    assert_eq!(saved.envelope.state, RiskState::Halted);
    assert_eq!(saved.next_cycle_id, 3);

    let governor = RiskGovernor::from_envelope(saved.envelope, RiskLimits::default());
    assert!(governor.is_halted());
    let _ = std::fs::remove_file(path);
}
