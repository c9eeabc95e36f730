//! In-memory harness for driving full cycles.
//!
//! Settable providers, a fixed-price simulated market and exchange, and
//! memory sinks, wired into a real `Orchestrator`. Price changes go to
//! both the market (fill price) and the technical provider (view price)
//! so the two never disagree.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use hydra::engine::accountant::ProtectiveLevels;
use hydra::engine::{ExecutionCoordinator, ExecutionSettings, Orchestrator, OrchestratorSettings};
use hydra::exchange::{FillMode, GatewayError, SimulatedExchange};
use hydra::notify::MemoryNotifier;
use hydra::retry::{BackoffConfig, RetryPolicy};
use hydra::signals::aggregator::{AggregatorConfig, SignalAggregator};
use hydra::signals::simulated::SimulatedMarket;
use hydra::signals::{ProviderError, StaticProvider};
use hydra::storage::{MemoryForensicLog, MemoryOrderStore, RuntimeState};
use hydra::strategy::risk::RiskGovernor;
use hydra::strategy::{build_brain, BrainConfig};
use hydra::types::{CycleRecord, RiskEnvelope, RiskLimits, SentimentReading, TechnicalSnapshot};

pub const SYMBOL: &str = "BTCUSDT";

/// Uptrend pullback with a MACD turn: reads as a confident long.
pub fn bullish_snapshot(price: f64) -> TechnicalSnapshot {
    TechnicalSnapshot {
        price,
        rsi: 30.0,
        ema_fast: price * 0.99,
        ema_slow: price * 0.95,
        bb_upper: price * 1.05,
        bb_lower: price * 0.90,
        macd: -0.5,
        macd_signal: -1.0,
        adx: 25.0,
    }
}

pub fn make_execution_settings() -> ExecutionSettings {
    ExecutionSettings {
        max_order_size: dec!(25),
        poll_interval: Duration::from_millis(1),
        max_status_polls: 3,
        cancel_after: chrono::Duration::seconds(900),
        levels: ProtectiveLevels {
            stop_loss_pct: Decimal::ZERO,
            take_profit_pct: Decimal::ZERO,
        },
    }
}

pub fn make_gateway_retry(max_attempts: u32) -> RetryPolicy<GatewayError> {
    RetryPolicy::new(max_attempts, BackoffConfig::immediate(), GatewayError::is_retryable)
}

pub struct HarnessOptions {
    pub limits: RiskLimits,
    pub brain: BrainConfig,
    pub failure_threshold: u32,
    pub technical_max_age: chrono::Duration,
    pub submit_attempts: u32,
    pub state_file: Option<String>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            limits: RiskLimits::default(),
            brain: BrainConfig {
                // 50 units at 100: the whole 5000 exposure budget in one go.
                risk_per_trade_pct: 0.5,
                ..BrainConfig::default()
            },
            failure_threshold: 2,
            technical_max_age: chrono::Duration::seconds(300),
            submit_attempts: 2,
            state_file: None,
        }
    }
}

pub struct Harness {
    pub technical: Arc<StaticProvider<TechnicalSnapshot>>,
    pub sentiment: Arc<StaticProvider<SentimentReading>>,
    pub market: Arc<SimulatedMarket>,
    pub exchange: Arc<SimulatedExchange>,
    pub store: Arc<MemoryOrderStore>,
    pub forensic: Arc<MemoryForensicLog>,
    pub notifier: Arc<MemoryNotifier>,
    pub governor: RiskGovernor,
    pub orchestrator: Orchestrator,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new(opts: HarnessOptions) -> Self {
        let technical = Arc::new(StaticProvider::new("tech"));
        let sentiment = Arc::new(StaticProvider::new("sent"));
        let aggregator = Arc::new(SignalAggregator::new(
            technical.clone(),
            sentiment.clone(),
            AggregatorConfig {
                technical_max_age: opts.technical_max_age,
                ..AggregatorConfig::default()
            },
            RetryPolicy::new(1, BackoffConfig::immediate(), ProviderError::is_transient),
        ));

        let market = Arc::new(SimulatedMarket::with_fixed_price(SYMBOL, dec!(100)));
        let exchange = Arc::new(SimulatedExchange::new(market.clone(), dec!(10000), FillMode::Immediate));
        let store = Arc::new(MemoryOrderStore::new());

        let state = RuntimeState::new(RiskEnvelope::new(opts.limits.clone()));
        let governor = RiskGovernor::from_envelope(state.envelope.clone(), opts.limits);
        let coordinator = Arc::new(ExecutionCoordinator::new(
            exchange.clone(),
            store.clone(),
            governor.clone(),
            make_gateway_retry(opts.submit_attempts),
            make_execution_settings(),
            hydra::types::PortfolioState::new(dec!(10000)),
        ));

        let forensic = Arc::new(MemoryForensicLog::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let settings = OrchestratorSettings {
            agent_name: "HYDRA-TEST".into(),
            symbol: SYMBOL.into(),
            cycle_interval: Duration::from_millis(1),
            cycle_deadline: Duration::from_secs(10),
            view_wait: Duration::from_secs(2),
            failure_threshold: opts.failure_threshold,
            report_every_cycles: 0,
            state_file: opts.state_file,
        };
        let orchestrator = Orchestrator::new(
            settings,
            aggregator,
            build_brain(&opts.brain),
            governor.clone(),
            coordinator,
            forensic.clone(),
            notifier.clone(),
            state,
        );

        Self {
            technical,
            sentiment,
            market,
            exchange,
            store,
            forensic,
            notifier,
            governor,
            orchestrator,
            cancel: CancellationToken::new(),
        }
    }

    pub fn start() -> Self {
        Self::new(HarnessOptions::default())
    }

    /// Move the market and publish a bullish technical reading at `price`.
    pub fn set_price(&self, price: f64) {
        if let Some(p) = Decimal::from_f64(price) {
            self.market.set_price(SYMBOL, p);
        }
        self.technical.set(bullish_snapshot(price), Utc::now());
    }

    pub fn set_sentiment(&self, score: f64, confidence: f64, observed_at: DateTime<Utc>) {
        self.sentiment
            .set(SentimentReading::new(score, confidence, "test crowd"), observed_at);
    }

    pub async fn cycle(&mut self) -> CycleRecord {
        self.orchestrator.run_cycle(&self.cancel).await
    }
}
