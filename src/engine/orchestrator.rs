//! Cycle orchestrator.
//!
//! One cycle: reconcile open orders, build the market view (falling back
//! to the cached view, marked stale), snapshot the portfolio, let the
//! governor evaluate transitions, decide, evaluate the decision, execute.
//! Whatever happens, the cycle ends with a forensic record, a state save
//! and a notification.

use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::engine::executor::ExecutionCoordinator;
use crate::notify::{self, Notice, Notifier};
use crate::signals::aggregator::SignalAggregator;
use crate::storage::{self, ForensicSink, RuntimeState};
use crate::strategy::risk::RiskGovernor;
use crate::strategy::StrategyBrain;
use crate::types::{CycleOutcome, CycleRecord, HaltCause, HydraError, MarketView, RiskState, Verdict};

// ---------------------------------------------------------------------------
// Settings and summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub agent_name: String,
    pub symbol: String,
    pub cycle_interval: Duration,
    pub cycle_deadline: Duration,
    pub view_wait: Duration,
    /// Consecutive failed cycles tolerated; one more halts the governor.
    pub failure_threshold: u32,
    /// Sentinel report cadence; 0 disables it.
    pub report_every_cycles: u64,
    /// Runtime state file. `None` keeps state in memory only.
    pub state_file: Option<String>,
}

impl From<&AppConfig> for OrchestratorSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            agent_name: cfg.agent.name.clone(),
            symbol: cfg.agent.symbol.clone(),
            cycle_interval: cfg.agent.cycle_interval(),
            cycle_deadline: cfg.agent.cycle_deadline(),
            view_wait: cfg.agent.view_wait(),
            failure_threshold: cfg.agent.failure_threshold,
            report_every_cycles: cfg.agent.report_every_cycles,
            state_file: Some(cfg.storage.state_file.clone()),
        }
    }
}

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    CycleLimit,
    Cancelled,
    Halted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub cycles_run: u64,
    pub final_state: RiskState,
    pub stop: StopReason,
}

fn expired(deadline: Instant) -> bool {
    Instant::now() >= deadline
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    settings: OrchestratorSettings,
    session_id: String,
    aggregator: Arc<SignalAggregator>,
    brain: Box<dyn StrategyBrain>,
    governor: RiskGovernor,
    coordinator: Arc<ExecutionCoordinator>,
    forensic: Arc<dyn ForensicSink>,
    notifier: Arc<dyn Notifier>,
    state: RuntimeState,
}

impl Orchestrator {
    /// `governor` must have been built from `state.envelope`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: OrchestratorSettings,
        aggregator: Arc<SignalAggregator>,
        brain: Box<dyn StrategyBrain>,
        governor: RiskGovernor,
        coordinator: Arc<ExecutionCoordinator>,
        forensic: Arc<dyn ForensicSink>,
        notifier: Arc<dyn Notifier>,
        state: RuntimeState,
    ) -> Self {
        Self {
            settings,
            session_id: uuid::Uuid::new_v4().to_string(),
            aggregator,
            brain,
            governor,
            coordinator,
            forensic,
            notifier,
            state,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> &RuntimeState {
        &self.state
    }

    pub fn governor(&self) -> &RiskGovernor {
        &self.governor
    }

    pub fn coordinator(&self) -> &ExecutionCoordinator {
        &self.coordinator
    }

    /// Run `cycles` cycles (forever when `None`) at the configured
    /// interval. Stops early on cancellation or when the governor halts.
    pub async fn run(&mut self, cycles: Option<u64>, cancel: &CancellationToken) -> Result<RunSummary> {
        info!(
            session = %self.session_id,
            brain = self.brain.name(),
            symbol = %self.settings.symbol,
            next_cycle = self.state.next_cycle_id,
            risk_state = %self.governor.state(),
            "Orchestrator starting"
        );
        if let Err(e) = self.coordinator.verify_positions().await {
            warn!(error = %e, "Startup position check failed");
        }

        let mut ticker = tokio::time::interval(self.settings.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles_run = 0;

        let stop = loop {
            if cycles.is_some_and(|n| cycles_run >= n) {
                break StopReason::CycleLimit;
            }
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if self.governor.is_halted() {
                error!(
                    reason = ?self.governor.envelope().halt_reason,
                    "Governor is HALTED, operator reset required"
                );
                break StopReason::Halted;
            }
            tokio::select! {
                _ = cancel.cancelled() => break StopReason::Cancelled,
                _ = ticker.tick() => {}
            }

            let record = self.run_cycle(cancel).await;
            cycles_run += 1;
            if record.outcome == CycleOutcome::Interrupted {
                break StopReason::Cancelled;
            }
        };

        let summary = RunSummary {
            cycles_run,
            final_state: self.governor.state(),
            stop,
        };
        info!(cycles = cycles_run, stop = ?summary.stop, risk_state = %summary.final_state, "Orchestrator stopped");
        Ok(summary)
    }

    /// Run one cycle end to end. Never fails: errors become a `Failed`
    /// record.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleRecord {
        let cycle_id = self.state.next_cycle_id;
        let deadline = Instant::now() + self.settings.cycle_deadline;
        let mut record = CycleRecord::new(&self.session_id, cycle_id, self.governor.state(), Utc::now());
        info!(cycle = cycle_id, risk_state = %record.risk_state_before, "Starting cycle");

        match self.pipeline(&mut record, deadline, cancel).await {
            Ok(outcome) => record.outcome = outcome,
            Err(e) => {
                error!(cycle = cycle_id, error = %format!("{e:#}"), "Cycle failed");
                record.errors.push(format!("{e:#}"));
                record.outcome = CycleOutcome::Failed;
            }
        }

        self.finish_cycle(record).await
    }

    async fn pipeline(
        &mut self,
        record: &mut CycleRecord,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome> {
        let cycle_id = record.cycle_id;

        // 1. Open orders from earlier cycles must be settled first.
        let reconciled = self.coordinator.reconcile_open_orders(Some(deadline)).await?;
        if reconciled.unresolved > 0 {
            record
                .errors
                .push(format!("{} order(s) still unresolved", reconciled.unresolved));
            return Ok(CycleOutcome::Failed);
        }
        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Interrupted);
        }

        // 2. Market view.
        let Some(view) = self.acquire_view(cycle_id, deadline).await else {
            record.errors.push("no market view available".to_string());
            return Ok(CycleOutcome::Skipped);
        };
        record.stale = view.stale;
        record.view = Some(view.clone());
        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Interrupted);
        }

        // 3. Snapshot and transitions.
        let marks = view
            .price()
            .map(|p| BTreeMap::from([(view.symbol.clone(), p)]))
            .unwrap_or_default();
        let snapshot = self.coordinator.snapshot(marks).await;
        record.transitions.extend(self.governor.begin_cycle(&snapshot, Utc::now()));

        // 4. Decide.
        let decision = self.brain.decide(&view, &snapshot.state);
        if decision.cycle_id != cycle_id || decision.symbol != view.symbol {
            return Err(HydraError::Invariant {
                cycle_id,
                message: format!(
                    "decision for cycle {} / {} does not match view for cycle {} / {}",
                    decision.cycle_id, decision.symbol, cycle_id, view.symbol
                ),
            }
            .into());
        }
        info!(cycle = cycle_id, decision = %decision, "Decision made");
        record.decision = Some(decision.clone());

        // 5. Govern.
        let verdict = self.governor.evaluate_view(&decision, &snapshot, &view);
        info!(cycle = cycle_id, verdict = %verdict, "Governor verdict");
        record.verdict = Some(verdict.clone());
        let size = match verdict {
            Verdict::Approved { size, .. } => size,
            Verdict::Vetoed { .. } => return Ok(CycleOutcome::Vetoed),
            Verdict::NoAction => return Ok(CycleOutcome::NoAction),
        };

        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Interrupted);
        }
        if expired(deadline) {
            record.errors.push("cycle deadline passed before execution".to_string());
            return Ok(CycleOutcome::Failed);
        }

        // 6. Execute.
        let execution = self.coordinator.execute(&decision, size, Some(deadline)).await?;
        let outcome = if execution.failed {
            CycleOutcome::Failed
        } else if execution.deadline_hit {
            record.errors.push("cycle deadline passed during execution".to_string());
            CycleOutcome::Failed
        } else if execution.rejection.is_some() {
            CycleOutcome::Rejected
        } else if execution.blocked_by_kill_switch {
            CycleOutcome::Vetoed
        } else if execution.orders.is_empty() {
            CycleOutcome::NoAction
        } else {
            CycleOutcome::Executed
        };
        record.execution = Some(execution);
        Ok(outcome)
    }

    /// Fresh view within the wait budget, else the cached view re-issued
    /// as stale, else nothing.
    async fn acquire_view(&mut self, cycle_id: u64, deadline: Instant) -> Option<MarketView> {
        let wait = self
            .settings
            .view_wait
            .min(deadline.saturating_duration_since(Instant::now()));
        let symbol = self.settings.symbol.clone();

        match tokio::time::timeout(wait, self.aggregator.market_view(&symbol, cycle_id)).await {
            Ok(Ok(view)) => {
                self.state.cached_view = Some(view.clone());
                return Some(view);
            }
            Ok(Err(e)) => warn!(cycle = cycle_id, error = %e, "Aggregator refused a view"),
            Err(_) => warn!(cycle = cycle_id, wait_ms = wait.as_millis() as u64, "Timed out waiting for market view"),
        }

        let cached = self.state.cached_view.as_ref()?;
        let view = cached.reissue_stale(cycle_id, Utc::now());
        warn!(
            cycle = cycle_id,
            technical_age_ms = view.ages.technical_ms,
            "Falling back to cached view (stale)"
        );
        Some(view)
    }

    /// Failure accounting, forensic record, state save, notification.
    async fn finish_cycle(&mut self, mut record: CycleRecord) -> CycleRecord {
        let now = Utc::now();
        let counted = match record.outcome {
            CycleOutcome::Failed | CycleOutcome::Skipped => {
                self.count_failure(&mut record, now);
                true
            }
            CycleOutcome::Interrupted => false,
            _ => {
                self.state.consecutive_failures = 0;
                false
            }
        };
        record.risk_state_after = self.governor.state();
        record.finished_at = Some(now);

        // A cycle without its forensic record is a failed cycle.
        if let Err(e) = self.forensic.append(&record).await {
            error!(cycle = record.cycle_id, error = %format!("{e:#}"), "Failed to write forensic record");
            record.errors.push(format!("forensic log: {e:#}"));
            if !counted {
                self.count_failure(&mut record, now);
                record.risk_state_after = self.governor.state();
            }
        }

        self.state.next_cycle_id = record.cycle_id + 1;
        self.state.envelope = self.governor.envelope();
        if let Some(ref path) = self.settings.state_file {
            if let Err(e) = storage::save_state(&self.state, Some(path)) {
                error!(error = %format!("{e:#}"), "Failed to save state");
            }
        }

        notify::dispatch(
            self.notifier.clone(),
            Notice::from_record(&self.settings.agent_name, &record),
        );

        info!(
            cycle = record.cycle_id,
            outcome = %record.outcome,
            stale = record.stale,
            risk_state = %record.risk_state_after,
            "Cycle complete"
        );

        let every = self.settings.report_every_cycles;
        if every > 0 && record.cycle_id % every == 0 {
            self.sentinel_report().await;
        }
        record
    }

    fn count_failure(&mut self, record: &mut CycleRecord, now: chrono::DateTime<Utc>) {
        self.state.consecutive_failures += 1;
        let count = self.state.consecutive_failures;
        warn!(cycle = record.cycle_id, failures = count, threshold = self.settings.failure_threshold, "Cycle counted as failure");
        if count > self.settings.failure_threshold {
            if let Some(t) = self.governor.halt(HaltCause::ConsecutiveFailures { count }, now) {
                record.transitions.push(t);
            }
        }
    }

    /// Periodic portfolio status line.
    pub async fn sentinel_report(&self) {
        let portfolio = self.coordinator.portfolio().await;
        let marks = self
            .state
            .cached_view
            .as_ref()
            .and_then(|v| v.price().map(|p| BTreeMap::from([(v.symbol.clone(), p)])))
            .unwrap_or_default();
        let equity = portfolio.equity(&marks);
        info!(
            agent = %self.settings.agent_name,
            next_cycle = self.state.next_cycle_id,
            risk_state = %self.governor.state(),
            cash = %portfolio.cash.round_dp(2),
            equity = %equity.round_dp(2),
            exposure = %portfolio.exposure().round_dp(2),
            positions = portfolio.open_positions(),
            realized_pnl = %portfolio.realized_pnl.round_dp(2),
            "SENTINEL report"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::executor::ExecutionSettings;
    use crate::exchange::{FillMode, GatewayError, SimulatedExchange};
    use crate::notify::MemoryNotifier;
    use crate::retry::{BackoffConfig, RetryPolicy};
    use crate::signals::aggregator::AggregatorConfig;
    use crate::signals::simulated::SimulatedMarket;
    use crate::signals::{ProviderError, StaticProvider};
    use crate::storage::{MemoryForensicLog, MemoryOrderStore};
    use crate::strategy::{build_brain, BrainConfig};
    use crate::types::{
        Action, Decision, PortfolioState, RiskEnvelope, RiskLimits, SentimentReading, TechnicalSnapshot,
    };
    use rust_decimal_macros::dec;

    struct Parts {
        technical: Arc<StaticProvider<TechnicalSnapshot>>,
        forensic: Arc<MemoryForensicLog>,
        orchestrator: Orchestrator,
    }

    fn make_settings() -> OrchestratorSettings {
        OrchestratorSettings {
            agent_name: "TEST".into(),
            symbol: "BTCUSDT".into(),
            cycle_interval: Duration::from_millis(1),
            cycle_deadline: Duration::from_secs(5),
            view_wait: Duration::from_secs(1),
            failure_threshold: 2,
            report_every_cycles: 1,
            state_file: None,
        }
    }

    fn make_parts(brain: Box<dyn StrategyBrain>) -> Parts {
        let forensic = Arc::new(MemoryForensicLog::new());
        let (technical, orchestrator) = make_orchestrator(brain, forensic.clone());
        Parts {
            technical,
            forensic,
            orchestrator,
        }
    }

    fn make_orchestrator(
        brain: Box<dyn StrategyBrain>,
        forensic: Arc<dyn ForensicSink>,
    ) -> (Arc<StaticProvider<TechnicalSnapshot>>, Orchestrator) {
        let technical = Arc::new(StaticProvider::new("tech"));
        let sentiment = Arc::new(StaticProvider::<SentimentReading>::new("sent"));
        let aggregator = Arc::new(SignalAggregator::new(
            technical.clone(),
            sentiment,
            AggregatorConfig::default(),
            RetryPolicy::new(1, BackoffConfig::immediate(), ProviderError::is_transient),
        ));
        let market = Arc::new(SimulatedMarket::with_fixed_price("BTCUSDT", dec!(100)));
        let exchange = Arc::new(SimulatedExchange::new(market, dec!(10000), FillMode::Immediate));
        let governor = RiskGovernor::new(RiskLimits::default());
        let coordinator = Arc::new(ExecutionCoordinator::new(
            exchange,
            Arc::new(MemoryOrderStore::new()),
            governor.clone(),
            RetryPolicy::new(2, BackoffConfig::immediate(), GatewayError::is_retryable),
            ExecutionSettings::from(&crate::config::ExecutionConfig::default()),
            PortfolioState::new(dec!(10000)),
        ));
        let orchestrator = Orchestrator::new(
            make_settings(),
            aggregator,
            brain,
            governor,
            coordinator,
            forensic,
            Arc::new(MemoryNotifier::new()),
            RuntimeState::new(RiskEnvelope::new(RiskLimits::default())),
        );
        (technical, orchestrator)
    }

    /// Sink whose disk is always full.
    struct FailingForensicLog;

    #[async_trait::async_trait]
    impl ForensicSink for FailingForensicLog {
        async fn append(&self, _record: &CycleRecord) -> Result<()> {
            anyhow::bail!("No space left on device")
        }
    }

    /// Brain that stamps the wrong cycle id.
    struct MisnumberedBrain;

    impl StrategyBrain for MisnumberedBrain {
        fn name(&self) -> &str {
            "misnumbered"
        }

        fn decide(&self, view: &MarketView, _portfolio: &PortfolioState) -> Decision {
            Decision {
                cycle_id: view.cycle_id + 100,
                symbol: view.symbol.clone(),
                action: Action::Hold,
                target_size: rust_decimal::Decimal::ZERO,
                confidence: 0.5,
                rationale: Vec::new(),
                view_built_at: view.built_at,
            }
        }
    }

    #[tokio::test]
    async fn test_no_view_skips_and_counts_failure() {
        let mut p = make_parts(build_brain(&BrainConfig::default()));
        let cancel = CancellationToken::new();
        let record = p.orchestrator.run_cycle(&cancel).await;
        assert_eq!(record.outcome, CycleOutcome::Skipped);
        assert_eq!(p.orchestrator.state().consecutive_failures, 1);
        assert_eq!(p.orchestrator.state().next_cycle_id, 2);
        assert_eq!(p.forensic.records().len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_view_is_cached_and_failures_reset() {
        let mut p = make_parts(build_brain(&BrainConfig::default()));
        let cancel = CancellationToken::new();
        p.orchestrator.run_cycle(&cancel).await;

        p.technical.set(TechnicalSnapshot::sample(), Utc::now());
        let record = p.orchestrator.run_cycle(&cancel).await;
        assert!(!record.stale);
        assert!(record.decision.is_some());
        assert_ne!(record.outcome, CycleOutcome::Failed);
        assert_eq!(p.orchestrator.state().consecutive_failures, 0);
        assert!(p.orchestrator.state().cached_view.is_some());
    }

    #[tokio::test]
    async fn test_invariant_violation_fails_only_that_cycle() {
        let mut p = make_parts(Box::new(MisnumberedBrain));
        p.technical.set(TechnicalSnapshot::sample(), Utc::now());
        let cancel = CancellationToken::new();

        let record = p.orchestrator.run_cycle(&cancel).await;
        assert_eq!(record.outcome, CycleOutcome::Failed);
        assert!(record.errors[0].contains("Invariant violated"));
        assert!(record.decision.is_none());

        let summary = p.orchestrator.run(Some(1), &cancel).await.unwrap();
        assert_eq!(summary.cycles_run, 1);
        assert_eq!(summary.stop, StopReason::CycleLimit);
    }

    #[tokio::test]
    async fn test_repeated_failures_halt_and_stop_run() {
        let mut p = make_parts(build_brain(&BrainConfig::default()));
        let cancel = CancellationToken::new();
        let summary = p.orchestrator.run(Some(10), &cancel).await.unwrap();

        assert_eq!(summary.cycles_run, 3);
        assert_eq!(summary.stop, StopReason::Halted);
        assert_eq!(summary.final_state, RiskState::Halted);
        let records = p.forensic.records();
        assert_eq!(records[2].risk_state_after, RiskState::Halted);
        assert_eq!(records[2].transitions.len(), 1);
    }

    #[tokio::test]
    async fn test_forensic_write_failures_count_and_halt() {
        let (technical, mut orchestrator) =
            make_orchestrator(build_brain(&BrainConfig::default()), Arc::new(FailingForensicLog));
        technical.set(TechnicalSnapshot::sample(), Utc::now());
        let cancel = CancellationToken::new();

        let record = orchestrator.run_cycle(&cancel).await;
        assert_ne!(record.outcome, CycleOutcome::Failed);
        assert!(record.errors.iter().any(|e| e.contains("forensic log")));
        assert_eq!(orchestrator.state().consecutive_failures, 1);

        let summary = orchestrator.run(Some(10), &cancel).await.unwrap();
        assert_eq!(summary.cycles_run, 2);
        assert_eq!(summary.stop, StopReason::Halted);
        assert_eq!(orchestrator.state().consecutive_failures, 3);
        assert_eq!(summary.final_state, RiskState::Halted);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mut p = make_parts(build_brain(&BrainConfig::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = p.orchestrator.run(None, &cancel).await.unwrap();
        assert_eq!(summary.cycles_run, 0);
        assert_eq!(summary.stop, StopReason::Cancelled);
        assert!(p.forensic.records().is_empty());
    }
}
