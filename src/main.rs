//! HYDRA: Autonomous Trading Agent
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores state from disk (or creates fresh), and runs the trading
//! cycle loop with graceful shutdown. `status` and `reset` are the
//! operator commands.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hydra::config::AppConfig;
use hydra::engine::{ExecutionCoordinator, ExecutionSettings, KillSwitchMonitor, Orchestrator, OrchestratorSettings};
use hydra::exchange::{ExchangeGateway, FillMode, GatewayError, HttpExchangeGateway, SimulatedExchange};
use hydra::notify::{LogNotifier, Notifier, WebhookNotifier};
use hydra::retry::RetryPolicy;
use hydra::signals::aggregator::{AggregatorConfig, SignalAggregator};
use hydra::signals::http::HttpSignalProvider;
use hydra::signals::simulated::{SimulatedMarket, SimulatedSentimentProvider, SimulatedTechnicalProvider};
use hydra::signals::{ProviderError, SentimentProvider, TechnicalProvider};
use hydra::storage::{self, JsonlForensicLog, OrderStore, RuntimeState, SqliteOrderStore};
use hydra::strategy::build_brain;
use hydra::strategy::risk::RiskGovernor;
use hydra::types::{MarketView, PortfolioState, RiskEnvelope, RiskState, SentimentReading, TechnicalSnapshot};

const BANNER: &str = r#"
 _   ___   ______  ____      _
| | | \ \ / /  _ \|  _ \    / \
| |_| |\ V /| | | | |_) |  / _ \
|  _  | | | | |_| |  _ <  / ___ \
|_| |_| |_| |____/|_| \_\/_/   \_\

  Sentiment + technical trading agent
  v0.1.0 — risk governor armed
"#;

#[derive(Parser)]
#[command(name = "hydra", version, about = "Autonomous trading agent with a hard risk governor")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trading loop.
    Run {
        /// Number of cycles to run; runs until stopped when omitted.
        #[arg(long)]
        cycles: Option<u64>,
        #[arg(long, value_enum, default_value_t = Mode::Sim)]
        mode: Mode,
    },
    /// Print the persisted risk state and portfolio.
    Status,
    /// Clear a HALTED governor and remove the kill-switch file.
    Reset {
        #[arg(long)]
        operator: String,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Simulated market, sentiment and exchange.
    Sim,
    /// HTTP signal providers and exchange from the config.
    Live,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    let cfg = AppConfig::load(&cli.config)?;
    cfg.validate()?;

    init_logging();

    match cli.command {
        Command::Run { cycles, mode } => run_agent(&cfg, cycles, mode).await,
        Command::Status => show_status(&cfg).await,
        Command::Reset { operator } => reset_governor(&cfg, &operator),
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

struct Adapters {
    technical: Arc<TechnicalProvider>,
    sentiment: Arc<SentimentProvider>,
    gateway: Arc<dyn ExchangeGateway>,
}

/// `restored` is the portfolio persisted by a previous run; in simulation
/// the in-process venue resumes from it so restored positions can be sold.
fn build_adapters(
    cfg: &AppConfig,
    mode: Mode,
    restored: Option<&PortfolioState>,
    last_view: Option<&MarketView>,
) -> Result<Adapters> {
    match mode {
        Mode::Sim => {
            let seed = cfg.agent.simulation_seed;
            let market = Arc::new(SimulatedMarket::new(seed));
            let gateway = match restored {
                Some(portfolio) => {
                    for pos in portfolio.positions.values() {
                        market.resume_at(&pos.symbol, pos.entry_price);
                    }
                    if let Some(view) = last_view {
                        if let Some(price) = view.price() {
                            market.resume_at(&view.symbol, price);
                        }
                    }
                    info!(
                        cash = %portfolio.cash,
                        positions = portfolio.positions.len(),
                        "Simulated venue resumed from restored portfolio"
                    );
                    SimulatedExchange::with_ledger(market.clone(), portfolio, FillMode::Immediate)
                }
                None => SimulatedExchange::new(market.clone(), cfg.agent.initial_cash, FillMode::Immediate),
            };
            info!(seed, "Simulation mode: in-process market and exchange");
            Ok(Adapters {
                technical: Arc::new(SimulatedTechnicalProvider::new(market)),
                sentiment: Arc::new(SimulatedSentimentProvider::new(seed)),
                gateway: Arc::new(gateway),
            })
        }
        Mode::Live => {
            let timeout = Duration::from_secs(cfg.exchange.timeout_secs);
            let technical_url = cfg
                .signals
                .technical_url
                .as_deref()
                .context("signals.technical_url is required in live mode")?;
            let sentiment_url = cfg
                .signals
                .sentiment_url
                .as_deref()
                .context("signals.sentiment_url is required in live mode")?;
            let base_url = cfg
                .exchange
                .base_url
                .as_deref()
                .context("exchange.base_url is required in live mode")?;
            let api_key = SecretString::new(AppConfig::resolve_env(&cfg.exchange.api_key_env)?);
            info!(exchange = base_url, "Live mode: HTTP providers and exchange");
            Ok(Adapters {
                technical: Arc::new(HttpSignalProvider::<TechnicalSnapshot>::new("technical", technical_url, timeout)?),
                sentiment: Arc::new(HttpSignalProvider::<SentimentReading>::new("sentiment", sentiment_url, timeout)?),
                gateway: Arc::new(HttpExchangeGateway::new(base_url, api_key, timeout)?),
            })
        }
    }
}

fn build_notifier(cfg: &AppConfig) -> Result<Arc<dyn Notifier>> {
    let url = cfg
        .alerts
        .webhook_url_env
        .as_deref()
        .and_then(|env| std::env::var(env).ok())
        .filter(|u| !u.is_empty());
    let notifier: Arc<dyn Notifier> = match url {
        Some(url) => {
            info!("Webhook notifications enabled");
            Arc::new(WebhookNotifier::new(&url, Duration::from_secs(cfg.alerts.timeout_secs))?)
        }
        None => Arc::new(LogNotifier),
    };
    Ok(notifier)
}

async fn run_agent(cfg: &AppConfig, cycles: Option<u64>, mode: Mode) -> Result<ExitCode> {
    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        symbol = %cfg.agent.symbol,
        cycle_interval_secs = cfg.agent.cycle_interval_secs,
        brain = ?cfg.strategy.variant,
        "HYDRA starting up"
    );

    // -- Restore or create state -----------------------------------------

    let state = match storage::load_state(Some(&cfg.storage.state_file))? {
        Some(s) => s,
        None => RuntimeState::new(RiskEnvelope::new(cfg.risk.clone())),
    };
    let governor = RiskGovernor::from_envelope(state.envelope.clone(), cfg.risk.clone());
    if governor.is_halted() {
        warn!(reason = ?state.envelope.halt_reason, "Restored HALTED state; run `hydra reset` to resume trading");
    }

    // -- Initialise components -------------------------------------------

    let store: Arc<dyn OrderStore> = Arc::new(SqliteOrderStore::connect(&cfg.storage.order_db).await?);
    let restored = store.load_portfolio().await?;
    let adapters = build_adapters(cfg, mode, restored.as_ref(), state.cached_view.as_ref())?;
    let coordinator = Arc::new(
        ExecutionCoordinator::restore(
            adapters.gateway,
            store,
            governor.clone(),
            RetryPolicy::new(cfg.execution.max_attempts, cfg.execution.retry.clone(), GatewayError::is_retryable),
            ExecutionSettings::from(&cfg.execution),
            cfg.agent.initial_cash,
        )
        .await?,
    );
    let report = coordinator.reconcile_open_orders(None).await?;
    info!(checked = report.checked, unresolved = report.unresolved, "Startup reconciliation done");

    let aggregator = Arc::new(SignalAggregator::new(
        adapters.technical,
        adapters.sentiment,
        AggregatorConfig::from(&cfg.signals),
        RetryPolicy::new(cfg.signals.max_attempts, cfg.signals.retry.clone(), ProviderError::is_transient),
    ));

    let mut orchestrator = Orchestrator::new(
        OrchestratorSettings::from(cfg),
        aggregator.clone(),
        build_brain(&cfg.strategy),
        governor.clone(),
        coordinator,
        Arc::new(JsonlForensicLog::new(&cfg.storage.forensic_log)),
        build_notifier(cfg)?,
        state,
    );

    // -- Background tasks ------------------------------------------------

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received.");
                cancel.cancel();
            }
        });
    }

    let monitor = KillSwitchMonitor::new(
        &cfg.agent.kill_switch_file,
        governor.clone(),
        Duration::from_secs(cfg.agent.kill_switch_poll_secs.max(1)),
    );
    monitor.check();
    let mut background = vec![monitor.spawn(cancel.child_token())];
    if cfg.signals.poll_interval_secs > 0 {
        background.push(aggregator.spawn_poller(
            cfg.agent.symbol.clone(),
            Duration::from_secs(cfg.signals.poll_interval_secs),
            cancel.child_token(),
        ));
    }

    // -- Main loop -------------------------------------------------------

    info!(session = orchestrator.session_id(), "Entering main loop. Press Ctrl+C to stop.");
    let summary = orchestrator.run(cycles, &cancel).await?;

    cancel.cancel();
    futures::future::join_all(background).await;
    orchestrator.sentinel_report().await;

    info!(
        cycles = summary.cycles_run,
        stop = ?summary.stop,
        risk_state = %summary.final_state,
        "HYDRA shut down cleanly."
    );

    Ok(if summary.final_state == RiskState::Halted {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

// ---------------------------------------------------------------------------
// status / reset
// ---------------------------------------------------------------------------

async fn show_status(cfg: &AppConfig) -> Result<ExitCode> {
    let Some(state) = storage::load_state(Some(&cfg.storage.state_file))? else {
        println!("No saved state at {}", cfg.storage.state_file);
        return Ok(ExitCode::SUCCESS);
    };
    let env = &state.envelope;
    println!("Risk state:        {}", env.state);
    if let Some(ref reason) = env.halt_reason {
        println!("Halt reason:       {reason}");
    }
    println!("Next cycle:        {}", state.next_cycle_id);
    println!("Failures in a row: {}", state.consecutive_failures);
    println!("Peak equity:       {}", env.peak_equity.round_dp(2));
    println!("Day start equity:  {}", env.day_start_equity.round_dp(2));

    let store = SqliteOrderStore::connect(&cfg.storage.order_db).await?;
    match store.load_portfolio().await? {
        Some(p) => {
            println!("Cash:              {}", p.cash.round_dp(2));
            println!("Realized PnL:      {}", p.realized_pnl.round_dp(2));
            for pos in p.positions.values() {
                println!("Position:          {pos}");
            }
        }
        None => println!("No portfolio recorded yet"),
    }
    println!("Open orders:       {}", store.unsettled().await?.len());
    Ok(ExitCode::SUCCESS)
}

fn reset_governor(cfg: &AppConfig, operator: &str) -> Result<ExitCode> {
    let kill_file = std::path::Path::new(&cfg.agent.kill_switch_file);
    if kill_file.exists() {
        std::fs::remove_file(kill_file)
            .with_context(|| format!("Failed to remove kill-switch file {}", kill_file.display()))?;
        println!("Removed {}", kill_file.display());
    }

    let Some(mut state) = storage::load_state(Some(&cfg.storage.state_file))? else {
        println!("No saved state; nothing to reset");
        return Ok(ExitCode::SUCCESS);
    };
    let governor = RiskGovernor::from_envelope(state.envelope.clone(), cfg.risk.clone());
    match governor.reset(operator, Utc::now()) {
        Some(t) => {
            state.envelope = governor.envelope();
            state.consecutive_failures = 0;
            storage::save_state(&state, Some(&cfg.storage.state_file))?;
            println!("{t}");
        }
        None => println!("Governor is {}; nothing to reset", governor.state()),
    }
    Ok(ExitCode::SUCCESS)
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hydra=info"));

    let json_logging = std::env::var("HYDRA_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
