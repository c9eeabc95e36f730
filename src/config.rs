//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every section has defaults so a partial file is valid. Secrets
//! (API keys, webhook URLs) are referenced by env-var name and
//! resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::retry::BackoffConfig;
use crate::strategy::BrainConfig;
use crate::types::{HydraError, RiskLimits};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub signals: SignalsConfig,
    pub strategy: BrainConfig,
    pub risk: RiskLimits,
    pub execution: ExecutionConfig,
    pub exchange: ExchangeConfig,
    pub storage: StorageConfig,
    pub alerts: AlertsConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub symbol: String,
    pub cycle_interval_secs: u64,
    /// Hard deadline for a single cycle.
    pub cycle_deadline_secs: u64,
    /// Bounded wait for the aggregator to build a market view.
    pub view_wait_ms: u64,
    /// Consecutive failed cycles tolerated before the kill switch trips.
    pub failure_threshold: u32,
    pub initial_cash: Decimal,
    /// Log a portfolio status report every N cycles (0 disables).
    pub report_every_cycles: u64,
    /// Presence of this file engages the kill switch.
    pub kill_switch_file: String,
    pub kill_switch_poll_secs: u64,
    /// Seed for the simulated market and sentiment walk.
    pub simulation_seed: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "HYDRA-01".to_string(),
            symbol: "BTCUSDT".to_string(),
            cycle_interval_secs: 300,
            cycle_deadline_secs: 60,
            view_wait_ms: 5_000,
            failure_threshold: 3,
            initial_cash: Decimal::from(10_000),
            report_every_cycles: 12,
            kill_switch_file: "EMERGENCY_STOP".to_string(),
            kill_switch_poll_secs: 5,
            simulation_seed: 42,
        }
    }
}

impl AgentConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_secs)
    }

    pub fn view_wait(&self) -> Duration {
        Duration::from_millis(self.view_wait_ms)
    }
}

/// Signal aggregation and provider settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SignalsConfig {
    /// Technical data older than this refuses the cycle.
    pub technical_max_age_secs: u64,
    /// Sentiment older than this is used with decayed confidence.
    pub sentiment_max_age_secs: u64,
    /// Confidence halves every `sentiment_half_life_secs` past max age.
    pub sentiment_half_life_secs: u64,
    /// Floor for the decay factor.
    pub sentiment_min_decay: f64,
    /// Background refresh period; 0 disables pollers.
    pub poll_interval_secs: u64,
    pub retry: BackoffConfig,
    pub max_attempts: u32,
    /// Live-mode provider endpoints.
    pub technical_url: Option<String>,
    pub sentiment_url: Option<String>,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            technical_max_age_secs: 300,
            sentiment_max_age_secs: 3_600,
            sentiment_half_life_secs: 1_800,
            sentiment_min_decay: 0.1,
            poll_interval_secs: 60,
            retry: BackoffConfig::default(),
            max_attempts: 3,
            technical_url: None,
            sentiment_url: None,
        }
    }
}

/// Order execution settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Per-order quantity cap; larger sizes are split.
    pub max_order_size: Decimal,
    pub max_attempts: u32,
    pub retry: BackoffConfig,
    pub poll_interval_ms: u64,
    pub max_status_polls: u32,
    /// Open orders older than this are cancelled during reconciliation.
    pub cancel_after_secs: u64,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_order_size: Decimal::new(5, 2),
            max_attempts: 4,
            retry: BackoffConfig::default(),
            poll_interval_ms: 500,
            max_status_polls: 10,
            cancel_after_secs: 900,
            stop_loss_pct: Decimal::new(2, 2),
            take_profit_pct: Decimal::new(3, 2),
        }
    }
}

/// Live exchange adapter settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExchangeConfig {
    pub base_url: Option<String>,
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_env: "HYDRA_EXCHANGE_API_KEY".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub state_file: String,
    pub order_db: String,
    pub forensic_log: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: "hydra_state.json".to_string(),
            order_db: "sqlite://hydra_orders.db".to_string(),
            forensic_log: "hydra_forensic.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlertsConfig {
    /// Env var holding the webhook URL; notifications only go to the log
    /// when unset.
    pub webhook_url_env: Option<String>,
    pub timeout_secs: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            webhook_url_env: Some("HYDRA_WEBHOOK_URL".to_string()),
            timeout_secs: 5,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(contents).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Check threshold ordering and ranges.
    pub fn validate(&self) -> Result<(), HydraError> {
        let r = &self.risk;
        let one = Decimal::ONE;
        if r.max_position_size <= Decimal::ZERO {
            return Err(HydraError::Config("risk.max_position_size must be positive".into()));
        }
        if r.soft_daily_loss_pct <= Decimal::ZERO || r.soft_daily_loss_pct >= r.max_daily_loss_pct {
            return Err(HydraError::Config(
                "risk.soft_daily_loss_pct must be positive and below max_daily_loss_pct".into(),
            ));
        }
        if r.max_daily_loss_pct >= one || r.max_drawdown_pct <= Decimal::ZERO || r.max_drawdown_pct >= one {
            return Err(HydraError::Config("risk loss limits must be fractions below 1".into()));
        }
        if r.throttle_factor <= Decimal::ZERO || r.throttle_factor > one {
            return Err(HydraError::Config("risk.throttle_factor must be in (0, 1]".into()));
        }
        if self.execution.max_order_size <= Decimal::ZERO {
            return Err(HydraError::Config("execution.max_order_size must be positive".into()));
        }
        if self.execution.max_attempts == 0 || self.signals.max_attempts == 0 {
            return Err(HydraError::Config("max_attempts must be at least 1".into()));
        }
        if self.agent.cycle_deadline_secs == 0 {
            return Err(HydraError::Config("agent.cycle_deadline_secs must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.signals.sentiment_min_decay) {
            return Err(HydraError::Config("signals.sentiment_min_decay must be in [0, 1]".into()));
        }
        self.strategy.validate()
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::StrategyVariant;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.agent.symbol, "BTCUSDT");
        assert_eq!(cfg.strategy.variant, StrategyVariant::Confluence);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg = AppConfig::from_toml(
            r#"
            [agent]
            symbol = "ETHUSDT"
            cycle_interval_secs = 60

            [risk]
            max_position_size = 2500
            max_drawdown_pct = 0.15

            [strategy]
            variant = "technical"
            conflict_margin = 0.3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.agent.symbol, "ETHUSDT");
        assert_eq!(cfg.agent.cycle_interval(), Duration::from_secs(60));
        assert_eq!(cfg.agent.failure_threshold, 3);
        assert_eq!(cfg.risk.max_position_size, dec!(2500));
        assert_eq!(cfg.risk.max_drawdown_pct, dec!(0.15));
        assert_eq!(cfg.risk.max_daily_loss_pct, dec!(0.05));
        assert_eq!(cfg.strategy.variant, StrategyVariant::Technical);
        assert_eq!(cfg.strategy.conflict_margin, 0.3);
    }

    #[test]
    fn test_soft_threshold_must_be_below_hard() {
        let err = AppConfig::from_toml(
            r#"
            [risk]
            soft_daily_loss_pct = 0.06
            max_daily_loss_pct = 0.05
            "#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("soft_daily_loss_pct"));
    }

    #[test]
    fn test_throttle_factor_range() {
        let mut cfg = AppConfig::default();
        cfg.risk.throttle_factor = dec!(1.5);
        assert!(cfg.validate().is_err());
        cfg.risk.throttle_factor = dec!(1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_config() {
        // Requires config.toml in the working directory (the crate root
        // under `cargo test`).
        let result = AppConfig::load("config.toml");
        if let Ok(cfg) = result {
            assert_eq!(cfg.agent.name, "HYDRA-01");
            assert!(cfg.risk.max_position_size > Decimal::ZERO);
            assert!(cfg.risk.throttle_factor <= Decimal::ONE);
        }
    }
}
