//! Strategy layer: decision brains and the risk governor.
//!
//! A brain is a pure function from (MarketView, PortfolioState) to a
//! Decision. Variants implement `StrategyBrain` and are picked by
//! `strategy.variant` in the config. The governor in `risk` then
//! approves, clamps or vetoes whatever the brain proposes.

pub mod confluence;
pub mod risk;
pub mod rules;

use serde::Deserialize;

use crate::types::{Decision, HydraError, MarketView, PortfolioState};

pub use confluence::{ConfluenceBrain, TechnicalBrain};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which brain drives decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyVariant {
    /// Technical and sentiment signals with conflict resolution.
    Confluence,
    /// Technical signal only; sentiment is recorded but not weighed.
    Technical,
}

/// Technical setup thresholds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TechnicalRules {
    pub rsi_oversold: f64,
    pub rsi_deep_oversold: f64,
    pub rsi_overbought: f64,
    pub rsi_deep_overbought: f64,
    /// Confidence for a pullback in the direction of the trend.
    pub trend_confidence: f64,
    /// Confidence for a deep oversold/overbought reversal.
    pub reversal_confidence: f64,
    /// Bonus when price sits at the Bollinger band.
    pub band_bonus: f64,
    /// How close to the band counts as "at" it (fraction of price).
    pub band_proximity: f64,
    /// Bonus when MACD confirms the turn.
    pub macd_bonus: f64,
    /// ADX below this means no trend; the technical signal goes neutral.
    pub adx_floor: f64,
    pub lateral_confidence: f64,
    /// Confidence of "no setup".
    pub neutral_confidence: f64,
}

impl Default for TechnicalRules {
    fn default() -> Self {
        Self {
            rsi_oversold: 35.0,
            rsi_deep_oversold: 25.0,
            rsi_overbought: 65.0,
            rsi_deep_overbought: 75.0,
            trend_confidence: 0.80,
            reversal_confidence: 0.75,
            band_bonus: 0.10,
            band_proximity: 0.01,
            macd_bonus: 0.05,
            adx_floor: 10.0,
            lateral_confidence: 0.40,
            neutral_confidence: 0.50,
        }
    }
}

/// Brain configuration shared by all variants.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    pub variant: StrategyVariant,
    /// Directional results below this become HOLD.
    pub min_confidence: f64,
    /// Disagreeing signals resolve only if one leads by more than this.
    pub conflict_margin: f64,
    /// Size multiplier when a conflict is resolved.
    pub conflict_size_factor: f64,
    /// Bearish confidence at or above this closes the whole position.
    pub close_confidence: f64,
    /// Fraction of equity committed per BUY.
    pub risk_per_trade_pct: f64,
    pub lot_decimals: u32,
    /// |score| inside this band reads as neutral sentiment.
    pub sentiment_neutral_band: f64,
    /// Read sentiment against the crowd (fear is a buy signal).
    pub contrarian_sentiment: bool,
    /// Whether sentiment alone may open a trade.
    pub sentiment_can_initiate: bool,
    pub technical: TechnicalRules,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            variant: StrategyVariant::Confluence,
            min_confidence: 0.50,
            conflict_margin: 0.20,
            conflict_size_factor: 0.50,
            close_confidence: 0.85,
            risk_per_trade_pct: 0.02,
            lot_decimals: 6,
            sentiment_neutral_band: 0.30,
            contrarian_sentiment: false,
            sentiment_can_initiate: false,
            technical: TechnicalRules::default(),
        }
    }
}

impl BrainConfig {
    pub fn validate(&self) -> Result<(), HydraError> {
        let unit = 0.0..=1.0;
        for (name, v) in [
            ("min_confidence", self.min_confidence),
            ("conflict_margin", self.conflict_margin),
            ("close_confidence", self.close_confidence),
            ("sentiment_neutral_band", self.sentiment_neutral_band),
        ] {
            if !unit.contains(&v) {
                return Err(HydraError::Config(format!("strategy.{name} must be in [0, 1]")));
            }
        }
        if self.conflict_size_factor <= 0.0 || self.conflict_size_factor > 1.0 {
            return Err(HydraError::Config(
                "strategy.conflict_size_factor must be in (0, 1]".into(),
            ));
        }
        if self.risk_per_trade_pct <= 0.0 || self.risk_per_trade_pct > 1.0 {
            return Err(HydraError::Config(
                "strategy.risk_per_trade_pct must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Brain interface
// ---------------------------------------------------------------------------

/// A deterministic decision function. Implementations must not read the
/// clock, randomness or any state beyond their arguments and config.
pub trait StrategyBrain: Send + Sync {
    fn name(&self) -> &str;

    fn decide(&self, view: &MarketView, portfolio: &PortfolioState) -> Decision;
}

/// Build the brain selected by `cfg.variant`.
pub fn build_brain(cfg: &BrainConfig) -> Box<dyn StrategyBrain> {
    match cfg.variant {
        StrategyVariant::Confluence => Box::new(ConfluenceBrain::new(cfg.clone())),
        StrategyVariant::Technical => Box::new(TechnicalBrain::new(cfg.clone())),
    }
}
