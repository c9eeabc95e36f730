//! Confluence brain: technical setup confirmed (or contradicted) by
//! sentiment, with an explicit conflict policy and equity-based sizing.
//!
//! Order of evaluation for one view:
//! 1. protective exits on an open position (stop-loss, take-profit)
//! 2. technical and sentiment signals, combined
//! 3. minimum-confidence gate
//! 4. mapping to BUY / SELL / CLOSE / HOLD with a target size

use rust_decimal::prelude::*;
use std::collections::BTreeMap;

use super::rules::{sentiment_signal, technical_signal};
use super::{BrainConfig, StrategyBrain};
use crate::types::{
    Action, Decision, Direction, MarketView, PortfolioState, RationaleEntry, SignalSource,
};

/// Result of combining the technical and sentiment signals.
#[derive(Debug, Clone, PartialEq)]
struct Combined {
    direction: Direction,
    confidence: f64,
    size_factor: f64,
}

/// Weighs technical and sentiment signals against each other.
pub struct ConfluenceBrain {
    cfg: BrainConfig,
}

impl ConfluenceBrain {
    pub fn new(cfg: BrainConfig) -> Self {
        Self { cfg }
    }
}

impl StrategyBrain for ConfluenceBrain {
    fn name(&self) -> &str {
        "confluence"
    }

    fn decide(&self, view: &MarketView, portfolio: &PortfolioState) -> Decision {
        decide_with(&self.cfg, view, portfolio, true)
    }
}

/// Technical setups only. Sentiment is still read into the rationale so
/// the forensic record shows what was ignored.
pub struct TechnicalBrain {
    cfg: BrainConfig,
}

impl TechnicalBrain {
    pub fn new(cfg: BrainConfig) -> Self {
        Self { cfg }
    }
}

impl StrategyBrain for TechnicalBrain {
    fn name(&self) -> &str {
        "technical"
    }

    fn decide(&self, view: &MarketView, portfolio: &PortfolioState) -> Decision {
        decide_with(&self.cfg, view, portfolio, false)
    }
}

fn hold(view: &MarketView, confidence: f64, rationale: Vec<RationaleEntry>) -> Decision {
    Decision {
        cycle_id: view.cycle_id,
        symbol: view.symbol.clone(),
        action: Action::Hold,
        target_size: Decimal::ZERO,
        confidence: confidence.clamp(0.0, 1.0),
        rationale,
        view_built_at: view.built_at,
    }
}

fn act(
    view: &MarketView,
    action: Action,
    size: Decimal,
    confidence: f64,
    rationale: Vec<RationaleEntry>,
) -> Decision {
    Decision {
        cycle_id: view.cycle_id,
        symbol: view.symbol.clone(),
        action,
        target_size: size,
        confidence: confidence.clamp(0.0, 1.0),
        rationale,
        view_built_at: view.built_at,
    }
}

fn decide_with(
    cfg: &BrainConfig,
    view: &MarketView,
    portfolio: &PortfolioState,
    use_sentiment: bool,
) -> Decision {
    let mut rationale = Vec::new();

    let Some(price) = view.price() else {
        rationale.push(RationaleEntry::new(
            SignalSource::Gate,
            Direction::Neutral,
            0.0,
            "no usable price in market view",
        ));
        return hold(view, 0.0, rationale);
    };

    // Protective exits take precedence over any new signal.
    if let Some(pos) = portfolio.position(&view.symbol) {
        if let Some(stop) = pos.stop_loss.filter(|s| price <= *s) {
            rationale.push(RationaleEntry::new(
                SignalSource::Protective,
                Direction::Short,
                1.0,
                format!("stop-loss hit: price {price} <= {stop}"),
            ));
            return act(view, Action::Close, pos.quantity, 1.0, rationale);
        }
        if let Some(target) = pos.take_profit.filter(|t| price >= *t) {
            rationale.push(RationaleEntry::new(
                SignalSource::Protective,
                Direction::Short,
                0.9,
                format!("take-profit hit: price {price} >= {target}"),
            ));
            return act(view, Action::Close, pos.quantity, 0.9, rationale);
        }
    }

    let technical = technical_signal(&view.technical, &cfg.technical);
    let mut sentiment = sentiment_signal(view.sentiment.as_ref(), view.sentiment_decay, cfg);

    let combined = if use_sentiment {
        combine(cfg, &technical, &sentiment, &mut rationale)
    } else {
        sentiment.detail.push_str(" [informational]");
        Combined {
            direction: technical.direction,
            confidence: technical.confidence,
            size_factor: 1.0,
        }
    };
    rationale.insert(0, sentiment);
    rationale.insert(0, technical);

    if combined.direction == Direction::Neutral {
        return hold(view, combined.confidence, rationale);
    }

    if combined.confidence < cfg.min_confidence {
        rationale.push(RationaleEntry::new(
            SignalSource::Gate,
            combined.direction,
            combined.confidence,
            format!(
                "confidence {:.2} below minimum {:.2}",
                combined.confidence, cfg.min_confidence
            ),
        ));
        return hold(view, 1.0 - combined.confidence, rationale);
    }

    let held = portfolio.held(&view.symbol);
    match combined.direction {
        Direction::Long => {
            let size = buy_size(cfg, portfolio, &view.symbol, price, combined.size_factor);
            rationale.push(RationaleEntry::new(
                SignalSource::Sizing,
                Direction::Long,
                combined.confidence,
                format!(
                    "{:.1}% of equity at {price}, factor {:.2}",
                    cfg.risk_per_trade_pct * 100.0,
                    combined.size_factor
                ),
            ));
            if size.is_zero() {
                return hold(view, combined.confidence, rationale);
            }
            act(view, Action::Buy, size, combined.confidence, rationale)
        }
        Direction::Short if held.is_zero() => {
            rationale.push(RationaleEntry::new(
                SignalSource::Gate,
                Direction::Short,
                combined.confidence,
                "bearish but flat: long-only, nothing to sell",
            ));
            hold(view, combined.confidence, rationale)
        }
        Direction::Short if combined.confidence >= cfg.close_confidence => {
            rationale.push(RationaleEntry::new(
                SignalSource::Sizing,
                Direction::Short,
                combined.confidence,
                format!("strong bearish signal: close all {held}"),
            ));
            act(view, Action::Close, held, combined.confidence, rationale)
        }
        Direction::Short => {
            let size = buy_size(cfg, portfolio, &view.symbol, price, combined.size_factor).min(held);
            let size = if size.is_zero() { held } else { size };
            rationale.push(RationaleEntry::new(
                SignalSource::Sizing,
                Direction::Short,
                combined.confidence,
                format!("reduce by {size} of {held}"),
            ));
            act(view, Action::Sell, size, combined.confidence, rationale)
        }
        Direction::Neutral => hold(view, combined.confidence, rationale),
    }
}

/// Apply the conflict policy. Pushes a `Conflict` entry when the signals
/// point in opposite directions.
fn combine(
    cfg: &BrainConfig,
    technical: &RationaleEntry,
    sentiment: &RationaleEntry,
    rationale: &mut Vec<RationaleEntry>,
) -> Combined {
    let (t, s) = (technical.confidence, sentiment.confidence);
    match (technical.direction, sentiment.direction) {
        (Direction::Neutral, Direction::Neutral) => Combined {
            direction: Direction::Neutral,
            confidence: t,
            size_factor: 1.0,
        },
        (dir, Direction::Neutral) => Combined {
            direction: dir,
            confidence: t,
            size_factor: 1.0,
        },
        (Direction::Neutral, dir) if cfg.sentiment_can_initiate => Combined {
            direction: dir,
            confidence: s,
            size_factor: 1.0,
        },
        (Direction::Neutral, _) => Combined {
            direction: Direction::Neutral,
            confidence: t,
            size_factor: 1.0,
        },
        (a, b) if a == b => Combined {
            direction: a,
            confidence: t + (1.0 - t) * s,
            size_factor: 1.0,
        },
        (a, b) => {
            let diff = (t - s).abs();
            if diff > cfg.conflict_margin {
                let (winner, source) = if t > s { (a, "technical") } else { (b, "sentiment") };
                rationale.push(RationaleEntry::new(
                    SignalSource::Conflict,
                    winner,
                    diff,
                    format!(
                        "signals disagree; {source} leads by {diff:.2} > {:.2}, size x{:.2}",
                        cfg.conflict_margin, cfg.conflict_size_factor
                    ),
                ));
                Combined {
                    direction: winner,
                    confidence: diff,
                    size_factor: cfg.conflict_size_factor,
                }
            } else {
                rationale.push(RationaleEntry::new(
                    SignalSource::Conflict,
                    Direction::Neutral,
                    1.0 - diff,
                    format!(
                        "signals disagree within margin ({diff:.2} <= {:.2})",
                        cfg.conflict_margin
                    ),
                ));
                Combined {
                    direction: Direction::Neutral,
                    confidence: 1.0 - diff,
                    size_factor: 1.0,
                }
            }
        }
    }
}

/// Equity × risk fraction / price × factor, rounded down to the lot size.
fn buy_size(
    cfg: &BrainConfig,
    portfolio: &PortfolioState,
    symbol: &str,
    price: Decimal,
    factor: f64,
) -> Decimal {
    let marks = BTreeMap::from([(symbol.to_string(), price)]);
    let equity = portfolio.equity(&marks);
    let risk = Decimal::from_f64(cfg.risk_per_trade_pct).unwrap_or(Decimal::ZERO);
    let factor = Decimal::from_f64(factor).unwrap_or(Decimal::ONE);
    if equity <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (equity * risk / price * factor)
        .round_dp_with_strategy(cfg.lot_decimals, RoundingStrategy::ToZero)
        .max(Decimal::ZERO)
}
