//! Signal readers: turn raw technical and sentiment inputs into a
//! directional rationale entry with a confidence.

use super::{BrainConfig, TechnicalRules};
use crate::types::{Direction, RationaleEntry, SentimentReading, SignalSource, TechnicalSnapshot};

/// Read the technical snapshot as a directional signal.
///
/// Long setups: a pullback (RSI oversold) inside an uptrend, boosted when
/// price is at the lower band or MACD is turning up below zero; or a deep
/// oversold reading still above EMA200. Short setups mirror these.
/// A weak trend (ADX under the floor) reads as neutral.
pub fn technical_signal(t: &TechnicalSnapshot, rules: &TechnicalRules) -> RationaleEntry {
    if t.adx < rules.adx_floor {
        return RationaleEntry::new(
            SignalSource::Technical,
            Direction::Neutral,
            rules.lateral_confidence,
            format!("lateral market: ADX {:.1} below {:.1}", t.adx, rules.adx_floor),
        );
    }

    if t.is_bullish_trend() && t.rsi < rules.rsi_oversold {
        let mut confidence = rules.trend_confidence;
        let mut detail = format!("uptrend pullback: RSI {:.1} < {:.0}", t.rsi, rules.rsi_oversold);
        if t.price <= t.bb_lower * (1.0 + rules.band_proximity) {
            confidence += rules.band_bonus;
            detail.push_str(", at lower band");
        }
        if t.macd > t.macd_signal && t.macd < 0.0 {
            confidence += rules.macd_bonus;
            detail.push_str(", MACD turning up");
        }
        return RationaleEntry::new(SignalSource::Technical, Direction::Long, confidence.min(1.0), detail);
    }

    if t.rsi < rules.rsi_deep_oversold && t.price > t.ema_slow {
        return RationaleEntry::new(
            SignalSource::Technical,
            Direction::Long,
            rules.reversal_confidence,
            format!("deep oversold above EMA200: RSI {:.1}", t.rsi),
        );
    }

    if t.is_bearish_trend() && t.rsi > rules.rsi_overbought {
        let mut confidence = rules.trend_confidence;
        let mut detail = format!("downtrend bounce: RSI {:.1} > {:.0}", t.rsi, rules.rsi_overbought);
        if t.price >= t.bb_upper * (1.0 - rules.band_proximity) {
            confidence += rules.band_bonus;
            detail.push_str(", at upper band");
        }
        if t.macd < t.macd_signal && t.macd > 0.0 {
            confidence += rules.macd_bonus;
            detail.push_str(", MACD turning down");
        }
        return RationaleEntry::new(SignalSource::Technical, Direction::Short, confidence.min(1.0), detail);
    }

    if t.rsi > rules.rsi_deep_overbought && t.price < t.ema_slow {
        return RationaleEntry::new(
            SignalSource::Technical,
            Direction::Short,
            rules.reversal_confidence,
            format!("deep overbought below EMA200: RSI {:.1}", t.rsi),
        );
    }

    RationaleEntry::new(
        SignalSource::Technical,
        Direction::Neutral,
        rules.neutral_confidence,
        format!("no setup: RSI {:.1}, ADX {:.1}", t.rsi, t.adx),
    )
}

/// Read the sentiment reading as a directional signal.
///
/// Confidence is |score| × provider confidence × staleness decay, so an
/// aged reading always weighs less than the same reading fresh.
pub fn sentiment_signal(reading: Option<&SentimentReading>, decay: f64, cfg: &BrainConfig) -> RationaleEntry {
    let Some(s) = reading else {
        return RationaleEntry::new(
            SignalSource::Sentiment,
            Direction::Neutral,
            0.0,
            "no sentiment reading",
        );
    };

    let crowd = if s.score > cfg.sentiment_neutral_band {
        Direction::Long
    } else if s.score < -cfg.sentiment_neutral_band {
        Direction::Short
    } else {
        Direction::Neutral
    };
    let direction = if cfg.contrarian_sentiment { crowd.opposite() } else { crowd };
    let confidence = (s.score.abs() * s.confidence * decay).clamp(0.0, 1.0);

    let mut detail = format!(
        "{} (score {:+.2}, provider conf {:.2})",
        s.mood(),
        s.score,
        s.confidence
    );
    if decay < 1.0 {
        detail.push_str(&format!(", stale: decayed x{decay:.2}"));
    }
    if cfg.contrarian_sentiment && crowd != Direction::Neutral {
        detail.push_str(", read contrarian");
    }
    RationaleEntry::new(SignalSource::Sentiment, direction, confidence, detail)
}
