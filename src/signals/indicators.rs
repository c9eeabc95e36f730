//! Technical indicators computed from OHLC candles.
//!
//! RSI and ADX use Wilder smoothing (EWM with alpha = 1/period), EMA uses
//! alpha = 2/(span+1) seeded with the first value, Bollinger bands use the
//! sample standard deviation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::TechnicalSnapshot;

/// Fewest candles that produce a meaningful indicator set.
pub const MIN_CANDLES: usize = 35;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub at: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Exponential moving average over the whole series.
pub fn ema(values: &[f64], span: usize) -> Vec<f64> {
    smooth(values, 2.0 / (span as f64 + 1.0))
}

/// Wilder's smoothing.
fn wilder(values: &[f64], period: usize) -> Vec<f64> {
    smooth(values, 1.0 / period as f64)
}

fn smooth(values: &[f64], alpha: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let mut prev = match values.first() {
        Some(v) => *v,
        None => return out,
    };
    for v in values {
        prev = alpha * v + (1.0 - alpha) * prev;
        out.push(prev);
    }
    out
}

/// Simple moving average of the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Relative strength index of the last close.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() <= period {
        return None;
    }
    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let gains: Vec<f64> = deltas.iter().map(|d| d.max(0.0)).collect();
    let losses: Vec<f64> = deltas.iter().map(|d| (-d).max(0.0)).collect();
    let avg_gain = *wilder(&gains, period).last()?;
    let avg_loss = *wilder(&losses, period).last()?;
    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Bollinger bands `(upper, middle, lower)` of the last close.
pub fn bollinger(closes: &[f64], period: usize, width: f64) -> Option<(f64, f64, f64)> {
    if period < 2 {
        return None;
    }
    let mid = sma(closes, period)?;
    let window = &closes[closes.len() - period..];
    let var = window.iter().map(|c| (c - mid).powi(2)).sum::<f64>() / (period as f64 - 1.0);
    let sd = var.sqrt();
    Some((mid + width * sd, mid, mid - width * sd))
}

/// MACD line and signal line of the last close.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<(f64, f64)> {
    if closes.len() < slow {
        return None;
    }
    let fast_ema = ema(closes, fast);
    let slow_ema = ema(closes, slow);
    let line: Vec<f64> = fast_ema.iter().zip(&slow_ema).map(|(f, s)| f - s).collect();
    let sig = ema(&line, signal);
    Some((*line.last()?, *sig.last()?))
}

/// Average directional index of the last candle.
pub fn adx(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() <= period * 2 {
        return None;
    }
    let mut tr = Vec::with_capacity(candles.len() - 1);
    let mut plus_dm = Vec::with_capacity(candles.len() - 1);
    let mut minus_dm = Vec::with_capacity(candles.len() - 1);
    for w in candles.windows(2) {
        let (prev, cur) = (&w[0], &w[1]);
        let up = cur.high - prev.high;
        let down = prev.low - cur.low;
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
        tr.push(
            (cur.high - cur.low)
                .max((cur.high - prev.close).abs())
                .max((cur.low - prev.close).abs()),
        );
    }
    let atr = wilder(&tr, period);
    let plus = wilder(&plus_dm, period);
    let minus = wilder(&minus_dm, period);
    let dx: Vec<f64> = atr
        .iter()
        .zip(plus.iter().zip(&minus))
        .map(|(a, (p, m))| {
            if *a == 0.0 {
                return 0.0;
            }
            let pdi = 100.0 * p / a;
            let mdi = 100.0 * m / a;
            if pdi + mdi == 0.0 {
                0.0
            } else {
                100.0 * (pdi - mdi).abs() / (pdi + mdi)
            }
        })
        .collect();
    wilder(&dx, period).last().copied()
}

/// Full indicator set for the last candle, `None` if history is too short.
pub fn snapshot(candles: &[Candle]) -> Option<TechnicalSnapshot> {
    if candles.len() < MIN_CANDLES {
        return None;
    }
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let (bb_upper, _, bb_lower) = bollinger(&closes, 20, 2.0)?;
    let (macd, macd_signal) = macd(&closes, 12, 26, 9)?;
    Some(TechnicalSnapshot {
        price: *closes.last()?,
        rsi: rsi(&closes, 14)?,
        ema_fast: *ema(&closes, 50).last()?,
        ema_slow: *ema(&closes, 200).last()?,
        bb_upper,
        bb_lower,
        macd,
        macd_signal,
        adx: adx(candles, 14)?,
    })
}
