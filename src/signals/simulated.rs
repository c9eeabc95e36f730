//! Simulated market data for simulation mode.
//!
//! `SimulatedMarket` generates a seeded random-walk candle series per
//! symbol. The simulated technical provider and the simulated exchange
//! share one market so orders fill at the price the strategy saw.

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::indicators::{self, Candle};
use super::{ProviderError, SignalProvider};
use crate::types::{SentimentReading, TechnicalSnapshot, Timestamped};

/// Candles seeded before the first reading.
const HISTORY: usize = 250;
/// Candles kept per symbol.
const MAX_HISTORY: usize = 500;
const START_PRICE: f64 = 50_000.0;
/// Max relative move per candle.
const VOLATILITY: f64 = 0.006;

struct MarketState {
    rng: StdRng,
    series: HashMap<String, Vec<Candle>>,
    fixed: HashMap<String, f64>,
    /// Where a fresh walk starts; set when resuming after a restart.
    anchors: HashMap<String, f64>,
}

/// Seeded random-walk market shared by simulated components.
pub struct SimulatedMarket {
    state: Mutex<MarketState>,
}

impl SimulatedMarket {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(MarketState {
                rng: StdRng::seed_from_u64(seed),
                series: HashMap::new(),
                fixed: HashMap::new(),
                anchors: HashMap::new(),
            }),
        }
    }

    /// A market where `symbol` trades flat at `price`.
    pub fn with_fixed_price(symbol: &str, price: Decimal) -> Self {
        let market = Self::new(0);
        market.set_price(symbol, price);
        market
    }

    /// Pin `symbol` to `price`; subsequent candles are flat at this level.
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .fixed
            .insert(symbol.to_string(), price.to_f64().unwrap_or(START_PRICE));
    }

    /// Start the walk for `symbol` at `price` instead of the default level.
    /// Unlike `set_price` the series keeps moving. Has no effect once the
    /// symbol has history.
    pub fn resume_at(&self, symbol: &str, price: Decimal) {
        let Some(px) = price.to_f64().filter(|p| *p > 0.0) else {
            return;
        };
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.anchors.insert(symbol.to_string(), px);
    }

    /// Last traded price for `symbol`, if any history or anchor exists.
    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let px = match state.fixed.get(symbol) {
            Some(p) => *p,
            None => match state.series.get(symbol).and_then(|s| s.last()) {
                Some(c) => c.close,
                None => *state.anchors.get(symbol)?,
            },
        };
        Decimal::from_f64(px).map(|d| d.round_dp(2))
    }

    /// Append one candle and return the recent history.
    pub fn advance(&self, symbol: &str) -> Vec<Candle> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let state = &mut *guard;
        let fixed = state.fixed.get(symbol).copied();
        let start = state.anchors.get(symbol).copied().unwrap_or(START_PRICE);
        let series = state.series.entry(symbol.to_string()).or_default();

        if series.is_empty() {
            let mut close = fixed.unwrap_or(start);
            for i in 0..HISTORY {
                let candle = next_candle(&mut state.rng, close, fixed, (HISTORY - i) as i64);
                close = candle.close;
                series.push(candle);
            }
        }
        let last_close = series.last().map(|c| c.close).unwrap_or(start);
        series.push(next_candle(&mut state.rng, last_close, fixed, 0));
        if series.len() > MAX_HISTORY {
            let excess = series.len() - MAX_HISTORY;
            series.drain(..excess);
        }
        series.clone()
    }
}

fn next_candle(rng: &mut StdRng, prev_close: f64, fixed: Option<f64>, minutes_ago: i64) -> Candle {
    let at = Utc::now() - chrono::Duration::minutes(minutes_ago * 5);
    if let Some(px) = fixed {
        return Candle {
            at,
            open: px,
            high: px,
            low: px,
            close: px,
        };
    }
    let open = prev_close;
    let close = (open * (1.0 + rng.random_range(-VOLATILITY..VOLATILITY))).max(1.0);
    let high = open.max(close) * (1.0 + rng.random_range(0.0..VOLATILITY / 2.0));
    let low = open.min(close) * (1.0 - rng.random_range(0.0..VOLATILITY / 2.0));
    Candle {
        at,
        open,
        high,
        low,
        close,
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Technical indicators computed from the simulated market.
pub struct SimulatedTechnicalProvider {
    market: Arc<SimulatedMarket>,
}

impl SimulatedTechnicalProvider {
    pub fn new(market: Arc<SimulatedMarket>) -> Self {
        Self { market }
    }
}

#[async_trait]
impl SignalProvider<TechnicalSnapshot> for SimulatedTechnicalProvider {
    async fn get_latest(&self, symbol: &str) -> Result<Timestamped<TechnicalSnapshot>, ProviderError> {
        let candles = self.market.advance(symbol);
        let snapshot = indicators::snapshot(&candles).ok_or_else(|| ProviderError::NoData {
            provider: self.name().to_string(),
            symbol: symbol.to_string(),
        })?;
        Ok(Timestamped::new(snapshot, Utc::now()))
    }

    fn name(&self) -> &str {
        "sim-technical"
    }
}

/// Mean-reverting sentiment score walk.
pub struct SimulatedSentimentProvider {
    state: Mutex<(StdRng, f64)>,
}

impl SimulatedSentimentProvider {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new((StdRng::seed_from_u64(seed ^ 0x5eed), 0.0)),
        }
    }
}

#[async_trait]
impl SignalProvider<SentimentReading> for SimulatedSentimentProvider {
    async fn get_latest(&self, _symbol: &str) -> Result<Timestamped<SentimentReading>, ProviderError> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (rng, score) = &mut *guard;
        *score = (*score * 0.8 + rng.random_range(-0.35..0.35)).clamp(-1.0, 1.0);
        let confidence = rng.random_range(0.5..0.95);
        let mut reading = SentimentReading::new(*score, confidence, "");
        reading.summary = format!("simulated crowd mood: {}", reading.mood());
        Ok(Timestamped::new(reading, Utc::now()))
    }

    fn name(&self) -> &str {
        "sim-sentiment"
    }
}
