//! Signal aggregator.
//!
//! Keeps the latest technical and sentiment snapshot per symbol in a
//! lock-free store and builds one `MarketView` per cycle from it.
//!
//! Providers are pulled concurrently, either by background pollers or by
//! the refresh that precedes each view. Writers publish a whole new map
//! through `ArcSwap::rcu`, so a reader always sees a complete snapshot and
//! never waits on a writer.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ProviderError, SentimentProvider, SignalProvider, TechnicalProvider};
use crate::config::SignalsConfig;
use crate::retry::RetryPolicy;
use crate::types::{FieldAges, MarketView, SentimentReading, TechnicalSnapshot, Timestamped};

// ---------------------------------------------------------------------------
// Snapshot store
// ---------------------------------------------------------------------------

/// Latest reading from each provider for one symbol.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolSignals {
    pub technical: Option<Timestamped<TechnicalSnapshot>>,
    pub sentiment: Option<Timestamped<SentimentReading>>,
}

/// Concurrently writable, atomically readable signal store.
/// Last write wins per field; an older observation never replaces a newer one.
pub struct SnapshotStore {
    inner: ArcSwap<HashMap<String, SymbolSignals>>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn record_technical(&self, symbol: &str, reading: Timestamped<TechnicalSnapshot>) -> bool {
        self.update(symbol, |signals| replace_if_newer(&mut signals.technical, &reading))
    }

    pub fn record_sentiment(&self, symbol: &str, reading: Timestamped<SentimentReading>) -> bool {
        self.update(symbol, |signals| replace_if_newer(&mut signals.sentiment, &reading))
    }

    /// Consistent copy of everything known about `symbol`.
    pub fn load(&self, symbol: &str) -> SymbolSignals {
        self.inner.load().get(symbol).cloned().unwrap_or_default()
    }

    fn update<F>(&self, symbol: &str, mut apply: F) -> bool
    where
        F: FnMut(&mut SymbolSignals) -> bool,
    {
        let mut accepted = false;
        self.inner.rcu(|current| {
            let mut next = (**current).clone();
            accepted = apply(next.entry(symbol.to_string()).or_default());
            next
        });
        accepted
    }
}

fn replace_if_newer<T: Clone>(slot: &mut Option<Timestamped<T>>, reading: &Timestamped<T>) -> bool {
    let newer = slot
        .as_ref()
        .map_or(true, |old| reading.observed_at >= old.observed_at);
    if newer {
        *slot = Some(reading.clone());
    }
    newer
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Why no market view could be built.
#[derive(Debug, Error, PartialEq)]
pub enum AggregatorError {
    #[error("No technical data for {symbol}")]
    NoTechnical { symbol: String },

    #[error("Technical data for {symbol} is {age_secs}s old (max {max_secs}s)")]
    TechnicalStale {
        symbol: String,
        age_secs: i64,
        max_secs: i64,
    },
}

/// Age limits and sentiment decay.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub technical_max_age: chrono::Duration,
    pub sentiment_max_age: chrono::Duration,
    pub sentiment_half_life: chrono::Duration,
    pub sentiment_min_decay: f64,
}

impl From<&SignalsConfig> for AggregatorConfig {
    fn from(cfg: &SignalsConfig) -> Self {
        Self {
            technical_max_age: chrono::Duration::seconds(cfg.technical_max_age_secs as i64),
            sentiment_max_age: chrono::Duration::seconds(cfg.sentiment_max_age_secs as i64),
            sentiment_half_life: chrono::Duration::seconds(cfg.sentiment_half_life_secs as i64),
            sentiment_min_decay: cfg.sentiment_min_decay,
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self::from(&SignalsConfig::default())
    }
}

/// Confidence multiplier for a sentiment reading of the given age:
/// 1.0 up to `max_age`, then halving every `half_life`, floored at `floor`.
pub fn sentiment_decay(
    age: chrono::Duration,
    max_age: chrono::Duration,
    half_life: chrono::Duration,
    floor: f64,
) -> f64 {
    if age <= max_age {
        return 1.0;
    }
    let half_life_ms = half_life.num_milliseconds();
    if half_life_ms <= 0 {
        return floor;
    }
    let excess = (age - max_age).num_milliseconds() as f64 / half_life_ms as f64;
    0.5_f64.powf(excess).clamp(floor, 1.0)
}

/// Which providers delivered a fresh reading in a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefreshReport {
    pub technical: bool,
    pub sentiment: bool,
}

pub struct SignalAggregator {
    technical: Arc<TechnicalProvider>,
    sentiment: Arc<SentimentProvider>,
    store: SnapshotStore,
    config: AggregatorConfig,
    retry: RetryPolicy<ProviderError>,
}

impl SignalAggregator {
    pub fn new(
        technical: Arc<TechnicalProvider>,
        sentiment: Arc<SentimentProvider>,
        config: AggregatorConfig,
        retry: RetryPolicy<ProviderError>,
    ) -> Self {
        Self {
            technical,
            sentiment,
            store: SnapshotStore::new(),
            config,
            retry,
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Pull both providers concurrently and record what they return.
    /// Failures degrade to the previous snapshot.
    pub async fn refresh(&self, symbol: &str) -> RefreshReport {
        let (technical, sentiment) = tokio::join!(
            self.pull(self.technical.as_ref(), symbol),
            self.pull(self.sentiment.as_ref(), symbol),
        );
        RefreshReport {
            technical: technical.is_some_and(|r| self.store.record_technical(symbol, r)),
            sentiment: sentiment.is_some_and(|r| self.store.record_sentiment(symbol, r)),
        }
    }

    async fn pull<T: Send + 'static>(
        &self,
        provider: &dyn SignalProvider<T>,
        symbol: &str,
    ) -> Option<Timestamped<T>> {
        match self
            .retry
            .execute(provider.name(), None, |_| provider.get_latest(symbol))
            .await
        {
            Ok(r) => Some(r.value),
            Err(e) => {
                warn!(provider = provider.name(), symbol, error = %e, "Provider pull failed, keeping previous snapshot");
                None
            }
        }
    }

    /// Refresh, then build the view for `cycle_id`.
    pub async fn market_view(&self, symbol: &str, cycle_id: u64) -> Result<MarketView, AggregatorError> {
        let report = self.refresh(symbol).await;
        debug!(symbol, cycle_id, ?report, "Signals refreshed");
        self.build_view(symbol, cycle_id, Utc::now())
    }

    /// Build a view from the current snapshots as of `now`.
    pub fn build_view(
        &self,
        symbol: &str,
        cycle_id: u64,
        now: DateTime<Utc>,
    ) -> Result<MarketView, AggregatorError> {
        let signals = self.store.load(symbol);
        let technical = signals.technical.ok_or_else(|| AggregatorError::NoTechnical {
            symbol: symbol.to_string(),
        })?;

        let technical_age = technical.age_at(now);
        if technical_age > self.config.technical_max_age {
            return Err(AggregatorError::TechnicalStale {
                symbol: symbol.to_string(),
                age_secs: technical_age.num_seconds(),
                max_secs: self.config.technical_max_age.num_seconds(),
            });
        }

        let (sentiment, sentiment_ms, sentiment_decay) = match signals.sentiment {
            Some(s) => {
                let age = s.age_at(now);
                let decay = sentiment_decay(
                    age,
                    self.config.sentiment_max_age,
                    self.config.sentiment_half_life,
                    self.config.sentiment_min_decay,
                );
                (Some(s.value), Some(age.num_milliseconds()), decay)
            }
            None => (None, None, 1.0),
        };

        Ok(MarketView {
            symbol: symbol.to_string(),
            cycle_id,
            built_at: now,
            technical: technical.value,
            sentiment,
            ages: FieldAges {
                technical_ms: technical_age.num_milliseconds(),
                sentiment_ms,
            },
            sentiment_decay,
            stale: false,
        })
    }

    /// Refresh `symbol` every `every` until cancelled.
    pub fn spawn_poller(
        self: Arc<Self>,
        symbol: String,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.refresh(&symbol).await;
                        debug!(%symbol, ?report, "Background refresh");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffConfig;
    use crate::signals::StaticProvider;

    struct Fixture {
        technical: Arc<StaticProvider<TechnicalSnapshot>>,
        sentiment: Arc<StaticProvider<SentimentReading>>,
        aggregator: SignalAggregator,
    }

    fn make_fixture() -> Fixture {
        let technical = Arc::new(StaticProvider::new("tech"));
        let sentiment = Arc::new(StaticProvider::new("sent"));
        let aggregator = SignalAggregator::new(
            technical.clone(),
            sentiment.clone(),
            AggregatorConfig::default(),
            RetryPolicy::new(2, BackoffConfig::immediate(), ProviderError::is_transient),
        );
        Fixture {
            technical,
            sentiment,
            aggregator,
        }
    }

    #[test]
    fn test_store_ignores_older_observation() {
        let store = SnapshotStore::new();
        let now = Utc::now();
        assert!(store.record_technical("BTC", Timestamped::new(TechnicalSnapshot::sample(), now)));

        let mut older = TechnicalSnapshot::sample();
        older.price = 1.0;
        let stale = Timestamped::new(older, now - chrono::Duration::seconds(5));
        assert!(!store.record_technical("BTC", stale));
        assert_eq!(store.load("BTC").technical.unwrap().value.price, 100.0);
    }

    #[test]
    fn test_store_fields_are_independent() {
        let store = SnapshotStore::new();
        let now = Utc::now();
        store.record_sentiment("BTC", Timestamped::new(SentimentReading::new(0.4, 0.9, "calm"), now));
        store.record_technical("BTC", Timestamped::new(TechnicalSnapshot::sample(), now));
        let loaded = store.load("BTC");
        assert!(loaded.technical.is_some());
        assert_eq!(loaded.sentiment.unwrap().value.score, 0.4);
        assert_eq!(store.load("ETH"), SymbolSignals::default());
    }

    #[test]
    fn test_decay_curve() {
        let max = chrono::Duration::minutes(60);
        let half = chrono::Duration::minutes(30);
        assert_eq!(sentiment_decay(chrono::Duration::minutes(10), max, half, 0.1), 1.0);
        let d = sentiment_decay(chrono::Duration::minutes(90), max, half, 0.1);
        assert!((d - 0.5).abs() < 1e-9);
        assert_eq!(sentiment_decay(chrono::Duration::days(3), max, half, 0.1), 0.1);
    }

    #[tokio::test]
    async fn test_fresh_view() {
        let f = make_fixture();
        let now = Utc::now();
        f.technical.set(TechnicalSnapshot::sample(), now);
        f.sentiment.set(SentimentReading::new(0.5, 0.8, "upbeat"), now);

        let view = f.aggregator.market_view("BTC", 4).await.unwrap();
        assert_eq!(view.cycle_id, 4);
        assert!(!view.stale);
        assert_eq!(view.sentiment_decay, 1.0);
        assert!(view.ages.sentiment_ms.is_some());
    }

    #[tokio::test]
    async fn test_stale_technical_refuses_view() {
        let f = make_fixture();
        f.technical
            .set(TechnicalSnapshot::sample(), Utc::now() - chrono::Duration::hours(1));
        let err = f.aggregator.market_view("BTC", 1).await.unwrap_err();
        assert!(matches!(err, AggregatorError::TechnicalStale { .. }));
    }

    #[tokio::test]
    async fn test_missing_technical_refuses_view() {
        let f = make_fixture();
        let err = f.aggregator.market_view("BTC", 1).await.unwrap_err();
        assert_eq!(err, AggregatorError::NoTechnical { symbol: "BTC".into() });
    }

    #[tokio::test]
    async fn test_stale_sentiment_is_decayed_not_dropped() {
        let f = make_fixture();
        let now = Utc::now();
        f.technical.set(TechnicalSnapshot::sample(), now);
        f.sentiment
            .set(SentimentReading::new(0.5, 0.8, "old news"), now - chrono::Duration::hours(3));

        let view = f.aggregator.market_view("BTC", 2).await.unwrap();
        assert!(view.sentiment.is_some());
        assert!(view.sentiment_decay < 1.0);
    }

    #[tokio::test]
    async fn test_provider_outage_keeps_previous_snapshot() {
        let f = make_fixture();
        f.technical.set(TechnicalSnapshot::sample(), Utc::now());
        f.aggregator.refresh("BTC").await;

        f.technical.fail_next(5);
        let report = f.aggregator.refresh("BTC").await;
        assert!(!report.technical);
        assert!(f.aggregator.build_view("BTC", 3, Utc::now()).is_ok());
    }

    #[tokio::test]
    async fn test_poller_stops_on_cancel() {
        let f = make_fixture();
        f.technical.set(TechnicalSnapshot::sample(), Utc::now());
        let aggregator = Arc::new(f.aggregator);
        let cancel = CancellationToken::new();
        let handle = aggregator
            .clone()
            .spawn_poller("BTC".into(), Duration::from_millis(5), cancel.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(aggregator.store().load("BTC").technical.is_some());
    }
}
