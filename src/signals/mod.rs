//! Signal providers and aggregation.
//!
//! Defines the `SignalProvider` trait that technical and sentiment sources
//! implement, plus the implementations shipped with the agent:
//! - `simulated`: seeded random-walk market and sentiment for simulation mode
//! - `http`: JSON-over-HTTP adapter for live providers
//! - `StaticProvider`: a settable in-memory source for replay and tests

pub mod aggregator;
pub mod http;
pub mod indicators;
pub mod simulated;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use thiserror::Error;

use crate::types::{SentimentReading, TechnicalSnapshot, Timestamped};

/// Errors a provider can report.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider {provider} unavailable: {message}")]
    Unavailable { provider: String, message: String },

    #[error("Provider {provider} has no data for {symbol}")]
    NoData { provider: String, symbol: String },

    #[error("Provider {provider} returned malformed data: {message}")]
    Malformed { provider: String, message: String },
}

impl ProviderError {
    /// Network-level trouble is worth retrying; missing or bad data is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Unavailable { .. })
    }
}

/// A pull-based source of timestamped signal values.
///
/// The aggregator calls `get_latest`; providers never push.
#[async_trait]
pub trait SignalProvider<T: Send + 'static>: Send + Sync {
    /// Most recent value for `symbol` with the time it was observed.
    async fn get_latest(&self, symbol: &str) -> Result<Timestamped<T>, ProviderError>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

pub type TechnicalProvider = dyn SignalProvider<TechnicalSnapshot>;
pub type SentimentProvider = dyn SignalProvider<SentimentReading>;

// ---------------------------------------------------------------------------
// Static provider
// ---------------------------------------------------------------------------

/// Provider returning whatever value was last `set`, with its timestamp.
pub struct StaticProvider<T> {
    name: String,
    value: RwLock<Option<Timestamped<T>>>,
    failures: AtomicU32,
}

impl<T: Clone> StaticProvider<T> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: RwLock::new(None),
            failures: AtomicU32::new(0),
        }
    }

    pub fn with_value(name: &str, value: T, observed_at: DateTime<Utc>) -> Self {
        let provider = Self::new(name);
        provider.set(value, observed_at);
        provider
    }

    pub fn set(&self, value: T, observed_at: DateTime<Utc>) {
        let mut slot = self.value.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Timestamped::new(value, observed_at));
    }

    pub fn clear(&self) {
        *self.value.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> SignalProvider<T> for StaticProvider<T> {
    async fn get_latest(&self, symbol: &str) -> Result<Timestamped<T>, ProviderError> {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(ProviderError::Unavailable {
                provider: self.name.clone(),
                message: "injected failure".to_string(),
            });
        }
        self.value
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| ProviderError::NoData {
                provider: self.name.clone(),
                symbol: symbol.to_string(),
            })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
