//! JSON-over-HTTP signal provider for live mode.
//!
//! `GET {base_url}/{symbol}` must answer with a `Timestamped<T>` body:
//! `{"value": {...}, "observed_at": "2025-01-01T00:00:00Z"}`.
//! 404 means no data for the symbol; 429 and 5xx are transient.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::debug;

use super::{ProviderError, SignalProvider};
use crate::types::Timestamped;

pub struct HttpSignalProvider<T> {
    http: Client,
    base_url: String,
    name: String,
    _value: PhantomData<fn() -> T>,
}

impl<T> HttpSignalProvider<T> {
    pub fn new(name: &str, base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("HYDRA/0.1")
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            name: name.to_string(),
            _value: PhantomData,
        })
    }

    fn url(&self, symbol: &str) -> String {
        format!("{}/{}", self.base_url, urlencoding::encode(symbol))
    }

    fn unavailable(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::Unavailable {
            provider: self.name.clone(),
            message: message.into(),
        }
    }
}

/// Map a non-success status to a provider error.
fn classify_status(provider: &str, symbol: &str, status: StatusCode) -> ProviderError {
    if status == StatusCode::NOT_FOUND {
        ProviderError::NoData {
            provider: provider.to_string(),
            symbol: symbol.to_string(),
        }
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ProviderError::Unavailable {
            provider: provider.to_string(),
            message: format!("HTTP {status}"),
        }
    } else {
        ProviderError::Malformed {
            provider: provider.to_string(),
            message: format!("unexpected HTTP {status}"),
        }
    }
}

#[async_trait]
impl<T: DeserializeOwned + Send + 'static> SignalProvider<T> for HttpSignalProvider<T> {
    async fn get_latest(&self, symbol: &str) -> Result<Timestamped<T>, ProviderError> {
        let url = self.url(symbol);
        debug!(provider = %self.name, %url, "Fetching signal");

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(classify_status(&self.name, symbol, resp.status()));
        }

        resp.json::<Timestamped<T>>()
            .await
            .map_err(|e| ProviderError::Malformed {
                provider: self.name.clone(),
                message: e.to_string(),
            })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SentimentReading;

    #[test]
    fn test_url_encodes_symbol() {
        let p: HttpSignalProvider<SentimentReading> =
            HttpSignalProvider::new("sentiment", "http://localhost:9000/sentiment/", Duration::from_secs(1))
                .unwrap();
        assert_eq!(p.url("BTC/USD"), "http://localhost:9000/sentiment/BTC%2FUSD");
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status("p", "BTC", StatusCode::NOT_FOUND),
            ProviderError::NoData { .. }
        ));
        assert!(classify_status("p", "BTC", StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(classify_status("p", "BTC", StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(!classify_status("p", "BTC", StatusCode::BAD_REQUEST).is_transient());
    }
}
