//! JSON REST exchange adapter for live mode.
//!
//! Endpoints (relative to `exchange.base_url`):
//! - `POST /orders` with an `Idempotency-Key` header
//! - `GET /orders/{id}`
//! - `DELETE /orders/{id}`
//! - `GET /positions`
//!
//! Auth: `X-API-KEY` header, read from the env var named in
//! `exchange.api_key_env`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{ExchangeGateway, GatewayError};
use crate::types::{Order, PortfolioState, Side};

#[derive(Debug, Serialize)]
struct SubmitOrderRequest<'a> {
    client_order_id: &'a str,
    symbol: &'a str,
    side: Side,
    quantity: Decimal,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

pub struct HttpExchangeGateway {
    http: Client,
    base_url: String,
    api_key: SecretString,
}

impl HttpExchangeGateway {
    pub fn new(base_url: &str, api_key: SecretString, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("HYDRA/0.1")
            .build()
            .context("Failed to build HTTP client for exchange")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn order_url(&self, order_id: &str) -> String {
        format!("{}/orders/{}", self.base_url, urlencoding::encode(order_id))
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("X-API-KEY", self.api_key.expose_secret().as_str())
    }

    async fn send(&self, req: RequestBuilder, order_id: Option<&str>) -> Result<Response, GatewayError> {
        let resp = self.authed(req).send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout
            } else {
                GatewayError::Network(e.to_string())
            }
        })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp
            .json::<ErrorBody>()
            .await
            .map(|b| b.message)
            .unwrap_or_default();
        Err(classify_status(status, message, order_id))
    }

    async fn order_body(resp: Response) -> Result<Order, GatewayError> {
        resp.json::<Order>()
            .await
            .map_err(|e| GatewayError::Protocol(e.to_string()))
    }
}

/// Map a non-success status to a gateway error.
fn classify_status(status: StatusCode, message: String, order_id: Option<&str>) -> GatewayError {
    match (status, order_id) {
        (StatusCode::TOO_MANY_REQUESTS, _) => GatewayError::RateLimited,
        (StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT, _) => GatewayError::Timeout,
        (StatusCode::NOT_FOUND, Some(id)) => GatewayError::UnknownOrder(id.to_string()),
        (s, _) if s.is_server_error() => GatewayError::Network(format!("HTTP {s}: {message}")),
        (StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::PAYMENT_REQUIRED, _) => {
            GatewayError::Rejected {
                reason: if message.is_empty() { format!("HTTP {status}") } else { message },
            }
        }
        (s, _) => GatewayError::Protocol(format!("unexpected HTTP {s}: {message}")),
    }
}

#[async_trait]
impl ExchangeGateway for HttpExchangeGateway {
    async fn submit_order(
        &self,
        idempotency_key: &str,
        symbol: &str,
        side: Side,
        quantity: Decimal,
    ) -> Result<Order, GatewayError> {
        let url = format!("{}/orders", self.base_url);
        debug!(%url, key = idempotency_key, %side, %quantity, "Submitting order");
        let req = self
            .http
            .post(&url)
            .header("Idempotency-Key", idempotency_key)
            .json(&SubmitOrderRequest {
                client_order_id: idempotency_key,
                symbol,
                side,
                quantity,
            });
        let resp = self.send(req, None).await?;
        Self::order_body(resp).await
    }

    async fn get_order_status(&self, order_id: &str) -> Result<Order, GatewayError> {
        let resp = self.send(self.http.get(self.order_url(order_id)), Some(order_id)).await?;
        Self::order_body(resp).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<Order, GatewayError> {
        let resp = self.send(self.http.delete(self.order_url(order_id)), Some(order_id)).await?;
        Self::order_body(resp).await
    }

    async fn get_open_positions(&self) -> Result<PortfolioState, GatewayError> {
        let url = format!("{}/positions", self.base_url);
        let resp = self.send(self.http.get(&url), None).await?;
        resp.json::<PortfolioState>()
            .await
            .map_err(|e| GatewayError::Protocol(e.to_string()))
    }

    fn name(&self) -> &str {
        "http"
    }
}
