//! Exchange gateway.
//!
//! Defines the `ExchangeGateway` trait the execution coordinator talks to,
//! and provides implementations for:
//! - `SimulatedExchange`: in-process fills against the simulated market
//! - `HttpExchangeGateway`: JSON REST adapter for a live venue
//!
//! Every gateway must treat a repeated `submit_order` with the same
//! idempotency key as a no-op that returns the original order.

pub mod http;
pub mod simulated;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{Order, PortfolioState, Side};

pub use http::HttpExchangeGateway;
pub use simulated::{FillMode, SimulatedExchange};

/// Gateway failures, split into retryable transport errors and terminal
/// business outcomes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited by exchange")]
    RateLimited,

    /// Invalid size, insufficient funds or position, unknown symbol.
    #[error("order rejected: {reason}")]
    Rejected { reason: String },

    #[error("order {0} unknown to exchange")]
    UnknownOrder(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl GatewayError {
    /// Safe to retry with the same idempotency key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Network(_) | GatewayError::Timeout | GatewayError::RateLimited
        )
    }
}

/// Abstraction over trading venues.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Submit an order under `idempotency_key`. A repeated key returns the
    /// original order without placing a new one.
    async fn submit_order(
        &self,
        idempotency_key: &str,
        symbol: &str,
        side: Side,
        quantity: Decimal,
    ) -> Result<Order, GatewayError>;

    async fn get_order_status(&self, order_id: &str) -> Result<Order, GatewayError>;

    async fn cancel_order(&self, order_id: &str) -> Result<Order, GatewayError>;

    /// The venue's view of cash and positions.
    async fn get_open_positions(&self) -> Result<PortfolioState, GatewayError>;

    fn name(&self) -> &str;
}
