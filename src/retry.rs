//! Retry policy with exponential backoff and jitter.
//!
//! A [`RetryPolicy`] is a plain value: max attempts, a backoff schedule and
//! a predicate deciding which errors are worth retrying. The execution
//! coordinator uses it for exchange calls and the aggregator for provider
//! pulls. Permanent errors are returned on the first attempt, and no
//! retry is started that could not finish its backoff before the caller's
//! deadline.

use rand::Rng;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

/// Backoff schedule, in milliseconds so it reads naturally from TOML.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// ±fraction of randomisation applied to each delay (0.2 = ±20%).
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Near-zero delays for tests.
    pub fn immediate() -> Self {
        Self {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Delay before retry number `retry` (0-based), jittered and capped.
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(retry as i32);
        let base = base.min(self.max_backoff_ms as f64);
        let jitter = base * self.jitter_factor.clamp(0.0, 1.0);
        let ms = if jitter > 0.0 {
            rand::rng().random_range((base - jitter).max(0.0)..=base + jitter)
        } else {
            base
        };
        Duration::from_millis((ms as u64).min(self.max_backoff_ms))
    }
}

/// Successful result plus the number of attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum RetryError<E: fmt::Debug + fmt::Display> {
    #[error("permanent failure after {attempts} attempt(s): {error}")]
    Permanent { error: E, attempts: u32 },

    #[error("retries exhausted after {attempts} attempt(s): {error}")]
    Exhausted { error: E, attempts: u32 },

    #[error("deadline reached after {attempts} attempt(s): {error}")]
    DeadlineExceeded { error: E, attempts: u32 },
}

impl<E: fmt::Debug + fmt::Display> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::DeadlineExceeded { attempts, .. } => *attempts,
        }
    }

    pub fn error(&self) -> &E {
        match self {
            RetryError::Permanent { error, .. }
            | RetryError::Exhausted { error, .. }
            | RetryError::DeadlineExceeded { error, .. } => error,
        }
    }

    pub fn into_error(self) -> E {
        match self {
            RetryError::Permanent { error, .. }
            | RetryError::Exhausted { error, .. }
            | RetryError::DeadlineExceeded { error, .. } => error,
        }
    }
}

/// Max attempts, backoff schedule and retryable-error predicate.
pub struct RetryPolicy<E> {
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    pub retryable: fn(&E) -> bool,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            retryable: self.retryable,
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl<E: fmt::Debug + fmt::Display> RetryPolicy<E> {
    pub fn new(max_attempts: u32, backoff: BackoffConfig, retryable: fn(&E) -> bool) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retryable,
        }
    }

    /// Run `op` until it succeeds, fails permanently, attempts run out, or
    /// the next backoff would end past `deadline`. `op` receives the 1-based
    /// attempt number. An attempt already in flight is never cut short.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        deadline: Option<Instant>,
        mut op: F,
    ) -> Result<Retried<T>, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                    })
                }
                Err(error) if !(self.retryable)(&error) => {
                    return Err(RetryError::Permanent {
                        error,
                        attempts: attempt,
                    })
                }
                Err(error) if attempt >= self.max_attempts => {
                    return Err(RetryError::Exhausted {
                        error,
                        attempts: attempt,
                    })
                }
                Err(error) => {
                    let delay = self.backoff.delay(attempt - 1);
                    if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                        warn!(operation, attempt, error = %error, "Deadline reached, giving up retries");
                        return Err(RetryError::DeadlineExceeded {
                            error,
                            attempts: attempt,
                        });
                    }
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
