//! Notification sinks.
//!
//! After every cycle the orchestrator hands a `Notice` (decision, verdict,
//! execution outcome and risk transitions) to a `Notifier`. Delivery is
//! fire-and-forget: `dispatch` spawns the send and only logs failures.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::types::{CycleOutcome, CycleRecord, Decision, ExecutionOutcome, RiskState, RiskTransition, Verdict};

/// What a notifier receives for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub agent: String,
    pub cycle_id: u64,
    pub outcome: CycleOutcome,
    pub risk_state: RiskState,
    pub decision: Option<Decision>,
    pub verdict: Option<Verdict>,
    pub execution: Option<ExecutionOutcome>,
    pub transitions: Vec<RiskTransition>,
    pub at: DateTime<Utc>,
}

impl Notice {
    pub fn from_record(agent: &str, record: &CycleRecord) -> Self {
        Self {
            agent: agent.to_string(),
            cycle_id: record.cycle_id,
            outcome: record.outcome,
            risk_state: record.risk_state_after,
            decision: record.decision.clone(),
            verdict: record.verdict.clone(),
            execution: record.execution.clone(),
            transitions: record.transitions.clone(),
            at: record.finished_at.unwrap_or(record.started_at),
        }
    }

    /// One-line summary for logs and chat webhooks.
    pub fn headline(&self) -> String {
        let mut line = format!("[{}] cycle {} {}", self.agent, self.cycle_id, self.outcome);
        if let Some(ref d) = self.decision {
            line.push_str(&format!(" | {d}"));
        }
        if let Some(ref v) = self.verdict {
            line.push_str(&format!(" | {v}"));
        }
        for t in &self.transitions {
            line.push_str(&format!(" | RISK {t}"));
        }
        line
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &Notice) -> Result<()>;

    fn name(&self) -> &str;
}

/// Spawn delivery of `notice` and return immediately.
pub fn dispatch(notifier: Arc<dyn Notifier>, notice: Notice) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&notice).await {
            warn!(notifier = notifier.name(), cycle = notice.cycle_id, error = %e, "Notification failed");
        }
    })
}

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

/// Writes notices to the tracing log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &Notice) -> Result<()> {
        if notice.transitions.is_empty() {
            info!(cycle = notice.cycle_id, "{}", notice.headline());
        } else {
            warn!(cycle = notice.cycle_id, risk_state = %notice.risk_state, "{}", notice.headline());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    text: String,
    notice: &'a Notice,
}

/// POSTs notices as JSON to a webhook URL.
pub struct WebhookNotifier {
    http: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("HYDRA/0.1")
            .build()
            .context("Failed to build HTTP client for webhook")?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notice: &Notice) -> Result<()> {
        let payload = WebhookPayload {
            text: notice.headline(),
            notice,
        };
        self.http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("Webhook request failed")?
            .error_for_status()
            .context("Webhook returned an error status")?;
        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// Collects notices in memory.
#[derive(Default)]
pub struct MemoryNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, notice: &Notice) -> Result<()> {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notice.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
