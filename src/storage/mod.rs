//! Persistence layer.
//!
//! - `RuntimeState` (cycle counter, risk envelope, cached view, failure
//!   count) is saved to a JSON file after every cycle. A HALTED envelope
//!   therefore survives restarts.
//! - Orders and the portfolio live in SQLite (`orders`), committed
//!   together so a fill is never applied without its order row.
//! - One forensic record per cycle is appended to a JSONL log (`forensic`).

pub mod forensic;
pub mod orders;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::types::{MarketView, RiskEnvelope};

pub use forensic::{ForensicSink, JsonlForensicLog, MemoryForensicLog};
pub use orders::{MemoryOrderStore, OrderStore, SqliteOrderStore};

/// Default state file path.
const DEFAULT_STATE_FILE: &str = "hydra_state.json";

/// Orchestrator state carried across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub next_cycle_id: u64,
    pub envelope: RiskEnvelope,
    /// Last fresh view, reused (marked stale) when the aggregator refuses.
    pub cached_view: Option<MarketView>,
    pub consecutive_failures: u32,
}

impl RuntimeState {
    pub fn new(envelope: RiskEnvelope) -> Self {
        Self {
            next_cycle_id: 1,
            envelope,
            cached_view: None,
            consecutive_failures: 0,
        }
    }
}

/// Save runtime state to a JSON file. Written to a sibling temp file and
/// renamed so a crash mid-write leaves the previous state intact.
pub fn save_state(state: &RuntimeState, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    let json = serde_json::to_string_pretty(state).context("Failed to serialise runtime state")?;

    let tmp = format!("{path}.tmp");
    std::fs::write(&tmp, &json).context(format!("Failed to write state to {tmp}"))?;
    std::fs::rename(&tmp, path).context(format!("Failed to move state into {path}"))?;

    debug!(
        path,
        next_cycle = state.next_cycle_id,
        risk_state = %state.envelope.state,
        "State saved"
    );
    Ok(())
}

/// Load runtime state from a JSON file.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_state(path: Option<&str>) -> Result<Option<RuntimeState>> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);

    if !Path::new(path).exists() {
        info!(path, "No saved state found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path).context(format!("Failed to read state from {path}"))?;
    let state: RuntimeState =
        serde_json::from_str(&json).context(format!("Failed to parse state from {path}"))?;

    info!(
        path,
        next_cycle = state.next_cycle_id,
        risk_state = %state.envelope.state,
        failures = state.consecutive_failures,
        "State loaded from disk"
    );

    Ok(Some(state))
}

/// Delete the state file (for testing or reset).
pub fn delete_state(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path).context(format!("Failed to delete state file {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
