//! External kill switch.
//!
//! Polls for a kill-switch file (default `EMERGENCY_STOP`) and halts the
//! risk governor when it appears. The file is only read, never removed;
//! `hydra reset` clears both the file and the HALTED state.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::strategy::risk::RiskGovernor;
use crate::types::{HaltCause, RiskTransition};

pub struct KillSwitchMonitor {
    path: PathBuf,
    governor: RiskGovernor,
    every: Duration,
}

impl KillSwitchMonitor {
    pub fn new(path: impl AsRef<Path>, governor: RiskGovernor, every: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            governor,
            every,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Halt the governor if the kill-switch file exists.
    pub fn check(&self) -> Option<RiskTransition> {
        if !self.path.exists() {
            return None;
        }
        let source = format!("kill file {}", self.path.display());
        let transition = self.governor.halt(HaltCause::External { source }, Utc::now());
        if let Some(ref t) = transition {
            error!(path = %self.path.display(), transition = %t, "Kill switch file detected, trading halted");
        }
        transition
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.check();
                    }
                }
            }
            debug!("Kill switch monitor stopped");
        })
    }
}
