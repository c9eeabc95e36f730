//! Core engine: the cycle loop and everything that moves money.
//!
//! - `orchestrator` runs the reconcile → view → decide → govern → execute cycle
//! - `executor` turns approved decisions into idempotent orders
//! - `accountant` settles fills into the portfolio
//! - `monitor` watches the external kill-switch file

pub mod accountant;
pub mod executor;
pub mod monitor;
pub mod orchestrator;

pub use executor::{ExecutionCoordinator, ExecutionSettings, ReconcileReport};
pub use monitor::KillSwitchMonitor;
pub use orchestrator::{Orchestrator, OrchestratorSettings, RunSummary, StopReason};
