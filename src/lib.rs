//! HYDRA: Autonomous Trading Agent
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod engine;
pub mod exchange;
pub mod notify;
pub mod retry;
pub mod signals;
pub mod storage;
pub mod strategy;
pub mod types;
