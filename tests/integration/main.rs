//! Integration tests for HYDRA.
//!
//! Full cycles run against simulated providers and a simulated exchange;
//! recovery tests reopen a SQLite order store between "processes".

mod harness;
mod properties;
mod recovery;
mod scenarios;
