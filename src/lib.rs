//! vloop - a verified iteration loop orchestrator
//!
//! vloop drives a task through plan -> build -> verify cycles. A run only
//! passes when an external verification command agrees; a role claiming
//! success is never enough. Every step is an event on a per-run append-only
//! log, so a run's state can be rebuilt by replaying that log.

pub mod bus;
pub mod controller;
pub mod domain;
pub mod error;
pub mod id;
pub mod manager;
pub mod roles;
pub mod storage;
pub mod verifier;
pub mod watchdog;

pub use controller::{LoopController, RunSpec};
pub use domain::{Event, EventKind, Policy, RunOutcome, RunSnapshot};
pub use error::{Result, VloopError};
pub use manager::RunManager;
