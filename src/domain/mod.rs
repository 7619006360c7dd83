//! Domain types for vloop
//!
//! This module contains all core domain types:
//! - Event: the immutable, append-only audit record of a run
//! - Hat: role capability descriptors (consumes / produces)
//! - VerificationResult: outcome of one external check
//! - Policy: per-run budgets, timeouts and retry routing
//! - RunState / RunSnapshot: status types exposed to observers

pub mod event;
pub mod hat;
pub mod policy;
pub mod run;
pub mod verification;

pub use event::{CONTROLLER_SOURCE, Event, EventKind, WATCHDOG_SOURCE};
pub use hat::{Hat, RoleId, RoleKind};
pub use policy::{Policy, StallRecovery, VerifyCommandSpec};
pub use run::{AbortReason, ERROR_EXIT_CODE, RunOutcome, RunResult, RunSnapshot, RunState};
pub use verification::{TIMEOUT_EXIT_CODE, VerificationRecord, VerificationResult, failure_signature};
