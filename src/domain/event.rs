//! Event record types - the sole audit trail of a run.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::hat::RoleId;
use crate::domain::run::AbortReason;
use crate::domain::verification::VerificationResult;
use crate::error::VloopError;
use crate::id::now_ms;

/// Source used for events the controller emits on its own behalf
pub const CONTROLLER_SOURCE: &str = "controller";

/// Source used for events injected by the watchdog
pub const WATCHDOG_SOURCE: &str = "watchdog";

/// The fixed event vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "task.start")]
    TaskStart,
    #[serde(rename = "plan.ready")]
    PlanReady,
    #[serde(rename = "build.done")]
    BuildDone,
    #[serde(rename = "test.passed")]
    TestPassed,
    #[serde(rename = "test.failed")]
    TestFailed,
    #[serde(rename = "stall.detected")]
    StallDetected,
    #[serde(rename = "recovery.injected")]
    RecoveryInjected,
    #[serde(rename = "run.aborted")]
    RunAborted,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::TaskStart,
        EventKind::PlanReady,
        EventKind::BuildDone,
        EventKind::TestPassed,
        EventKind::TestFailed,
        EventKind::StallDetected,
        EventKind::RecoveryInjected,
        EventKind::RunAborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskStart => "task.start",
            EventKind::PlanReady => "plan.ready",
            EventKind::BuildDone => "build.done",
            EventKind::TestPassed => "test.passed",
            EventKind::TestFailed => "test.failed",
            EventKind::StallDetected => "stall.detected",
            EventKind::RecoveryInjected => "recovery.injected",
            EventKind::RunAborted => "run.aborted",
        }
    }

    /// Kinds the controller acts on itself instead of routing to a role
    pub fn is_controller_handled(&self) -> bool {
        matches!(
            self,
            EventKind::TestPassed | EventKind::StallDetected | EventKind::RunAborted
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = VloopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| VloopError::InvalidState(format!("unknown event kind: {}", s)))
    }
}

/// Immutable record of something that happened in a run.
///
/// `id` and `seq` are assigned by the event bus on publish; until then they
/// are empty / zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    /// Position in the run's total order
    pub seq: u64,
    pub kind: EventKind,
    pub run_id: String,
    /// Iteration the event belongs to (1-based)
    pub iteration: u32,
    pub payload: Value,
    /// Role (or controller/watchdog) that emitted the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<RoleId>,
    /// Role chosen by routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<RoleId>,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
}

impl Event {
    /// Create an unpublished event
    pub fn new(kind: EventKind, run_id: impl Into<String>, iteration: u32, payload: Value) -> Self {
        Self {
            id: String::new(),
            seq: 0,
            kind,
            run_id: run_id.into(),
            iteration,
            payload,
            source: None,
            target: None,
            timestamp: now_ms(),
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<RoleId>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: impl Into<RoleId>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Create a task.start event
    pub fn task_start(run_id: &str, task: &str) -> Self {
        Self::new(
            EventKind::TaskStart,
            run_id,
            1,
            serde_json::json!({ "task": task }),
        )
        .with_source(CONTROLLER_SOURCE)
    }

    /// Create a test.failed event for a role that crashed, timed out or broke
    /// its contract. It counts against the budget like a genuine failure.
    pub fn role_failure(run_id: &str, iteration: u32, origin: &RoleId, diagnostic: &str) -> Self {
        Self::new(
            EventKind::TestFailed,
            run_id,
            iteration,
            serde_json::json!({
                "origin": origin,
                "diagnostics": diagnostic,
                "role_error": true,
            }),
        )
        .with_source(CONTROLLER_SOURCE)
    }

    /// Create a stall.detected event
    pub fn stall_detected(run_id: &str, iteration: u32, reason: &str, detail: &str) -> Self {
        Self::new(
            EventKind::StallDetected,
            run_id,
            iteration,
            serde_json::json!({ "reason": reason, "detail": detail }),
        )
    }

    /// Create a recovery.injected event carrying a context-reset directive
    pub fn recovery_injected(run_id: &str, iteration: u32, attempt: u32, stall_detail: &str) -> Self {
        Self::new(
            EventKind::RecoveryInjected,
            run_id,
            iteration,
            serde_json::json!({
                "directive": "context_reset",
                "attempt": attempt,
                "stall": stall_detail,
            }),
        )
        .with_source(CONTROLLER_SOURCE)
    }

    /// Create a run.aborted event
    pub fn run_aborted(run_id: &str, iteration: u32, reason: AbortReason, diagnostic: &str) -> Self {
        Self::new(
            EventKind::RunAborted,
            run_id,
            iteration,
            serde_json::json!({ "reason": reason, "diagnostics": diagnostic }),
        )
        .with_source(CONTROLLER_SOURCE)
    }

    /// Verification result attached by the gate, if any
    pub fn verification(&self) -> Option<VerificationResult> {
        self.payload
            .get("verification")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Diagnostic text carried by failures, stalls and aborts
    pub fn diagnostics(&self) -> Option<&str> {
        self.payload
            .get("diagnostics")
            .or_else(|| self.payload.get("detail"))
            .and_then(|v| v.as_str())
    }

    /// Role whose output failed (test.failed only)
    pub fn origin(&self) -> Option<RoleId> {
        self.payload
            .get("origin")
            .and_then(|v| v.as_str())
            .map(RoleId::from)
    }

    /// Abort reason (run.aborted only)
    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.payload
            .get("reason")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Whether the event was emitted by the given role
    pub fn is_from(&self, role: &RoleId) -> bool {
        self.source.as_ref() == Some(role)
    }
}
