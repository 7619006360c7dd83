//! Run status types and the read-only snapshot exposed to observers.

use serde::{Deserialize, Serialize};

/// Controller state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Planning,
    Building,
    Verifying,
    Refining,
    Stalled,
    Passed,
    Aborted,
}

impl RunState {
    /// Returns true if the run can make no further progress
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Passed | RunState::Aborted)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Planning => "planning",
            RunState::Building => "building",
            RunState::Verifying => "verifying",
            RunState::Refining => "refining",
            RunState::Stalled => "stalled",
            RunState::Passed => "passed",
            RunState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Terminal result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunResult {
    #[default]
    Unset,
    Passed,
    /// The latest check failed and the run is still iterating
    Failed,
    Aborted,
}

/// Why a run was aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Iteration cap reached without a passing check
    BudgetExhausted,
    /// Watchdog stall with no recovery left
    Stalled,
    /// Event had no registered consumer
    Unroutable,
    /// Cancelled from outside
    Cancelled,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::BudgetExhausted => "budget_exhausted",
            AbortReason::Stalled => "stalled",
            AbortReason::Unroutable => "unroutable",
            AbortReason::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome handed back to whoever started the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The verifier gate recorded a passing result
    Passed { iteration: u32 },
    /// The run was abandoned
    Aborted {
        reason: AbortReason,
        iteration: u32,
        diagnostics: String,
    },
}

impl RunOutcome {
    /// Process exit code for this outcome
    ///
    /// - 0: passed
    /// - 2: aborted (budget, stall, unroutable event)
    /// - 130: cancelled (SIGINT = 128 + 2)
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Passed { .. } => 0,
            RunOutcome::Aborted {
                reason: AbortReason::Cancelled,
                ..
            } => 130,
            RunOutcome::Aborted { .. } => 2,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Passed { .. })
    }
}

/// Exit code for internal faults (config errors, storage failures, panics)
pub const ERROR_EXIT_CODE: i32 = 1;

/// Point-in-time view of a run, published after every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub task: String,
    pub state: RunState,
    pub iteration: u32,
    pub result: RunResult,
    pub abort_reason: Option<AbortReason>,
    pub event_count: usize,
    pub created_at: u64,
    pub last_activity: u64,
    /// Signatures of the most recent failures, oldest first
    pub failure_signatures: Vec<String>,
    /// Number of test.failed events seen so far
    pub failure_count: usize,
    /// Diagnostics of the last failure, or of the passing check
    pub last_diagnostics: Option<String>,
}

impl RunSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
