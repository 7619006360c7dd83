//! Run projection: the run's state as a pure fold over its event log.

use crate::domain::{AbortReason, Event, EventKind, RunOutcome, RunResult, RunSnapshot, RunState, failure_signature};
use crate::id::now_ms;

/// How many recent failure signatures a projection keeps
const RECENT_SIGNATURES: usize = 16;

/// State of one run, derived only from its events.
///
/// Replaying a log from empty yields exactly the state the live controller
/// had after publishing the same events.
#[derive(Debug, Clone, PartialEq)]
pub struct RunProjection {
    pub run_id: String,
    pub task: String,
    pub state: RunState,
    pub iteration: u32,
    pub result: RunResult,
    pub abort_reason: Option<AbortReason>,
    pub abort_diagnostics: Option<String>,
    pub event_count: usize,
    pub created_at: u64,
    pub last_activity: u64,
    pub failure_signatures: Vec<String>,
    pub failure_count: usize,
    pub last_diagnostics: Option<String>,
    /// recovery.injected events seen
    pub recoveries: u32,
}

impl RunProjection {
    pub fn new(run_id: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            run_id: run_id.into(),
            task: String::new(),
            state: RunState::Idle,
            iteration: 1,
            result: RunResult::Unset,
            abort_reason: None,
            abort_diagnostics: None,
            event_count: 0,
            created_at: now,
            last_activity: now,
            failure_signatures: Vec::new(),
            failure_count: 0,
            last_diagnostics: None,
            recoveries: 0,
        }
    }

    pub fn replay<'a>(run_id: &str, events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut projection = Self::new(run_id);
        for event in events {
            projection.apply(event);
        }
        projection
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Fold one event into the state.
    ///
    /// Events after a terminal one are counted but change nothing else.
    pub fn apply(&mut self, event: &Event) {
        if event.run_id != self.run_id {
            return;
        }
        self.event_count += 1;
        self.last_activity = event.timestamp;
        if self.is_terminal() {
            return;
        }

        match event.kind {
            EventKind::TaskStart => {
                if self.state == RunState::Idle {
                    self.task = event.payload["task"].as_str().unwrap_or_default().to_string();
                    self.created_at = event.timestamp;
                    self.state = RunState::Planning;
                }
            }
            EventKind::PlanReady => self.state = RunState::Building,
            EventKind::BuildDone => self.state = RunState::Verifying,
            EventKind::TestPassed => {
                let verified = event.verification().is_some_and(|v| v.passed);
                if self.state == RunState::Verifying && verified {
                    self.state = RunState::Passed;
                    self.result = RunResult::Passed;
                    self.last_diagnostics = event.diagnostics().map(str::to_string);
                }
            }
            EventKind::TestFailed => {
                self.state = RunState::Refining;
                self.result = RunResult::Failed;
                self.iteration += 1;
                self.failure_count += 1;
                let diagnostics = event.diagnostics().unwrap_or_default();
                self.failure_signatures.push(failure_signature(diagnostics));
                if self.failure_signatures.len() > RECENT_SIGNATURES {
                    self.failure_signatures.remove(0);
                }
                self.last_diagnostics = Some(diagnostics.to_string());
            }
            EventKind::StallDetected => self.state = RunState::Stalled,
            EventKind::RecoveryInjected => {
                self.state = RunState::Refining;
                self.recoveries += 1;
                // A fresh episode: earlier repetitions no longer count
                self.failure_signatures.clear();
            }
            EventKind::RunAborted => {
                self.state = RunState::Aborted;
                self.result = RunResult::Aborted;
                self.abort_reason = Some(event.abort_reason().unwrap_or(AbortReason::Cancelled));
                self.abort_diagnostics = event.diagnostics().map(str::to_string);
            }
        }
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        match self.state {
            RunState::Passed => Some(RunOutcome::Passed {
                iteration: self.iteration,
            }),
            RunState::Aborted => Some(RunOutcome::Aborted {
                reason: self.abort_reason.unwrap_or(AbortReason::Cancelled),
                iteration: self.iteration,
                diagnostics: self.abort_diagnostics.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id.clone(),
            task: self.task.clone(),
            state: self.state,
            iteration: self.iteration,
            result: self.result,
            abort_reason: self.abort_reason,
            event_count: self.event_count,
            created_at: self.created_at,
            last_activity: self.last_activity,
            failure_signatures: self.failure_signatures.clone(),
            failure_count: self.failure_count,
            last_diagnostics: self.last_diagnostics.clone(),
        }
    }
}
