//! Verifier gate.
//!
//! The only component allowed to declare a build good. It runs one check per
//! build.done on the run's own execution slot, writes every invocation to its
//! ledger, and turns the verdict into the event the controller publishes.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::{info, warn};

use super::traits::{Verifier, VerifyRequest};
use crate::domain::{Event, EventKind, RoleId, VerificationRecord, VerificationResult};
use crate::error::{Result, VloopError};

/// Ledger diagnostic for a check whose caller stopped waiting
pub const INTERRUPTED: &str = "verification interrupted";

/// A check the gate is still waiting on.
///
/// Dropped unsettled (the caller was preempted by a cancel or a stall), it
/// stops the spawned task and records the invocation as interrupted.
struct PendingCheck<'a> {
    gate: &'a VerifierGate,
    iteration: u32,
    build_seq: u64,
    start: Instant,
    task: AbortHandle,
    settled: bool,
}

impl PendingCheck<'_> {
    fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn settle(mut self, record: VerificationRecord) {
        self.settled = true;
        self.gate.ledger().push(record);
    }
}

impl Drop for PendingCheck<'_> {
    fn drop(&mut self) {
        self.task.abort();
        if self.settled {
            return;
        }
        warn!(run_id = %self.gate.run_id, iteration = self.iteration, build_seq = self.build_seq, "verification interrupted");
        let record = VerificationRecord::infra(
            &self.gate.run_id,
            self.iteration,
            self.build_seq,
            INTERRUPTED,
            self.elapsed_ms(),
        );
        self.gate.ledger().push(record);
    }
}

pub struct VerifierGate {
    run_id: String,
    role: RoleId,
    verifier: Arc<dyn Verifier>,
    workdir: PathBuf,
    slot: Arc<Semaphore>,
    ledger: Mutex<Vec<VerificationRecord>>,
}

impl VerifierGate {
    pub fn new(run_id: impl Into<String>, role: RoleId, verifier: Arc<dyn Verifier>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            run_id: run_id.into(),
            role,
            verifier,
            workdir: workdir.into(),
            slot: Arc::new(Semaphore::new(1)),
            ledger: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn role(&self) -> &RoleId {
        &self.role
    }

    fn ledger(&self) -> MutexGuard<'_, Vec<VerificationRecord>> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run the external check for one build.done.
    ///
    /// Exactly one ledger record is written per call. Infrastructure
    /// problems come back as `VerificationInfra`; the gate never retries.
    pub async fn check(&self, build: &Event) -> Result<VerificationResult> {
        if build.run_id != self.run_id {
            return Err(VloopError::InvalidState(format!(
                "gate of run {} asked to check run {}",
                self.run_id, build.run_id
            )));
        }
        if build.kind != EventKind::BuildDone {
            return Err(VloopError::InvalidState(format!(
                "gate only checks build.done, got {}",
                build.kind
            )));
        }

        let permit = Arc::clone(&self.slot).try_acquire_owned().map_err(|_| {
            VloopError::InvalidState(format!("verification already running for run {}", self.run_id))
        })?;

        let request = VerifyRequest {
            run_id: self.run_id.clone(),
            iteration: build.iteration,
            build_seq: build.seq,
            artifact: build.payload.clone(),
            workdir: self.workdir.clone(),
        };

        info!(
            run_id = %self.run_id,
            iteration = build.iteration,
            build_seq = build.seq,
            verifier = self.verifier.description(),
            "verification started"
        );

        let verifier = Arc::clone(&self.verifier);
        let task_request = request.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            verifier.verify(&task_request).await
        });
        let pending = PendingCheck {
            gate: self,
            iteration: request.iteration,
            build_seq: request.build_seq,
            start: Instant::now(),
            task: handle.abort_handle(),
            settled: false,
        };

        let outcome = match handle.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(VloopError::VerificationInfra(msg))) => Err(msg),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("verification task failed: {}", e)),
        };
        let elapsed_ms = pending.elapsed_ms();

        match outcome {
            Ok(result) => {
                info!(
                    run_id = %self.run_id,
                    iteration = build.iteration,
                    passed = result.passed,
                    exit_code = result.exit_code,
                    duration_ms = result.duration_ms,
                    "verification finished"
                );
                pending.settle(VerificationRecord::new(
                    &self.run_id,
                    request.iteration,
                    request.build_seq,
                    result.clone(),
                ));
                Ok(result)
            }
            Err(msg) => {
                warn!(run_id = %self.run_id, iteration = build.iteration, error = %msg, "verification infrastructure error");
                pending.settle(VerificationRecord::infra(
                    &self.run_id,
                    request.iteration,
                    request.build_seq,
                    &msg,
                    elapsed_ms,
                ));
                Err(VloopError::VerificationInfra(msg))
            }
        }
    }

    /// The verdict event for a checked build.
    ///
    /// test.passed only for a build.done whose own check passed; anything
    /// else becomes test.failed. `origin` names the role that produced the
    /// build so the failure can be routed back upstream.
    pub fn outcome_event(&self, build: &Event, result: &VerificationResult) -> Event {
        let kind = if build.kind == EventKind::BuildDone && result.passed {
            EventKind::TestPassed
        } else {
            EventKind::TestFailed
        };
        Event::new(
            kind,
            &self.run_id,
            build.iteration,
            serde_json::json!({
                "verification": result,
                "diagnostics": result.diagnostics,
                "origin": build.source,
                "build_seq": build.seq,
            }),
        )
        .with_source(&self.role)
    }

    pub fn records(&self) -> Vec<VerificationRecord> {
        self.ledger().clone()
    }

    /// Whether any recorded check passed
    pub fn has_pass(&self) -> bool {
        self.ledger().iter().any(VerificationRecord::is_pass)
    }

    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }
}
