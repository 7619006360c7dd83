//! Verification results produced by the verifier gate.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::id::now_ms;

/// Exit code recorded when the command was killed by its timeout
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Outcome of one external check. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Whether the check passed
    pub passed: bool,
    /// Captured output of the check
    pub diagnostics: String,
    /// Exit code of the check command
    pub exit_code: i32,
    /// Wall-clock duration of the check
    pub duration_ms: u64,
}

impl VerificationResult {
    /// Create a passing result with output
    pub fn pass(diagnostics: impl Into<String>) -> Self {
        Self {
            passed: true,
            diagnostics: diagnostics.into(),
            exit_code: 0,
            duration_ms: 0,
        }
    }

    /// Create a failing result
    pub fn fail(diagnostics: impl Into<String>, exit_code: i32) -> Self {
        Self {
            passed: false,
            diagnostics: diagnostics.into(),
            exit_code,
            duration_ms: 0,
        }
    }

    /// Create a failing result for a check that hit its timeout
    pub fn timed_out(timeout_ms: u64) -> Self {
        Self::fail(
            format!("Verification timed out after {}ms", timeout_ms),
            TIMEOUT_EXIT_CODE,
        )
    }

    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Stable fingerprint of the diagnostics.
    ///
    /// Whitespace is collapsed so that reflowed output of the same failure
    /// yields the same signature.
    pub fn signature(&self) -> String {
        failure_signature(&self.diagnostics)
    }
}

/// SHA-256 of whitespace-normalised diagnostic text, hex encoded
pub fn failure_signature(diagnostics: &str) -> String {
    let normalized = diagnostics.split_whitespace().collect::<Vec<_>>().join(" ");
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// One entry of the gate ledger: every invocation writes exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub run_id: String,
    pub iteration: u32,
    /// Seq of the build.done event that triggered the check
    pub build_seq: u64,
    pub result: VerificationResult,
    /// Set when the check could not run at all
    pub infra_error: Option<String>,
    pub recorded_at: u64,
}

impl VerificationRecord {
    pub fn new(run_id: &str, iteration: u32, build_seq: u64, result: VerificationResult) -> Self {
        Self {
            run_id: run_id.to_string(),
            iteration,
            build_seq,
            result,
            infra_error: None,
            recorded_at: now_ms(),
        }
    }

    pub fn infra(run_id: &str, iteration: u32, build_seq: u64, error: &str, duration_ms: u64) -> Self {
        let mut record = Self::new(
            run_id,
            iteration,
            build_seq,
            VerificationResult::fail(error, TIMEOUT_EXIT_CODE).with_duration_ms(duration_ms),
        );
        record.infra_error = Some(error.to_string());
        record
    }

    /// A genuine pass: the check ran and returned success
    pub fn is_pass(&self) -> bool {
        self.infra_error.is_none() && self.result.passed
    }
}
