//! Command verifier - runs a shell command and turns its exit status into a
//! verdict.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::traits::{Verifier, VerifyRequest};
use crate::domain::{VerificationResult, VerifyCommandSpec};
use crate::error::{Result, VloopError};

/// Combine stdout and stderr and cap the result at `max_bytes`.
pub fn render_output(stdout: &[u8], stderr: &[u8], max_bytes: usize) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);

    let result = if stdout.is_empty() && !stderr.is_empty() {
        stderr.to_string()
    } else if stderr.is_empty() {
        stdout.to_string()
    } else {
        format!("{}\n\nSTDERR:\n{}", stdout, stderr)
    };

    if result.len() <= max_bytes {
        return result;
    }
    let mut cut = max_bytes;
    while !result.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...\n[truncated, {} bytes total]", &result[..cut], result.len())
}

/// Verifier that executes a shell command.
///
/// Exit 0 passes, any other exit code fails with the captured output as
/// diagnostics. Hitting the timeout is a failure too (exit code -1). Only a
/// command that cannot be spawned, or dies from a signal, is reported as an
/// infrastructure error.
pub struct CommandVerifier {
    spec: VerifyCommandSpec,
}

impl CommandVerifier {
    pub fn from_spec(spec: VerifyCommandSpec) -> Self {
        Self { spec }
    }

    /// Create a command verifier with default limits
    pub fn simple(command: impl Into<String>) -> Self {
        Self::from_spec(VerifyCommandSpec::new(command))
    }

    pub fn command(&self) -> &str {
        &self.spec.command
    }

    fn build(&self, request: &VerifyRequest) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.spec.command);
        let workdir: &PathBuf = self.spec.workdir.as_ref().unwrap_or(&request.workdir);
        cmd.current_dir(workdir);

        cmd.env("VLOOP_RUN_ID", &request.run_id)
            .env("VLOOP_ITERATION", request.iteration.to_string())
            .env("VLOOP_ARTIFACT", request.artifact.to_string());
        for (key, value) in &self.spec.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Verifier for CommandVerifier {
    async fn verify(&self, request: &VerifyRequest) -> Result<VerificationResult> {
        let start = Instant::now();
        let child = self.build(request).spawn().map_err(|e| {
            VloopError::VerificationInfra(format!("failed to spawn '{}': {}", self.spec.command, e))
        })?;

        let output = match tokio::time::timeout(self.spec.timeout(), child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| {
                VloopError::VerificationInfra(format!("failed to collect '{}': {}", self.spec.command, e))
            })?,
            Err(_) => {
                debug!(run_id = %request.run_id, timeout_ms = self.spec.timeout_ms, "verification timed out");
                return Ok(VerificationResult::timed_out(self.spec.timeout_ms)
                    .with_duration_ms(start.elapsed().as_millis() as u64));
            }
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let diagnostics = render_output(&output.stdout, &output.stderr, self.spec.max_output_bytes);
        let result = match output.status.code() {
            Some(0) => VerificationResult::pass(diagnostics),
            Some(code) => VerificationResult::fail(diagnostics, code),
            None => {
                return Err(VloopError::VerificationInfra(format!(
                    "'{}' was terminated by a signal",
                    self.spec.command
                )));
            }
        };
        Ok(result.with_duration_ms(duration_ms))
    }

    fn description(&self) -> &str {
        &self.spec.command
    }
}
