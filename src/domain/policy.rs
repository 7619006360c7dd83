//! Per-run policy: budgets, timeouts, retry routing and stall recovery.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::hat::RoleId;
use crate::error::{Result, VloopError};

/// What the controller does with a stall.detected event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StallRecovery {
    /// Inject a context-reset directive and re-route to the planner
    Replan,
    /// Abort with reason=stalled
    Abort,
}

/// External verification command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyCommandSpec {
    /// Shell command, run through `sh -c`
    pub command: String,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
    pub timeout_ms: u64,
    /// Working directory (defaults to the current directory)
    pub workdir: Option<PathBuf>,
    /// Diagnostics beyond this size are truncated
    pub max_output_bytes: usize,
}

impl Default for VerifyCommandSpec {
    fn default() -> Self {
        Self {
            command: "cargo test".to_string(),
            env: BTreeMap::new(),
            timeout_ms: 600000,
            workdir: None,
            max_output_bytes: 100000,
        }
    }
}

impl VerifyCommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Per-run configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub max_iterations: u32,
    /// Timeout per role id; roles not listed use `default_role_timeout_ms`
    pub role_timeout_ms: BTreeMap<RoleId, u64>,
    pub default_role_timeout_ms: u64,
    pub stall_threshold_ms: u64,
    /// Failure-origin role -> role that receives test.failed. Unmapped
    /// origins retry themselves.
    pub retry_target: BTreeMap<RoleId, RoleId>,
    pub verify_command: VerifyCommandSpec,
    pub stall_recovery: StallRecovery,
    /// Context resets allowed before a stall forces an abort
    pub max_stall_recoveries: u32,
    /// Identical consecutive failures that count as a stall
    pub repeat_failure_limit: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            role_timeout_ms: BTreeMap::new(),
            default_role_timeout_ms: 300000,
            stall_threshold_ms: 900000,
            retry_target: BTreeMap::new(),
            verify_command: VerifyCommandSpec::default(),
            stall_recovery: StallRecovery::Replan,
            max_stall_recoveries: 1,
            repeat_failure_limit: 3,
        }
    }
}

impl Policy {
    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    #[must_use]
    pub fn with_verify_command(mut self, spec: VerifyCommandSpec) -> Self {
        self.verify_command = spec;
        self
    }

    #[must_use]
    pub fn with_stall_threshold_ms(mut self, ms: u64) -> Self {
        self.stall_threshold_ms = ms;
        self
    }

    #[must_use]
    pub fn with_role_timeout_ms(mut self, role: impl Into<RoleId>, ms: u64) -> Self {
        self.role_timeout_ms.insert(role.into(), ms);
        self
    }

    #[must_use]
    pub fn with_retry_target(mut self, origin: impl Into<RoleId>, target: impl Into<RoleId>) -> Self {
        self.retry_target.insert(origin.into(), target.into());
        self
    }

    #[must_use]
    pub fn with_stall_recovery(mut self, recovery: StallRecovery, max_recoveries: u32) -> Self {
        self.stall_recovery = recovery;
        self.max_stall_recoveries = max_recoveries;
        self
    }

    #[must_use]
    pub fn with_repeat_failure_limit(mut self, limit: usize) -> Self {
        self.repeat_failure_limit = limit;
        self
    }

    pub fn role_timeout(&self, role: &RoleId) -> Duration {
        let ms = self
            .role_timeout_ms
            .get(role)
            .copied()
            .unwrap_or(self.default_role_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    /// Checks that do not depend on the role roster
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(VloopError::PolicyViolation(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.stall_threshold_ms == 0 {
            return Err(VloopError::PolicyViolation(
                "stall_threshold_ms must be positive".to_string(),
            ));
        }
        if self.default_role_timeout_ms == 0 || self.role_timeout_ms.values().any(|ms| *ms == 0) {
            return Err(VloopError::PolicyViolation(
                "role timeouts must be positive".to_string(),
            ));
        }
        if self.verify_command.command.trim().is_empty() {
            return Err(VloopError::PolicyViolation(
                "verify_command.command is empty".to_string(),
            ));
        }
        if self.repeat_failure_limit < 2 {
            return Err(VloopError::PolicyViolation(
                "repeat_failure_limit must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}
