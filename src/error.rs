//! Error types for vloop
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in vloop
#[derive(Debug, Error)]
pub enum VloopError {
    /// Event has no registered consumer; fatal to the run
    #[error("Routing error: {0}")]
    Routing(String),

    /// The external check could not run (spawn failure, killed by signal)
    #[error("Verification infrastructure error: {0}")]
    VerificationInfra(String),

    /// Policy rejected at run creation
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// Iteration cap reached
    #[error("Budget exhausted after {0} iterations")]
    BudgetExhausted(u32),

    /// Watchdog-detected stall
    #[error("Stall timeout: {0}")]
    StallTimeout(String),

    /// A role crashed, timed out, or broke its capability contract
    #[error("Role '{role}' failed: {reason}")]
    RoleFailed { role: String, reason: String },

    /// Run not found in the manager or the event log
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Invalid state transition or operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl VloopError {
    /// Create a role failure
    pub fn role_failed(role: impl Into<String>, reason: impl Into<String>) -> Self {
        VloopError::RoleFailed {
            role: role.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for vloop operations
pub type Result<T> = std::result::Result<T, VloopError>;
