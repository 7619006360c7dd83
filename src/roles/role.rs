//! Role trait - the seam where the surrounding agent framework plugs in.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{Event, EventKind, Hat};
use crate::error::Result;

/// What a role gets to see when an event is delivered to it.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleContext {
    pub run_id: String,
    pub task: String,
    pub iteration: u32,
    pub workdir: PathBuf,
    /// Diagnostics of the most recent failure, if any
    pub diagnostics: Option<String>,
    /// Set when the run was re-routed after a stall: start from a clean slate
    pub context_reset: bool,
}

/// What a role hands back: an event kind from its `produces` set and a
/// payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleOutput {
    /// None means the hat's primary output
    pub kind: Option<EventKind>,
    pub payload: Value,
}

impl RoleOutput {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind: Some(kind),
            payload,
        }
    }

    pub fn primary(payload: Value) -> Self {
        Self { kind: None, payload }
    }
}

/// A participant filling one hat.
///
/// Implementations do the actual work (planning, building). Errors are
/// captured by the controller and turned into a failed iteration, so a
/// crashing role cannot hang a run.
#[async_trait]
pub trait Role: Send + Sync {
    /// The capability contract this role honours
    fn hat(&self) -> &Hat;

    /// React to one delivered event
    async fn handle(&self, event: &Event, ctx: &RoleContext) -> Result<RoleOutput>;
}
