//! Hat types - the roles participating in a run.
//!
//! A hat is a named participant with a fixed capability contract: the event
//! kinds it consumes and the event kinds it is allowed to produce.

use serde::{Deserialize, Serialize};

use crate::domain::event::EventKind;

/// Unique identifier for a role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(String);

impl RoleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoleId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RoleId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&RoleId> for RoleId {
    fn from(id: &RoleId) -> Self {
        id.clone()
    }
}

impl std::fmt::Display for RoleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Variant of a role. Selected by configuration, not by subclassing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    Planner,
    Builder,
    Verifier,
    Custom,
}

/// Capability descriptor for a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hat {
    pub id: RoleId,
    pub kind: RoleKind,
    pub name: String,
    pub consumes: Vec<EventKind>,
    pub produces: Vec<EventKind>,
}

impl Hat {
    pub fn new(id: impl Into<RoleId>, kind: RoleKind) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            kind,
            consumes: Vec::new(),
            produces: Vec::new(),
        }
    }

    /// Planner: starts the task, re-plans after a context reset
    pub fn planner() -> Self {
        Self::new("planner", RoleKind::Planner)
            .with_name("Planner")
            .consuming(&[
                EventKind::TaskStart,
                EventKind::TestFailed,
                EventKind::RecoveryInjected,
            ])
            .producing(&[EventKind::PlanReady])
    }

    /// Builder: turns a plan (or failure diagnostics) into a build artifact
    pub fn builder() -> Self {
        Self::new("builder", RoleKind::Builder)
            .with_name("Builder")
            .consuming(&[EventKind::PlanReady, EventKind::TestFailed])
            .producing(&[EventKind::BuildDone])
    }

    /// Verifier: backed by the verifier gate, never by a role implementation
    pub fn verifier() -> Self {
        Self::new("verifier", RoleKind::Verifier)
            .with_name("Verifier")
            .consuming(&[EventKind::BuildDone])
            .producing(&[EventKind::TestPassed, EventKind::TestFailed])
    }

    /// The standard planner/builder/verifier roster
    pub fn default_roster() -> Vec<Hat> {
        vec![Hat::planner(), Hat::builder(), Hat::verifier()]
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn consuming(mut self, kinds: &[EventKind]) -> Self {
        self.consumes = kinds.to_vec();
        self
    }

    #[must_use]
    pub fn producing(mut self, kinds: &[EventKind]) -> Self {
        self.produces = kinds.to_vec();
        self
    }

    pub fn consumes(&self, kind: EventKind) -> bool {
        self.consumes.contains(&kind)
    }

    pub fn produces(&self, kind: EventKind) -> bool {
        self.produces.contains(&kind)
    }

    /// The kind emitted when a role finishes without naming one
    pub fn primary_output(&self) -> Option<EventKind> {
        self.produces.first().copied()
    }
}
