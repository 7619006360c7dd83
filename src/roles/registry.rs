//! Role registry and routing table.
//!
//! The registry knows every hat taking part in a run, answers "who reacts to
//! this event", and checks a policy against the roster before a run starts.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tracing::debug;

use super::role::Role;
use crate::domain::{CONTROLLER_SOURCE, Event, EventKind, Hat, Policy, RoleId, RoleKind, StallRecovery, WATCHDOG_SOURCE};
use crate::error::{Result, VloopError};

/// Kinds routed by the table rather than by an explicit target.
/// Each needs exactly one consumer.
pub const UNTARGETED_KINDS: [EventKind; 4] = [
    EventKind::TaskStart,
    EventKind::PlanReady,
    EventKind::BuildDone,
    EventKind::RecoveryInjected,
];

pub struct RoleRegistry {
    verifier: Hat,
    roles: Vec<Arc<dyn Role>>,
    index: HashMap<RoleId, usize>,
    table: HashMap<EventKind, RoleId>,
}

impl RoleRegistry {
    /// Build a registry from the verifier hat and the working roles.
    ///
    /// Structural problems with the roster are reported as
    /// `PolicyViolation`: they make every run with this roster invalid.
    pub fn new(verifier: Hat, roles: Vec<Arc<dyn Role>>) -> Result<Self> {
        if verifier.kind != RoleKind::Verifier {
            return Err(VloopError::PolicyViolation(format!(
                "verifier hat '{}' has kind {:?}",
                verifier.id, verifier.kind
            )));
        }
        if !verifier.consumes(EventKind::BuildDone) {
            return Err(VloopError::PolicyViolation(format!(
                "verifier '{}' must consume build.done",
                verifier.id
            )));
        }

        let mut index = HashMap::new();
        for (i, role) in roles.iter().enumerate() {
            let hat = role.hat();
            let id = &hat.id;
            if id.as_str() == CONTROLLER_SOURCE || id.as_str() == WATCHDOG_SOURCE {
                return Err(VloopError::PolicyViolation(format!("role id '{}' is reserved", id)));
            }
            if *id == verifier.id || index.insert(id.clone(), i).is_some() {
                return Err(VloopError::PolicyViolation(format!("duplicate role id '{}'", id)));
            }
            if hat.kind == RoleKind::Verifier {
                return Err(VloopError::PolicyViolation(format!(
                    "more than one verifier: '{}' and '{}'",
                    verifier.id, id
                )));
            }
            if let Some(kind) = hat.consumes.iter().find(|k| k.is_controller_handled()) {
                return Err(VloopError::PolicyViolation(format!(
                    "role '{}' consumes {}, which only the controller handles",
                    id, kind
                )));
            }
        }

        let mut table: HashMap<EventKind, RoleId> = HashMap::new();
        let all_hats = std::iter::once(&verifier).chain(roles.iter().map(|r| r.hat()));
        for hat in all_hats {
            for kind in hat.consumes.iter().filter(|k| UNTARGETED_KINDS.contains(k)) {
                if let Some(existing) = table.insert(*kind, hat.id.clone()) {
                    return Err(VloopError::PolicyViolation(format!(
                        "{} has two consumers: '{}' and '{}'",
                        kind, existing, hat.id
                    )));
                }
            }
        }
        if !table.contains_key(&EventKind::TaskStart) {
            return Err(VloopError::PolicyViolation("no role consumes task.start".to_string()));
        }

        Ok(Self {
            verifier,
            roles,
            index,
            table,
        })
    }

    /// Registry with the given roles and the stock verifier hat
    pub fn with_roles(roles: Vec<Arc<dyn Role>>) -> Result<Self> {
        Self::new(Hat::verifier(), roles)
    }

    pub fn verifier_id(&self) -> &RoleId {
        &self.verifier.id
    }

    pub fn is_verifier(&self, id: &RoleId) -> bool {
        *id == self.verifier.id
    }

    pub fn hat(&self, id: &RoleId) -> Option<&Hat> {
        if self.is_verifier(id) {
            return Some(&self.verifier);
        }
        self.index.get(id).map(|i| self.roles[*i].hat())
    }

    /// Implementation behind a working role; the verifier has none
    pub fn handler(&self, id: &RoleId) -> Option<Arc<dyn Role>> {
        self.index.get(id).map(|i| Arc::clone(&self.roles[*i]))
    }

    pub fn role_ids(&self) -> Vec<RoleId> {
        self.roles.iter().map(|r| r.hat().id.clone()).collect()
    }

    /// Every (kind, role) pair to subscribe on a run's bus
    pub fn subscriptions(&self) -> Vec<(EventKind, RoleId)> {
        std::iter::once(&self.verifier)
            .chain(self.roles.iter().map(|r| r.hat()))
            .flat_map(|hat| hat.consumes.iter().map(|kind| (*kind, hat.id.clone())))
            .collect()
    }

    /// Consumer of an untargeted kind
    pub fn consumer_of(&self, kind: EventKind) -> Option<&RoleId> {
        self.table.get(&kind)
    }

    /// Decide which role receives an event.
    pub fn route(&self, event: &Event) -> Result<RoleId> {
        if event.kind.is_controller_handled() {
            return Err(VloopError::Routing(format!(
                "{} is handled by the controller, not routed",
                event.kind
            )));
        }

        if let Some(target) = &event.target {
            let hat = self
                .hat(target)
                .ok_or_else(|| VloopError::Routing(format!("{} targets unknown role '{}'", event.kind, target)))?;
            if !hat.consumes(event.kind) {
                return Err(VloopError::Routing(format!(
                    "{} targets '{}', which does not consume it",
                    event.kind, target
                )));
            }
            return Ok(target.clone());
        }

        if event.kind == EventKind::TestFailed {
            return Err(VloopError::Routing("test.failed must name its retry target".to_string()));
        }

        let role = self
            .table
            .get(&event.kind)
            .cloned()
            .ok_or_else(|| VloopError::Routing(format!("no role consumes {}", event.kind)))?;
        debug!(kind = %event.kind, role = %role, "routed");
        Ok(role)
    }

    /// Where a failure originating at `origin` is sent
    pub fn retry_target_for(&self, policy: &Policy, origin: &RoleId) -> Result<RoleId> {
        if let Some(target) = policy.retry_target.get(origin) {
            return Ok(target.clone());
        }
        match self.hat(origin) {
            Some(hat) if hat.consumes(EventKind::TestFailed) => Ok(origin.clone()),
            Some(_) => Err(VloopError::Routing(format!(
                "no retry target for failures from '{}'",
                origin
            ))),
            None => Err(VloopError::Routing(format!("failure from unknown role '{}'", origin))),
        }
    }

    /// Roles on the path from task.start to the verifier, in discovery order.
    ///
    /// Walks the untargeted table: the consumer of task.start, then the
    /// consumers of whatever it produces, stopping at the verifier.
    pub fn causal_chain(&self) -> Vec<RoleId> {
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        let mut frontier: VecDeque<EventKind> = VecDeque::from([EventKind::TaskStart]);

        while let Some(kind) = frontier.pop_front() {
            let Some(role) = self.table.get(&kind) else {
                continue;
            };
            if self.is_verifier(role) || !seen.insert(role.clone()) {
                continue;
            }
            chain.push(role.clone());
            if let Some(hat) = self.hat(role) {
                frontier.extend(hat.produces.iter().copied());
            }
        }
        chain
    }

    /// Whether the verifier is reachable from task.start
    pub fn reaches_verifier(&self) -> bool {
        self.causal_chain().iter().any(|id| {
            self.hat(id)
                .is_some_and(|hat| hat.produces(EventKind::BuildDone))
        })
    }

    /// Check a policy against this roster.
    pub fn validate(&self, policy: &Policy) -> Result<()> {
        policy.validate()?;

        if !self.reaches_verifier() {
            return Err(VloopError::PolicyViolation(
                "no path from task.start leads to build.done".to_string(),
            ));
        }

        for role in policy.role_timeout_ms.keys() {
            if self.hat(role).is_none() {
                return Err(VloopError::PolicyViolation(format!("timeout set for unknown role '{}'", role)));
            }
        }

        let chain = self.causal_chain();
        for (origin, target) in &policy.retry_target {
            let origin_hat = self
                .hat(origin)
                .ok_or_else(|| VloopError::PolicyViolation(format!("retry origin '{}' is not a role", origin)))?;
            if !origin_hat.produces(EventKind::BuildDone) {
                return Err(VloopError::PolicyViolation(format!(
                    "retry origin '{}' never produces build.done",
                    origin
                )));
            }
            let target_hat = self
                .hat(target)
                .ok_or_else(|| VloopError::PolicyViolation(format!("retry target '{}' is not a role", target)))?;
            if !target_hat.consumes(EventKind::TestFailed) {
                return Err(VloopError::PolicyViolation(format!(
                    "retry target '{}' does not consume test.failed",
                    target
                )));
            }
            if !chain.contains(target) {
                return Err(VloopError::PolicyViolation(format!(
                    "retry target '{}' is not upstream of verification",
                    target
                )));
            }
        }

        // Any role that gets deliveries can fail, and its failure must land
        // somewhere that can act on it
        for origin in &chain {
            let target = self.retry_target_for(policy, origin).map_err(|_| {
                VloopError::PolicyViolation(format!(
                    "failures from '{}' have no retry target",
                    origin
                ))
            })?;
            let takes_failures = self.hat(&target).is_some_and(|hat| hat.consumes(EventKind::TestFailed));
            if !takes_failures || !chain.contains(&target) {
                return Err(VloopError::PolicyViolation(format!(
                    "failures from '{}' go to '{}', which cannot take test.failed upstream of verification",
                    origin, target
                )));
            }
        }

        if policy.stall_recovery == StallRecovery::Replan && policy.max_stall_recoveries > 0 {
            match self.table.get(&EventKind::RecoveryInjected) {
                Some(planner) if chain.contains(planner) => {}
                Some(other) => {
                    return Err(VloopError::PolicyViolation(format!(
                        "recovery target '{}' is not upstream of verification",
                        other
                    )));
                }
                None => {
                    return Err(VloopError::PolicyViolation(
                        "replan recovery needs a role consuming recovery.injected".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for RoleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleRegistry")
            .field("verifier", &self.verifier.id)
            .field("roles", &self.role_ids())
            .finish()
    }
}
