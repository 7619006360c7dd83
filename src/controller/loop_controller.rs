//! Loop controller - the state machine that owns one run.
//!
//! The controller is the only writer of its run's log. It pulls deliveries
//! off the bus one at a time, hands them to roles or to the verifier gate,
//! routes whatever comes back, and applies the budget, retry and stall
//! policies. Watchdog reports and cancel requests reach it through the bus's
//! external channel and preempt whatever is in flight.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::state::RunProjection;
use crate::bus::{BusPublisher, Delivery, EventBus};
use crate::domain::{
    AbortReason, CONTROLLER_SOURCE, Event, EventKind, Hat, Policy, RoleId, RunOutcome, RunSnapshot, StallRecovery,
};
use crate::error::{Result, VloopError};
use crate::id::generate_run_id;
use crate::roles::{RoleContext, RoleOutput, RoleRegistry};
use crate::storage::EventSink;
use crate::verifier::{Verifier, VerifierGate};

/// Checks attempted per build before infrastructure trouble becomes a stall
const MAX_INFRA_ATTEMPTS: u32 = 2;

/// stall.detected reason used when the check itself keeps failing to run
pub const STALL_REASON_INFRA: &str = "verification_infra";

/// Everything needed to create a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    pub run_id: String,
    pub task: String,
    pub policy: Policy,
    pub workdir: PathBuf,
}

impl RunSpec {
    pub fn new(task: impl Into<String>, policy: Policy) -> Self {
        Self {
            run_id: generate_run_id(),
            task: task.into(),
            policy,
            workdir: PathBuf::from("."),
        }
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    #[must_use]
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }
}

/// A role or check either finished or was preempted by an external event.
enum Step<T> {
    Done(T),
    Interrupted(Event),
}

fn preempts(event: &Event) -> bool {
    matches!(event.kind, EventKind::StallDetected | EventKind::RunAborted)
}

pub struct LoopController {
    run_id: String,
    task: String,
    policy: Policy,
    workdir: PathBuf,
    registry: Arc<RoleRegistry>,
    gate: VerifierGate,
    bus: EventBus,
    sink: Arc<dyn EventSink>,
    projection: RunProjection,
    snapshot_tx: watch::Sender<RunSnapshot>,
}

impl LoopController {
    /// Create the controller for one run.
    ///
    /// The policy is checked against the roster here; a bad policy never
    /// produces a run.
    pub fn new(
        spec: RunSpec,
        registry: Arc<RoleRegistry>,
        verifier: Arc<dyn Verifier>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        registry.validate(&spec.policy)?;

        let mut bus = EventBus::new(&spec.run_id, Arc::clone(&sink));
        for (kind, role) in registry.subscriptions() {
            bus.subscribe(&spec.run_id, kind, role)?;
        }
        bus.seal();

        let gate = VerifierGate::new(&spec.run_id, registry.verifier_id().clone(), verifier, &spec.workdir);
        let mut projection = RunProjection::new(&spec.run_id);
        projection.task = spec.task.clone();
        let (snapshot_tx, _) = watch::channel(projection.snapshot());

        Ok(Self {
            run_id: spec.run_id,
            task: spec.task,
            policy: spec.policy,
            workdir: spec.workdir,
            registry,
            gate,
            bus,
            sink,
            projection,
            snapshot_tx,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Sender for watchdog reports and cancel requests
    pub fn publisher(&self) -> BusPublisher {
        self.bus.publisher()
    }

    /// Snapshot stream, updated after every event
    pub fn watch(&self) -> watch::Receiver<RunSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Read-only stream of every logged event
    pub fn observe(&self) -> broadcast::Receiver<Event> {
        self.bus.observe()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.projection.snapshot()
    }

    pub fn events(&self) -> &[Event] {
        self.bus.log()
    }

    pub fn gate(&self) -> &VerifierGate {
        &self.gate
    }

    /// Drive the run until it passes or is aborted.
    ///
    /// If the sink already holds events for this run id, the run is resumed
    /// from them instead of started fresh.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        let existing = self.sink.load(&self.run_id)?;
        if existing.is_empty() {
            info!(
                run_id = %self.run_id,
                max_iterations = self.policy.max_iterations,
                "run started"
            );
            let start = Event::task_start(&self.run_id, &self.task);
            self.route_and_publish(start)?;
        } else {
            self.resume(existing)?;
        }

        loop {
            if let Some(outcome) = self.projection.outcome() {
                self.finish(&outcome)?;
                return Ok(outcome);
            }
            if let Some(external) = self.bus.try_recv_external() {
                self.handle_external(external)?;
                continue;
            }
            match self.bus.next_delivery() {
                Some(delivery) => self.dispatch(delivery).await?,
                None => {
                    debug!(run_id = %self.run_id, state = %self.projection.state, "nothing queued, waiting");
                    let external = self.bus.recv_external().await.ok_or_else(|| {
                        VloopError::InvalidState(format!("run {} lost its external channel", self.run_id))
                    })?;
                    self.handle_external(external)?;
                }
            }
        }
    }

    fn finish(&mut self, outcome: &RunOutcome) -> Result<()> {
        self.bus.halt();
        // Late arrivals are kept for audit only
        while let Some(late) = self.bus.try_recv_external() {
            debug!(run_id = %self.run_id, kind = %late.kind, "event after terminal state");
            self.publish(late)?;
        }
        match outcome {
            RunOutcome::Passed { iteration } => {
                info!(run_id = %self.run_id, iteration, "run passed");
            }
            RunOutcome::Aborted { reason, iteration, diagnostics } => {
                warn!(run_id = %self.run_id, reason = %reason, iteration, diagnostics = %diagnostics, "run aborted");
            }
        }
        Ok(())
    }

    fn resume(&mut self, events: Vec<Event>) -> Result<()> {
        self.projection = RunProjection::replay(&self.run_id, &events);
        let count = events.len();
        self.bus.restore(events)?;
        if !self.projection.task.is_empty() {
            self.task = self.projection.task.clone();
        }
        self.snapshot_tx.send_replace(self.projection.snapshot());
        info!(
            run_id = %self.run_id,
            events = count,
            state = %self.projection.state,
            iteration = self.projection.iteration,
            "resuming run"
        );

        if self.projection.is_terminal() {
            return Ok(());
        }
        let Some(last) = self.bus.last().cloned() else {
            return Ok(());
        };

        match last.kind {
            EventKind::StallDetected => {
                let detail = last.diagnostics().unwrap_or("stall").to_string();
                self.recover(&detail)
            }
            kind if kind.is_controller_handled() => Ok(()),
            EventKind::TestFailed if self.projection.iteration > self.policy.max_iterations => self.budget_exhausted(),
            _ => {
                let target = match &last.target {
                    Some(target) => self.registry.route(&last).map(|_| target.clone()),
                    None => self.registry.route(&last),
                };
                match target {
                    Ok(target) => {
                        debug!(run_id = %self.run_id, seq = last.seq, role = %target, "redelivering last event");
                        self.bus.redeliver(last.seq, target)
                    }
                    Err(e) => self.abort(AbortReason::Unroutable, &e.to_string()),
                }
            }
        }
    }

    async fn dispatch(&mut self, delivery: Delivery) -> Result<()> {
        if self.registry.is_verifier(&delivery.role) {
            self.verify(delivery).await
        } else {
            self.invoke_role(delivery).await
        }
    }

    fn context_for(&self, event: &Event) -> RoleContext {
        RoleContext {
            run_id: self.run_id.clone(),
            task: self.task.clone(),
            iteration: self.projection.iteration,
            workdir: self.workdir.clone(),
            diagnostics: event
                .diagnostics()
                .map(str::to_string)
                .or_else(|| self.projection.last_diagnostics.clone()),
            context_reset: event.kind == EventKind::RecoveryInjected,
        }
    }

    async fn invoke_role(&mut self, delivery: Delivery) -> Result<()> {
        let Delivery { role, event } = delivery;
        let Some(handler) = self.registry.handler(&role) else {
            self.bus.ack(event.seq, &role)?;
            return self.abort(AbortReason::Unroutable, &format!("no implementation for role '{}'", role));
        };

        let ctx = self.context_for(&event);
        let timeout = self.policy.role_timeout(&role);
        debug!(
            run_id = %self.run_id,
            role = %role,
            kind = %event.kind,
            seq = event.seq,
            iteration = ctx.iteration,
            "delivering"
        );

        let step = {
            let work = tokio::time::timeout(timeout, handler.handle(&event, &ctx));
            tokio::pin!(work);
            loop {
                tokio::select! {
                    biased;
                    Some(external) = self.bus.recv_external() => {
                        if preempts(&external) {
                            break Step::Interrupted(external);
                        }
                        warn!(kind = %external.kind, "ignoring external event");
                    }
                    result = &mut work => break Step::Done(result),
                }
            }
        };

        let result = match step {
            Step::Interrupted(external) => {
                info!(run_id = %self.run_id, role = %role, kind = %external.kind, "role preempted");
                return self.handle_external(external);
            }
            Step::Done(result) => result,
        };

        self.bus.ack(event.seq, &role)?;
        let next = match result {
            Ok(Ok(output)) => self.role_event(handler.hat(), output),
            Ok(Err(e)) => {
                warn!(run_id = %self.run_id, role = %role, error = %e, "role failed");
                Event::role_failure(&self.run_id, self.projection.iteration, &role, &e.to_string())
            }
            Err(_) => {
                warn!(run_id = %self.run_id, role = %role, timeout_ms = timeout.as_millis() as u64, "role timed out");
                Event::role_failure(
                    &self.run_id,
                    self.projection.iteration,
                    &role,
                    &format!("role '{}' timed out after {}ms", role, timeout.as_millis()),
                )
            }
        };
        self.route_and_publish(next)
    }

    /// Turn a role's output into the event to publish, enforcing its
    /// produce contract.
    fn role_event(&self, hat: &Hat, output: RoleOutput) -> Event {
        let iteration = self.projection.iteration;
        let Some(mut kind) = output.kind.or_else(|| hat.primary_output()) else {
            return Event::role_failure(&self.run_id, iteration, &hat.id, "role produced no event");
        };

        let claimed = kind == EventKind::TestPassed;
        if claimed {
            // Only the gate may declare success; a claim goes to verification
            warn!(run_id = %self.run_id, role = %hat.id, "role claimed test.passed, treating as build.done");
            kind = EventKind::BuildDone;
        }
        if kind == EventKind::TaskStart || kind.is_controller_handled() || !(claimed || hat.produces(kind)) {
            return Event::role_failure(
                &self.run_id,
                iteration,
                &hat.id,
                &format!("contract violation: role '{}' may not emit {}", hat.id, kind),
            );
        }

        let mut payload = output.payload;
        if kind == EventKind::TestFailed {
            payload = match payload {
                Value::Object(mut map) => {
                    map.entry("origin").or_insert_with(|| Value::String(hat.id.to_string()));
                    Value::Object(map)
                }
                other => serde_json::json!({ "origin": hat.id, "diagnostics": other.to_string() }),
            };
        }
        Event::new(kind, &self.run_id, iteration, payload).with_source(&hat.id)
    }

    async fn verify(&mut self, delivery: Delivery) -> Result<()> {
        let Delivery { role, event: build } = delivery;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let step = {
                let check = self.gate.check(&build);
                tokio::pin!(check);
                loop {
                    tokio::select! {
                        biased;
                        Some(external) = self.bus.recv_external() => {
                            if preempts(&external) {
                                break Step::Interrupted(external);
                            }
                            warn!(kind = %external.kind, "ignoring external event");
                        }
                        result = &mut check => break Step::Done(result),
                    }
                }
            };

            match step {
                Step::Interrupted(external) => {
                    info!(run_id = %self.run_id, kind = %external.kind, "verification preempted");
                    return self.handle_external(external);
                }
                Step::Done(Ok(result)) => {
                    self.bus.ack(build.seq, &role)?;
                    let verdict = self.gate.outcome_event(&build, &result);
                    return self.route_and_publish(verdict);
                }
                Step::Done(Err(VloopError::VerificationInfra(msg))) if attempts < MAX_INFRA_ATTEMPTS => {
                    warn!(run_id = %self.run_id, attempt = attempts, error = %msg, "verification could not run, retrying");
                }
                Step::Done(Err(VloopError::VerificationInfra(msg))) => {
                    self.bus.ack(build.seq, &role)?;
                    let stall = Event::stall_detected(&self.run_id, self.projection.iteration, STALL_REASON_INFRA, &msg)
                        .with_source(CONTROLLER_SOURCE);
                    return self.stall(stall);
                }
                Step::Done(Err(e)) => return Err(e),
            }
        }
    }

    fn handle_external(&mut self, mut event: Event) -> Result<()> {
        event.iteration = self.projection.iteration;
        if self.projection.is_terminal() {
            return self.publish(event).map(|_| ());
        }
        match event.kind {
            EventKind::StallDetected => self.stall(event),
            EventKind::RunAborted => {
                info!(
                    run_id = %self.run_id,
                    reason = ?event.abort_reason(),
                    "abort requested"
                );
                self.publish(event).map(|_| ())
            }
            other => {
                warn!(run_id = %self.run_id, kind = %other, "ignoring external event");
                Ok(())
            }
        }
    }

    fn stall(&mut self, event: Event) -> Result<()> {
        let detail = event.diagnostics().unwrap_or("stall").to_string();
        warn!(
            run_id = %self.run_id,
            reason = event.payload["reason"].as_str().unwrap_or("unknown"),
            detail = %detail,
            "stall detected"
        );
        self.publish(event)?;
        self.recover(&detail)
    }

    /// Apply the stall recovery policy after a stall.detected
    fn recover(&mut self, detail: &str) -> Result<()> {
        let used = self.projection.recoveries;
        if self.policy.stall_recovery == StallRecovery::Replan && used < self.policy.max_stall_recoveries {
            let dropped = self.bus.clear_pending();
            info!(run_id = %self.run_id, attempt = used + 1, dropped, "injecting recovery");
            let recovery = Event::recovery_injected(&self.run_id, self.projection.iteration, used + 1, detail);
            self.route_and_publish(recovery)
        } else {
            self.abort(AbortReason::Stalled, &VloopError::StallTimeout(detail.to_string()).to_string())
        }
    }

    fn abort(&mut self, reason: AbortReason, diagnostics: &str) -> Result<()> {
        let event = Event::run_aborted(&self.run_id, self.projection.iteration, reason, diagnostics);
        self.publish(event).map(|_| ())
    }

    fn budget_exhausted(&mut self) -> Result<()> {
        let last = self.projection.last_diagnostics.clone().unwrap_or_default();
        let msg = format!(
            "{}; last failure: {}",
            VloopError::BudgetExhausted(self.policy.max_iterations),
            last
        );
        self.abort(AbortReason::BudgetExhausted, &msg)
    }

    /// Resolve the target, publish, and apply the follow-up policy.
    ///
    /// An event nobody can take is still logged, then the run is aborted
    /// as unroutable.
    fn route_and_publish(&mut self, mut event: Event) -> Result<()> {
        if !event.kind.is_controller_handled() {
            if event.kind == EventKind::TestFailed && event.target.is_none() {
                let origin = event.origin().or_else(|| event.source.clone());
                match origin {
                    Some(origin) => match self.registry.retry_target_for(&self.policy, &origin) {
                        Ok(target) => event.target = Some(target),
                        Err(e) => return self.unroutable(event, e),
                    },
                    None => {
                        let e = VloopError::Routing("test.failed without an origin".to_string());
                        return self.unroutable(event, e);
                    }
                }
            }
            match self.registry.route(&event) {
                Ok(target) => event.target = Some(target),
                Err(e) => return self.unroutable(event, e),
            }
        }

        let kind = event.kind;
        let recipients = self.publish(event)?;
        if self.projection.is_terminal() {
            return Ok(());
        }
        if recipients.is_empty() && !kind.is_controller_handled() {
            return self.abort(AbortReason::Unroutable, &format!("{} has no recipient", kind));
        }
        if kind == EventKind::TestFailed && self.projection.iteration > self.policy.max_iterations {
            return self.budget_exhausted();
        }
        Ok(())
    }

    fn unroutable(&mut self, event: Event, error: VloopError) -> Result<()> {
        warn!(run_id = %self.run_id, kind = %event.kind, error = %error, "unroutable event");
        self.publish(event)?;
        if self.projection.is_terminal() {
            return Ok(());
        }
        self.abort(AbortReason::Unroutable, &error.to_string())
    }

    /// Append to the log and fold into the projection.
    fn publish(&mut self, event: Event) -> Result<Vec<RoleId>> {
        let recipients = self.bus.publish(event)?;
        if let Some(logged) = self.bus.last() {
            debug!(
                run_id = %self.run_id,
                seq = logged.seq,
                kind = %logged.kind,
                target = ?logged.target,
                "event published"
            );
            self.projection.apply(logged);
        }
        self.snapshot_tx.send_replace(self.projection.snapshot());
        if self.projection.is_terminal() {
            self.bus.halt();
        }
        Ok(recipients)
    }
}

impl std::fmt::Debug for LoopController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopController")
            .field("run_id", &self.run_id)
            .field("state", &self.projection.state)
            .field("iteration", &self.projection.iteration)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunState, VerificationResult};
    use crate::roles::{PassthroughRole, Role};
    use crate::storage::MemoryEventLog;
    use crate::verifier::VerifyRequest;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Verdicts in order; `None` is an infrastructure error. Once the script
    /// runs out the last verdict repeats.
    struct ScriptedVerifier {
        script: Mutex<VecDeque<Option<bool>>>,
        last: Mutex<Option<bool>>,
    }

    impl ScriptedVerifier {
        fn new(script: &[Option<bool>]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                last: Mutex::new(Some(false)),
            })
        }
    }

    #[async_trait]
    impl Verifier for ScriptedVerifier {
        async fn verify(&self, request: &VerifyRequest) -> Result<VerificationResult> {
            let next = self.script.lock().unwrap().pop_front();
            let verdict = match next {
                Some(v) => {
                    *self.last.lock().unwrap() = v;
                    v
                }
                None => *self.last.lock().unwrap(),
            };
            match verdict {
                Some(true) => Ok(VerificationResult::pass("all tests passed")),
                Some(false) => Ok(VerificationResult::fail(
                    format!("test failed at iteration {}", request.iteration),
                    1,
                )),
                None => Err(VloopError::VerificationInfra("runner unavailable".into())),
            }
        }
    }

    /// Builder that misbehaves on its first `bad_calls` invocations.
    struct FlakyBuilder {
        hat: Hat,
        bad_calls: usize,
        calls: AtomicUsize,
        mode: Flake,
    }

    #[derive(Clone, Copy)]
    enum Flake {
        Error,
        Hang,
        ClaimSuccess,
    }

    impl FlakyBuilder {
        fn new(mode: Flake, bad_calls: usize) -> Arc<Self> {
            Arc::new(Self {
                hat: Hat::builder(),
                bad_calls,
                calls: AtomicUsize::new(0),
                mode,
            })
        }
    }

    #[async_trait]
    impl Role for FlakyBuilder {
        fn hat(&self) -> &Hat {
            &self.hat
        }

        async fn handle(&self, _event: &Event, _ctx: &RoleContext) -> Result<RoleOutput> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n >= self.bad_calls {
                return Ok(RoleOutput::primary(serde_json::json!({"built": n})));
            }
            match self.mode {
                Flake::Error => Err(VloopError::role_failed("builder", "compiler crashed")),
                Flake::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(RoleOutput::primary(Value::Null))
                }
                Flake::ClaimSuccess => Ok(RoleOutput::new(EventKind::TestPassed, Value::Null)),
            }
        }
    }

    async fn wait_until_called(builder: &FlakyBuilder) {
        while builder.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn passthrough(hat: Hat) -> Arc<dyn Role> {
        Arc::new(PassthroughRole::new(hat))
    }

    fn registry_with(builder: Arc<dyn Role>) -> Arc<RoleRegistry> {
        Arc::new(RoleRegistry::with_roles(vec![passthrough(Hat::planner()), builder]).unwrap())
    }

    fn default_registry() -> Arc<RoleRegistry> {
        registry_with(passthrough(Hat::builder()))
    }

    fn controller(policy: Policy, registry: Arc<RoleRegistry>, verifier: Arc<dyn Verifier>) -> LoopController {
        let spec = RunSpec::new("make the tests pass", policy).with_run_id("run-ctl");
        LoopController::new(spec, registry, verifier, Arc::new(MemoryEventLog::new())).unwrap()
    }

    fn count(events: &[Event], kind: EventKind) -> usize {
        events.iter().filter(|e| e.kind == kind).count()
    }

    #[tokio::test]
    async fn test_passes_first_time() {
        let mut ctl = controller(Policy::default(), default_registry(), ScriptedVerifier::new(&[Some(true)]));
        let outcome = ctl.run().await.unwrap();
        assert_eq!(outcome, RunOutcome::Passed { iteration: 1 });

        let kinds: Vec<EventKind> = ctl.events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::TaskStart, EventKind::PlanReady, EventKind::BuildDone, EventKind::TestPassed]
        );
        assert_eq!(ctl.events()[1].target, Some(RoleId::new("builder")));
        assert_eq!(ctl.events()[2].target, Some(RoleId::new("verifier")));
        assert!(ctl.gate().has_pass());
    }

    #[tokio::test]
    async fn test_fails_twice_then_passes() {
        let verifier = ScriptedVerifier::new(&[Some(false), Some(false), Some(true)]);
        let mut ctl = controller(Policy::default(), default_registry(), verifier);
        let outcome = ctl.run().await.unwrap();

        assert_eq!(outcome, RunOutcome::Passed { iteration: 3 });
        assert_eq!(count(ctl.events(), EventKind::TestFailed), 2);
        assert_eq!(count(ctl.events(), EventKind::TestPassed), 1);
        assert_eq!(ctl.gate().records().len(), 3);
        // Failures go back to the builder, not the planner
        assert_eq!(count(ctl.events(), EventKind::PlanReady), 1);
        for failed in ctl.events().iter().filter(|e| e.kind == EventKind::TestFailed) {
            assert_eq!(failed.target, Some(RoleId::new("builder")));
            assert_eq!(failed.origin(), Some(RoleId::new("builder")));
        }
    }

    #[tokio::test]
    async fn test_budget_exhausted_after_exact_cycles() {
        let policy = Policy::default().with_max_iterations(3);
        let mut ctl = controller(policy, default_registry(), ScriptedVerifier::new(&[Some(false)]));
        let outcome = ctl.run().await.unwrap();

        match &outcome {
            RunOutcome::Aborted { reason, diagnostics, .. } => {
                assert_eq!(*reason, AbortReason::BudgetExhausted);
                assert!(diagnostics.starts_with("Budget exhausted after 3 iterations"));
                assert!(diagnostics.contains("test failed at iteration 3"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(count(ctl.events(), EventKind::BuildDone), 3);
        assert_eq!(ctl.gate().records().len(), 3);
        assert_eq!(ctl.events().last().unwrap().kind, EventKind::RunAborted);
        assert!(!ctl.gate().has_pass());
    }

    #[tokio::test]
    async fn test_replay_matches_live_state() {
        let verifier = ScriptedVerifier::new(&[Some(false), Some(true)]);
        let mut ctl = controller(Policy::default(), default_registry(), verifier);
        ctl.run().await.unwrap();

        let replayed = RunProjection::replay(ctl.run_id(), ctl.events());
        assert_eq!(replayed.snapshot(), ctl.snapshot());
    }

    #[tokio::test]
    async fn test_single_infra_error_is_retried_for_free() {
        let verifier = ScriptedVerifier::new(&[None, Some(true)]);
        let mut ctl = controller(Policy::default(), default_registry(), verifier);
        let outcome = ctl.run().await.unwrap();

        assert_eq!(outcome, RunOutcome::Passed { iteration: 1 });
        assert_eq!(ctl.gate().records().len(), 2);
        assert_eq!(count(ctl.events(), EventKind::TestFailed), 0);
    }

    #[tokio::test]
    async fn test_repeated_infra_error_stalls_then_recovers() {
        let verifier = ScriptedVerifier::new(&[None, None, Some(true)]);
        let mut ctl = controller(Policy::default(), default_registry(), verifier);
        let outcome = ctl.run().await.unwrap();

        assert_eq!(outcome, RunOutcome::Passed { iteration: 1 });
        let stall = ctl
            .events()
            .iter()
            .find(|e| e.kind == EventKind::StallDetected)
            .unwrap();
        assert_eq!(stall.payload["reason"], STALL_REASON_INFRA);
        let recovery = ctl
            .events()
            .iter()
            .find(|e| e.kind == EventKind::RecoveryInjected)
            .unwrap();
        assert_eq!(recovery.target, Some(RoleId::new("planner")));
        assert_eq!(count(ctl.events(), EventKind::PlanReady), 2);
    }

    #[tokio::test]
    async fn test_repeated_infra_error_aborts_without_recovery() {
        let policy = Policy::default().with_stall_recovery(StallRecovery::Abort, 0);
        let mut ctl = controller(policy, default_registry(), ScriptedVerifier::new(&[None]));
        let outcome = ctl.run().await.unwrap();

        match outcome {
            RunOutcome::Aborted { reason, diagnostics, .. } => {
                assert_eq!(reason, AbortReason::Stalled);
                assert!(diagnostics.starts_with("Stall timeout:"));
                assert!(diagnostics.contains("runner unavailable"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(ctl.gate().records().len(), 2);
    }

    #[tokio::test]
    async fn test_recoveries_are_bounded() {
        let mut ctl = controller(Policy::default(), default_registry(), ScriptedVerifier::new(&[None]));
        let outcome = ctl.run().await.unwrap();

        match outcome {
            RunOutcome::Aborted { reason, .. } => assert_eq!(reason, AbortReason::Stalled),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(count(ctl.events(), EventKind::RecoveryInjected), 1);
        assert_eq!(count(ctl.events(), EventKind::StallDetected), 2);
    }

    #[tokio::test]
    async fn test_role_error_consumes_iteration() {
        let builder = FlakyBuilder::new(Flake::Error, 1);
        let mut ctl = controller(Policy::default(), registry_with(builder), ScriptedVerifier::new(&[Some(true)]));
        let outcome = ctl.run().await.unwrap();

        assert_eq!(outcome, RunOutcome::Passed { iteration: 2 });
        let failed = ctl
            .events()
            .iter()
            .find(|e| e.kind == EventKind::TestFailed)
            .unwrap();
        assert_eq!(failed.payload["role_error"], true);
        assert!(failed.diagnostics().unwrap().contains("compiler crashed"));
        assert_eq!(ctl.gate().records().len(), 1);
    }

    #[tokio::test]
    async fn test_role_timeout_consumes_iteration() {
        let builder = FlakyBuilder::new(Flake::Hang, 1);
        let policy = Policy::default().with_role_timeout_ms("builder", 50);
        let mut ctl = controller(policy, registry_with(builder), ScriptedVerifier::new(&[Some(true)]));
        let outcome = ctl.run().await.unwrap();

        assert_eq!(outcome, RunOutcome::Passed { iteration: 2 });
        let failed = ctl
            .events()
            .iter()
            .find(|e| e.kind == EventKind::TestFailed)
            .unwrap();
        assert!(failed.diagnostics().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_claimed_success_goes_to_verification() {
        let builder = FlakyBuilder::new(Flake::ClaimSuccess, 1);
        let verifier = ScriptedVerifier::new(&[Some(false), Some(true)]);
        let mut ctl = controller(Policy::default(), registry_with(builder), verifier);
        let outcome = ctl.run().await.unwrap();

        // The claim was checked (and failed) like any build
        assert_eq!(outcome, RunOutcome::Passed { iteration: 2 });
        let passed: Vec<&Event> = ctl
            .events()
            .iter()
            .filter(|e| e.kind == EventKind::TestPassed)
            .collect();
        assert_eq!(passed.len(), 1);
        assert_eq!(passed[0].source, Some(RoleId::new("verifier")));
        assert_eq!(ctl.events()[2].kind, EventKind::BuildDone);
        assert_eq!(ctl.events()[2].source, Some(RoleId::new("builder")));
    }

    #[tokio::test]
    async fn test_retry_target_planner() {
        let policy = Policy::default().with_retry_target("builder", "planner");
        let verifier = ScriptedVerifier::new(&[Some(false), Some(true)]);
        let mut ctl = controller(policy, default_registry(), verifier);
        let outcome = ctl.run().await.unwrap();

        assert_eq!(outcome, RunOutcome::Passed { iteration: 2 });
        assert_eq!(count(ctl.events(), EventKind::PlanReady), 2);
        let failed = ctl
            .events()
            .iter()
            .find(|e| e.kind == EventKind::TestFailed)
            .unwrap();
        assert_eq!(failed.target, Some(RoleId::new("planner")));
    }

    #[test]
    fn test_planner_without_failure_route_rejected() {
        // The planner can crash, but nobody would receive its test.failed
        let planner = Hat::planner().consuming(&[EventKind::TaskStart, EventKind::RecoveryInjected]);
        let registry = Arc::new(RoleRegistry::with_roles(vec![passthrough(planner), passthrough(Hat::builder())]).unwrap());
        let spec = RunSpec::new("t", Policy::default()).with_run_id("run-ctl");
        let sink = Arc::new(MemoryEventLog::new());
        let err = LoopController::new(spec, registry, ScriptedVerifier::new(&[Some(true)]), sink.clone()).unwrap_err();

        assert!(matches!(err, VloopError::PolicyViolation(_)));
        assert!(!sink.exists("run-ctl").unwrap());
    }

    #[tokio::test]
    async fn test_event_without_consumer_aborts() {
        // Replan is off, so nobody consumes recovery.injected
        let planner = Hat::planner().consuming(&[EventKind::TaskStart, EventKind::TestFailed]);
        let builder = Hat::builder().producing(&[EventKind::BuildDone, EventKind::RecoveryInjected]);

        struct Resetter(Hat);

        #[async_trait]
        impl Role for Resetter {
            fn hat(&self) -> &Hat {
                &self.0
            }

            async fn handle(&self, _event: &Event, _ctx: &RoleContext) -> Result<RoleOutput> {
                Ok(RoleOutput::new(EventKind::RecoveryInjected, Value::Null))
            }
        }

        let registry = Arc::new(
            RoleRegistry::with_roles(vec![passthrough(planner), Arc::new(Resetter(builder)) as Arc<dyn Role>]).unwrap(),
        );
        let policy = Policy::default().with_stall_recovery(StallRecovery::Abort, 0);
        let mut ctl = controller(policy, registry, ScriptedVerifier::new(&[Some(true)]));
        let outcome = ctl.run().await.unwrap();

        match outcome {
            RunOutcome::Aborted { reason, .. } => assert_eq!(reason, AbortReason::Unroutable),
            other => panic!("unexpected outcome: {other:?}"),
        }
        // The event itself is still in the log
        assert_eq!(count(ctl.events(), EventKind::RecoveryInjected), 1);
        assert!(!ctl.gate().has_pass());
    }

    #[tokio::test]
    async fn test_cancel_preempts_role() {
        let builder = FlakyBuilder::new(Flake::Hang, 1);
        let mut ctl = controller(
            Policy::default(),
            registry_with(builder.clone()),
            ScriptedVerifier::new(&[Some(true)]),
        );
        let publisher = ctl.publisher();

        let handle = tokio::spawn(async move {
            let outcome = ctl.run().await;
            (outcome, ctl)
        });
        wait_until_called(&builder).await;
        publisher
            .send(Event::run_aborted("run-ctl", 0, AbortReason::Cancelled, "user cancelled"))
            .unwrap();

        let (outcome, ctl) = handle.await.unwrap();
        let outcome = outcome.unwrap();
        assert_eq!(outcome.exit_code(), 130);
        assert_eq!(ctl.snapshot().state, RunState::Aborted);
        assert_eq!(count(ctl.events(), EventKind::BuildDone), 0);
        // The controller stamps its own iteration on external events
        assert_eq!(ctl.events().last().unwrap().iteration, 1);
    }

    /// Verifier that never answers in time.
    struct SlowVerifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Verifier for SlowVerifier {
        async fn verify(&self, _request: &VerifyRequest) -> Result<VerificationResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(VerificationResult::pass("too late"))
        }
    }

    #[tokio::test]
    async fn test_cancel_during_check_is_recorded() {
        let verifier = Arc::new(SlowVerifier { calls: AtomicUsize::new(0) });
        let mut ctl = controller(Policy::default(), default_registry(), verifier.clone());
        let publisher = ctl.publisher();

        let handle = tokio::spawn(async move {
            let outcome = ctl.run().await;
            (outcome, ctl)
        });
        while verifier.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        publisher
            .send(Event::run_aborted("run-ctl", 0, AbortReason::Cancelled, "user cancelled"))
            .unwrap();

        let (outcome, ctl) = handle.await.unwrap();
        assert_eq!(outcome.unwrap().exit_code(), 130);
        let records = ctl.gate().records();
        assert_eq!(records.len(), 1);
        assert!(records[0].infra_error.is_some());
        assert!(!ctl.gate().has_pass());
        assert_eq!(count(ctl.events(), EventKind::TestPassed), 0);
    }

    #[tokio::test]
    async fn test_external_stall_replans() {
        let builder = FlakyBuilder::new(Flake::Hang, 1);
        let mut ctl = controller(
            Policy::default(),
            registry_with(builder.clone()),
            ScriptedVerifier::new(&[Some(true)]),
        );
        let publisher = ctl.publisher();

        let handle = tokio::spawn(async move {
            let outcome = ctl.run().await;
            (outcome, ctl)
        });
        wait_until_called(&builder).await;
        publisher
            .send(
                Event::stall_detected("run-ctl", 0, "timeout", "no activity")
                    .with_source(crate::domain::WATCHDOG_SOURCE),
            )
            .unwrap();

        let (outcome, ctl) = handle.await.unwrap();
        assert_eq!(outcome.unwrap(), RunOutcome::Passed { iteration: 1 });
        let kinds: Vec<EventKind> = ctl.events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::TaskStart,
                EventKind::PlanReady,
                EventKind::StallDetected,
                EventKind::RecoveryInjected,
                EventKind::PlanReady,
                EventKind::BuildDone,
                EventKind::TestPassed,
            ]
        );
    }

    #[tokio::test]
    async fn test_resume_continues_from_log() {
        let sink = Arc::new(MemoryEventLog::new());
        {
            let mut bus = EventBus::new("run-ctl", sink.clone());
            bus.publish(Event::task_start("run-ctl", "resume me").with_target("planner"))
                .unwrap();
            bus.publish(
                Event::new(EventKind::PlanReady, "run-ctl", 1, Value::Null)
                    .with_source("planner")
                    .with_target("builder"),
            )
            .unwrap();
        }

        let spec = RunSpec::new("ignored", Policy::default()).with_run_id("run-ctl");
        let mut ctl =
            LoopController::new(spec, default_registry(), ScriptedVerifier::new(&[Some(true)]), sink.clone()).unwrap();
        let outcome = ctl.run().await.unwrap();

        assert_eq!(outcome, RunOutcome::Passed { iteration: 1 });
        assert_eq!(ctl.snapshot().task, "resume me");
        assert_eq!(count(ctl.events(), EventKind::TaskStart), 1);
        assert_eq!(sink.load("run-ctl").unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_resume_of_finished_run_is_noop() {
        let sink = Arc::new(MemoryEventLog::new());
        let spec = RunSpec::new("t", Policy::default()).with_run_id("run-ctl");
        let mut first =
            LoopController::new(spec.clone(), default_registry(), ScriptedVerifier::new(&[Some(true)]), sink.clone())
                .unwrap();
        first.run().await.unwrap();

        let mut second =
            LoopController::new(spec, default_registry(), ScriptedVerifier::new(&[Some(false)]), sink.clone()).unwrap();
        assert_eq!(second.run().await.unwrap(), RunOutcome::Passed { iteration: 1 });
        assert_eq!(second.gate().records().len(), 0);
        assert_eq!(sink.load("run-ctl").unwrap().len(), 4);
    }

    #[test]
    fn test_bad_policy_rejected_at_creation() {
        let reviewer = Hat::new("reviewer", crate::domain::RoleKind::Custom).consuming(&[EventKind::TestFailed]);
        let registry = Arc::new(
            RoleRegistry::with_roles(vec![
                passthrough(Hat::planner()),
                passthrough(Hat::builder()),
                passthrough(reviewer),
            ])
            .unwrap(),
        );
        let policy = Policy::default().with_retry_target("builder", "reviewer");
        let spec = RunSpec::new("t", policy);
        let err = LoopController::new(spec, registry, ScriptedVerifier::new(&[]), Arc::new(MemoryEventLog::new()))
            .unwrap_err();
        assert!(matches!(err, VloopError::PolicyViolation(_)));
    }

    #[tokio::test]
    async fn test_snapshot_watch_sees_terminal_state() {
        let mut ctl = controller(Policy::default(), default_registry(), ScriptedVerifier::new(&[Some(true)]));
        let watch = ctl.watch();
        ctl.run().await.unwrap();
        assert_eq!(watch.borrow().state, RunState::Passed);
        assert_eq!(watch.borrow().event_count, 4);
    }
}
