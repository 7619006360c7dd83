//! Run manager - starts runs side by side and keeps track of them.
//!
//! Every run gets its own controller on its own tokio task. The manager
//! keeps only the handles it needs to observe, cancel and join them, and
//! registers each run with the shared watchdog.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::BusPublisher;
use crate::controller::{LoopController, RunProjection, RunSpec};
use crate::domain::{AbortReason, Event, Policy, RunOutcome, RunSnapshot};
use crate::error::{Result, VloopError};
use crate::roles::RoleRegistry;
use crate::storage::EventSink;
use crate::verifier::{CommandVerifier, Verifier};
use crate::watchdog::{RunHandle, Watchdog};

/// Builds the verifier for a run from its policy
pub type VerifierFactory = Arc<dyn Fn(&Policy) -> Arc<dyn Verifier> + Send + Sync>;

struct ManagedRun {
    publisher: BusPublisher,
    snapshot: watch::Receiver<RunSnapshot>,
    handle: Option<JoinHandle<Result<RunOutcome>>>,
}

pub struct RunManager {
    registry: Arc<RoleRegistry>,
    sink: Arc<dyn EventSink>,
    watchdog: Arc<Watchdog>,
    verifier_factory: VerifierFactory,
    runs: HashMap<String, ManagedRun>,
}

impl RunManager {
    /// Runs are verified with their policy's `verify_command`.
    pub fn new(registry: Arc<RoleRegistry>, sink: Arc<dyn EventSink>, watchdog: Arc<Watchdog>) -> Self {
        Self {
            registry,
            sink,
            watchdog,
            verifier_factory: Arc::new(|policy: &Policy| {
                Arc::new(CommandVerifier::from_spec(policy.verify_command.clone())) as Arc<dyn Verifier>
            }),
            runs: HashMap::new(),
        }
    }

    /// Use one verifier for every run
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier_factory = Arc::new(move |_: &Policy| Arc::clone(&verifier));
        self
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    pub fn registry(&self) -> &Arc<RoleRegistry> {
        &self.registry
    }

    /// Create a run and start it in the background.
    ///
    /// Policy problems are reported here, before anything is logged.
    pub fn start(&mut self, spec: RunSpec) -> Result<String> {
        if self.runs.contains_key(&spec.run_id) {
            return Err(VloopError::InvalidState(format!("run {} is already managed", spec.run_id)));
        }

        let run_id = spec.run_id.clone();
        let policy = spec.policy.clone();
        let verifier = (self.verifier_factory)(&policy);
        let mut controller = LoopController::new(spec, Arc::clone(&self.registry), verifier, Arc::clone(&self.sink))?;

        let publisher = controller.publisher();
        let snapshot = controller.watch();
        self.watchdog
            .register(RunHandle::new(publisher.clone(), snapshot.clone(), &policy));

        let handle = tokio::spawn(async move { controller.run().await });
        info!(run_id = %run_id, max_iterations = policy.max_iterations, "run spawned");

        self.runs.insert(
            run_id.clone(),
            ManagedRun {
                publisher,
                snapshot,
                handle: Some(handle),
            },
        );
        Ok(run_id)
    }

    /// Wait for a run to reach a terminal state
    pub async fn wait(&mut self, run_id: &str) -> Result<RunOutcome> {
        let handle = self
            .runs
            .get_mut(run_id)
            .ok_or_else(|| VloopError::RunNotFound(run_id.to_string()))?
            .handle
            .take()
            .ok_or_else(|| VloopError::InvalidState(format!("run {} is already being waited on", run_id)))?;

        let outcome = join(run_id, handle).await;
        self.watchdog.deregister(run_id);
        outcome
    }

    /// Wait for every run that nobody is waiting on yet
    pub async fn wait_all(&mut self) -> Vec<(String, Result<RunOutcome>)> {
        let pending: Vec<(String, JoinHandle<Result<RunOutcome>>)> = self
            .runs
            .iter_mut()
            .filter_map(|(id, run)| run.handle.take().map(|h| (id.clone(), h)))
            .collect();

        let results = join_all(pending.into_iter().map(|(id, handle)| async move {
            let outcome = join(&id, handle).await;
            (id, outcome)
        }))
        .await;

        for (id, _) in &results {
            self.watchdog.deregister(id);
        }
        results
    }

    /// Ask a run to stop. The run ends aborted with reason `cancelled`.
    pub fn cancel(&self, run_id: &str) -> Result<()> {
        let run = self
            .runs
            .get(run_id)
            .ok_or_else(|| VloopError::RunNotFound(run_id.to_string()))?;
        if run.snapshot.borrow().is_terminal() {
            return Ok(());
        }
        info!(run_id = %run_id, "cancelling run");
        let iteration = run.snapshot.borrow().iteration;
        run.publisher
            .send(Event::run_aborted(run_id, iteration, AbortReason::Cancelled, "cancelled by request"))
    }

    /// Sender into a run's bus, for signal handlers that outlive a borrow of
    /// the manager
    pub fn publisher(&self, run_id: &str) -> Result<BusPublisher> {
        self.runs
            .get(run_id)
            .map(|run| run.publisher.clone())
            .ok_or_else(|| VloopError::RunNotFound(run_id.to_string()))
    }

    /// Cancel every run that is still going
    pub fn cancel_all(&self) {
        for run_id in self.runs.keys() {
            if let Err(e) = self.cancel(run_id) {
                warn!(run_id = %run_id, error = %e, "cancel failed");
            }
        }
    }

    /// Current snapshot of a run; runs not managed here are replayed from
    /// the sink.
    pub fn status(&self, run_id: &str) -> Result<RunSnapshot> {
        if let Some(run) = self.runs.get(run_id) {
            return Ok(run.snapshot.borrow().clone());
        }
        let events = self.sink.load(run_id)?;
        if events.is_empty() {
            return Err(VloopError::RunNotFound(run_id.to_string()));
        }
        Ok(RunProjection::replay(run_id, &events).snapshot())
    }

    /// Snapshots of the managed runs, ordered by run id
    pub fn list(&self) -> Vec<RunSnapshot> {
        let mut snapshots: Vec<RunSnapshot> = self.runs.values().map(|r| r.snapshot.borrow().clone()).collect();
        snapshots.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        snapshots
    }

    pub fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.keys().cloned().collect();
        ids.sort();
        ids
    }
}

async fn join(run_id: &str, handle: JoinHandle<Result<RunOutcome>>) -> Result<RunOutcome> {
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "run task died");
            Err(VloopError::InvalidState(format!("run {} task failed: {}", run_id, e)))
        }
    }
}
