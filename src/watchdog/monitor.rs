//! Watchdog - notices runs that stopped making progress.
//!
//! Each monitored run is a `RunHandle`: a read-only snapshot stream and the
//! sender into the run's bus. The watchdog never touches a run's state; it
//! only reports stall.detected and lets the run's controller decide.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::tick::{TickConfig, TickResult, TickState};
use crate::bus::BusPublisher;
use crate::domain::{Event, Policy, RunSnapshot, WATCHDOG_SOURCE};
use crate::id::now_ms;

pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_REPEATED_FAILURE: &str = "repeated_failure";

/// Observation point for one run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    run_id: String,
    snapshot: watch::Receiver<RunSnapshot>,
    publisher: BusPublisher,
    stall_threshold_ms: u64,
    repeat_failure_limit: usize,
}

impl RunHandle {
    pub fn new(publisher: BusPublisher, snapshot: watch::Receiver<RunSnapshot>, policy: &Policy) -> Self {
        Self {
            run_id: publisher.run_id().to_string(),
            snapshot,
            publisher,
            stall_threshold_ms: policy.stall_threshold_ms,
            repeat_failure_limit: policy.repeat_failure_limit,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

struct Monitored {
    handle: RunHandle,
    /// (last_activity, failure_count) of the episode already reported
    reported: Option<(u64, usize)>,
}

/// Whether the newest `limit` signatures are all the same
fn repeats(signatures: &[String], limit: usize) -> Option<&str> {
    if limit == 0 || signatures.len() < limit {
        return None;
    }
    let recent = &signatures[signatures.len() - limit..];
    let first = recent.first()?;
    recent.iter().all(|s| s == first).then_some(first.as_str())
}

pub struct Watchdog {
    config: TickConfig,
    runs: Mutex<HashMap<String, Monitored>>,
    state: Mutex<TickState>,
}

impl Watchdog {
    pub fn new(config: TickConfig) -> Self {
        Self {
            config,
            runs: Mutex::new(HashMap::new()),
            state: Mutex::new(TickState::new()),
        }
    }

    pub fn config(&self) -> &TickConfig {
        &self.config
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, Monitored>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tick_state(&self) -> MutexGuard<'_, TickState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start monitoring a run
    pub fn register(&self, handle: RunHandle) {
        debug!(run_id = %handle.run_id, threshold_ms = handle.stall_threshold_ms, "watchdog monitoring run");
        let previous = self.runs().insert(
            handle.run_id.clone(),
            Monitored {
                handle,
                reported: None,
            },
        );
        if previous.is_none() {
            self.tick_state().registered();
        }
    }

    pub fn deregister(&self, run_id: &str) -> bool {
        let removed = self.runs().remove(run_id).is_some();
        if removed {
            self.tick_state().deregistered(1);
        }
        removed
    }

    pub fn is_monitoring(&self, run_id: &str) -> bool {
        self.runs().contains_key(run_id)
    }

    pub fn monitored(&self) -> usize {
        self.runs().len()
    }

    pub fn state(&self) -> TickState {
        self.tick_state().clone()
    }

    /// Check every monitored run once
    pub fn tick(&self) -> TickResult {
        self.tick_at(now_ms())
    }

    /// Check every monitored run as of `now` (milliseconds since the epoch)
    pub fn tick_at(&self, now: u64) -> TickResult {
        let mut finished = Vec::new();
        let mut timeouts = 0;
        let mut repeated = 0;

        {
            let mut runs = self.runs();
            for (run_id, monitored) in runs.iter_mut() {
                let handle = &monitored.handle;
                let snapshot = handle.snapshot.borrow().clone();
                if snapshot.is_terminal() || handle.publisher.is_closed() {
                    finished.push(run_id.clone());
                    continue;
                }

                let episode = (snapshot.last_activity, snapshot.failure_count);
                if monitored.reported == Some(episode) {
                    continue;
                }

                let idle_ms = now.saturating_sub(snapshot.last_activity);
                let (reason, detail) =
                    if let Some(signature) = repeats(&snapshot.failure_signatures, handle.repeat_failure_limit) {
                        (
                            REASON_REPEATED_FAILURE,
                            format!(
                                "last {} failures share signature {}",
                                handle.repeat_failure_limit,
                                &signature[..signature.len().min(12)]
                            ),
                        )
                    } else if idle_ms >= handle.stall_threshold_ms {
                        (
                            REASON_TIMEOUT,
                            format!(
                                "no activity for {}ms (threshold {}ms) in state {}",
                                idle_ms, handle.stall_threshold_ms, snapshot.state
                            ),
                        )
                    } else {
                        continue;
                    };

                let event = Event::stall_detected(run_id, snapshot.iteration, reason, &detail).with_source(WATCHDOG_SOURCE);
                match handle.publisher.send(event) {
                    Ok(()) => {
                        info!(run_id = %run_id, reason, detail = %detail, "stall reported");
                        monitored.reported = Some(episode);
                        if reason == REASON_TIMEOUT {
                            timeouts += 1;
                        } else {
                            repeated += 1;
                        }
                    }
                    Err(e) => warn!(run_id = %run_id, error = %e, "could not report stall"),
                }
            }
            for run_id in &finished {
                runs.remove(run_id);
            }
        }

        let mut state = self.tick_state();
        state.tick();
        if !finished.is_empty() {
            debug!(count = finished.len(), "watchdog released finished runs");
            state.deregistered(finished.len());
        }
        for _ in 0..timeouts {
            state.timeout_reported();
        }
        for _ in 0..repeated {
            state.repeat_reported();
        }

        match timeouts + repeated {
            0 => TickResult::Ok,
            n => TickResult::Reported(n),
        }
    }

    /// Tick on a fixed interval until `shutdown` turns true or its sender
    /// goes away.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> TickState {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.config.tick_interval.as_millis() as u64, "watchdog started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let mut state = self.tick_state();
        state.request_shutdown();
        info!(ticks = state.tick_count, reported = state.total_reported(), "watchdog stopped");
        state.clone()
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new(TickConfig::default())
    }
}
