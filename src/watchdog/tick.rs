//! Watchdog tick bookkeeping.

use std::time::Duration;

/// Configuration for the watchdog tick loop
#[derive(Debug, Clone)]
pub struct TickConfig {
    /// Interval between ticks
    pub tick_interval: Duration,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1000),
        }
    }
}

impl TickConfig {
    pub fn new(tick_interval: Duration) -> Self {
        Self { tick_interval }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }
}

/// What happened during one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickResult {
    /// Nothing to report
    Ok,
    /// Stall reports sent this tick
    Reported(usize),
}

/// Counters kept across ticks
#[derive(Debug, Default, Clone)]
pub struct TickState {
    pub tick_count: u64,
    /// Runs currently monitored
    pub monitored: usize,
    pub total_registered: u64,
    /// Runs dropped from monitoring after reaching a terminal state
    pub total_deregistered: u64,
    pub timeouts_reported: u64,
    pub repeats_reported: u64,
    pub shutdown_requested: bool,
}

impl TickState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self) {
        self.tick_count += 1;
    }

    pub fn registered(&mut self) {
        self.monitored += 1;
        self.total_registered += 1;
    }

    pub fn deregistered(&mut self, count: usize) {
        self.monitored = self.monitored.saturating_sub(count);
        self.total_deregistered += count as u64;
    }

    pub fn timeout_reported(&mut self) {
        self.timeouts_reported += 1;
    }

    pub fn repeat_reported(&mut self) {
        self.repeats_reported += 1;
    }

    pub fn total_reported(&self) -> u64 {
        self.timeouts_reported + self.repeats_reported
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }
}
