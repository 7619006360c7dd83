//! Watchdog: supervises running loops and reports stalls.

mod monitor;
mod tick;

pub use monitor::{REASON_REPEATED_FAILURE, REASON_TIMEOUT, RunHandle, Watchdog};
pub use tick::{TickConfig, TickResult, TickState};
