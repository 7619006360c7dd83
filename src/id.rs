//! ID generation utilities for vloop
//!
//! Provides functions for generating unique identifiers for runs and events.

use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a unique run ID
///
/// Format: `run-{timestamp_ms}-{random_hex}`
/// Example: `run-1738300800123-a1b2`
pub fn generate_run_id() -> String {
    let timestamp = now_ms();
    let random: u16 = rand::rng().random();
    format!("run-{}-{:04x}", timestamp, random)
}

/// Generate an event ID scoped to a run and its sequence number
///
/// Format: `evt-{run_id}-{seq:06}`
pub fn generate_event_id(run_id: &str, seq: u64) -> String {
    format!("evt-{}-{:06}", run_id, seq)
}
