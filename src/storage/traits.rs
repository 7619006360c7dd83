//! Persistence sink trait for run event logs.

use crate::domain::Event;
use crate::error::Result;

/// Append-only persistence for run event logs.
///
/// Written on every publish, read once at run start to resume.
pub trait EventSink: Send + Sync {
    /// Append one event to its run's log
    fn append(&self, event: &Event) -> Result<()>;

    /// Load the full log of a run, in publish order. Unknown runs yield an
    /// empty log.
    fn load(&self, run_id: &str) -> Result<Vec<Event>>;

    /// Ids of all runs that have a log
    fn list_runs(&self) -> Result<Vec<String>>;

    /// Whether any event has been persisted for the run
    fn exists(&self, run_id: &str) -> Result<bool> {
        Ok(!self.load(run_id)?.is_empty())
    }
}
