//! In-memory event sink, used by tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::RwLock;

use super::traits::EventSink;
use crate::domain::Event;
use crate::error::{Result, VloopError};

#[derive(Default)]
pub struct MemoryEventLog {
    runs: RwLock<HashMap<String, Vec<Event>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventSink for MemoryEventLog {
    fn append(&self, event: &Event) -> Result<()> {
        let mut runs = self.runs.write().map_err(|e| VloopError::Storage(e.to_string()))?;
        runs.entry(event.run_id.clone()).or_default().push(event.clone());
        Ok(())
    }

    fn load(&self, run_id: &str) -> Result<Vec<Event>> {
        let runs = self.runs.read().map_err(|e| VloopError::Storage(e.to_string()))?;
        Ok(runs.get(run_id).cloned().unwrap_or_default())
    }

    fn list_runs(&self) -> Result<Vec<String>> {
        let runs = self.runs.read().map_err(|e| VloopError::Storage(e.to_string()))?;
        let mut ids: Vec<String> = runs.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
