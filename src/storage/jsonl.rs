//! JSONL-based event log with in-memory caching.
//!
//! One file per run: `<base_path>/<run_id>.jsonl`, one event per line.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use super::traits::EventSink;
use crate::domain::Event;
use crate::error::{Result, VloopError};

/// JSONL-based event log with in-memory caching.
pub struct JsonlEventLog {
    base_path: PathBuf,
    cache: RwLock<HashMap<String, Vec<Event>>>,
}

impl JsonlEventLog {
    /// Create a new JsonlEventLog at the given path.
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get the file path for a run's log.
    fn log_path(&self, run_id: &str) -> Result<PathBuf> {
        if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id.starts_with('.') {
            return Err(VloopError::Storage(format!("Invalid run id: {:?}", run_id)));
        }
        Ok(self.base_path.join(format!("{}.jsonl", run_id)))
    }

    /// Load a run's log into cache if not already loaded.
    fn ensure_loaded(&self, run_id: &str) -> Result<()> {
        {
            let cache = self.cache.read().map_err(|e| VloopError::Storage(e.to_string()))?;
            if cache.contains_key(run_id) {
                return Ok(());
            }
        }

        let mut cache = self.cache.write().map_err(|e| VloopError::Storage(e.to_string()))?;
        if cache.contains_key(run_id) {
            return Ok(());
        }

        let path = self.log_path(run_id)?;
        let events = if path.exists() {
            let file = File::open(&path)?;
            let reader = BufReader::new(file);
            let mut events = Vec::new();
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let event: Event = serde_json::from_str(&line).map_err(|e| {
                    VloopError::Storage(format!("{}:{}: {}", path.display(), lineno + 1, e))
                })?;
                events.push(event);
            }
            events
        } else {
            Vec::new()
        };

        cache.insert(run_id.to_string(), events);
        Ok(())
    }

    /// Append an event to the run's JSONL file.
    fn append_to_file(&self, event: &Event) -> Result<()> {
        let path = self.log_path(&event.run_id)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(event)?)?;
        file.flush()?;
        Ok(())
    }
}

impl EventSink for JsonlEventLog {
    fn append(&self, event: &Event) -> Result<()> {
        self.ensure_loaded(&event.run_id)?;

        // File first (source of truth), then cache
        self.append_to_file(event)?;

        let mut cache = self.cache.write().map_err(|e| VloopError::Storage(e.to_string()))?;
        cache.entry(event.run_id.clone()).or_default().push(event.clone());
        Ok(())
    }

    fn load(&self, run_id: &str) -> Result<Vec<Event>> {
        self.ensure_loaded(run_id)?;

        let cache = self.cache.read().map_err(|e| VloopError::Storage(e.to_string()))?;
        Ok(cache.get(run_id).cloned().unwrap_or_default())
    }

    fn list_runs(&self) -> Result<Vec<String>> {
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                runs.push(stem.to_string());
            }
        }
        runs.sort();
        Ok(runs)
    }
}
