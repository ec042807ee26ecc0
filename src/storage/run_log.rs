//! Bounded execution log
//!
//! Every run appends one summary entry to a JSON array on disk. Only the
//! newest entries are kept.

use crate::etl::RunSummary;
use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_RETAINED_RUNS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub summary: RunSummary,
}

pub struct RunLog {
    path: PathBuf,
    retain: usize,
}

impl RunLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            retain: DEFAULT_RETAINED_RUNS,
        }
    }

    pub fn with_retain(mut self, retain: usize) -> Self {
        self.retain = retain.max(1);
        self
    }

    /// Read all entries, oldest first. A missing or unreadable log is empty.
    pub fn entries(&self) -> Vec<RunLogEntry> {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!(
                    "Ignoring unreadable execution log {}: {}",
                    self.path.display(),
                    e
                );
                Vec::new()
            }
        }
    }

    /// Append a run summary, dropping the oldest entries beyond the retention limit
    pub fn append(&self, summary: &RunSummary) -> Result<()> {
        let mut entries = self.entries();
        entries.push(RunLogEntry {
            timestamp: Utc::now(),
            summary: summary.clone(),
        });
        if entries.len() > self.retain {
            let excess = entries.len() - self.retain;
            entries.drain(..excess);
        }

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&entries)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write execution log: {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn summary(succeeded: usize) -> RunSummary {
        RunSummary {
            succeeded,
            ..RunSummary::default()
        }
    }

    #[test]
    fn test_append_and_retain() {
        let temp = TempDir::new().unwrap();
        let log = RunLog::new(temp.path().join("logs/execution_log.json")).with_retain(3);

        for i in 0..5 {
            log.append(&summary(i)).unwrap();
        }

        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].summary.succeeded, 2);
        assert_eq!(entries[2].summary.succeeded, 4);
    }

    #[test]
    fn test_unreadable_log_starts_over() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("execution_log.json");
        std::fs::write(&path, "garbage").unwrap();

        let log = RunLog::new(&path);
        assert!(log.entries().is_empty());
        log.append(&summary(1)).unwrap();
        assert_eq!(log.entries().len(), 1);
    }
}
