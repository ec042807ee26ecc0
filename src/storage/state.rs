//! Durable per-period state
//!
//! One JSON file holds exactly one [`PeriodRecord`] per period, keyed by
//! `YYYY-MM`. The whole file is loaded when the store opens and rewritten
//! after every change, through a temporary file and a rename so that a killed
//! process leaves either the previous or the new contents.
//!
//! Example format:
//! ```json
//! {
//!   "version": 1,
//!   "updated_at": "2025-08-01T06:00:00Z",
//!   "periods": {
//!     "2025-07": {
//!       "period": { "year": 2025, "month": 7, "day_start": 1, "day_end": 31 },
//!       "status": "succeeded",
//!       "last_error_kind": null,
//!       "last_attempt_count": 3,
//!       ...
//!     }
//!   }
//! }
//! ```

use crate::error::{Error, PeriodFailure, Result};
use crate::etl::{ErrorKind, Period};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodStatus {
    Pending,
    Succeeded,
    Failed,
}

impl std::fmt::Display for PeriodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Latest known outcome of one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodRecord {
    pub period: Period,
    pub status: PeriodStatus,
    pub last_error_kind: Option<ErrorKind>,
    pub last_attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub rows: Option<usize>,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    pub updated_at: DateTime<Utc>,
}

impl PeriodRecord {
    fn pending(period: Period) -> Self {
        Self {
            period,
            status: PeriodStatus::Pending,
            last_error_kind: None,
            last_attempt_count: 0,
            last_error: None,
            rows: None,
            files: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    periods: BTreeMap<String, PeriodRecord>,
}

/// File-backed record set of period outcomes
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    records: BTreeMap<String, PeriodRecord>,
}

impl StateStore {
    /// Load the store at `path`, starting empty if the file does not exist
    ///
    /// # Errors
    /// Returns [`Error::State`] if the file exists but cannot be read or parsed
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            log::debug!("No state file at {}, starting fresh", path.display());
            return Ok(Self {
                path,
                records: BTreeMap::new(),
            });
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::State(format!("failed to read {}: {}", path.display(), e)))?;
        let file: StateFile = serde_json::from_str(&content)
            .map_err(|e| Error::State(format!("failed to parse {}: {}", path.display(), e)))?;
        if file.version > STATE_VERSION {
            return Err(Error::State(format!(
                "{} was written by a newer version (state version {})",
                path.display(),
                file.version
            )));
        }

        // Re-key by period so a hand-edited file cannot smuggle in duplicates
        let records: BTreeMap<String, PeriodRecord> = file
            .periods
            .into_values()
            .map(|record| (record.period.key(), record))
            .collect();
        log::debug!(
            "Loaded {} period record(s) from {}",
            records.len(),
            path.display()
        );

        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, period: &Period) -> Option<&PeriodRecord> {
        self.records.get(&period.key())
    }

    pub fn status(&self, period: &Period) -> Option<PeriodStatus> {
        self.get(period).map(|r| r.status)
    }

    /// All records, oldest period first
    pub fn records(&self) -> impl Iterator<Item = &PeriodRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record that work on `period` is starting
    pub fn mark_pending(&mut self, period: &Period) -> Result<()> {
        let record = self
            .records
            .entry(period.key())
            .or_insert_with(|| PeriodRecord::pending(*period));
        record.status = PeriodStatus::Pending;
        record.updated_at = Utc::now();
        self.save()
    }

    /// Record a successful extraction and export
    pub fn mark_succeeded(
        &mut self,
        period: &Period,
        attempts: u32,
        rows: usize,
        files: Vec<PathBuf>,
    ) -> Result<()> {
        self.records.insert(
            period.key(),
            PeriodRecord {
                period: *period,
                status: PeriodStatus::Succeeded,
                last_error_kind: None,
                last_attempt_count: attempts,
                last_error: None,
                rows: Some(rows),
                files,
                updated_at: Utc::now(),
            },
        );
        self.save()
    }

    /// Record a period whose retries were exhausted
    pub fn mark_failed(&mut self, failure: &PeriodFailure) -> Result<()> {
        self.record_failure(
            &failure.period,
            Some(failure.last_error_kind),
            failure.attempts,
            failure.message.clone(),
        )
    }

    /// Record a failure that happened outside the query (export, validation)
    pub fn record_failure(
        &mut self,
        period: &Period,
        kind: Option<ErrorKind>,
        attempts: u32,
        message: String,
    ) -> Result<()> {
        self.records.insert(
            period.key(),
            PeriodRecord {
                period: *period,
                status: PeriodStatus::Failed,
                last_error_kind: kind,
                last_attempt_count: attempts,
                last_error: Some(message),
                rows: None,
                files: Vec::new(),
                updated_at: Utc::now(),
            },
        );
        self.save()
    }

    /// Remove one period's record. Returns whether it existed.
    pub fn remove(&mut self, period: &Period) -> Result<bool> {
        let existed = self.records.remove(&period.key()).is_some();
        if existed {
            self.save()?;
        }
        Ok(existed)
    }

    /// Remove every failed record. Returns how many were removed.
    pub fn remove_failed(&mut self) -> Result<usize> {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.status != PeriodStatus::Failed);
        let removed = before - self.records.len();
        if removed > 0 {
            self.save()?;
        }
        Ok(removed)
    }

    /// Remove every record
    pub fn clear(&mut self) -> Result<usize> {
        let removed = self.records.len();
        self.records.clear();
        self.save()?;
        Ok(removed)
    }

    /// Rewrite the whole file atomically
    pub fn save(&self) -> Result<()> {
        let file = StateFile {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            periods: self.records.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::State(format!("failed to serialize state: {}", e)))?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json)
            .map_err(|e| Error::State(format!("failed to write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            Error::State(format!("failed to replace {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }
}
