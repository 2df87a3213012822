//! Persisted migration history.
//!
//! Every run, success or failure, appends exactly one redacted record to a
//! JSON file, newest first, capped at [`HISTORY_LIMIT`] entries.

use crate::config::MigrationType;
use crate::error::{MigrateError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Maximum number of retained records.
pub const HISTORY_LIMIT: usize = 50;

/// Terminal status of a recorded run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

/// One persisted run. Endpoints are stored redacted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub target: String,
    pub migration_type: MigrationType,
    pub status: RunStatus,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Bounded newest-first record store backed by a JSON file.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    /// Open the store at its default location, `~/.pg-sync/history.json`,
    /// creating the directory if needed.
    pub fn open_default() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| MigrateError::Config("could not determine home directory".into()))?;
        let dir = home.join(".pg-sync");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join("history.json"),
        })
    }

    /// Open a store at an explicit path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Prepend a record, enforcing the retention bound.
    pub fn append(&self, record: MigrationRecord) -> Result<()> {
        // A corrupt or missing file starts a fresh history rather than
        // blocking the run from being recorded.
        let mut records = self.load().unwrap_or_default();
        records.insert(0, record);
        records.truncate(HISTORY_LIMIT);

        let data = serde_json::to_string_pretty(&records)?;
        std::fs::write(&self.path, data)?;
        Ok(())
    }

    /// Load all records, newest first. A missing file is an empty history.
    pub fn load(&self) -> Result<Vec<MigrationRecord>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records: Vec<MigrationRecord> = serde_json::from_str(&data)?;
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(seq: i64) -> MigrationRecord {
        MigrationRecord {
            timestamp: Utc::now() + Duration::seconds(seq),
            source: "postgres://src/app".to_string(),
            target: "postgres://tgt/app".to_string(),
            migration_type: MigrationType::SchemaAndData,
            status: RunStatus::Success,
            duration_seconds: 1.5,
            error: None,
        }
    }

    fn temp_store() -> (tempfile::TempDir, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::at(dir.path().join("history.json"));
        (dir, store)
    }

    #[test]
    fn test_missing_file_is_empty_history() {
        let (_dir, store) = temp_store();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_append_prepends_newest_first() {
        let (_dir, store) = temp_store();
        for seq in 0..3 {
            store.append(record(seq)).unwrap();
        }

        let records = store.load().unwrap();
        assert_eq!(records.len(), 3);
        assert!(records[0].timestamp > records[1].timestamp);
        assert!(records[1].timestamp > records[2].timestamp);
    }

    #[test]
    fn test_retention_bound() {
        let (_dir, store) = temp_store();
        for seq in 0..(HISTORY_LIMIT as i64 + 5) {
            store.append(record(seq)).unwrap();
        }

        let records = store.load().unwrap();
        assert_eq!(records.len(), HISTORY_LIMIT);
        // The newest records survive the cap.
        assert!(records[0].timestamp > records[HISTORY_LIMIT - 1].timestamp);
    }

    #[test]
    fn test_error_text_round_trips() {
        let (_dir, store) = temp_store();
        let mut failed = record(0);
        failed.status = RunStatus::Failed;
        failed.error = Some("restore failed: boom".to_string());
        store.append(failed).unwrap();

        let records = store.load().unwrap();
        assert_eq!(records[0].status, RunStatus::Failed);
        assert_eq!(records[0].error.as_deref(), Some("restore failed: boom"));
    }
}
