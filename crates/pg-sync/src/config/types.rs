//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default number of parallel restore jobs when the caller does not set one.
pub const DEFAULT_PARALLEL_JOBS: usize = 4;

/// What a migration carries across: schema, data, or both.
///
/// Chosen once per run and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationType {
    SchemaAndData,
    SchemaOnly,
    DataOnly,
}

impl MigrationType {
    /// The pg_dump filter flag for this migration type, if any.
    pub fn dump_flag(self) -> Option<&'static str> {
        match self {
            MigrationType::SchemaAndData => None,
            MigrationType::SchemaOnly => Some("--schema-only"),
            MigrationType::DataOnly => Some("--data-only"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationType::SchemaAndData => "schema_and_data",
            MigrationType::SchemaOnly => "schema_only",
            MigrationType::DataOnly => "data_only",
        }
    }
}

impl fmt::Display for MigrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Caller-owned knobs for a single migration run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Tables to migrate. Empty selects every table in the database.
    #[serde(default)]
    pub selected_tables: Vec<String>,

    /// Parallel restore jobs. `None` falls back to [`DEFAULT_PARALLEL_JOBS`].
    #[serde(default)]
    pub parallel_jobs: Option<usize>,

    /// Take a safety backup of the target before restoring over it.
    #[serde(default)]
    pub auto_backup: bool,
}

impl MigrationOptions {
    /// Effective parallel job count for pg_restore.
    pub fn jobs(&self) -> usize {
        match self.parallel_jobs {
            Some(n) if n > 0 => n,
            _ => DEFAULT_PARALLEL_JOBS,
        }
    }
}

/// Full configuration for one migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Source endpoint (`postgres://...` connection URL).
    pub source: String,

    /// Target endpoint (`postgres://...` connection URL).
    pub target: String,

    /// What to migrate.
    pub migration_type: MigrationType,

    /// Behavior knobs.
    #[serde(default)]
    pub options: MigrationOptions,
}
