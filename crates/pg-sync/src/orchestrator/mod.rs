//! Migration pipeline orchestration.
//!
//! [`Migrator::run`] executes the ordered pipeline for one migration:
//! verify source → verify target → optional safety backup → dump → restore,
//! with an automatic rollback from the backup when the restore fails. The
//! pipeline is strictly sequential; it runs concurrently only with respect
//! to the consumer of its progress channel. Every run, success or failure,
//! yields a [`MigrationStats`], emits a terminal progress event, appends one
//! history record, and leaves a flushed-per-line audit log on disk.

use crate::check;
use crate::config::{redact_url, MigrationConfig, MigrationOptions, MigrationType};
use crate::error::{MigrateError, Result};
use crate::history::{HistoryStore, MigrationRecord, RunStatus};
use crate::progress::ProgressUpdate;
use crate::runner::{PgToolRunner, ToolInvocation, ToolRunner};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Restore output emitted when a dump from a newer server is restored into an
/// older one that does not understand the connection parameter the newer
/// format sets. Substring heuristic: pg_restore exposes no structured error
/// channel, so a future message format change silently stops matching.
pub const BENIGN_RESTORE_PATTERN: &str =
    r#"unrecognized configuration parameter "transaction_timeout""#;

/// Whether restore output matches the known-benign version-skew signature.
pub fn is_benign_restore_failure(output: &str) -> bool {
    output.contains(BENIGN_RESTORE_PATTERN)
}

/// Authoritative record of what a run did. Created at the start of a run,
/// mutated only by the engine, frozen once returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStats {
    pub run_id: String,
    pub migration_type: MigrationType,
    pub tables_migrated: usize,
    pub duration_seconds: f64,
    pub warnings: Vec<String>,
    /// Set if and only if the safety backup succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    pub did_rollback: bool,
    pub rollback_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

impl MigrationStats {
    fn new(migration_type: MigrationType) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            migration_type,
            tables_migrated: 0,
            duration_seconds: 0.0,
            warnings: Vec::new(),
            backup_path: None,
            did_rollback: false,
            rollback_success: false,
            log_path: None,
        }
    }
}

/// Result of a finished run. Stats are always present; `error` is set when
/// the run failed.
#[derive(Debug)]
pub struct RunOutcome {
    pub stats: MigrationStats,
    pub error: Option<MigrateError>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-run audit log: one timestamped line per event, written straight to an
/// unbuffered file so the trail survives a crash mid-run. The file is kept
/// after the run and its path surfaced through [`MigrationStats::log_path`].
struct RunLog {
    file: Option<std::fs::File>,
    path: Option<PathBuf>,
}

impl RunLog {
    fn create() -> Self {
        // A run without an audit trail is still a run; log creation failure
        // only degrades.
        let kept = tempfile::Builder::new()
            .prefix("pg_sync_migration_")
            .suffix(".log")
            .tempfile()
            .and_then(|file| file.keep().map_err(|e| e.error));

        match kept {
            Ok((file, path)) => Self {
                file: Some(file),
                path: Some(path),
            },
            Err(e) => {
                warn!("could not create migration log file: {e}");
                Self {
                    file: None,
                    path: None,
                }
            }
        }
    }

    fn line(&mut self, message: impl AsRef<str>) {
        if let Some(file) = self.file.as_mut() {
            let stamp = chrono::Local::now().format("%H:%M:%S");
            let _ = writeln!(file, "[{stamp}] {}", message.as_ref());
        }
    }
}

/// Migration pipeline engine. One instance runs exactly one migration;
/// [`Migrator::run`] consumes it.
pub struct Migrator {
    source: String,
    target: String,
    migration_type: MigrationType,
    options: MigrationOptions,
    runner: Arc<dyn ToolRunner>,
    history: Option<HistoryStore>,
    progress_tx: Option<mpsc::Sender<ProgressUpdate>>,
}

impl Migrator {
    /// Create an engine for a validated configuration.
    pub fn new(config: MigrationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source: config.source,
            target: config.target,
            migration_type: config.migration_type,
            options: config.options,
            runner: Arc::new(PgToolRunner),
            history: None,
            progress_tx: None,
        })
    }

    /// Replace the tool runner (tests, dry runs).
    pub fn with_runner(mut self, runner: Arc<dyn ToolRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Record history somewhere other than the default store.
    pub fn with_history(mut self, history: HistoryStore) -> Self {
        self.history = Some(history);
        self
    }

    /// Set progress channel for updates.
    pub fn with_progress(mut self, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// Run the migration to its terminal state.
    pub async fn run(self) -> RunOutcome {
        let started = Instant::now();
        let started_at = Utc::now();

        let mut stats = MigrationStats::new(self.migration_type);
        let mut log = RunLog::create();
        stats.log_path = log.path.clone();

        info!(
            "starting migration {} -> {} ({})",
            redact_url(&self.source),
            redact_url(&self.target),
            self.migration_type
        );

        let error = self.execute(&mut stats, &mut log).await.err();
        stats.duration_seconds = started.elapsed().as_secs_f64();

        match &error {
            None => log.line(format!(
                "Migration completed in {:.1}s",
                stats.duration_seconds
            )),
            Some(e) => log.line(format!("Migration failed: {e}")),
        }

        // Exactly one history record per run, success or failure.
        self.record_history(MigrationRecord {
            timestamp: started_at,
            source: redact_url(&self.source),
            target: redact_url(&self.target),
            migration_type: self.migration_type,
            status: match &error {
                None => RunStatus::Success,
                Some(_) => RunStatus::Failed,
            },
            duration_seconds: stats.duration_seconds,
            error: error.as_ref().map(|e| e.to_string()),
        });

        match &error {
            None => {
                self.send(
                    ProgressUpdate::step(1.0, "Step 5/5: Migration completed!")
                        .with_stats(stats.clone()),
                )
                .await
            }
            Some(e) => {
                self.send(ProgressUpdate::failed(e.to_string()).with_stats(stats.clone()))
                    .await
            }
        }

        RunOutcome { stats, error }
    }

    async fn execute(&self, stats: &mut MigrationStats, log: &mut RunLog) -> Result<()> {
        log.line(format!(
            "Starting migration {} -> {} (type: {})",
            redact_url(&self.source),
            redact_url(&self.target),
            self.migration_type
        ));

        if !self.options.selected_tables.is_empty() {
            stats.tables_migrated = self.options.selected_tables.len();
        }

        self.send(ProgressUpdate::step(0.0, "Preparing migration tasks..."))
            .await;

        // Step 1/5: connectivity. Either endpoint failing aborts before any
        // artifact is produced.
        self.send(
            ProgressUpdate::step(0.1, "Step 1/5: Verifying source connection...")
                .with_command(format!("pg_isready -d {}", redact_url(&self.source))),
        )
        .await;
        if let Err(e) = check::check_connection(self.runner.as_ref(), &self.source, "source database").await
        {
            log.line(format!("Source connection check failed: {e}"));
            return Err(e);
        }
        log.line("Source connection verified");

        self.send(
            ProgressUpdate::step(0.2, "Step 1/5: Verifying target connection...")
                .with_command(format!("pg_isready -d {}", redact_url(&self.target))),
        )
        .await;
        if let Err(e) = check::check_connection(self.runner.as_ref(), &self.target, "target database").await
        {
            log.line(format!("Target connection check failed: {e}"));
            return Err(e);
        }
        log.line("Target connection verified");

        // Step 2/5: safety backup. Failure degrades to a warning; the run
        // continues without a rollback safety net.
        if self.options.auto_backup {
            self.backup_target(stats, log).await;
        }

        // Step 3/5: dump the source into a temp artifact. The artifact is
        // removed when it drops, whatever the outcome of the run.
        self.send(ProgressUpdate::step(0.4, "Step 3/5: Dumping source database..."))
            .await;
        let dump_file = tempfile::Builder::new()
            .prefix("pg_sync_dump_")
            .suffix(".dump")
            .tempfile()?;
        let dump_path = dump_file.path().display().to_string();

        let mut dump_args: Vec<String> = vec![
            self.source.clone(),
            "-w".into(),
            "-Fc".into(),
            "-f".into(),
            dump_path.clone(),
        ];
        if let Some(flag) = self.migration_type.dump_flag() {
            dump_args.push(flag.into());
        }
        for table in &self.options.selected_tables {
            dump_args.push("-t".into());
            dump_args.push(table.clone());
        }
        dump_args.extend(["--no-owner".into(), "--no-privileges".into(), "--verbose".into()]);

        self.send(
            ProgressUpdate::step(0.5, "Step 3/5: Dumping content...").with_command(format!(
                "pg_dump {} ... (tables: {})",
                redact_url(&self.source),
                self.options.selected_tables.len()
            )),
        )
        .await;

        let dump = ToolInvocation::new("pg_dump", dump_args);
        log.line(format!(
            "Running dump command: {}",
            self.redacted_argv(&dump, &self.source)
        ));
        let out = self.runner.run(&dump).await?;
        if !out.success {
            log.line(format!("Dump failed: {}", out.output.trim()));
            return Err(MigrateError::tool("pg_dump", out.output.trim()));
        }

        match std::fs::metadata(dump_file.path()) {
            Ok(meta) => {
                log.line(format!("Dump file size: {} bytes", meta.len()));
                if meta.len() == 0 {
                    log.line("Error: dump file is empty");
                    return Err(MigrateError::EmptyArtifact);
                }
            }
            Err(e) => log.line(format!("Warning: could not check dump file size: {e}")),
        }

        // Step 4/5: parallel restore into the target, dropping existing
        // objects and ignoring ownership/privilege metadata.
        let jobs = self.options.jobs().to_string();
        self.send(
            ProgressUpdate::step(0.8, format!("Step 4/5: Parallel restore (j={jobs})..."))
                .with_command(format!(
                    "pg_restore -d {} -j {jobs} ...",
                    redact_url(&self.target)
                )),
        )
        .await;

        let restore = ToolInvocation::new(
            "pg_restore",
            [
                "-d",
                self.target.as_str(),
                "-w",
                "-j",
                jobs.as_str(),
                "-c",
                "--if-exists",
                "--no-owner",
                "--no-privileges",
                "--verbose",
                dump_path.as_str(),
            ],
        );
        log.line(format!(
            "Running restore command: {}",
            self.redacted_argv(&restore, &self.target)
        ));
        let out = self.runner.run(&restore).await?;

        if !out.success {
            let output = out.output.trim().to_string();
            if is_benign_restore_failure(&output) {
                log.line("Restore error matches the version-skew pattern, treating as warning");
                log.line(format!("Output: {output}"));
                stats.warnings.push(
                    "Ignored benign 'transaction_timeout' errors (newer pg_dump against an older server)"
                        .to_string(),
                );
            } else {
                log.line(format!("Restore failed: {output}"));
                return Err(self.attempt_rollback(stats, log, &jobs, output).await);
            }
        }

        Ok(())
    }

    /// Full dump of the target as a recovery artifact, named with the run
    /// timestamp and intentionally retained on disk.
    async fn backup_target(&self, stats: &mut MigrationStats, log: &mut RunLog) {
        let backup_file = format!("backup_target_{}.dump", Utc::now().timestamp());
        self.send(
            ProgressUpdate::step(0.3, "Step 2/5: Creating safety backup of target...")
                .with_command(format!(
                    "pg_dump -d {} -w -Fc -f {backup_file}",
                    redact_url(&self.target)
                )),
        )
        .await;

        let backup = ToolInvocation::new(
            "pg_dump",
            ["-d", self.target.as_str(), "-w", "-Fc", "-f", backup_file.as_str()],
        );
        log.line(format!(
            "Running backup command: {}",
            self.redacted_argv(&backup, &self.target)
        ));

        let failure = match self.runner.run(&backup).await {
            Ok(out) if out.success => {
                stats.backup_path = Some(PathBuf::from(&backup_file));
                log.line(format!("Safety backup created: {backup_file}"));
                self.send(ProgressUpdate::step(
                    0.35,
                    format!("Step 2/5: Safety backup created: {backup_file}"),
                ))
                .await;
                return;
            }
            Ok(out) => out.output.trim().to_string(),
            Err(e) => e.to_string(),
        };

        log.line(format!("Backup failed: {failure}"));
        warn!("safety backup failed, proceeding without rollback capability");
        stats.warnings.push(format!("Safety backup failed: {failure}"));
        self.send(
            ProgressUpdate::step(0.3, "Warning: Safety backup failed, proceeding...")
                .with_command(failure),
        )
        .await;
    }

    /// Restore the safety backup after a fatal restore error. Returns the
    /// final error for the run: the restore failure with the rollback
    /// outcome appended, never masking the original error.
    async fn attempt_rollback(
        &self,
        stats: &mut MigrationStats,
        log: &mut RunLog,
        jobs: &str,
        restore_output: String,
    ) -> MigrateError {
        let Some(backup_path) = stats.backup_path.clone() else {
            return MigrateError::tool("pg_restore", restore_output);
        };
        let backup = backup_path.display().to_string();

        stats.did_rollback = true;
        self.send(ProgressUpdate::step(
            0.85,
            "Restore failed! Attempting rollback from backup...",
        ))
        .await;

        let rollback = ToolInvocation::new(
            "pg_restore",
            ["-d", self.target.as_str(), "-w", "-c", "--if-exists", "-j", jobs, backup.as_str()],
        );
        log.line(format!(
            "Running rollback command: {}",
            self.redacted_argv(&rollback, &self.target)
        ));

        let failure = match self.runner.run(&rollback).await {
            Ok(out) if out.success => {
                stats.rollback_success = true;
                log.line("Rollback successful");
                self.send(ProgressUpdate::step(
                    0.9,
                    "Rollback successful! Target database restored to previous state.",
                ))
                .await;
                return MigrateError::tool(
                    "pg_restore",
                    format!("{restore_output} (rolled back successfully)"),
                );
            }
            Ok(out) => out.output.trim().to_string(),
            Err(e) => e.to_string(),
        };

        log.line(format!("Rollback failed: {failure}"));
        stats.rollback_success = false;
        stats.warnings.push(format!("Rollback also failed: {failure}"));
        MigrateError::tool(
            "pg_restore",
            format!("{restore_output} (rollback also failed)"),
        )
    }

    fn record_history(&self, record: MigrationRecord) {
        let result = match &self.history {
            Some(store) => store.append(record),
            None => HistoryStore::open_default().and_then(|store| store.append(record)),
        };
        if let Err(e) = result {
            warn!("failed to record migration history: {e}");
        }
    }

    /// Render an invocation for the audit log with the endpoint redacted.
    fn redacted_argv(&self, invocation: &ToolInvocation, url: &str) -> String {
        let mut parts = Vec::with_capacity(invocation.args.len() + 1);
        parts.push(invocation.program.clone());
        for arg in &invocation.args {
            if arg == url {
                parts.push(redact_url(url));
            } else {
                parts.push(arg.clone());
            }
        }
        parts.join(" ")
    }

    async fn send(&self, update: ProgressUpdate) {
        if let Some(tx) = &self.progress_tx {
            // Capacity covers a full run's events; a vanished consumer is
            // not an engine error.
            let _ = tx.send(update).await;
        }
    }
}
