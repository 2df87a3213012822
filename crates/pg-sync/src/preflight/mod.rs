//! Pre-flight diagnostics.
//!
//! [`Estimator::estimate`] fans out five independent probes against the
//! source and target endpoints, then aggregates them into an
//! [`EstimationResult`]. Probes run as spawned tasks and report over a
//! channel; a single aggregator merges reports sequentially, so there is no
//! shared mutable state. Connectivity failures on either endpoint are fatal
//! for the whole estimation; every other probe failure degrades to a yellow
//! check. The aggregator always drains every probe before returning.

use crate::check::{self, QUERY_TIMEOUT};
use crate::error::{MigrateError, Result};
use crate::progress::ProgressUpdate;
use crate::runner::{ToolInvocation, ToolRunner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const PROBE_COUNT: usize = 5;

/// Connection-pooler port marker. Pooled connections multiplex transactions
/// and interact poorly with parallel restore, so their presence is flagged.
const POOLER_PORT: &str = ":6543";

const VERSION_SQL: &str = "SHOW server_version;";
const SIZE_SQL: &str = "SELECT pg_size_pretty(pg_database_size(current_database()));";
const TABLE_COUNT_SQL: &str =
    "SELECT count(*) FROM information_schema.tables WHERE table_schema = 'public';";
const EXTENSIONS_SQL: &str = "SELECT extname FROM pg_extension;";

/// Severity of a single diagnostic check. Informational only; a red check
/// never blocks a migration, the caller decides whether to proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Green,
    Yellow,
    Red,
}

/// One diagnostic finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

impl CheckResult {
    fn green(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Green,
            message: message.into(),
        }
    }

    fn yellow(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Yellow,
            message: message.into(),
        }
    }

    fn red(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Red,
            message: message.into(),
        }
    }
}

/// Aggregated pre-flight report. Immutable once returned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EstimationResult {
    pub source_version: String,
    pub target_version: String,
    pub db_size: String,
    pub table_count: usize,
    pub checks: Vec<CheckResult>,
}

enum ProbeReport {
    SourceVersion(Result<String>),
    TargetVersion(Result<String>),
    DbSize(Result<String>),
    TableCount(Result<usize>),
    Extensions(Result<ExtensionLists>),
}

struct ExtensionLists {
    source: Vec<String>,
    target: Vec<String>,
}

/// Concurrent pre-flight estimator.
pub struct Estimator {
    runner: Arc<dyn ToolRunner>,
    progress_tx: Option<mpsc::Sender<ProgressUpdate>>,
}

impl Estimator {
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            runner,
            progress_tx: None,
        }
    }

    /// Set progress channel for updates.
    pub fn with_progress(mut self, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    async fn send_progress(&self, update: ProgressUpdate) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(update).await;
        }
    }

    /// Run all probes and aggregate the report.
    pub async fn estimate(&self, source: &str, target: &str) -> Result<EstimationResult> {
        crate::config::validate_url(source)?;
        crate::config::validate_url(target)?;

        let (tx, mut rx) = mpsc::channel::<ProbeReport>(PROBE_COUNT);

        {
            let runner = self.runner.clone();
            let url = source.to_string();
            let tx = tx.clone();
            tokio::spawn(async move {
                let report = version_probe(runner.as_ref(), &url, "source database").await;
                let _ = tx.send(ProbeReport::SourceVersion(report)).await;
            });
        }
        {
            let runner = self.runner.clone();
            let url = target.to_string();
            let tx = tx.clone();
            tokio::spawn(async move {
                let report = version_probe(runner.as_ref(), &url, "target database").await;
                let _ = tx.send(ProbeReport::TargetVersion(report)).await;
            });
        }
        {
            let runner = self.runner.clone();
            let url = source.to_string();
            let tx = tx.clone();
            tokio::spawn(async move {
                let report = scalar_query(runner.as_ref(), &url, SIZE_SQL).await;
                let _ = tx.send(ProbeReport::DbSize(report)).await;
            });
        }
        {
            let runner = self.runner.clone();
            let url = source.to_string();
            let tx = tx.clone();
            tokio::spawn(async move {
                let report = table_count_probe(runner.as_ref(), &url).await;
                let _ = tx.send(ProbeReport::TableCount(report)).await;
            });
        }
        {
            let runner = self.runner.clone();
            let source = source.to_string();
            let target = target.to_string();
            let tx = tx.clone();
            tokio::spawn(async move {
                let report = extensions_probe(runner.as_ref(), &source, &target).await;
                let _ = tx.send(ProbeReport::Extensions(report)).await;
            });
        }
        drop(tx);

        // Full fan-in: drain every probe before classifying, so a fatal
        // connectivity error never leaves a task writing into the void.
        let mut result = EstimationResult::default();
        let mut fatal: Option<MigrateError> = None;
        let mut completed = 0usize;

        while let Some(report) = rx.recv().await {
            completed += 1;
            merge(report, &mut result, &mut fatal);
            self.send_progress(ProgressUpdate::step(
                completed as f64 / (PROBE_COUNT + 1) as f64,
                format!("Preflight: {completed}/{PROBE_COUNT} probes complete"),
            ))
            .await;
        }

        if let Some(err) = fatal {
            self.send_progress(ProgressUpdate::failed(err.to_string()))
                .await;
            return Err(err);
        }

        if result.source_version == result.target_version {
            result.checks.push(CheckResult::green(
                "Postgres Compatibility",
                "Versions are compatible",
            ));
        } else {
            result.checks.push(CheckResult::yellow(
                "Postgres Compatibility",
                format!(
                    "Version mismatch: {} -> {}",
                    result.source_version, result.target_version
                ),
            ));
        }

        if source.contains(POOLER_PORT) || target.contains(POOLER_PORT) {
            result.checks.push(CheckResult::yellow(
                "Connection Mode",
                "Port 6543 detected (connection pooler). Use a direct 5432 connection if possible.",
            ));
        }

        debug!("preflight complete: {} checks", result.checks.len());
        self.send_progress(ProgressUpdate::step(1.0, "Preflight checks complete"))
            .await;

        Ok(result)
    }
}

fn merge(report: ProbeReport, result: &mut EstimationResult, fatal: &mut Option<MigrateError>) {
    match report {
        ProbeReport::SourceVersion(Ok(version)) => result.source_version = version,
        ProbeReport::TargetVersion(Ok(version)) => result.target_version = version,
        ProbeReport::SourceVersion(Err(e)) | ProbeReport::TargetVersion(Err(e)) => {
            warn!("fatal preflight probe failure: {e}");
            fatal.get_or_insert(e);
        }
        ProbeReport::DbSize(Ok(size)) => {
            result.db_size = size.clone();
            result.checks.push(CheckResult::green("Estimated Size", size));
        }
        ProbeReport::DbSize(Err(_)) => {
            result
                .checks
                .push(CheckResult::yellow("Disk Space", "Could not estimate size"));
        }
        ProbeReport::TableCount(Ok(count)) => {
            result.table_count = count;
            result
                .checks
                .push(CheckResult::green("Objects", format!("{count} tables")));
        }
        ProbeReport::TableCount(Err(_)) => {
            result
                .checks
                .push(CheckResult::yellow("Table Count", "Unknown"));
        }
        ProbeReport::Extensions(Ok(lists)) => {
            let missing: Vec<String> = lists
                .source
                .iter()
                .filter(|ext| !lists.target.contains(ext))
                .cloned()
                .collect();
            if missing.is_empty() {
                result
                    .checks
                    .push(CheckResult::green("Extensions", "All extensions present"));
            } else {
                result.checks.push(CheckResult::red(
                    "Extensions",
                    format!("Missing on target: {}", missing.join(", ")),
                ));
            }
        }
        ProbeReport::Extensions(Err(_)) => {
            result.checks.push(CheckResult::yellow(
                "Extensions",
                "Could not check extensions",
            ));
        }
    }
}

/// Connectivity plus server version for one endpoint. Either failing is
/// fatal for the whole estimation.
async fn version_probe(runner: &dyn ToolRunner, url: &str, context: &str) -> Result<String> {
    check::check_connection(runner, url, context).await?;
    scalar_query(runner, url, VERSION_SQL).await
}

/// Run a single-value query and return its trimmed output.
async fn scalar_query(runner: &dyn ToolRunner, url: &str, sql: &str) -> Result<String> {
    let invocation =
        ToolInvocation::new("psql", [url, "-w", "-t", "-c", sql]).with_timeout(QUERY_TIMEOUT);
    let out = runner.run(&invocation).await?;
    if !out.success {
        return Err(MigrateError::tool("psql", out.output.trim()));
    }
    Ok(out.output.trim().to_string())
}

async fn table_count_probe(runner: &dyn ToolRunner, url: &str) -> Result<usize> {
    let raw = scalar_query(runner, url, TABLE_COUNT_SQL).await?;
    raw.parse::<usize>()
        .map_err(|_| MigrateError::tool("psql", format!("unexpected table count output: {raw}")))
}

async fn extension_list(runner: &dyn ToolRunner, url: &str) -> Result<Vec<String>> {
    let invocation = ToolInvocation::new("psql", [url, "-w", "-t", "-c", EXTENSIONS_SQL])
        .with_timeout(QUERY_TIMEOUT);
    let out = runner.run(&invocation).await?;
    if !out.success {
        return Err(MigrateError::tool("psql", out.output.trim()));
    }
    Ok(out
        .output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}

/// Source extensions, then target extensions. Sequential within the probe;
/// the diff needs both lists.
async fn extensions_probe(
    runner: &dyn ToolRunner,
    source: &str,
    target: &str,
) -> Result<ExtensionLists> {
    let source_exts = extension_list(runner, source).await?;
    let target_exts = extension_list(runner, target).await?;
    Ok(ExtensionLists {
        source: source_exts,
        target: target_exts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::progress_channel;
    use crate::runner::{RecordingRunner, ScriptedResult};
    use std::collections::HashMap;

    const SRC: &str = "postgres://user:pw@source-host:5432/app";
    const TGT: &str = "postgres://user:pw@target-host:5432/app";

    fn script_happy_path(runner: &RecordingRunner, src_version: &str, tgt_version: &str) {
        runner.script_matching(
            "psql",
            &["server_version", "source-host"],
            ScriptedResult::SucceedWith(format!(" {src_version}\n")),
        );
        runner.script_matching(
            "psql",
            &["server_version", "target-host"],
            ScriptedResult::SucceedWith(format!(" {tgt_version}\n")),
        );
        runner.script_matching(
            "psql",
            &["pg_database_size"],
            ScriptedResult::SucceedWith(" 512 MB \n".into()),
        );
        runner.script_matching(
            "psql",
            &["count(*)"],
            ScriptedResult::SucceedWith(" 42 \n".into()),
        );
        runner.script_matching(
            "psql",
            &["pg_extension", "source-host"],
            ScriptedResult::SucceedWith("plpgsql\npostgis\n".into()),
        );
        runner.script_matching(
            "psql",
            &["pg_extension", "target-host"],
            ScriptedResult::SucceedWith("plpgsql\npostgis\n".into()),
        );
    }

    fn statuses(result: &EstimationResult) -> HashMap<String, CheckStatus> {
        result
            .checks
            .iter()
            .map(|c| (c.name.clone(), c.status))
            .collect()
    }

    #[tokio::test]
    async fn test_happy_path_reports_all_checks() {
        let runner = Arc::new(RecordingRunner::new());
        script_happy_path(&runner, "16.4", "16.4");

        let result = Estimator::new(runner).estimate(SRC, TGT).await.unwrap();

        assert_eq!(result.source_version, "16.4");
        assert_eq!(result.target_version, "16.4");
        assert_eq!(result.db_size, "512 MB");
        assert_eq!(result.table_count, 42);

        let statuses = statuses(&result);
        assert_eq!(statuses["Estimated Size"], CheckStatus::Green);
        assert_eq!(statuses["Objects"], CheckStatus::Green);
        assert_eq!(statuses["Extensions"], CheckStatus::Green);
        assert_eq!(statuses["Postgres Compatibility"], CheckStatus::Green);
        assert!(!statuses.contains_key("Connection Mode"));
    }

    #[tokio::test]
    async fn test_degraded_probes_go_yellow() {
        let runner = Arc::new(RecordingRunner::new());
        runner.script_matching(
            "psql",
            &["pg_database_size"],
            ScriptedResult::Fail("ERROR: permission denied".into()),
        );
        runner.script_matching(
            "psql",
            &["count(*)"],
            ScriptedResult::TimeOut,
        );

        let result = Estimator::new(runner).estimate(SRC, TGT).await.unwrap();

        let statuses = statuses(&result);
        assert_eq!(statuses["Disk Space"], CheckStatus::Yellow);
        assert_eq!(statuses["Table Count"], CheckStatus::Yellow);
    }

    #[tokio::test]
    async fn test_target_connectivity_failure_is_fatal() {
        let runner = Arc::new(RecordingRunner::new());
        script_happy_path(&runner, "16.4", "16.4");
        runner.script_matching(
            "pg_isready",
            &["target-host"],
            ScriptedResult::Fail("target-host:5432 - no response".into()),
        );

        let err = Estimator::new(runner)
            .estimate(SRC, TGT)
            .await
            .unwrap_err();
        match err {
            MigrateError::Unreachable { context, .. } => {
                assert_eq!(context, "target database")
            }
            other => panic!("expected Unreachable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_version_mismatch_goes_yellow() {
        let runner = Arc::new(RecordingRunner::new());
        script_happy_path(&runner, "17.2", "15.6");

        let result = Estimator::new(runner).estimate(SRC, TGT).await.unwrap();

        let check = result
            .checks
            .iter()
            .find(|c| c.name == "Postgres Compatibility")
            .unwrap();
        assert_eq!(check.status, CheckStatus::Yellow);
        assert!(check.message.contains("17.2"));
        assert!(check.message.contains("15.6"));
    }

    #[tokio::test]
    async fn test_missing_extension_goes_red() {
        let runner = Arc::new(RecordingRunner::new());
        runner.script_matching(
            "psql",
            &["pg_extension", "source-host"],
            ScriptedResult::SucceedWith("plpgsql\npostgis\n".into()),
        );
        runner.script_matching(
            "psql",
            &["pg_extension", "target-host"],
            ScriptedResult::SucceedWith("plpgsql\n".into()),
        );

        let result = Estimator::new(runner).estimate(SRC, TGT).await.unwrap();

        let check = result.checks.iter().find(|c| c.name == "Extensions").unwrap();
        assert_eq!(check.status, CheckStatus::Red);
        assert!(check.message.contains("postgis"));
    }

    #[tokio::test]
    async fn test_pooler_port_flagged() {
        let pooled = "postgres://user:pw@source-host:6543/app";
        let runner = Arc::new(RecordingRunner::new());

        let result = Estimator::new(runner).estimate(pooled, TGT).await.unwrap();

        let check = result
            .checks
            .iter()
            .find(|c| c.name == "Connection Mode")
            .unwrap();
        assert_eq!(check.status, CheckStatus::Yellow);
    }

    #[tokio::test]
    async fn test_estimation_is_idempotent() {
        let runner = Arc::new(RecordingRunner::new());
        script_happy_path(&runner, "16.4", "16.4");
        script_happy_path(&runner, "16.4", "16.4");

        let estimator = Estimator::new(runner);
        let first = estimator.estimate(SRC, TGT).await.unwrap();
        let second = estimator.estimate(SRC, TGT).await.unwrap();

        assert_eq!(statuses(&first), statuses(&second));
    }

    #[tokio::test]
    async fn test_progress_ends_terminal() {
        let runner = Arc::new(RecordingRunner::new());
        script_happy_path(&runner, "16.4", "16.4");
        let (tx, mut rx) = progress_channel();

        Estimator::new(runner)
            .with_progress(tx)
            .estimate(SRC, TGT)
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(update) = rx.try_recv() {
            events.push(update);
        }
        assert!(!events.is_empty());
        assert!(events.last().unwrap().is_terminal());
        assert_eq!(events.last().unwrap().percentage, 1.0);
    }
}
