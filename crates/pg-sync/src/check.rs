//! Connectivity and environment checks.

use crate::error::{MigrateError, Result};
use crate::runner::{ToolInvocation, ToolRunner};
use std::time::Duration;

/// Deadline for a single connectivity probe.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for a lightweight diagnostic query.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Client tools the pipeline shells out to.
pub const REQUIRED_TOOLS: [&str; 4] = ["pg_isready", "psql", "pg_dump", "pg_restore"];

const LIST_TABLES_SQL: &str = "SELECT table_name FROM information_schema.tables \
     WHERE table_schema = 'public' ORDER BY table_name;";

/// Verify that an endpoint accepts connections.
///
/// Single probe, no retries. A deadline overrun surfaces as
/// [`MigrateError::Timeout`], a tool-reported failure (bad credentials, host
/// down) as [`MigrateError::Unreachable`] carrying the tool's output, so the
/// caller can message the two differently. `context` names the endpoint in
/// the error ("source database", "target database").
pub async fn check_connection(runner: &dyn ToolRunner, url: &str, context: &str) -> Result<()> {
    let invocation =
        ToolInvocation::new("pg_isready", ["-d", url, "-t", "3"]).with_timeout(CONNECT_TIMEOUT);

    let out = runner.run(&invocation).await?;
    if !out.success {
        return Err(MigrateError::unreachable(context, out.output.trim()));
    }
    Ok(())
}

/// Verify that the PostgreSQL client tools are invocable.
///
/// Installation is the caller's problem; this only reports what is missing.
pub async fn check_client_tools(runner: &dyn ToolRunner) -> Result<()> {
    for tool in REQUIRED_TOOLS {
        let invocation =
            ToolInvocation::new(tool, ["--version"]).with_timeout(CONNECT_TIMEOUT);
        match runner.run(&invocation).await {
            Ok(out) if out.success => {}
            Ok(out) => return Err(MigrateError::tool(tool, out.output.trim())),
            Err(MigrateError::Io(_)) => {
                return Err(MigrateError::Config(format!("{tool} not found in PATH")))
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// List the tables in the public schema of an endpoint, sorted by name.
pub async fn list_tables(runner: &dyn ToolRunner, url: &str) -> Result<Vec<String>> {
    let invocation = ToolInvocation::new("psql", [url, "-w", "-t", "-c", LIST_TABLES_SQL])
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{RecordingRunner, ScriptedResult};

    const URL: &str = "postgres://user:pw@host:5432/db";

    #[tokio::test]
    async fn test_check_connection_ok() {
        let runner = RecordingRunner::new();
        check_connection(&runner, URL, "source database")
            .await
            .unwrap();

        let calls = runner.calls_for("pg_isready");
        assert_eq!(calls.len(), 1);
        assert!(calls[0].has_arg_containing(URL));
        assert_eq!(calls[0].timeout, Some(CONNECT_TIMEOUT));
    }

    #[tokio::test]
    async fn test_check_connection_unreachable() {
        let runner = RecordingRunner::new();
        runner.script(
            "pg_isready",
            ScriptedResult::Fail("host:5432 - no response".into()),
        );

        let err = check_connection(&runner, URL, "target database")
            .await
            .unwrap_err();
        match err {
            MigrateError::Unreachable { context, message } => {
                assert_eq!(context, "target database");
                assert!(message.contains("no response"));
            }
            other => panic!("expected Unreachable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_check_connection_timeout_is_distinct() {
        let runner = RecordingRunner::new();
        runner.script("pg_isready", ScriptedResult::TimeOut);

        let err = check_connection(&runner, URL, "source database")
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_list_tables_parses_lines() {
        let runner = RecordingRunner::new();
        runner.script(
            "psql",
            ScriptedResult::SucceedWith(" accounts \n orders \n\n users \n".into()),
        );

        let tables = list_tables(&runner, URL).await.unwrap();
        assert_eq!(tables, vec!["accounts", "orders", "users"]);
    }

    #[tokio::test]
    async fn test_check_client_tools_reports_failure() {
        let runner = RecordingRunner::new();
        runner.script_matching("pg_restore", &["--version"], ScriptedResult::Fail("boom".into()));

        let err = check_client_tools(&runner).await.unwrap_err();
        assert!(err.to_string().contains("pg_restore"));
    }
}
