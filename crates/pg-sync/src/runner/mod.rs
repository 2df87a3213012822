//! External tool invocation.
//!
//! Every database interaction in this crate goes through a short-lived
//! subprocess (`pg_isready`, `psql`, `pg_dump`, `pg_restore`). The
//! [`ToolRunner`] trait is the seam between the engine and those processes;
//! [`PgToolRunner`] is the real implementation, [`RecordingRunner`] a
//! scripted one for tests.

mod recording;

pub use recording::{RecordingRunner, ScriptedResult};

use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// A single external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// Deadline for the subprocess. `None` leaves the run bounded only by the
    /// tool itself; dump and restore legitimately run for hours.
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether any argument contains `needle`.
    pub fn has_arg_containing(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a.contains(needle))
    }
}

/// Combined result of a completed subprocess.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Stdout followed by stderr, lossily decoded.
    pub output: String,

    /// Whether the process exited zero.
    pub success: bool,
}

/// Seam for invoking external database tools.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run the tool to completion, honoring the invocation deadline.
    ///
    /// A completed-but-failed process is `Ok` with `success == false` so the
    /// caller can classify its output; `Err` is reserved for deadline overrun
    /// and spawn failures.
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput>;
}

/// Runs PostgreSQL client tools as real subprocesses.
pub struct PgToolRunner;

#[async_trait]
impl ToolRunner for PgToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        debug!("running {} ({} args)", invocation.program, invocation.args.len());

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out probe must not leave its child running.
            .kill_on_drop(true);

        let completed = match invocation.timeout {
            Some(limit) => match tokio::time::timeout(limit, command.output()).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(MigrateError::timeout(&invocation.program, limit.as_secs()))
                }
            },
            None => command.output().await,
        };

        let out = completed?;
        let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&out.stderr));

        Ok(ToolOutput {
            output: combined,
            success: out.status.success(),
        })
    }
}
