//! Scripted tool runner for tests.
//!
//! Records every invocation and replays configured results instead of
//! spawning processes, so pipeline behavior can be exercised without a
//! database or the PostgreSQL client tools installed.

use super::{ToolInvocation, ToolOutput, ToolRunner};
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Mutex;

/// What a scripted invocation should produce.
#[derive(Debug, Clone)]
pub enum ScriptedResult {
    /// Exit zero with empty output.
    Succeed,
    /// Exit zero with the given combined output.
    SucceedWith(String),
    /// Exit zero but leave the `-f` artifact empty (silent dump failure).
    EmptyArtifact,
    /// Exit non-zero with the given combined output.
    Fail(String),
    /// Exceed the invocation deadline.
    TimeOut,
}

struct ScriptEntry {
    program: String,
    /// Every needle must appear in some argument for the entry to match.
    needles: Vec<String>,
    result: ScriptedResult,
}

/// Test double for [`ToolRunner`].
///
/// Unscripted invocations succeed with empty output; a successful `pg_dump`
/// additionally fills its `-f` artifact so the engine's zero-byte check
/// passes. Scripts are consumed in registration order, first match wins.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<ToolInvocation>>,
    scripts: Mutex<Vec<ScriptEntry>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next invocation of `program`.
    pub fn script(&self, program: &str, result: ScriptedResult) {
        self.script_matching(program, &[], result);
    }

    /// Script the next invocation of `program` whose arguments contain every
    /// given needle.
    pub fn script_matching(&self, program: &str, needles: &[&str], result: ScriptedResult) {
        self.scripts.lock().unwrap().push(ScriptEntry {
            program: program.to_string(),
            needles: needles.iter().map(|n| n.to_string()).collect(),
            result,
        });
    }

    /// All recorded invocations, in call order.
    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded invocations of one program.
    pub fn calls_for(&self, program: &str) -> Vec<ToolInvocation> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    fn take_script(&self, invocation: &ToolInvocation) -> Option<ScriptedResult> {
        let mut scripts = self.scripts.lock().unwrap();
        let index = scripts.iter().position(|entry| {
            entry.program == invocation.program
                && entry.needles.iter().all(|n| invocation.has_arg_containing(n))
        })?;
        Some(scripts.remove(index).result)
    }

    /// Fill the `-f` artifact of a dump invocation, mirroring what pg_dump
    /// does on success. Only touches paths that already exist so a scripted
    /// backup never drops files into the working directory.
    fn write_artifact(invocation: &ToolInvocation, contents: &[u8]) {
        let Some(flag_index) = invocation.args.iter().position(|a| a == "-f") else {
            return;
        };
        let Some(path) = invocation.args.get(flag_index + 1) else {
            return;
        };
        if Path::new(path).exists() {
            let _ = std::fs::write(path, contents);
        }
    }
}

#[async_trait]
impl ToolRunner for RecordingRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        self.calls.lock().unwrap().push(invocation.clone());

        let result = self
            .take_script(invocation)
            .unwrap_or(ScriptedResult::Succeed);

        match result {
            ScriptedResult::Succeed => {
                if invocation.program == "pg_dump" {
                    Self::write_artifact(invocation, b"PGDMP\x01scripted");
                }
                Ok(ToolOutput {
                    output: String::new(),
                    success: true,
                })
            }
            ScriptedResult::SucceedWith(output) => {
                if invocation.program == "pg_dump" {
                    Self::write_artifact(invocation, b"PGDMP\x01scripted");
                }
                Ok(ToolOutput {
                    output,
                    success: true,
                })
            }
            ScriptedResult::EmptyArtifact => {
                Self::write_artifact(invocation, b"");
                Ok(ToolOutput {
                    output: String::new(),
                    success: true,
                })
            }
            ScriptedResult::Fail(output) => Ok(ToolOutput {
                output,
                success: false,
            }),
            ScriptedResult::TimeOut => Err(MigrateError::timeout(
                &invocation.program,
                invocation.timeout.map(|t| t.as_secs()).unwrap_or(0),
            )),
        }
    }
}
