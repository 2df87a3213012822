//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (bad endpoint, invalid options, missing tools).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A connectivity probe failed for a non-timeout reason.
    #[error("{context}: connection check failed: {message}")]
    Unreachable { context: String, message: String },

    /// A bounded probe or query exceeded its deadline.
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// A dump completed without error but produced a zero-byte artifact.
    /// Distinct from a tool-reported failure: pg_dump can exit zero while
    /// writing nothing when permissions silently deny every object.
    #[error("dump file is empty (0 bytes) - check source database permissions or connectivity")]
    EmptyArtifact,

    /// An external tool exited non-zero with unrecognized output.
    #[error("{tool} failed: {output}")]
    Tool { tool: String, output: String },

    /// IO error (file operations, spawning tools).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MigrateError {
    /// Create an Unreachable error with context about which endpoint failed.
    pub fn unreachable(context: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Unreachable {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create a Timeout error for a named operation.
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        MigrateError::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// Create a Tool error from an external command's combined output.
    pub fn tool(tool: impl Into<String>, output: impl Into<String>) -> Self {
        MigrateError::Tool {
            tool: tool.into(),
            output: output.into(),
        }
    }

    /// Whether this error was caused by a deadline expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MigrateError::Timeout { .. })
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
