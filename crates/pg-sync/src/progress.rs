//! Progress event protocol between the engine and its consumer.
//!
//! One engine run produces an ordered sequence of [`ProgressUpdate`] events
//! over a bounded single-producer/single-consumer channel. Percentages are
//! monotonically non-decreasing until the terminal event: `1.0` with final
//! statistics on success, [`PROGRESS_FAILED`] with an error message on
//! failure. A channel that closes without a terminal event also means the
//! run is over; consumers treat it as completion.

use crate::orchestrator::MigrationStats;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Percentage sentinel marking a failed run's terminal event.
pub const PROGRESS_FAILED: f64 = -1.0;

/// Channel capacity. A single run emits on the order of a dozen events, so
/// this buffer holds a full run with room to spare; the producer is never
/// blocked by a slow or abandoned consumer.
pub const PROGRESS_CAPACITY: usize = 64;

/// One progress event from the engine or the preflight estimator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Fraction complete in `[0, 1]`, or [`PROGRESS_FAILED`].
    pub percentage: f64,

    /// Human-readable step description.
    pub message: String,

    /// Redacted external command line for display, when a step runs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Final statistics, present on a successful run's terminal event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<MigrationStats>,
}

impl ProgressUpdate {
    /// A non-terminal step event.
    pub fn step(percentage: f64, message: impl Into<String>) -> Self {
        Self {
            percentage,
            message: message.into(),
            command: None,
            stats: None,
        }
    }

    /// A terminal failure event.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::step(PROGRESS_FAILED, message)
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_stats(mut self, stats: MigrationStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Whether this is the last event of a run.
    pub fn is_terminal(&self) -> bool {
        self.percentage >= 1.0 || self.percentage < 0.0
    }
}

/// Create the bounded progress channel for one run.
pub fn progress_channel() -> (mpsc::Sender<ProgressUpdate>, mpsc::Receiver<ProgressUpdate>) {
    mpsc::channel(PROGRESS_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(!ProgressUpdate::step(0.0, "start").is_terminal());
        assert!(!ProgressUpdate::step(0.8, "restore").is_terminal());
        assert!(ProgressUpdate::step(1.0, "done").is_terminal());
        assert!(ProgressUpdate::failed("boom").is_terminal());
    }

    #[test]
    fn test_failed_uses_sentinel() {
        assert_eq!(ProgressUpdate::failed("boom").percentage, PROGRESS_FAILED);
    }
}
