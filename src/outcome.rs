/// Run result synthesis.
///
/// Maps the OS-confirmed exit of the child plus the run's memory statistics
/// onto the final `RunResult`. The confirmed exit is authoritative: a kill the
/// supervisor asked for only counts if the child actually died by signal.
use crate::stats::{MemorySample, RunStatistics};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Exit code reported for a child the supervisor killed on the memory limit.
pub const KILLED_EXIT_CODE: i32 = 137;

/// Termination as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    #[cfg(test)]
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    #[cfg(test)]
    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    #[cfg(unix)]
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Failed,
    Killed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
            RunStatus::Killed => "KILLED",
        };
        f.write_str(s)
    }
}

/// Finalized record of one supervised run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub command: String,
    pub started_at: DateTime<Local>,
    pub exit_code: i32,
    pub duration: Duration,
    pub avg_memory_mb: u64,
    pub max_memory_mb: u64,
    pub sample_count: usize,
    /// Every recorded sample, in order.
    pub samples: Vec<MemorySample>,
    pub status: RunStatus,
    pub log_file: PathBuf,
    pub summary_file: PathBuf,
}

/// Decide exit code and status from the confirmed exit.
pub fn classify_exit(exit: ExitOutcome, kill_requested: bool) -> (i32, RunStatus) {
    match (exit.code, exit.signal) {
        (Some(0), _) => (0, RunStatus::Success),
        // Natural exit wins even if a kill was already in flight
        (Some(code), _) => (code, RunStatus::Failed),
        (None, Some(_)) if kill_requested => (KILLED_EXIT_CODE, RunStatus::Killed),
        (None, Some(signal)) => (128 + signal, RunStatus::Failed),
        (None, None) => (-1, RunStatus::Failed),
    }
}

/// Everything about a run that is known at synthesis time, apart from stats.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub command: String,
    pub started_at: DateTime<Local>,
    pub log_file: PathBuf,
    pub summary_file: PathBuf,
}

pub fn synthesize(
    ctx: RunContext,
    stats: &RunStatistics,
    exit: ExitOutcome,
    kill_requested: bool,
    duration: Duration,
) -> RunResult {
    let (exit_code, status) = classify_exit(exit, kill_requested);
    RunResult {
        command: ctx.command,
        started_at: ctx.started_at,
        exit_code,
        duration,
        avg_memory_mb: stats.avg_mb(),
        max_memory_mb: stats.max_mb(),
        sample_count: stats.sample_count(),
        samples: stats.samples().to_vec(),
        status,
        log_file: ctx.log_file,
        summary_file: ctx.summary_file,
    }
}
