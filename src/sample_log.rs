/// Per-run sample log: append-only text file, one run per file.
///
/// Sample lines have the fixed form `[<elapsed>s] Memory: <mb>MB` so they can
/// be parsed back by `parse_samples`, e.g. for `memwatch analyze`.
use crate::stats::MemorySample;
use chrono::{DateTime, Local};
use regex::Regex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

static SAMPLE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)s\] Memory: (\d+)MB").unwrap());
static LIMIT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Memory limit set to (\d+)MB").unwrap());

/// Build the log path for a run started at `started_at`.
pub fn log_file_path(log_dir: &Path, started_at: DateTime<Local>) -> PathBuf {
    log_dir.join(format!(
        "etl_job_{}.log",
        started_at.format("%Y%m%d_%H%M%S_%3f")
    ))
}

pub fn format_sample(sample: &MemorySample) -> String {
    format!(
        "[{}s] Memory: {}MB",
        sample.elapsed_secs, sample.resident_mb
    )
}

/// Append-only writer for one run's log file.
pub struct SampleLog {
    path: PathBuf,
    file: File,
}

impl SampleLog {
    /// Create (or append to) the log file at `path`.
    pub fn create(path: PathBuf) -> Result<Self, LogWriteError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LogWriteError {
                path: path.clone(),
                source: e,
            })?;
        Ok(Self { path, file })
    }

    fn write_line(&mut self, line: &str) -> Result<(), LogWriteError> {
        writeln!(self.file, "{line}").map_err(|e| LogWriteError {
            path: self.path.clone(),
            source: e,
        })
    }

    pub fn write_header(
        &mut self,
        started_at: DateTime<Local>,
        limit_mb: u64,
    ) -> Result<(), LogWriteError> {
        self.write_line(&format!("Starting ETL job at {}", started_at.to_rfc3339()))?;
        self.write_line(&format!("Memory limit set to {limit_mb}MB"))
    }

    pub fn write_sample(&mut self, sample: &MemorySample) -> Result<(), LogWriteError> {
        self.write_line(&format_sample(sample))
    }

    pub fn write_footer(
        &mut self,
        exit_code: i32,
        duration: Duration,
        avg_mb: u64,
        max_mb: u64,
    ) -> Result<(), LogWriteError> {
        self.write_line(&format!(
            "ETL job completed with exit code {exit_code} after {:.2}s",
            duration.as_secs_f64()
        ))?;
        self.write_line(&format!("Memory usage: avg {avg_mb}MB, max {max_mb}MB"))?;
        self.file.flush().map_err(|e| LogWriteError {
            path: self.path.clone(),
            source: e,
        })
    }
}

/// Extract every sample line from log text, in file order. Other lines are
/// ignored.
pub fn parse_samples(text: &str) -> Vec<MemorySample> {
    text.lines()
        .filter_map(|line| {
            let caps = SAMPLE_LINE.captures(line)?;
            Some(MemorySample {
                elapsed_secs: caps[1].parse().ok()?,
                resident_mb: caps[2].parse().ok()?,
            })
        })
        .collect()
}

/// The limit recorded in the log header, if present.
pub fn parse_limit(text: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| LIMIT_LINE.captures(line))
        .and_then(|caps| caps[1].parse().ok())
}

/// A write to the per-run log failed. Recoverable: the run continues.
#[derive(Debug)]
pub struct LogWriteError {
    pub path: PathBuf,
    pub source: std::io::Error,
}

impl std::fmt::Display for LogWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to write log file {}: {}",
            self.path.display(),
            self.source
        )
    }
}

impl std::error::Error for LogWriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
