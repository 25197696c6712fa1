/// Run summary store: `etl_summary.json`, a JSON object holding every past run
/// in insertion order.
///
/// Appends are read-modify-write under an exclusive advisory lock on a
/// sidecar `.lock` file, and the new contents land via temp file + rename, so
/// readers never see a partial write and concurrent supervisors never drop
/// each other's entries.
use crate::outcome::{RunResult, RunStatus};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Default summary file name inside the log directory.
pub const SUMMARY_FILE_NAME: &str = "etl_summary.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub timestamp: String,
    pub duration: f64,
    pub exit_code: i32,
    pub avg_memory_mb: u64,
    pub max_memory_mb: u64,
    pub status: RunStatus,
}

impl From<&RunResult> for RunSummary {
    fn from(result: &RunResult) -> Self {
        Self {
            timestamp: result.started_at.to_rfc3339(),
            duration: (result.duration.as_secs_f64() * 100.0).round() / 100.0,
            exit_code: result.exit_code,
            avg_memory_mb: result.avg_memory_mb,
            max_memory_mb: result.max_memory_mb,
            status: result.status,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SummaryDocument {
    #[serde(default)]
    pub runs: Vec<RunSummary>,
}

pub struct SummaryStore {
    path: PathBuf,
}

impl SummaryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Load all recorded runs. A missing file is an empty history.
    pub fn load(&self) -> Result<SummaryDocument, SummaryError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SummaryDocument::default());
            }
            Err(e) => {
                return Err(SummaryError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        if contents.trim().is_empty() {
            return Ok(SummaryDocument::default());
        }
        serde_json::from_str(&contents).map_err(|e| SummaryError::Parse {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Append one run and return the new number of recorded runs.
    pub fn append(&self, entry: RunSummary) -> Result<usize, SummaryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| SummaryError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let lock_path = self.lock_path();
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| SummaryError::Lock {
                path: lock_path.clone(),
                source: e,
            })?;
        FileExt::lock_exclusive(&lock).map_err(|e| SummaryError::Lock {
            path: lock_path.clone(),
            source: e,
        })?;

        let result = self.append_locked(entry);

        if let Err(e) = FileExt::unlock(&lock) {
            tracing::warn!(error = %e, path = %lock_path.display(), "failed to release summary lock");
        }
        result
    }

    fn append_locked(&self, entry: RunSummary) -> Result<usize, SummaryError> {
        let mut doc = self.load()?;
        doc.runs.push(entry);

        let json = serde_json::to_string_pretty(&doc)
            .map_err(|e| SummaryError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| SUMMARY_FILE_NAME.to_string());
        let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| SummaryError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| SummaryError::Write {
            path: self.path.clone(),
            source: e,
        })?;

        Ok(doc.runs.len())
    }
}

/// Handle `memwatch history`.
pub fn handle_history(store: &SummaryStore, last: usize) -> Result<(), SummaryError> {
    let doc = store.load()?;
    if doc.runs.is_empty() {
        println!("No runs recorded in {}.", store.path().display());
        return Ok(());
    }

    let skip = doc.runs.len().saturating_sub(last);
    println!(
        "{:<27} {:>10} {:>6} {:>9} {:>9}  STATUS",
        "TIMESTAMP", "DURATION", "EXIT", "AVG MB", "MAX MB"
    );
    println!("{}", "-".repeat(76));
    for run in doc.runs.iter().skip(skip) {
        println!(
            "{:<27} {:>9.2}s {:>6} {:>9} {:>9}  {}",
            run.timestamp, run.duration, run.exit_code, run.avg_memory_mb, run.max_memory_mb, run.status
        );
    }

    let totals = HistoryTotals::from_runs(&doc.runs);
    println!();
    println!(
        "{} runs: {} succeeded, {} failed, {} killed ({:.0}% success); peak {}MB",
        totals.runs,
        totals.succeeded,
        totals.failed,
        totals.killed,
        totals.success_rate() * 100.0,
        totals.peak_mb
    );
    Ok(())
}

#[derive(Debug, Default, PartialEq)]
pub struct HistoryTotals {
    pub runs: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub killed: usize,
    pub peak_mb: u64,
}

impl HistoryTotals {
    pub fn from_runs(runs: &[RunSummary]) -> Self {
        let mut totals = HistoryTotals {
            runs: runs.len(),
            ..Default::default()
        };
        for run in runs {
            match run.status {
                RunStatus::Success => totals.succeeded += 1,
                RunStatus::Failed => totals.failed += 1,
                RunStatus::Killed => totals.killed += 1,
            }
            totals.peak_mb = totals.peak_mb.max(run.max_memory_mb);
        }
        totals
    }

    pub fn success_rate(&self) -> f64 {
        if self.runs == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.runs as f64
    }
}

/// Errors from summary store operations.
#[derive(Debug)]
pub enum SummaryError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for SummaryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SummaryError::Read { path, source } => {
                write!(f, "failed to read summary file {}: {source}", path.display())
            }
            SummaryError::Parse { path, source } => {
                write!(f, "summary file {} is not valid JSON: {source}", path.display())
            }
            SummaryError::Serialize { source } => {
                write!(f, "failed to serialize summary: {source}")
            }
            SummaryError::Lock { path, source } => {
                write!(f, "failed to lock {}: {source}", path.display())
            }
            SummaryError::Write { path, source } => {
                write!(f, "failed to write {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for SummaryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SummaryError::Read { source, .. } => Some(source),
            SummaryError::Parse { source, .. } => Some(source),
            SummaryError::Serialize { source } => Some(source),
            SummaryError::Lock { source, .. } => Some(source),
            SummaryError::Write { source, .. } => Some(source),
        }
    }
}
