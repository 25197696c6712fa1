/// Memory supervisor: the monitor-and-decide loop.
///
/// Spawns the job, samples its memory on the configured schedule, kills it
/// when it breaches the limit (if allowed to), and converges on exactly one
/// `RunResult` however the child ends. The adapter's confirmed exit is the only
/// thing that ends the loop; a kill merely asks for it.
use crate::adapters::{KillError, ProcessAdapter, SpawnError};
use crate::config::MonitorConfig;
use crate::outcome::{self, ExitOutcome, RunContext, RunResult};
use crate::sample_log::{self, LogWriteError, SampleLog};
use crate::schedule::{Checkpoint, SamplingPolicy};
use crate::stats::{bytes_to_mb, MemorySample, RunStatistics};
use crate::summary::{RunSummary, SummaryError, SummaryStore};
use chrono::{DateTime, Local};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Killing,
    Completing,
    Terminated,
}

impl SupervisorState {
    fn can_transition_to(self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Terminated)
                | (Running, Killing)
                | (Running, Completing)
                // kill signal could not be delivered
                | (Killing, Running)
                | (Killing, Completing)
                | (Completing, Terminated)
        )
    }
}

/// What a finished run hands back: the result, plus whether it made it into
/// the summary store.
#[derive(Debug)]
pub struct RunOutcome {
    pub result: RunResult,
    pub summary: Result<usize, SummaryError>,
}

/// Per-run log that reports write failures instead of propagating them.
struct RunLog {
    log: Option<SampleLog>,
    failures: u32,
}

impl RunLog {
    fn open(path: PathBuf) -> Self {
        match SampleLog::create(path) {
            Ok(log) => Self {
                log: Some(log),
                failures: 0,
            },
            Err(e) => {
                tracing::warn!(error = %e, "cannot open run log, continuing without it");
                Self {
                    log: None,
                    failures: 1,
                }
            }
        }
    }

    fn write(&mut self, op: impl FnOnce(&mut SampleLog) -> Result<(), LogWriteError>) {
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = op(log) {
                self.failures += 1;
                tracing::warn!(error = %e, "failed to write run log");
            }
        }
    }
}

struct Run<'a> {
    config: &'a MonitorConfig,
    adapter: &'a mut dyn ProcessAdapter,
    state: SupervisorState,
    stats: RunStatistics,
    log: RunLog,
    start: Instant,
    pid: u32,
    kill_requested: bool,
    limit_warned: bool,
}

impl Run<'_> {
    fn transition(&mut self, next: SupervisorState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(from = ?self.state, to = ?next, "supervisor state change");
        self.state = next;
    }

    /// Take one reading. Unreadable memory (0 bytes) is not a sample.
    fn sample(&mut self, checkpoint: Option<Checkpoint>) -> Option<MemorySample> {
        let bytes = self.adapter.sample_memory(self.pid);
        if bytes == 0 {
            tracing::debug!(pid = self.pid, "memory reading unavailable, skipping sample");
            return None;
        }
        let sample = MemorySample {
            elapsed_secs: self.start.elapsed().as_secs(),
            resident_mb: bytes_to_mb(bytes),
        };
        // The log is written before the statistics see the sample
        self.log.write(|log| log.write_sample(&sample));
        let sample = self.stats.record(sample);
        tracing::info!(
            elapsed_secs = sample.elapsed_secs,
            resident_mb = sample.resident_mb,
            checkpoint = checkpoint.map(Checkpoint::as_str),
            "memory sample"
        );
        Some(sample)
    }

    fn enforce_limit(&mut self, sample: MemorySample) {
        let limit = self.config.memory_limit_mb;
        if sample.resident_mb <= limit || self.kill_requested {
            return;
        }
        if !self.config.kill_on_limit {
            if !self.limit_warned {
                tracing::warn!(
                    resident_mb = sample.resident_mb,
                    limit_mb = limit,
                    "memory limit exceeded (kill on limit disabled)"
                );
                self.limit_warned = true;
            }
            return;
        }

        tracing::warn!(
            resident_mb = sample.resident_mb,
            limit_mb = limit,
            pid = self.pid,
            "memory limit exceeded, killing child"
        );
        self.transition(SupervisorState::Killing);
        match self.adapter.kill(self.pid) {
            Ok(()) => self.kill_requested = true,
            Err(e) => {
                self.report_kill_failure(&e);
                self.transition(SupervisorState::Running);
            }
        }
    }

    fn report_kill_failure(&self, e: &KillError) {
        tracing::error!(error = %e, "failed to kill child, will retry on next breach");
    }

    fn interrupt(&mut self) {
        tracing::warn!(pid = self.pid, "interrupted, terminating child");
        if let Err(e) = self.adapter.kill(self.pid) {
            tracing::error!(error = %e, "failed to terminate child after interrupt");
        }
    }
}

/// Supervise one run. Ctrl-C terminates the child and still produces a result.
pub async fn run(
    config: &MonitorConfig,
    adapter: &mut dyn ProcessAdapter,
) -> Result<RunOutcome, SupervisorError> {
    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    run_until(config, adapter, interrupt).await
}

/// Supervise one run; `interrupt` resolving terminates the child early.
pub async fn run_until(
    config: &MonitorConfig,
    adapter: &mut dyn ProcessAdapter,
    interrupt: impl Future<Output = ()>,
) -> Result<RunOutcome, SupervisorError> {
    std::fs::create_dir_all(&config.log_dir).map_err(|e| SupervisorError::LogDir {
        path: config.log_dir.clone(),
        source: e,
    })?;

    let started_at = Local::now();
    let log_path = sample_log::log_file_path(&config.log_dir, started_at);
    supervise(config, adapter, interrupt, started_at, log_path).await
}

async fn supervise(
    config: &MonitorConfig,
    adapter: &mut dyn ProcessAdapter,
    interrupt: impl Future<Output = ()>,
    started_at: DateTime<Local>,
    log_path: PathBuf,
) -> Result<RunOutcome, SupervisorError> {
    let mut log = RunLog::open(log_path.clone());
    log.write(|l| l.write_header(started_at, config.memory_limit_mb));

    let mut policy = SamplingPolicy::from_interval_secs(config.check_interval_secs);
    let command = config.command.display();
    tracing::info!(
        command = %command,
        limit_mb = config.memory_limit_mb,
        interval_secs = config.check_interval_secs,
        lightweight = policy.is_lightweight(),
        adapter = adapter.name(),
        log = %log_path.display(),
        "starting supervised job"
    );

    let spawned = match adapter.spawn(&config.command, config.silent) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "job failed to start");
            return Err(SupervisorError::Spawn(e));
        }
    };

    let mut run = Run {
        config,
        adapter,
        state: SupervisorState::Starting,
        stats: RunStatistics::new(),
        log,
        start: Instant::now(),
        pid: spawned.pid,
        kill_requested: false,
        limit_warned: false,
    };
    run.transition(SupervisorState::Running);

    let mut next_interval_sample = Some(run.start);
    let mut exit = spawned.exit;
    tokio::pin!(interrupt);
    let mut interrupted = false;

    let confirmed: ExitOutcome = loop {
        let deadline = if run.kill_requested {
            None
        } else {
            match &policy {
                SamplingPolicy::Interval(_) => next_interval_sample,
                SamplingPolicy::Checkpoints(plan) => plan.next_due().map(|d| run.start + d),
            }
        };

        tokio::select! {
            biased;
            outcome = &mut exit => break outcome,
            _ = &mut interrupt, if !interrupted => {
                interrupted = true;
                run.interrupt();
            }
            _ = sleep_until(deadline) => {
                let checkpoint = match &mut policy {
                    SamplingPolicy::Interval(period) => {
                        next_interval_sample = next_interval_sample
                            .and_then(|at| next_tick(at, *period, Instant::now()));
                        None
                    }
                    SamplingPolicy::Checkpoints(plan) => {
                        match plan.claim_due(run.start.elapsed()) {
                            Some(c) => Some(c),
                            None => continue,
                        }
                    }
                };
                if let Some(sample) = run.sample(checkpoint) {
                    run.enforce_limit(sample);
                }
            }
        }
    };

    run.transition(SupervisorState::Completing);
    tracing::debug!(?confirmed, kill_requested = run.kill_requested, "child exit confirmed");

    // The exit future reaps the child, so its pid is gone (or already reused):
    // there is no reading left to take. The last sample is the last one
    // taken while the child was alive.
    if let SamplingPolicy::Checkpoints(plan) = &mut policy {
        if plan.claim_final() {
            tracing::debug!(
                checkpoint = Checkpoint::Final.as_str(),
                "child reaped, nothing left to sample"
            );
        }
    }

    let duration = run.start.elapsed();
    let ctx = RunContext {
        command,
        started_at,
        log_file: log_path,
        summary_file: config.summary_file.clone(),
    };
    let result = outcome::synthesize(ctx, &run.stats, confirmed, run.kill_requested, duration);

    run.log.write(|l| {
        l.write_footer(
            result.exit_code,
            result.duration,
            result.avg_memory_mb,
            result.max_memory_mb,
        )
    });
    if run.log.failures > 0 {
        tracing::warn!(failures = run.log.failures, "run log is incomplete");
    }

    tracing::info!(
        status = %result.status,
        exit_code = result.exit_code,
        duration_secs = duration.as_secs_f64(),
        avg_mb = result.avg_memory_mb,
        max_mb = result.max_memory_mb,
        samples = result.sample_count,
        "job finished"
    );

    let store = SummaryStore::new(&config.summary_file);
    let summary = store.append(RunSummary::from(&result));
    if let Err(e) = &summary {
        tracing::error!(error = %e, "failed to record run in summary file");
    }

    run.transition(SupervisorState::Terminated);
    Ok(RunOutcome { result, summary })
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Next interval sample time. A late tick is not made up for: the schedule
/// restarts one period from now. `None` when the clock cannot represent it.
fn next_tick(scheduled: Instant, period: Duration, now: Instant) -> Option<Instant> {
    match scheduled.checked_add(period) {
        Some(next) if next > now => Some(next),
        _ => now.checked_add(period),
    }
}

/// Fatal supervisor errors: the run never produced a result.
#[derive(Debug)]
pub enum SupervisorError {
    LogDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Spawn(SpawnError),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::LogDir { path, source } => {
                write!(
                    f,
                    "failed to create log directory {}: {source}",
                    path.display()
                )
            }
            SupervisorError::Spawn(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::LogDir { source, .. } => Some(source),
            SupervisorError::Spawn(e) => Some(e),
        }
    }
}
