pub mod portable;
pub mod procfs;

use crate::config::TargetCommand;
use crate::outcome::ExitOutcome;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use tokio::process::Command;

/// Resolves exactly once, when the OS reports the child has terminated.
pub type ExitFuture = Pin<Box<dyn Future<Output = ExitOutcome> + Send>>;

/// A freshly spawned child: its pid and the future of its exit.
pub struct Spawned {
    pub pid: u32,
    pub exit: ExitFuture,
}

/// Which memory sampler to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    /// Pick the best sampler for this host
    #[default]
    Auto,
    /// Read /proc/<pid>/status directly (Linux only)
    Procfs,
    /// Use the cross-platform sysinfo crate
    Sysinfo,
}

/// Host capabilities the supervisor depends on: spawn a command, sample its
/// resident memory, and kill it.
pub trait ProcessAdapter: Send {
    /// Human-readable adapter name (e.g., "procfs", "sysinfo").
    fn name(&self) -> &'static str;

    /// Launch the command in its own process group.
    fn spawn(&mut self, command: &TargetCommand, silent: bool) -> Result<Spawned, SpawnError> {
        spawn_child(command, silent)
    }

    /// Resident memory of the child and all of its descendants, in bytes.
    ///
    /// Best effort: returns 0 when the process is gone or the measurement is
    /// unavailable. Never fails.
    fn sample_memory(&mut self, pid: u32) -> u64;

    /// Forcefully terminate the child's process group. Killing a group that no
    /// longer exists is a no-op.
    fn kill(&mut self, pid: u32) -> Result<(), KillError> {
        kill_group(pid)
    }
}

/// Pick an adapter for this host.
pub fn detect(kind: SamplerKind) -> Box<dyn ProcessAdapter> {
    let resolved = match kind {
        SamplerKind::Auto if procfs::available(Path::new(procfs::PROC_ROOT)) => SamplerKind::Procfs,
        SamplerKind::Auto => SamplerKind::Sysinfo,
        other => other,
    };
    let adapter: Box<dyn ProcessAdapter> = match resolved {
        SamplerKind::Procfs => Box::new(procfs::ProcfsAdapter::new()),
        _ => Box::new(portable::SysinfoAdapter::new()),
    };
    tracing::debug!(requested = ?kind, adapter = adapter.name(), "selected process adapter");
    adapter
}

/// Spawn with tokio. The child gets its own process group so a kill reaches
/// everything it forked, and is killed if the supervisor goes away.
pub(crate) fn spawn_child(command: &TargetCommand, silent: bool) -> Result<Spawned, SpawnError> {
    let (program, args) = command.program_and_args();
    let mut cmd = Command::new(&program);
    cmd.args(&args).process_group(0).kill_on_drop(true);
    if silent {
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }

    let mut child = cmd.spawn().map_err(|e| SpawnError {
        program: program.clone(),
        source: e,
    })?;
    let pid = child.id().ok_or_else(|| SpawnError {
        program: program.clone(),
        source: std::io::Error::other("child exited before its pid could be read"),
    })?;
    tracing::info!(pid, program = %program, args = ?args, "child process started");

    let exit: ExitFuture = Box::pin(async move {
        match child.wait().await {
            Ok(status) => ExitOutcome::from_status(status),
            Err(e) => {
                tracing::error!(pid, error = %e, "failed to wait on child process");
                ExitOutcome {
                    code: None,
                    signal: None,
                }
            }
        }
    });
    Ok(Spawned { pid, exit })
}

/// SIGKILL the process group led by `pid`.
pub(crate) fn kill_group(pid: u32) -> Result<(), KillError> {
    let raw = i32::try_from(pid).map_err(|_| KillError {
        pid,
        source: Errno::EINVAL,
    })?;
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            tracing::debug!(pid, "process group already gone, nothing to kill");
            Ok(())
        }
        Err(e) => Err(KillError { pid, source: e }),
    }
}

/// The child could not be launched. Fatal for the run.
#[derive(Debug)]
pub struct SpawnError {
    pub program: String,
    pub source: std::io::Error,
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to spawn {}: {}", self.program, self.source)
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// The kill signal could not be delivered. Recoverable.
#[derive(Debug)]
pub struct KillError {
    pub pid: u32,
    pub source: Errno,
}

impl std::fmt::Display for KillError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to kill process group {}: {}", self.pid, self.source)
    }
}

impl std::error::Error for KillError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
