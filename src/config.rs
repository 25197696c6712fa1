use crate::adapters::SamplerKind;
use crate::summary::SUMMARY_FILE_NAME;
use serde::Deserialize;
use crate::schedule::{MAX_PERIOD, MIN_PERIOD};
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from memwatch.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub monitor: MonitorSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub memory_limit_mb: u64,
    pub log_dir: PathBuf,
    pub summary_file: Option<PathBuf>,
    pub kill_on_limit: bool,
    pub silent: bool,
    pub check_interval_secs: f64,
    pub sampler: SamplerKind,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            memory_limit_mb: 500,
            log_dir: PathBuf::from("./logs"),
            summary_file: None,
            kill_on_limit: true,
            silent: false,
            check_interval_secs: 2.0,
            sampler: SamplerKind::Auto,
        }
    }
}

impl FileConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Values given on the command line; `None` means "use the file value".
#[derive(Debug, Default)]
pub struct Overrides {
    pub memory_limit_mb: Option<u64>,
    pub log_dir: Option<PathBuf>,
    pub summary_file: Option<PathBuf>,
    pub no_kill: bool,
    pub silent: bool,
    pub check_interval_secs: Option<f64>,
    pub sampler: Option<SamplerKind>,
}

/// The command to supervise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetCommand {
    argv: Vec<String>,
}

impl TargetCommand {
    pub fn new(argv: Vec<String>) -> Result<Self, ConfigError> {
        match argv.first() {
            Some(first) if !first.trim().is_empty() => Ok(Self { argv }),
            _ => Err(ConfigError::EmptyCommand),
        }
    }

    /// Program and arguments to exec. A lone argument with whitespace in it is
    /// a shell command line and goes through `sh -c`.
    pub fn program_and_args(&self) -> (String, Vec<String>) {
        if self.argv.len() == 1 && self.argv[0].contains(char::is_whitespace) {
            return (
                "sh".to_string(),
                vec!["-c".to_string(), self.argv[0].clone()],
            );
        }
        (self.argv[0].clone(), self.argv[1..].to_vec())
    }

    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Fully resolved, validated settings for one run. Never mutated after
/// construction.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub command: TargetCommand,
    pub memory_limit_mb: u64,
    pub log_dir: PathBuf,
    pub summary_file: PathBuf,
    pub silent: bool,
    pub kill_on_limit: bool,
    pub check_interval_secs: f64,
    pub sampler: SamplerKind,
}

impl MonitorConfig {
    pub fn resolve(
        command: TargetCommand,
        file: MonitorSection,
        overrides: Overrides,
    ) -> Result<Self, ConfigError> {
        let log_dir = overrides.log_dir.unwrap_or(file.log_dir);
        let summary_file = overrides
            .summary_file
            .or(file.summary_file)
            .unwrap_or_else(|| log_dir.join(SUMMARY_FILE_NAME));

        let config = Self {
            command,
            memory_limit_mb: overrides.memory_limit_mb.unwrap_or(file.memory_limit_mb),
            log_dir,
            summary_file,
            silent: overrides.silent || file.silent,
            kill_on_limit: file.kill_on_limit && !overrides.no_kill,
            check_interval_secs: overrides
                .check_interval_secs
                .unwrap_or(file.check_interval_secs),
            sampler: overrides.sampler.unwrap_or(file.sampler),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_limit_mb == 0 {
            return Err(ConfigError::Invalid(
                "memory limit must be greater than 0 MB".to_string(),
            ));
        }
        let interval = self.check_interval_secs;
        if !interval.is_finite() || interval < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "check interval must be a non-negative number of seconds, got {interval}"
            )));
        }
        // 0 selects checkpoint mode; anything else must be a usable period
        let (min, max) = (MIN_PERIOD.as_secs_f64(), MAX_PERIOD.as_secs_f64());
        if interval != 0.0 && !(min..=max).contains(&interval) {
            return Err(ConfigError::Invalid(format!(
                "check interval must be 0 or between {min}s and {max}s, got {interval}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    EmptyCommand,
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {source}", path.display())
            }
            ConfigError::EmptyCommand => write!(f, "no command given to supervise"),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::EmptyCommand | ConfigError::Invalid(_) => None,
        }
    }
}
