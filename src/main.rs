mod adapters;
mod analysis;
mod config;
mod outcome;
mod report;
mod sample_log;
mod schedule;
mod stats;
mod summary;
mod supervisor;

use adapters::SamplerKind;
use clap::{Parser, Subcommand};
use config::{FileConfig, MonitorConfig, Overrides, TargetCommand};
use std::path::PathBuf;
use summary::{SummaryStore, SUMMARY_FILE_NAME};
use supervisor::SupervisorError;
use tracing_subscriber::EnvFilter;

/// Exit code when the target command cannot be launched.
const EXIT_SPAWN_FAILED: i32 = 127;
/// Exit code for any other supervisor-side failure.
const EXIT_SUPERVISOR_ERROR: i32 = 125;

/// Run a command under memory supervision: sample its resident memory, kill
/// it when it crosses a limit, and keep a history of every run.
#[derive(Parser, Debug)]
#[command(name = "memwatch", version, about)]
pub struct Cli {
    /// Debug-level logging (sampling, checkpoints, state transitions)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command and watch its memory
    Run {
        /// Memory limit in MB
        #[arg(short = 'm', long = "memory-limit")]
        memory_limit: Option<u64>,

        /// Directory for per-run logs
        #[arg(short, long)]
        log_dir: Option<PathBuf>,

        /// Summary file (default: <log-dir>/etl_summary.json)
        #[arg(short, long)]
        summary_file: Option<PathBuf>,

        /// Only warn when the limit is exceeded
        #[arg(long)]
        no_kill: bool,

        /// Discard the command's output and only log warnings
        #[arg(long)]
        silent: bool,

        /// Seconds between samples; 0 samples only at fixed checkpoints
        #[arg(short, long)]
        interval: Option<f64>,

        /// Memory sampler to use
        #[arg(long, value_enum)]
        sampler: Option<SamplerKind>,

        /// Print the memory analysis after the run
        #[arg(long)]
        analyze: bool,

        /// Config file path
        #[arg(short, long, default_value = "memwatch.toml")]
        config: PathBuf,

        /// Command to run, with its arguments
        #[arg(
            value_name = "COMMAND",
            required = true,
            trailing_var_arg = true,
            allow_hyphen_values = true
        )]
        target: Vec<String>,
    },
    /// Analyze a run log: statistics, patterns, suggestions
    Analyze {
        /// Log file written by `memwatch run`
        log_file: PathBuf,

        /// Limit to judge headroom against (default: the one in the log)
        #[arg(long)]
        limit: Option<u64>,

        /// Also write an HTML report
        #[arg(long)]
        html: Option<PathBuf>,

        /// Skip the terminal chart
        #[arg(long)]
        no_chart: bool,
    },
    /// Show past runs from the summary file
    History {
        /// Summary file to read
        #[arg(short, long, conflicts_with = "log_dir")]
        summary_file: Option<PathBuf>,

        /// Log directory holding etl_summary.json
        #[arg(short, long, default_value = "./logs")]
        log_dir: PathBuf,

        /// Show only the last N runs
        #[arg(long, default_value_t = 20)]
        last: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        _ if cli.verbose => "debug",
        Commands::Run { silent: true, .. } => "warn",
        _ => "info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match cli.command {
        Commands::Run {
            memory_limit,
            log_dir,
            summary_file,
            no_kill,
            silent,
            interval,
            sampler,
            analyze,
            config,
            target,
        } => {
            let overrides = Overrides {
                memory_limit_mb: memory_limit,
                log_dir,
                summary_file,
                no_kill,
                silent,
                check_interval_secs: interval,
                sampler,
            };
            handle_run(&config, target, overrides, analyze).await
        }
        Commands::Analyze {
            log_file,
            limit,
            html,
            no_chart,
        } => match report::handle_analyze(&log_file, limit, html.as_deref(), !no_chart) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("Error: {e}");
                EXIT_SUPERVISOR_ERROR
            }
        },
        Commands::History {
            summary_file,
            log_dir,
            last,
        } => {
            let path = summary_file.unwrap_or_else(|| log_dir.join(SUMMARY_FILE_NAME));
            match summary::handle_history(&SummaryStore::new(path), last) {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("Error: {e}");
                    EXIT_SUPERVISOR_ERROR
                }
            }
        }
    };
    std::process::exit(code);
}

/// Handle the `run` subcommand. Returns the process exit code.
async fn handle_run(
    config_path: &std::path::Path,
    argv: Vec<String>,
    overrides: Overrides,
    analyze: bool,
) -> i32 {
    let config = match resolve_config(config_path, argv, overrides) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            return EXIT_SUPERVISOR_ERROR;
        }
    };

    let mut adapter = adapters::detect(config.sampler);

    let outcome = match supervisor::run(&config, adapter.as_mut()).await {
        Ok(o) => o,
        Err(e @ SupervisorError::Spawn(_)) => {
            eprintln!("Error: {e}");
            return EXIT_SPAWN_FAILED;
        }
        Err(e) => {
            eprintln!("Error: {e}");
            return EXIT_SUPERVISOR_ERROR;
        }
    };

    let result = &outcome.result;
    println!(
        "Job `{}` finished: {} (exit code {}) after {:.2}s",
        result.command,
        result.status,
        result.exit_code,
        result.duration.as_secs_f64()
    );
    println!(
        "Memory usage: avg {}MB, max {}MB over {} samples",
        result.avg_memory_mb, result.max_memory_mb, result.sample_count
    );
    println!("Log file: {}", result.log_file.display());
    match &outcome.summary {
        Ok(count) => println!(
            "Summary: {} ({count} runs recorded)",
            result.summary_file.display()
        ),
        Err(e) => eprintln!("Warning: run not recorded in summary: {e}"),
    }

    if analyze {
        println!();
        print!(
            "{}",
            report::format_analysis(&result.samples, Some(config.memory_limit_mb), true)
        );
    }

    result.exit_code
}

fn resolve_config(
    config_path: &std::path::Path,
    argv: Vec<String>,
    overrides: Overrides,
) -> Result<MonitorConfig, config::ConfigError> {
    let file = FileConfig::load(config_path)?;
    let command = TargetCommand::new(argv)?;
    MonitorConfig::resolve(command, file.monitor, overrides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_collects_trailing_command() {
        let cli = Cli::parse_from([
            "memwatch", "run", "-m", "256", "-i", "0", "python3", "etl.py", "--batch", "10",
        ]);
        match cli.command {
            Commands::Run {
                memory_limit,
                interval,
                target,
                no_kill,
                ..
            } => {
                assert_eq!(memory_limit, Some(256));
                assert_eq!(interval, Some(0.0));
                assert_eq!(target, vec!["python3", "etl.py", "--batch", "10"]);
                assert!(!no_kill);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_run_requires_command() {
        assert!(Cli::try_parse_from(["memwatch", "run", "-m", "100"]).is_err());
    }

    #[test]
    fn test_sampler_flag_parses() {
        let cli = Cli::parse_from(["memwatch", "run", "--sampler", "sysinfo", "true"]);
        assert!(matches!(
            cli.command,
            Commands::Run {
                sampler: Some(SamplerKind::Sysinfo),
                ..
            }
        ));
    }

    #[test]
    fn test_history_defaults() {
        let cli = Cli::parse_from(["memwatch", "history"]);
        match cli.command {
            Commands::History {
                summary_file,
                log_dir,
                last,
            } => {
                assert!(summary_file.is_none());
                assert_eq!(log_dir, PathBuf::from("./logs"));
                assert_eq!(last, 20);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_resolve_config_rejects_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_config(
            &dir.path().join("missing.toml"),
            vec![String::new()],
            Overrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, config::ConfigError::EmptyCommand));
    }
}
