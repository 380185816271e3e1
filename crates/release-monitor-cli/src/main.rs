use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use gcs_release_monitor::config::load_config;
use gcs_release_monitor::monitor::{MonitorService, Reporter};

#[derive(Parser, Debug)]
#[command(name = "gcs-release-monitor", version)]
#[command(about = "Monitor GCS bucket releases, mirror to Nextcloud, and signal a release filter")]
struct Cli {
    /// Path to the YAML config
    #[arg(long)]
    config: PathBuf,

    /// Run exactly one polling cycle
    #[arg(long)]
    once: bool,

    /// Discover, download, and select artifacts without uploading,
    /// webhooking, or writing state
    #[arg(long)]
    dry_run: bool,

    /// Logging level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, PartialEq, PartialOrd)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" | "trace" => Some(LogLevel::Debug),
            _ => None,
        }
    }
}

/// Stderr reporter honoring the `--log-level` threshold.
struct CliReporter {
    level: LogLevel,
}

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        if self.level >= LogLevel::Info {
            eprintln!("[info] {msg}");
        }
    }

    fn warn(&mut self, msg: &str) {
        if self.level >= LogLevel::Warn {
            eprintln!("[warn] {msg}");
        }
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let Some(level) = LogLevel::parse(&cli.log_level) else {
        eprintln!("[error] invalid log level: {}", cli.log_level);
        return ExitCode::from(2);
    };
    let mut reporter = CliReporter { level };

    if cli.dry_run && !cli.once {
        reporter.error("--dry-run requires --once to avoid infinite no-op loops");
        return ExitCode::from(2);
    }

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            reporter.error(&format!("config validation failed: {err:#}"));
            return ExitCode::from(2);
        }
    };

    let service = match MonitorService::new(config) {
        Ok(service) => service,
        Err(err) => {
            reporter.error(&format!("failed to initialize monitor: {err:#}"));
            return ExitCode::FAILURE;
        }
    };

    let result = if cli.once {
        service.run_once(cli.dry_run, &mut reporter)
    } else {
        service.run_forever(&mut reporter)
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            reporter.error(&format!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}
