//! Dataferry CLI: runs, triggers, and schedules the ingestion pipeline.

mod commands;

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::Parser;
use dataferry_core::BackendKind;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Dataferry: scheduled, idempotent fetch, stage, and load
#[derive(Parser, Debug)]
#[command(name = "dataferry", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (holds dataferry.toml)
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Configuration file path (replaces the workspace dataferry.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backend override: local or cloud
    #[arg(long, global = true)]
    backend: Option<BackendKind>,

    /// Staging directory override
    #[arg(long, global = true)]
    staging_dir: Option<PathBuf>,

    /// Bucket override
    #[arg(long, global = true)]
    bucket: Option<String>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the pipeline once in this process
    Run,
    /// Run the pipeline once as a child process, relaying its output
    Trigger,
    /// Run the pipeline on its cron schedule until interrupted
    Schedule {
        /// Print the next N fire times and exit
        #[arg(long, value_name = "N")]
        dry_run: Option<usize>,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Print the resolved configuration as TOML
    Show,
    /// Validate the resolved configuration
    Validate,
    /// Write a default dataferry.toml into the workspace
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // Human-readable layer for stderr (always active)
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_target(false)
        .with_filter(stderr_filter);

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "dataferry", "dataferry")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "dataferry.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    // Resolve workspace
    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let ctx = commands::Context {
        workspace,
        config_file: cli.config,
        overrides: dataferry_core::ConfigOverrides {
            staging_dir: cli.staging_dir,
            backend: cli.backend,
            bucket: cli.bucket,
        },
        verbose: cli.verbose,
        quiet: cli.quiet,
    };
    commands::handle_command(cli.command, &ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_global_flags() {
        let cli = Cli::try_parse_from([
            "dataferry",
            "run",
            "--config",
            "pipeline.toml",
            "--backend",
            "cloud",
            "-vv",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Run));
        assert_eq!(cli.config, Some(PathBuf::from("pipeline.toml")));
        assert_eq!(cli.backend, Some(BackendKind::Cloud));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_parse_schedule_dry_run() {
        let cli = Cli::try_parse_from(["dataferry", "schedule", "--dry-run", "3"]).unwrap();
        match cli.command {
            Commands::Schedule { dry_run } => assert_eq!(dry_run, Some(3)),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_config_actions() {
        let cli = Cli::try_parse_from(["dataferry", "config", "validate"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Validate
            }
        ));
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(Cli::try_parse_from(["dataferry", "run", "--backend", "s3"]).is_err());
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Cli::try_parse_from(["dataferry"]).is_err());
    }
}
