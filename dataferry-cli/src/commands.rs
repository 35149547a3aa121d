//! Subcommand handlers and backend wiring.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use dataferry_core::config::WORKSPACE_CONFIG_FILE;
use dataferry_core::credentials::resolve_credential_path;
use dataferry_core::source::{HttpFallback, KaggleSource};
use dataferry_core::stage::{FsObjectStore, GcsObjectStore};
use dataferry_core::warehouse::{BigQueryWarehouse, LocalWarehouse};
use dataferry_core::{
    BackendKind, ConfigOverrides, GcpCredential, JobCommand, ObjectStore, PipelineConfig,
    PipelineRunner, Schedule, ScheduledTrigger, Warehouse,
};
use tracing::info;

use crate::{Commands, ConfigAction};

/// Everything the handlers need from the command line.
#[derive(Debug, Clone)]
pub struct Context {
    pub workspace: PathBuf,
    pub config_file: Option<PathBuf>,
    pub overrides: ConfigOverrides,
    pub verbose: u8,
    pub quiet: bool,
}

impl Context {
    fn load_config(&self) -> anyhow::Result<PipelineConfig> {
        dataferry_core::load_config(
            Some(&self.workspace),
            self.config_file.as_deref(),
            Some(&self.overrides),
        )
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
    }
}

pub async fn handle_command(command: Commands, ctx: &Context) -> anyhow::Result<()> {
    match command {
        Commands::Run => handle_run(ctx).await,
        Commands::Trigger => handle_trigger(ctx).await,
        Commands::Schedule { dry_run } => handle_schedule(ctx, dry_run).await,
        Commands::Config { action } => handle_config(action, ctx).await,
    }
}

async fn handle_run(ctx: &Context) -> anyhow::Result<()> {
    let config = ctx.load_config()?;
    let runner = build_runner(&config).await?;
    let table = runner.settings().table.clone();
    let result = runner.run_isolated().await?;
    if !ctx.quiet {
        println!(
            "run {} {}: {} rows loaded into {} ({} rows in table) in {:.1}s",
            result.run_id,
            result.status,
            result.rows,
            table,
            result.table_rows,
            result.elapsed.as_secs_f64()
        );
    }
    Ok(())
}

async fn handle_trigger(ctx: &Context) -> anyhow::Result<()> {
    let config = ctx.load_config()?;
    config.validate()?;
    let trigger = ScheduledTrigger::new(Schedule::from_config(&config.schedule)?, job_command(ctx)?);
    let outcome = trigger.run_once().await?;
    if !ctx.quiet {
        println!(
            "triggered run succeeded in {:.1}s ({} lines of output)",
            outcome.duration.as_secs_f64(),
            outcome.lines
        );
    }
    Ok(())
}

async fn handle_schedule(ctx: &Context, dry_run: Option<usize>) -> anyhow::Result<()> {
    let config = ctx.load_config()?;
    let schedule = Schedule::from_config(&config.schedule)?;

    if let Some(n) = dry_run {
        println!(
            "{} ({} in {}):",
            schedule.name(),
            schedule.expression(),
            schedule.timezone()
        );
        for time in schedule.upcoming(Utc::now(), n) {
            println!(
                "  {}  ({})",
                time.to_rfc3339(),
                time.with_timezone(&schedule.timezone()).format("%Y-%m-%d %H:%M:%S %Z")
            );
        }
        return Ok(());
    }

    config.validate()?;
    let trigger = ScheduledTrigger::new(schedule, job_command(ctx)?);
    let (tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping scheduler");
            let _ = tx.send(true);
        }
    });
    trigger.run_forever(rx).await?;
    Ok(())
}

async fn handle_config(action: ConfigAction, ctx: &Context) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = ctx.load_config()?;
            println!("{}", config.to_toml()?);
            Ok(())
        }
        ConfigAction::Validate => {
            let config = ctx.load_config()?;
            config.validate()?;
            if !ctx.quiet {
                println!(
                    "Configuration OK: {} -> {}/{} -> {} ({:?} backend)",
                    config.dataset,
                    config.store.bucket,
                    config.store.object_key,
                    config.warehouse.table_ref(),
                    config.backend.kind
                );
            }
            Ok(())
        }
        ConfigAction::Init => {
            let path = init_workspace_config(&ctx.workspace)?;
            println!("Configuration file: {}", path.display());
            Ok(())
        }
    }
}

/// Write a default `dataferry.toml` unless one already exists.
fn init_workspace_config(workspace: &Path) -> anyhow::Result<PathBuf> {
    let path = workspace.join(WORKSPACE_CONFIG_FILE);
    if path.exists() {
        return Ok(path);
    }
    let toml = PipelineConfig::default().to_toml()?;
    std::fs::write(&path, toml).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// The child invocation: this executable running `run` with the same inputs.
fn job_command(ctx: &Context) -> anyhow::Result<JobCommand> {
    let exe = std::env::current_exe().context("cannot locate the dataferry executable")?;
    Ok(child_command(exe, ctx))
}

fn child_command(exe: PathBuf, ctx: &Context) -> JobCommand {
    let mut cmd = JobCommand::new(exe).arg("run").arg("--workspace").arg(&ctx.workspace);
    if let Some(path) = &ctx.config_file {
        cmd = cmd.arg("--config").arg(path);
    }
    if let Some(kind) = ctx.overrides.backend {
        let name = match kind {
            BackendKind::Local => "local",
            BackendKind::Cloud => "cloud",
        };
        cmd = cmd.arg("--backend").arg(name);
    }
    if let Some(dir) = &ctx.overrides.staging_dir {
        cmd = cmd.arg("--staging-dir").arg(dir);
    }
    if let Some(bucket) = &ctx.overrides.bucket {
        cmd = cmd.arg("--bucket").arg(bucket);
    }
    if ctx.verbose > 0 {
        cmd = cmd.arg(OsString::from(format!("-{}", "v".repeat(ctx.verbose as usize))));
    }
    cmd.env("NO_COLOR", "1")
}

/// Build the runner with the clients selected by `backend.kind`.
async fn build_runner(config: &PipelineConfig) -> anyhow::Result<PipelineRunner> {
    config.validate()?;
    let timeout = Duration::from_secs(config.fetch.timeout_secs);
    let primary = Arc::new(KaggleSource::new(config.credentials.kaggle.clone(), timeout)?);
    let fallback = Arc::new(HttpFallback::new(timeout)?);

    let (store, warehouse): (Arc<dyn ObjectStore>, Arc<dyn Warehouse>) = match config.backend.kind {
        BackendKind::Local => {
            let root = &config.backend.local_root;
            info!(root = %root.display(), "Using local backend");
            (
                Arc::new(FsObjectStore::new(root.join("lake"))),
                Arc::new(LocalWarehouse::new(root.join("warehouse"))),
            )
        }
        BackendKind::Cloud => {
            let path = resolve_credential_path("gcp", &config.credentials.gcp)?;
            let credential = GcpCredential::load(&path, config.warehouse.project.as_deref()).await?;
            info!(project = %credential.project_id, "Using cloud backend");
            let store = GcsObjectStore::new(
                credential.clone(),
                Duration::from_secs(config.store.request_timeout_secs),
            )?;
            let warehouse = BigQueryWarehouse::new(
                credential,
                config.warehouse.location.clone(),
                Duration::from_secs(config.warehouse.request_timeout_secs),
            )?
            .with_polling(
                Duration::from_millis(config.warehouse.poll_interval_ms),
                Duration::from_secs(config.warehouse.job_timeout_secs),
            );
            (Arc::new(store), Arc::new(warehouse))
        }
    };

    Ok(PipelineRunner::from_config(
        config, primary, fallback, store, warehouse,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx(workspace: &Path) -> Context {
        Context {
            workspace: workspace.to_path_buf(),
            config_file: Some(PathBuf::from("pipeline.toml")),
            overrides: ConfigOverrides {
                staging_dir: None,
                backend: Some(BackendKind::Cloud),
                bucket: Some("b1".into()),
            },
            verbose: 2,
            quiet: false,
        }
    }

    #[test]
    fn test_child_command_forwards_inputs() {
        let cmd = child_command(PathBuf::from("/usr/bin/dataferry"), &ctx(Path::new("/srv/ws")));
        let args: Vec<String> = cmd
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "run",
                "--workspace",
                "/srv/ws",
                "--config",
                "pipeline.toml",
                "--backend",
                "cloud",
                "--bucket",
                "b1",
                "-vv",
            ]
        );
        assert_eq!(cmd.envs, vec![(OsString::from("NO_COLOR"), OsString::from("1"))]);
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = init_workspace_config(dir.path()).unwrap();
        let parsed: PipelineConfig = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.store.object_key, "raw/covid19_data.csv");

        std::fs::write(&path, "dataset = \"a/b\"\n").unwrap();
        init_workspace_config(dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "dataset = \"a/b\"\n");
    }

    #[tokio::test]
    async fn test_build_runner_rejects_invalid_config() {
        let config = PipelineConfig::default();
        let err = build_runner(&config).await.err().unwrap();
        assert!(err.to_string().contains("store.bucket"));
    }
}
