//! Pipeline Runner: drives one fetch, stage, load run.
//!
//! Steps run strictly in sequence and each step's output feeds the next. The
//! first unrecoverable step failure stops the run, moves the state machine to
//! `Failed`, and is returned tagged with the step it came from.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::artifact::ArtifactLocator;
use crate::config::PipelineConfig;
use crate::error::{ConfigError, DataferryError, PipelineError, StepError};
use crate::source::{DatasetRef, FallbackSource, PrimarySource, SourceFetcher};
use crate::stage::{ObjectStore, StageUploader};
use crate::warehouse::{LoadReport, SchemaMode, TableRef, Warehouse, WarehouseLoader, WriteMode};

/// One step of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStep {
    Fetching,
    Staging,
    Loading,
}

impl PipelineStep {
    pub const ALL: [PipelineStep; 3] = [
        PipelineStep::Fetching,
        PipelineStep::Staging,
        PipelineStep::Loading,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStep::Fetching => "Fetching",
            PipelineStep::Staging => "Staging",
            PipelineStep::Loading => "Loading",
        }
    }

    /// Parse a step name as it appears in log output.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    NotStarted,
    Fetching,
    Staging,
    Loading,
    Succeeded,
    Failed { step: PipelineStep, cause: String },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed { .. })
    }

    fn for_step(step: PipelineStep) -> Self {
        match step {
            PipelineStep::Fetching => RunState::Fetching,
            PipelineStep::Staging => RunState::Staging,
            PipelineStep::Loading => RunState::Loading,
        }
    }

    /// Whether `next` may follow this state.
    pub fn can_transition_to(&self, next: &RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (NotStarted, Fetching) | (Fetching, Staging) | (Staging, Loading) | (Loading, Succeeded) => true,
            (Fetching, Failed { step: PipelineStep::Fetching, .. })
            | (Staging, Failed { step: PipelineStep::Staging, .. })
            | (Loading, Failed { step: PipelineStep::Loading, .. }) => true,
            _ => false,
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(self, next: RunState) -> Result<RunState, PipelineError> {
        if self.can_transition_to(&next) {
            Ok(next)
        } else {
            Err(PipelineError::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::NotStarted => write!(f, "NotStarted"),
            RunState::Fetching => write!(f, "Fetching"),
            RunState::Staging => write!(f, "Staging"),
            RunState::Loading => write!(f, "Loading"),
            RunState::Succeeded => write!(f, "Succeeded"),
            RunState::Failed { step, .. } => write!(f, "Failed({})", step),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Ok,
    Failed,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Ok => write!(f, "ok"),
            StepOutcome::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: PipelineStep,
    pub duration: Duration,
    pub outcome: StepOutcome,
    /// What the step produced, or why it failed.
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "Succeeded"),
            RunStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Summary of one run. Only kept in memory and in the logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Rows written by this run's load job.
    pub rows: u64,
    /// Rows in the destination table after the load.
    pub table_rows: u64,
    pub steps: Vec<StepRecord>,
    pub elapsed: Duration,
    pub started_at: DateTime<Utc>,
}

/// The validated inputs of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub dataset: DatasetRef,
    pub staging_dir: PathBuf,
    pub bucket: String,
    pub object_key: String,
    pub table: TableRef,
    pub write_mode: WriteMode,
    pub schema: SchemaMode,
}

impl PipelineSettings {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            dataset: config.dataset_ref()?,
            staging_dir: config.staging_dir.clone(),
            bucket: config.store.bucket.clone(),
            object_key: config.store.object_key.clone(),
            table: config.warehouse.table_ref(),
            write_mode: config.warehouse.write_mode,
            schema: config.warehouse.schema.clone(),
        })
    }
}

/// Runs the fetch, stage, and load steps in order.
pub struct PipelineRunner {
    settings: PipelineSettings,
    fetcher: SourceFetcher,
    uploader: StageUploader,
    loader: WarehouseLoader,
    state: RunState,
    last_run: Option<RunResult>,
}

impl PipelineRunner {
    pub fn new(
        settings: PipelineSettings,
        fetcher: SourceFetcher,
        uploader: StageUploader,
        loader: WarehouseLoader,
    ) -> Self {
        Self {
            settings,
            fetcher,
            uploader,
            loader,
            state: RunState::NotStarted,
            last_run: None,
        }
    }

    /// Build a runner from a validated configuration and concrete clients.
    pub fn from_config(
        config: &PipelineConfig,
        primary: Arc<dyn PrimarySource>,
        fallback: Arc<dyn FallbackSource>,
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let settings = PipelineSettings::from_config(config)?;
        let fetcher = SourceFetcher::new(
            primary,
            fallback,
            ArtifactLocator::new(&config.fetch.patterns)?,
        )
        .with_fallback_url(config.fetch.fallback_url.clone())
        .with_canonical_filename(config.fetch.canonical_filename.clone())
        .with_reuse_existing(config.fetch.reuse_existing);
        let uploader = StageUploader::new(store, config.store.location.clone(), config.retry.clone());
        let loader = WarehouseLoader::new(warehouse, config.retry.clone())
            .with_skip_leading_rows(config.warehouse.skip_leading_rows);
        Ok(Self::new(settings, fetcher, uploader, loader))
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Step records of the most recent run.
    pub fn history(&self) -> &[StepRecord] {
        self.last_run
            .as_ref()
            .map(|r| r.steps.as_slice())
            .unwrap_or(&[])
    }

    pub fn last_run(&self) -> Option<&RunResult> {
        self.last_run.as_ref()
    }

    /// Execute one run.
    pub async fn run(&mut self) -> Result<RunResult, PipelineError> {
        let mut run = RunResult {
            run_id: Uuid::new_v4(),
            status: RunStatus::Failed,
            rows: 0,
            table_rows: 0,
            steps: Vec::new(),
            elapsed: Duration::ZERO,
            started_at: Utc::now(),
        };
        let clock = Instant::now();
        self.state = RunState::NotStarted;
        info!(
            run_id = %run.run_id,
            dataset = %self.settings.dataset,
            table = %self.settings.table,
            "Pipeline run started"
        );

        let result = self.run_steps(&mut run).await;
        run.elapsed = clock.elapsed();
        match &result {
            Ok(report) => {
                run.status = RunStatus::Succeeded;
                run.rows = report.rows;
                run.table_rows = report.table_rows;
                info!(
                    run_id = %run.run_id,
                    status = %run.status,
                    rows = run.rows,
                    table_rows = run.table_rows,
                    elapsed_ms = run.elapsed.as_millis() as u64,
                    "Pipeline run finished"
                );
            }
            Err(e) => {
                error!(
                    run_id = %run.run_id,
                    status = %run.status,
                    elapsed_ms = run.elapsed.as_millis() as u64,
                    error = %e,
                    "Pipeline run failed"
                );
            }
        }
        self.last_run = Some(run.clone());
        result.map(|_| run)
    }

    async fn run_steps(&mut self, run: &mut RunResult) -> Result<LoadReport, PipelineError> {
        let run_id = run.run_id;

        self.enter(run_id, PipelineStep::Fetching)?;
        let started = Instant::now();
        let fetched = self
            .fetcher
            .fetch(&self.settings.dataset, &self.settings.staging_dir)
            .await
            .map_err(StepError::from);
        let fetched = self.finish(run, PipelineStep::Fetching, started, fetched, |f| {
            format!("{} ({} rows, {})", f.artifact.path.display(), f.artifact.row_count, f.origin)
        })?;

        self.enter(run_id, PipelineStep::Staging)?;
        let started = Instant::now();
        let staged = self
            .uploader
            .upload(&fetched.artifact, &self.settings.bucket, &self.settings.object_key)
            .await
            .map_err(StepError::from);
        let staged = self.finish(run, PipelineStep::Staging, started, staged, |s| {
            if s.bucket_created {
                format!("{} (bucket created)", s.uri)
            } else {
                s.uri.clone()
            }
        })?;

        self.enter(run_id, PipelineStep::Loading)?;
        let started = Instant::now();
        let loaded = self
            .loader
            .load(
                &staged,
                &self.settings.table,
                self.settings.write_mode,
                &self.settings.schema,
            )
            .await
            .map_err(StepError::from);
        let report = self.finish(run, PipelineStep::Loading, started, loaded, |r| {
            format!(
                "{} rows into {} ({}, {} in table)",
                r.rows, r.table, r.write_mode, r.table_rows
            )
        })?;

        self.advance(RunState::Succeeded)?;
        Ok(report)
    }

    /// Execute one run on its own task, consuming the runner.
    ///
    /// A panic inside a step surfaces as `DataferryError::Unexpected` rather
    /// than unwinding through the caller.
    pub async fn run_isolated(mut self) -> Result<RunResult, DataferryError> {
        let task = tokio::spawn(async move { self.run().await });
        match task.await {
            Ok(result) => Ok(result?),
            Err(e) => {
                let message = if e.is_panic() {
                    let payload = e.into_panic();
                    let text = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    format!("pipeline run panicked: {}", text)
                } else {
                    format!("pipeline run was cancelled: {}", e)
                };
                error!(error = %message, "Pipeline run aborted");
                Err(DataferryError::Unexpected(message))
            }
        }
    }

    fn advance(&mut self, next: RunState) -> Result<(), PipelineError> {
        let current = std::mem::replace(&mut self.state, RunState::NotStarted);
        match current.clone().transition(next) {
            Ok(state) => {
                self.state = state;
                Ok(())
            }
            Err(e) => {
                self.state = current;
                Err(e)
            }
        }
    }

    fn enter(&mut self, run_id: Uuid, step: PipelineStep) -> Result<(), PipelineError> {
        self.advance(RunState::for_step(step))?;
        info!(run_id = %run_id, step = %step, "Step started");
        Ok(())
    }

    /// Record a finished step and convert its failure into a run failure.
    fn finish<T>(
        &mut self,
        run: &mut RunResult,
        step: PipelineStep,
        started: Instant,
        result: Result<T, StepError>,
        describe: impl FnOnce(&T) -> String,
    ) -> Result<T, PipelineError> {
        let duration = started.elapsed();
        let duration_ms = duration.as_millis() as u64;
        match result {
            Ok(value) => {
                let detail = describe(&value);
                info!(
                    run_id = %run.run_id,
                    step = %step,
                    duration_ms,
                    outcome = %StepOutcome::Ok,
                    detail = %detail,
                    "Step finished"
                );
                run.steps.push(StepRecord {
                    step,
                    duration,
                    outcome: StepOutcome::Ok,
                    detail,
                });
                Ok(value)
            }
            Err(source) => {
                let cause = source.to_string();
                error!(
                    run_id = %run.run_id,
                    step = %step,
                    duration_ms,
                    outcome = %StepOutcome::Failed,
                    error = %cause,
                    "Step failed"
                );
                run.steps.push(StepRecord {
                    step,
                    duration,
                    outcome: StepOutcome::Failed,
                    detail: cause.clone(),
                });
                self.advance(RunState::Failed { step, cause })?;
                Err(PipelineError::StepFailed { step, source })
            }
        }
    }
}
