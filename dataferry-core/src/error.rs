//! Error types for the dataferry core library.
//!
//! Uses `thiserror` for public API error types. Each pipeline step owns one
//! error enum (`FetchError`, `StageError`, `LoadError`) and classifies only the
//! failures it understands; the runner wraps them with the failing step's name.

use std::path::PathBuf;

use crate::pipeline::PipelineStep;
use crate::retry::Transient;

/// Top-level error type for the dataferry core library.
#[derive(Debug, thiserror::Error)]
pub enum DataferryError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Errors from loading and validating configuration. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for '{field}': {message}")]
    Invalid { field: String, message: String },

    #[error("No {kind} credential file found (tried: {candidates})")]
    CredentialNotFound { kind: String, candidates: String },

    #[error("Failed to parse credential file {path}: {message}")]
    CredentialParse { path: PathBuf, message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from the artifact readability check.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Artifact {path} is unreadable: {message}")]
    Unreadable { path: PathBuf, message: String },

    #[error("Artifact {path} is malformed at line {line}: {message}")]
    Malformed {
        path: PathBuf,
        line: u64,
        message: String,
    },

    #[error("Artifact {path} has no data rows")]
    Empty { path: PathBuf },
}

/// Errors raised by a single dataset source (primary or fallback).
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("authentication failed: {message}")]
    Auth { message: String },

    #[error("dataset not found: {message}")]
    NotFound { message: String },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("archive error: {message}")]
    Archive { message: String },

    #[error("IO error: {message}")]
    Io { message: String },
}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        SourceError::Io {
            message: e.to_string(),
        }
    }
}

/// Errors from the Source Fetcher step.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("primary source failed and no fallback is configured: {source}")]
    Primary { source: SourceError },

    #[error("primary source failed ({primary}); fallback source failed ({fallback})")]
    BothFailed {
        primary: SourceError,
        fallback: SourceError,
    },

    #[error("no artifact matching {patterns:?} in {dir} after download")]
    ArtifactMissing { dir: PathBuf, patterns: Vec<String> },

    #[error("downloaded artifact failed the readability check: {0}")]
    InvalidArtifact(#[from] ArtifactError),

    #[error("staging directory error: {message}")]
    Staging { message: String },
}

/// Errors raised by an object store client.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transient store error: {message}")]
    Transient { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("permission denied: {message}")]
    Permission { message: String },

    #[error("store error: {message}")]
    Other { message: String },
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }
}

/// Errors from the Stage Uploader step.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("artifact is not stageable: {0}")]
    InvalidArtifact(#[from] ArtifactError),

    #[error("object store {op} failed: {source}")]
    Store { op: String, source: StoreError },
}

/// Errors raised by a warehouse client.
#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error("transient warehouse error: {message}")]
    Transient { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("permission denied: {message}")]
    Permission { message: String },

    #[error("warehouse error: {message}")]
    Other { message: String },
}

impl Transient for WarehouseError {
    fn is_transient(&self) -> bool {
        matches!(self, WarehouseError::Transient { .. })
    }
}

/// Errors from the Warehouse Loader step.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to submit load job: {source}")]
    Submit { source: WarehouseError },

    #[error("load job {job_id} failed: {diagnostic}")]
    JobFailed { job_id: String, diagnostic: String },

    #[error("failed waiting for load job {job_id}: {source}")]
    Wait {
        job_id: String,
        source: WarehouseError,
    },

    #[error("failed to read back table {table}: {source}")]
    ReadBack {
        table: String,
        source: WarehouseError,
    },
}

/// The typed cause of a failed pipeline step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Errors from the Pipeline Runner.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: PipelineStep,
        source: StepError,
    },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },
}

impl PipelineError {
    /// The step that failed, if this is a step failure.
    pub fn step(&self) -> Option<PipelineStep> {
        match self {
            PipelineError::StepFailed { step, .. } => Some(*step),
            PipelineError::InvalidStateTransition { .. } => None,
        }
    }
}

/// Errors from the out-of-process trigger.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("failed to spawn '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("run failed (exit code {}) during step {}: {}",
        .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".into()),
        .step.as_deref().unwrap_or("unknown"),
        .last_lines.last().map(String::as_str).unwrap_or("(no output)"))]
    RunFailed {
        exit_code: Option<i32>,
        step: Option<String>,
        last_lines: Vec<String>,
    },

    #[error("failed waiting for run: {message}")]
    Wait { message: String },
}

/// Errors from schedule parsing and evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCronExpression { expression: String, message: String },

    #[error("Unknown timezone: {timezone}")]
    InvalidTimezone { timezone: String },

    #[error("Schedule '{expression}' has no upcoming fire time")]
    NoUpcoming { expression: String },
}

/// A type alias for results using the top-level `DataferryError`.
pub type Result<T> = std::result::Result<T, DataferryError>;
