//! # Dataferry Core
//!
//! Core library for the dataferry ingestion pipeline.
//! Provides the source fetcher, stage uploader, warehouse loader, pipeline
//! runner, scheduled trigger, configuration, and credential handling.

pub mod artifact;
pub mod config;
pub mod credentials;
pub mod error;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod stage;
pub mod trigger;
pub mod warehouse;

// Re-export commonly used types at the crate root.
pub use artifact::{ArtifactLocator, LocalArtifact};
pub use config::{BackendKind, ConfigOverrides, PipelineConfig, load_config};
pub use credentials::{GcpCredential, KaggleCredential};
pub use error::{
    ConfigError, DataferryError, FetchError, LoadError, PipelineError, Result, StageError,
    TriggerError,
};
pub use pipeline::{PipelineRunner, PipelineStep, RunResult, RunState, RunStatus, StepRecord};
pub use retry::RetryConfig;
pub use source::{DatasetRef, FetchOrigin, FetchOutcome, SourceFetcher};
pub use stage::{ObjectStore, StageUploader, StagedObject};
pub use trigger::{JobCommand, Schedule, ScheduledTrigger, TriggerOutcome};
pub use warehouse::{SchemaMode, TableRef, Warehouse, WarehouseLoader, WriteMode};
