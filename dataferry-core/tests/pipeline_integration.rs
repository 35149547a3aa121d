//! End-to-end pipeline runs against in-memory and directory-backed backends.

use std::path::Path;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use dataferry_core::error::{FetchError, SourceError, StepError};
use dataferry_core::source::{FetchOrigin, MockFallbackSource, MockPrimarySource};
use dataferry_core::stage::{FsObjectStore, MemoryObjectStore};
use dataferry_core::warehouse::{
    FieldSpec, FieldType, LocalWarehouse, MemoryWarehouse, SchemaMode, TableRef, WriteMode,
};
use dataferry_core::{
    PipelineConfig, PipelineError, PipelineRunner, PipelineStep, RetryConfig, RunState, RunStatus,
};

fn covid_csv(rows: usize) -> String {
    let mut csv = String::from("USMER,MEDICAL_UNIT,SEX,PATIENT_TYPE,DATE_DIED,AGE\n");
    for i in 0..rows {
        csv.push_str(&format!(
            "{},{},{},1,9999-99-99,{}\n",
            1 + i % 2,
            i % 13,
            1 + i % 2,
            18 + i % 70
        ));
    }
    csv
}

fn config(dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.dataset = "meirnizri/covid19-dataset".into();
    config.staging_dir = dir.join("tmp");
    config.store.bucket = "b1".into();
    config.store.object_key = "raw/covid19_data.csv".into();
    config.warehouse.dataset = "covid19_dataset".into();
    config.warehouse.table = "covid_raw".into();
    config.fetch.fallback_url = Some("https://mirror.example.com/covid%20data.csv".into());
    config.retry = RetryConfig::none();
    config
}

fn covid_table() -> TableRef {
    TableRef::new("covid19_dataset", "covid_raw")
}

struct MemoryBackend {
    store: Arc<MemoryObjectStore>,
    warehouse: Arc<MemoryWarehouse>,
}

impl MemoryBackend {
    fn new() -> Self {
        let store = Arc::new(MemoryObjectStore::new());
        let warehouse = Arc::new(MemoryWarehouse::new(store.clone()));
        Self { store, warehouse }
    }

    fn runner(
        &self,
        config: &PipelineConfig,
        primary: Arc<MockPrimarySource>,
        fallback: Arc<MockFallbackSource>,
    ) -> PipelineRunner {
        PipelineRunner::from_config(
            config,
            primary,
            fallback,
            self.store.clone(),
            self.warehouse.clone(),
        )
        .unwrap()
    }
}

#[tokio::test]
async fn test_covid_dataset_scenario() {
    let dir = TempDir::new().unwrap();
    let backend = MemoryBackend::new();
    let primary = Arc::new(MockPrimarySource::with_files(vec![(
        "Covid Data.csv".into(),
        covid_csv(1000),
    )]));
    let fallback = Arc::new(MockFallbackSource::new(404, Vec::new()));
    let mut runner = backend.runner(&config(dir.path()), primary, fallback.clone());

    let result = runner.run().await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.rows, 1000);
    assert_eq!(result.steps.len(), 3);
    assert_eq!(runner.state(), &RunState::Succeeded);
    assert_eq!(fallback.calls(), 0);
    assert_eq!(backend.store.bucket_location("b1").as_deref(), Some("EU"));
    assert!(backend
        .store
        .object_bytes("b1", "raw/covid19_data.csv")
        .is_some());
    let table = backend.warehouse.table(&covid_table()).unwrap();
    assert_eq!(table.rows.len(), 1000);
    assert_eq!(table.header[0], "USMER");
}

#[tokio::test]
async fn test_not_found_and_fallback_404_fails_in_fetching() {
    let dir = TempDir::new().unwrap();
    let backend = MemoryBackend::new();
    let primary = Arc::new(MockPrimarySource::failing_not_found());
    let fallback = Arc::new(MockFallbackSource::new(404, b"Not Found".to_vec()));
    let mut runner = backend.runner(&config(dir.path()), primary.clone(), fallback.clone());

    let err = runner.run().await.unwrap_err();

    assert_eq!(err.step(), Some(PipelineStep::Fetching));
    match err {
        PipelineError::StepFailed {
            source: StepError::Fetch(FetchError::BothFailed { primary, fallback }),
            ..
        } => {
            assert!(matches!(primary, SourceError::NotFound { .. }));
            assert!(matches!(fallback, SourceError::Status { status: 404, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(
        runner.state(),
        RunState::Failed {
            step: PipelineStep::Fetching,
            ..
        }
    ));
    assert_eq!(primary.download_calls(), 1);
    assert_eq!(fallback.calls(), 1);
    assert_eq!(backend.store.bucket_exists_calls(), 0);
    assert_eq!(backend.warehouse.submit_count(), 0);
}

#[tokio::test]
async fn test_second_run_reuses_artifact_and_bucket() {
    let dir = TempDir::new().unwrap();
    let backend = MemoryBackend::new();
    let primary = Arc::new(MockPrimarySource::with_files(vec![(
        "Covid Data.csv".into(),
        covid_csv(250),
    )]));
    let fallback = Arc::new(MockFallbackSource::new(404, Vec::new()));
    let mut runner = backend.runner(&config(dir.path()), primary.clone(), fallback.clone());

    runner.run().await.unwrap();
    let second = runner.run().await.unwrap();

    assert_eq!(primary.authenticate_calls(), 1);
    assert_eq!(primary.download_calls(), 1);
    assert_eq!(fallback.calls(), 0);
    assert!(second.steps[0].detail.contains("already_present"));
    assert_eq!(backend.store.create_bucket_calls(), 1);
    // Truncate mode: two runs still leave exactly one copy of the data.
    assert_eq!(second.rows, 250);
    assert_eq!(second.table_rows, 250);
    assert_eq!(backend.warehouse.table(&covid_table()).unwrap().rows.len(), 250);
}

#[tokio::test]
async fn test_auth_failure_falls_back_once() {
    let dir = TempDir::new().unwrap();
    let backend = MemoryBackend::new();
    let primary = Arc::new(MockPrimarySource::failing_auth());
    let fallback = Arc::new(MockFallbackSource::new(200, covid_csv(10).into_bytes()));
    let mut runner = backend.runner(&config(dir.path()), primary.clone(), fallback.clone());

    let result = runner.run().await.unwrap();

    assert_eq!(result.rows, 10);
    assert_eq!(primary.authenticate_calls(), 1);
    assert_eq!(fallback.calls(), 1);
    assert!(dir.path().join("tmp").join("Covid Data.csv").exists());
    assert!(result.steps[0].detail.contains(&FetchOrigin::Fallback.to_string()));
}

#[tokio::test]
async fn test_failed_load_keeps_previous_table() {
    let dir = TempDir::new().unwrap();
    let backend = MemoryBackend::new();
    let primary = Arc::new(MockPrimarySource::with_files(vec![(
        "Covid Data.csv".into(),
        covid_csv(40),
    )]));
    let fallback = Arc::new(MockFallbackSource::new(404, Vec::new()));
    let mut runner = backend.runner(&config(dir.path()), primary, fallback);
    runner.run().await.unwrap();
    let before = backend.warehouse.table(&covid_table()).unwrap();

    backend.warehouse.fail_next_job("Error while reading data");
    let err = runner.run().await.unwrap_err();

    assert_eq!(err.step(), Some(PipelineStep::Loading));
    assert!(err.to_string().contains("Error while reading data"));
    assert_eq!(backend.warehouse.table(&covid_table()).unwrap(), before);
}

#[tokio::test]
async fn test_unreachable_store_fails_in_staging() {
    let dir = TempDir::new().unwrap();
    let backend = MemoryBackend::new();
    backend.store.set_unreachable(true);
    let primary = Arc::new(MockPrimarySource::with_files(vec![(
        "Covid Data.csv".into(),
        covid_csv(5),
    )]));
    let fallback = Arc::new(MockFallbackSource::new(404, Vec::new()));
    let mut cfg = config(dir.path());
    cfg.retry = RetryConfig {
        max_retries: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        backoff_multiplier: 2.0,
        jitter: false,
    };
    let mut runner = backend.runner(&cfg, primary, fallback);

    let err = runner.run().await.unwrap_err();

    assert_eq!(err.step(), Some(PipelineStep::Staging));
    assert_eq!(backend.store.bucket_exists_calls(), 3);
    assert_eq!(backend.warehouse.submit_count(), 0);
}

#[tokio::test]
async fn test_local_backend_end_to_end() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join(".dataferry");
    let primary = Arc::new(MockPrimarySource::with_files(vec![(
        "Covid Data.csv".into(),
        covid_csv(100),
    )]));
    let fallback = Arc::new(MockFallbackSource::new(404, Vec::new()));
    let warehouse = Arc::new(LocalWarehouse::new(root.join("warehouse")));
    let mut cfg = config(dir.path());
    cfg.warehouse.write_mode = WriteMode::Append;

    let mut runner = PipelineRunner::from_config(
        &cfg,
        primary,
        fallback,
        Arc::new(FsObjectStore::new(root.join("lake"))),
        warehouse.clone(),
    )
    .unwrap();

    let first = runner.run().await.unwrap();
    assert_eq!((first.rows, first.table_rows), (100, 100));
    assert!(root.join("lake").join("b1").join("raw").join("covid19_data.csv").is_file());
    // Append mode adds a second copy of the rows; only this run's rows count as loaded.
    let second = runner.run().await.unwrap();
    assert_eq!((second.rows, second.table_rows), (100, 200));

    let table = std::fs::read_to_string(warehouse.table_path(&covid_table()).unwrap()).unwrap();
    assert_eq!(table.lines().count(), 201);
}

#[tokio::test]
async fn test_local_backend_rejects_schema_mismatch() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join(".dataferry");
    let primary = Arc::new(MockPrimarySource::with_files(vec![(
        "Covid Data.csv".into(),
        covid_csv(3),
    )]));
    let fallback = Arc::new(MockFallbackSource::new(404, Vec::new()));
    let warehouse = Arc::new(LocalWarehouse::new(root.join("warehouse")));
    let mut cfg = config(dir.path());
    cfg.warehouse.schema = SchemaMode::Explicit {
        fields: vec![
            FieldSpec::new("USMER", FieldType::Integer),
            FieldSpec::new("MEDICAL_UNIT", FieldType::Integer),
            FieldSpec::new("SEX", FieldType::Integer),
            FieldSpec::new("PATIENT_TYPE", FieldType::Integer),
            FieldSpec::new("DATE_DIED", FieldType::Integer),
            FieldSpec::new("AGE", FieldType::Integer),
        ],
    };

    let mut runner = PipelineRunner::from_config(
        &cfg,
        primary,
        fallback,
        Arc::new(FsObjectStore::new(root.join("lake"))),
        warehouse.clone(),
    )
    .unwrap();

    let err = runner.run().await.unwrap_err();
    assert_eq!(err.step(), Some(PipelineStep::Loading));
    assert!(err.to_string().contains("DATE_DIED"));
    assert!(!warehouse.table_path(&covid_table()).unwrap().exists());
}
