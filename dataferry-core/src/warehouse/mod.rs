//! Warehouse Loader: loads a staged object into a destination table.
//!
//! The loader builds a load job description, submits it, blocks until the
//! warehouse reports completion, then reads the table back to confirm the row
//! count. Backends implement [`Warehouse`]; a failed job must leave the
//! destination table untouched.

pub mod bigquery;
pub mod local;
pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LoadError, WarehouseError};
use crate::retry::{with_retry, RetryConfig};
use crate::stage::StagedObject;

pub use bigquery::BigQueryWarehouse;
pub use local::LocalWarehouse;
pub use memory::MemoryWarehouse;

/// A destination table reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            project: None,
            dataset: dataset.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

/// Write disposition of a load job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Replace all existing rows.
    #[default]
    Truncate,
    Append,
}

impl WriteMode {
    pub fn disposition(&self) -> &'static str {
        match self {
            WriteMode::Truncate => "WRITE_TRUNCATE",
            WriteMode::Append => "WRITE_APPEND",
        }
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::Truncate => write!(f, "truncate"),
            WriteMode::Append => write!(f, "append"),
        }
    }
}

/// Column type for fixed-schema loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "STRING",
            FieldType::Integer => "INTEGER",
            FieldType::Float => "FLOAT",
            FieldType::Boolean => "BOOLEAN",
        }
    }

    /// Whether a raw CSV cell parses as this type.
    pub fn accepts(&self, value: &str) -> bool {
        let v = value.trim();
        match self {
            FieldType::String => true,
            FieldType::Integer => v.parse::<i64>().is_ok(),
            FieldType::Float => v.parse::<f64>().is_ok(),
            FieldType::Boolean => matches!(
                v.to_ascii_lowercase().as_str(),
                "true" | "false" | "1" | "0"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
        }
    }
}

/// Schema handling for a load job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SchemaMode {
    /// Let the warehouse detect column names and types.
    #[default]
    Infer,
    Explicit { fields: Vec<FieldSpec> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceFormat {
    Csv,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Csv => "CSV",
        }
    }
}

/// Everything a warehouse needs to run one load job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadJobConfig {
    pub source_format: SourceFormat,
    /// Leading rows to skip; the first one is the header when non-zero.
    pub skip_leading_rows: u32,
    pub schema: SchemaMode,
    pub write_disposition: WriteMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
    /// Project the job was created in, when the warehouse has projects.
    pub project: Option<String>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// `output_rows` is the number of rows this job wrote, if reported.
    Done { output_rows: Option<u64> },
    Failed { diagnostic: String },
}

/// A fresh load job id. Generated once per load so retried submits reuse it.
pub fn new_job_id() -> String {
    format!("dataferry_{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableInfo {
    pub row_count: u64,
}

/// Warehouse capability used by the loader.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Submit a load job under the caller's `job_id`.
    ///
    /// Submitting an id the warehouse already knows must return that job's
    /// handle without starting a second load.
    async fn submit_load_job(
        &self,
        job_id: &str,
        source_uri: &str,
        table: &TableRef,
        config: &LoadJobConfig,
    ) -> Result<JobHandle, WarehouseError>;

    /// Block until the job reaches a terminal state.
    async fn wait_for_completion(&self, job: &JobHandle) -> Result<JobStatus, WarehouseError>;

    async fn get_table(&self, table: &TableRef) -> Result<TableInfo, WarehouseError>;
}

/// Summary of a successful load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub job_id: String,
    pub table: TableRef,
    /// Rows written by this load.
    pub rows: u64,
    /// Rows in the table after the load, as read back from the warehouse.
    pub table_rows: u64,
    pub write_mode: WriteMode,
}

/// The Warehouse Loader step.
pub struct WarehouseLoader {
    warehouse: Arc<dyn Warehouse>,
    retry: RetryConfig,
    skip_leading_rows: u32,
}

impl WarehouseLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, retry: RetryConfig) -> Self {
        Self {
            warehouse,
            retry,
            skip_leading_rows: 1,
        }
    }

    pub fn with_skip_leading_rows(mut self, rows: u32) -> Self {
        self.skip_leading_rows = rows;
        self
    }

    pub fn job_config(&self, mode: WriteMode, schema: &SchemaMode) -> LoadJobConfig {
        LoadJobConfig {
            source_format: SourceFormat::Csv,
            skip_leading_rows: self.skip_leading_rows,
            schema: schema.clone(),
            write_disposition: mode,
        }
    }

    pub async fn load(
        &self,
        staged: &StagedObject,
        table: &TableRef,
        mode: WriteMode,
        schema: &SchemaMode,
    ) -> Result<LoadReport, LoadError> {
        let config = self.job_config(mode, schema);
        let uri = staged.uri.as_str();
        let job_id = new_job_id();

        let job = with_retry(&self.retry, "submit_load_job", || {
            self.warehouse.submit_load_job(&job_id, uri, table, &config)
        })
        .await
        .map_err(|source| LoadError::Submit { source })?;
        debug!(job_id = %job.job_id, source_uri = uri, %table, mode = %mode, "Load job submitted");

        let status = with_retry(&self.retry, "wait_for_completion", || {
            self.warehouse.wait_for_completion(&job)
        })
        .await
        .map_err(|source| LoadError::Wait {
            job_id: job.job_id.clone(),
            source,
        })?;

        let output_rows = match status {
            JobStatus::Done { output_rows } => output_rows,
            JobStatus::Failed { diagnostic } => {
                return Err(LoadError::JobFailed {
                    job_id: job.job_id,
                    diagnostic,
                });
            }
        };

        let info = with_retry(&self.retry, "get_table", || self.warehouse.get_table(table))
            .await
            .map_err(|source| LoadError::ReadBack {
                table: table.to_string(),
                source,
            })?;

        let rows = match (output_rows, mode) {
            (Some(rows), _) => rows,
            (None, WriteMode::Truncate) => info.row_count,
            (None, WriteMode::Append) => {
                warn!(job_id = %job.job_id, %table, "Warehouse did not report loaded rows");
                0
            }
        };
        info!(
            job_id = %job.job_id,
            %table,
            rows,
            table_rows = info.row_count,
            "Loaded table"
        );
        Ok(LoadReport {
            job_id: job.job_id,
            table: table.clone(),
            rows,
            table_rows: info.row_count,
            write_mode: mode,
        })
    }
}

/// Parsed rows of a staged CSV object, validated against a load job config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedLoad {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Parse and validate a staged CSV object for the file-backed warehouses.
///
/// Returns the warehouse diagnostic on failure. Nothing is committed by this
/// function, so callers can apply the result atomically.
pub(crate) fn parse_csv_load(bytes: &[u8], config: &LoadJobConfig) -> Result<ParsedLoad, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut skipped: Vec<Vec<String>> = Vec::new();
    let mut rows: Vec<Vec<String>> = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.map_err(|e| format!("malformed CSV at record {}: {}", idx + 1, e))?;
        let values: Vec<String> = record.iter().map(str::to_string).collect();
        if (idx as u32) < config.skip_leading_rows {
            skipped.push(values);
        } else {
            rows.push(values);
        }
    }

    let header: Vec<String> = match &config.schema {
        SchemaMode::Explicit { fields } => fields.iter().map(|f| f.name.clone()).collect(),
        SchemaMode::Infer => match skipped.first() {
            Some(h) => h.iter().map(|c| c.trim().to_string()).collect(),
            None => {
                let width = rows.first().map(Vec::len).unwrap_or(0);
                (1..=width).map(|i| format!("column{}", i)).collect()
            }
        },
    };
    if header.is_empty() {
        return Err("source has no columns".to_string());
    }

    for (idx, row) in rows.iter().enumerate() {
        let line = idx + 1 + config.skip_leading_rows as usize;
        if row.len() != header.len() {
            return Err(format!(
                "row {} has {} columns, expected {}",
                line,
                row.len(),
                header.len()
            ));
        }
        if let SchemaMode::Explicit { fields } = &config.schema {
            for (field, value) in fields.iter().zip(row) {
                if value.trim().is_empty() {
                    if !field.nullable {
                        return Err(format!("row {}: required field '{}' is empty", line, field.name));
                    }
                    continue;
                }
                if !field.field_type.accepts(value) {
                    return Err(format!(
                        "row {}: could not parse '{}' as {} for field '{}'",
                        line,
                        value,
                        field.field_type.as_str(),
                        field.name
                    ));
                }
            }
        }
    }

    Ok(ParsedLoad { header, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn infer_config(mode: WriteMode) -> LoadJobConfig {
        LoadJobConfig {
            source_format: SourceFormat::Csv,
            skip_leading_rows: 1,
            schema: SchemaMode::Infer,
            write_disposition: mode,
        }
    }

    #[test]
    fn test_table_ref_display() {
        assert_eq!(
            TableRef::new("covid19_dataset", "covid_raw").to_string(),
            "covid19_dataset.covid_raw"
        );
    }

    #[test]
    fn test_write_mode_disposition() {
        assert_eq!(WriteMode::Truncate.disposition(), "WRITE_TRUNCATE");
        assert_eq!(WriteMode::Append.disposition(), "WRITE_APPEND");
        assert_eq!(WriteMode::default(), WriteMode::Truncate);
    }

    #[test]
    fn test_field_type_accepts() {
        assert!(FieldType::Integer.accepts(" 42 "));
        assert!(!FieldType::Integer.accepts("4.2"));
        assert!(FieldType::Float.accepts("4.2"));
        assert!(FieldType::Boolean.accepts("TRUE"));
        assert!(!FieldType::Boolean.accepts("yes"));
        assert!(FieldType::String.accepts("anything"));
    }

    #[test]
    fn test_schema_mode_toml() {
        let infer: SchemaMode = toml::from_str(r#"mode = "infer""#).unwrap();
        assert_eq!(infer, SchemaMode::Infer);
        let explicit: SchemaMode = toml::from_str(
            r#"
mode = "explicit"
[[fields]]
name = "column1"
type = "STRING"
[[fields]]
name = "column2"
type = "INTEGER"
nullable = false
"#,
        )
        .unwrap();
        match explicit {
            SchemaMode::Explicit { fields } => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[1].field_type, FieldType::Integer);
                assert!(!fields[1].nullable);
                assert!(fields[0].nullable);
            }
            SchemaMode::Infer => panic!("expected explicit schema"),
        }
    }

    #[test]
    fn test_parse_csv_load_infers_header() {
        let parsed = parse_csv_load(b"a,b\n1,2\n3,4\n", &infer_config(WriteMode::Truncate)).unwrap();
        assert_eq!(parsed.header, vec!["a", "b"]);
        assert_eq!(parsed.rows.len(), 2);
    }

    #[test]
    fn test_parse_csv_load_without_header_synthesizes_columns() {
        let mut config = infer_config(WriteMode::Truncate);
        config.skip_leading_rows = 0;
        let parsed = parse_csv_load(b"1,2\n3,4\n", &config).unwrap();
        assert_eq!(parsed.header, vec!["column1", "column2"]);
        assert_eq!(parsed.rows.len(), 2);
    }

    #[test]
    fn test_parse_csv_load_rejects_ragged_rows() {
        let err = parse_csv_load(b"a,b\n1,2\n3\n", &infer_config(WriteMode::Truncate)).unwrap_err();
        assert!(err.contains("row 3"));
    }

    #[test]
    fn test_parse_csv_load_explicit_schema_type_mismatch() {
        let config = LoadJobConfig {
            schema: SchemaMode::Explicit {
                fields: vec![
                    FieldSpec::new("name", FieldType::String),
                    FieldSpec::new("age", FieldType::Integer),
                ],
            },
            ..infer_config(WriteMode::Append)
        };
        let err = parse_csv_load(b"name,age\nana,31\nbo,old\n", &config).unwrap_err();
        assert!(err.contains("INTEGER"));
        assert!(err.contains("age"));
    }

    #[test]
    fn test_parse_csv_load_explicit_schema_nullability() {
        let mut age = FieldSpec::new("age", FieldType::Integer);
        age.nullable = false;
        let config = LoadJobConfig {
            schema: SchemaMode::Explicit {
                fields: vec![FieldSpec::new("name", FieldType::String), age],
            },
            ..infer_config(WriteMode::Append)
        };
        assert!(parse_csv_load(b"name,age\n,31\n", &config).is_ok());
        assert!(parse_csv_load(b"name,age\nana,\n", &config).is_err());
    }

    // --- WarehouseLoader retries ---

    use crate::stage::MemoryObjectStore;

    const CSV: &str = "USMER,SEX,AGE\n2,1,65\n2,2,72\n1,2,55\n";

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn staged_warehouse() -> (Arc<MemoryWarehouse>, StagedObject) {
        let store = Arc::new(MemoryObjectStore::new());
        store.put_object("b1", "raw/covid19_data.csv", CSV.as_bytes().to_vec());
        let staged = StagedObject {
            bucket: "b1".into(),
            key: "raw/covid19_data.csv".into(),
            uri: "mem://b1/raw/covid19_data.csv".into(),
            bucket_created: false,
            size_bytes: CSV.len() as u64,
        };
        (Arc::new(MemoryWarehouse::new(store)), staged)
    }

    fn covid_table() -> TableRef {
        TableRef::new("covid19_dataset", "covid_raw")
    }

    #[tokio::test]
    async fn test_loader_retries_transient_submit() {
        let (warehouse, staged) = staged_warehouse();
        warehouse.fail_submits_transiently(2);
        let loader = WarehouseLoader::new(warehouse.clone(), fast_retry(3));

        let report = loader
            .load(&staged, &covid_table(), WriteMode::Truncate, &SchemaMode::Infer)
            .await
            .unwrap();

        assert_eq!(warehouse.submit_count(), 3);
        assert_eq!(report.rows, 3);
        assert_eq!(report.table_rows, 3);
    }

    #[tokio::test]
    async fn test_loader_gives_up_after_max_retries() {
        let (warehouse, staged) = staged_warehouse();
        warehouse.fail_submits_transiently(10);
        let loader = WarehouseLoader::new(warehouse.clone(), fast_retry(2));

        let err = loader
            .load(&staged, &covid_table(), WriteMode::Truncate, &SchemaMode::Infer)
            .await
            .unwrap_err();

        assert!(
            matches!(err, LoadError::Submit { source: WarehouseError::Transient { .. } }),
            "{:?}",
            err
        );
        assert_eq!(warehouse.submit_count(), 3);
        assert!(warehouse.table(&covid_table()).is_none());
    }

    #[tokio::test]
    async fn test_loader_does_not_retry_permission_errors() {
        let (warehouse, staged) = staged_warehouse();
        warehouse.deny_submits();
        let loader = WarehouseLoader::new(warehouse.clone(), fast_retry(3));

        let err = loader
            .load(&staged, &covid_table(), WriteMode::Truncate, &SchemaMode::Infer)
            .await
            .unwrap_err();

        assert!(
            matches!(err, LoadError::Submit { source: WarehouseError::Permission { .. } }),
            "{:?}",
            err
        );
        assert_eq!(warehouse.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_lost_submit_response_loads_once() {
        let (warehouse, staged) = staged_warehouse();
        warehouse.lose_next_submit_response();
        let loader = WarehouseLoader::new(warehouse.clone(), fast_retry(3));

        let report = loader
            .load(&staged, &covid_table(), WriteMode::Append, &SchemaMode::Infer)
            .await
            .unwrap();

        assert_eq!(warehouse.submit_count(), 2);
        assert_eq!(report.rows, 3);
        assert_eq!(report.table_rows, 3);
        assert_eq!(warehouse.table(&covid_table()).unwrap().rows.len(), 3);
    }
}
