//! File-backed warehouse: each table is `<root>/<dataset>/<table>.csv`.
//!
//! Jobs are recorded on submit and executed when waited on. A load writes the
//! complete new table to a sibling temp file and renames it into place, so a
//! failed job never leaves a partially written table behind.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use super::{
    parse_csv_load, JobHandle, JobStatus, LoadJobConfig, TableInfo, TableRef, Warehouse, WriteMode,
};
use crate::error::WarehouseError;

#[derive(Debug, Clone)]
enum LocalJob {
    Pending {
        source: PathBuf,
        table: TableRef,
        config: LoadJobConfig,
    },
    Finished(JobStatus),
}

pub struct LocalWarehouse {
    root: PathBuf,
    jobs: Mutex<HashMap<String, LocalJob>>,
}

impl LocalWarehouse {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the CSV file of a table below the root, rejecting traversal.
    pub fn table_path(&self, table: &TableRef) -> Result<PathBuf, WarehouseError> {
        let dataset = path_segment("dataset", &table.dataset)?;
        let name = path_segment("table", &table.table)?;
        Ok(self.root.join(dataset).join(format!("{}.csv", name)))
    }

    fn run_load(&self, source: &Path, table: &TableRef, config: &LoadJobConfig) -> JobStatus {
        match self.try_load(source, table, config) {
            Ok(loaded) => {
                debug!(%table, rows = loaded, "Local load committed");
                JobStatus::Done {
                    output_rows: Some(loaded as u64),
                }
            }
            Err(diagnostic) => JobStatus::Failed { diagnostic },
        }
    }

    fn try_load(&self, source: &Path, table: &TableRef, config: &LoadJobConfig) -> Result<usize, String> {
        let bytes = std::fs::read(source)
            .map_err(|e| format!("cannot read source {}: {}", source.display(), e))?;
        let parsed = parse_csv_load(&bytes, config)?;
        let loaded = parsed.rows.len();

        let path = self.table_path(table).map_err(|e| e.to_string())?;
        let mut rows: Vec<Vec<String>> = Vec::new();
        if config.write_disposition == WriteMode::Append && path.exists() {
            let mut existing = csv::Reader::from_path(&path)
                .map_err(|e| format!("cannot read table {}: {}", table, e))?;
            let existing_header: Vec<String> = existing
                .headers()
                .map_err(|e| format!("cannot read table {}: {}", table, e))?
                .iter()
                .map(str::to_string)
                .collect();
            if existing_header != parsed.header {
                return Err(format!(
                    "schema mismatch for {}: table has {:?}, source has {:?}",
                    table, existing_header, parsed.header
                ));
            }
            for record in existing.records() {
                let record = record.map_err(|e| format!("corrupt table {}: {}", table, e))?;
                rows.push(record.iter().map(str::to_string).collect());
            }
        }
        rows.extend(parsed.rows);

        let dir = path
            .parent()
            .ok_or_else(|| format!("invalid table path {}", path.display()))?;
        std::fs::create_dir_all(dir).map_err(|e| format!("cannot create dataset dir: {}", e))?;

        let tmp = dir.join(format!(".{}.{}.tmp", table.table, Uuid::new_v4().simple()));
        let written = write_table(&tmp, &parsed.header, &rows);
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(format!("cannot write table {}: {}", table, e));
        }
        std::fs::rename(&tmp, &path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            format!("cannot commit table {}: {}", table, e)
        })?;
        Ok(loaded)
    }
}

fn path_segment<'a>(kind: &str, name: &'a str) -> Result<&'a str, WarehouseError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\']) => Ok(name),
        _ => Err(WarehouseError::Other {
            message: format!("invalid {} name '{}'", kind, name),
        }),
    }
}

fn write_table(path: &Path, header: &[String], rows: &[Vec<String>]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn source_path(source_uri: &str) -> Result<PathBuf, WarehouseError> {
    let url = Url::parse(source_uri).map_err(|e| WarehouseError::Other {
        message: format!("invalid source URI '{}': {}", source_uri, e),
    })?;
    if url.scheme() != "file" {
        return Err(WarehouseError::Other {
            message: format!("local warehouse cannot read '{}' URIs", url.scheme()),
        });
    }
    url.to_file_path().map_err(|_| WarehouseError::Other {
        message: format!("invalid file URI '{}'", source_uri),
    })
}

#[async_trait]
impl Warehouse for LocalWarehouse {
    async fn submit_load_job(
        &self,
        job_id: &str,
        source_uri: &str,
        table: &TableRef,
        config: &LoadJobConfig,
    ) -> Result<JobHandle, WarehouseError> {
        let handle = JobHandle {
            job_id: job_id.to_string(),
            project: None,
            location: None,
        };
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(job_id) {
            return Ok(handle);
        }
        self.table_path(table)?;
        let source = source_path(source_uri)?;
        if !source.is_file() {
            return Err(WarehouseError::NotFound {
                message: format!("staged object {} does not exist", source_uri),
            });
        }
        jobs.insert(
            job_id.to_string(),
            LocalJob::Pending {
                source,
                table: table.clone(),
                config: config.clone(),
            },
        );
        Ok(handle)
    }

    async fn wait_for_completion(&self, job: &JobHandle) -> Result<JobStatus, WarehouseError> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs
            .get_mut(&job.job_id)
            .ok_or_else(|| WarehouseError::NotFound {
                message: format!("unknown job {}", job.job_id),
            })?;
        let status = match entry {
            LocalJob::Finished(status) => status.clone(),
            LocalJob::Pending {
                source,
                table,
                config,
            } => self.run_load(source, table, config),
        };
        *entry = LocalJob::Finished(status.clone());
        Ok(status)
    }

    async fn get_table(&self, table: &TableRef) -> Result<TableInfo, WarehouseError> {
        let path = self.table_path(table)?;
        if !path.is_file() {
            return Err(WarehouseError::NotFound {
                message: format!("table {} does not exist", table),
            });
        }
        let mut reader = csv::Reader::from_path(&path).map_err(|e| WarehouseError::Other {
            message: e.to_string(),
        })?;
        let mut row_count = 0u64;
        for record in reader.records() {
            record.map_err(|e| WarehouseError::Other {
                message: format!("corrupt table {}: {}", table, e),
            })?;
            row_count += 1;
        }
        Ok(TableInfo { row_count })
    }
}
