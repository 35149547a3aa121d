//! In-memory warehouse reading staged objects from a [`MemoryObjectStore`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{
    parse_csv_load, JobHandle, JobStatus, LoadJobConfig, TableInfo, TableRef, Warehouse, WriteMode,
};
use crate::error::WarehouseError;
use crate::stage::MemoryObjectStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Default)]
struct State {
    tables: HashMap<TableRef, MemoryTable>,
    jobs: HashMap<String, JobStatus>,
    fail_next_job: Option<String>,
    transient_submits: usize,
    lose_next_response: bool,
    deny_submits: bool,
}

/// Warehouse double with atomic per-job commits and scriptable failures.
pub struct MemoryWarehouse {
    store: Arc<MemoryObjectStore>,
    state: Mutex<State>,
    submits: AtomicUsize,
}

impl MemoryWarehouse {
    pub fn new(store: Arc<MemoryObjectStore>) -> Self {
        Self {
            store,
            state: Mutex::new(State::default()),
            submits: AtomicUsize::new(0),
        }
    }

    /// The next submitted job fails with this diagnostic and commits nothing.
    pub fn fail_next_job(&self, diagnostic: impl Into<String>) {
        self.lock().fail_next_job = Some(diagnostic.into());
    }

    /// The next `n` submissions fail with a transient error.
    pub fn fail_submits_transiently(&self, n: usize) {
        self.lock().transient_submits = n;
    }

    /// The next submission is executed but reports a transient error, as if
    /// the response was lost on the way back.
    pub fn lose_next_submit_response(&self) {
        self.lock().lose_next_response = true;
    }

    /// Every submission fails with a permission error.
    pub fn deny_submits(&self) {
        self.lock().deny_submits = true;
    }

    pub fn seed_table(&self, table: TableRef, contents: MemoryTable) {
        self.lock().tables.insert(table, contents);
    }

    pub fn table(&self, table: &TableRef) -> Option<MemoryTable> {
        self.lock().tables.get(table).cloned()
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn execute(
        &self,
        state: &mut State,
        bytes: &[u8],
        table: &TableRef,
        config: &LoadJobConfig,
    ) -> JobStatus {
        if let Some(diagnostic) = state.fail_next_job.take() {
            return JobStatus::Failed { diagnostic };
        }
        let parsed = match parse_csv_load(bytes, config) {
            Ok(parsed) => parsed,
            Err(diagnostic) => return JobStatus::Failed { diagnostic },
        };
        let loaded = parsed.rows.len() as u64;
        match (config.write_disposition, state.tables.get_mut(table)) {
            (WriteMode::Append, Some(existing)) => {
                if existing.header != parsed.header {
                    return JobStatus::Failed {
                        diagnostic: format!("schema mismatch for {}", table),
                    };
                }
                existing.rows.extend(parsed.rows);
            }
            _ => {
                state.tables.insert(
                    table.clone(),
                    MemoryTable {
                        header: parsed.header,
                        rows: parsed.rows,
                    },
                );
            }
        }
        JobStatus::Done {
            output_rows: Some(loaded),
        }
    }
}

fn parse_mem_uri(uri: &str) -> Result<(&str, &str), WarehouseError> {
    uri.strip_prefix("mem://")
        .and_then(|rest| rest.split_once('/'))
        .ok_or_else(|| WarehouseError::Other {
            message: format!("memory warehouse cannot read '{}'", uri),
        })
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn submit_load_job(
        &self,
        job_id: &str,
        source_uri: &str,
        table: &TableRef,
        config: &LoadJobConfig,
    ) -> Result<JobHandle, WarehouseError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let handle = JobHandle {
            job_id: job_id.to_string(),
            project: None,
            location: None,
        };
        let mut state = self.lock();
        if state.deny_submits {
            return Err(WarehouseError::Permission {
                message: "403 access denied".into(),
            });
        }
        if state.jobs.contains_key(job_id) {
            return Ok(handle);
        }
        if state.transient_submits > 0 {
            state.transient_submits -= 1;
            return Err(WarehouseError::Transient {
                message: "503 backend unavailable".into(),
            });
        }

        let (bucket, key) = parse_mem_uri(source_uri)?;
        let bytes = self
            .store
            .object_bytes(bucket, key)
            .ok_or_else(|| WarehouseError::NotFound {
                message: format!("staged object {} does not exist", source_uri),
            })?;

        let status = self.execute(&mut state, &bytes, table, config);
        state.jobs.insert(job_id.to_string(), status);
        if std::mem::take(&mut state.lose_next_response) {
            return Err(WarehouseError::Transient {
                message: "connection reset before response".into(),
            });
        }
        Ok(handle)
    }

    async fn wait_for_completion(&self, job: &JobHandle) -> Result<JobStatus, WarehouseError> {
        self.lock()
            .jobs
            .get(&job.job_id)
            .cloned()
            .ok_or_else(|| WarehouseError::NotFound {
                message: format!("unknown job {}", job.job_id),
            })
    }

    async fn get_table(&self, table: &TableRef) -> Result<TableInfo, WarehouseError> {
        self.lock()
            .tables
            .get(table)
            .map(|t| TableInfo {
                row_count: t.rows.len() as u64,
            })
            .ok_or_else(|| WarehouseError::NotFound {
                message: format!("table {} does not exist", table),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::ObjectStore;
    use crate::warehouse::{SchemaMode, SourceFormat};

    fn config(mode: WriteMode) -> LoadJobConfig {
        LoadJobConfig {
            source_format: SourceFormat::Csv,
            skip_leading_rows: 1,
            schema: SchemaMode::Infer,
            write_disposition: mode,
        }
    }

    #[tokio::test]
    async fn test_failed_job_commits_nothing() {
        let store = Arc::new(MemoryObjectStore::new());
        store.put_object("b1", "k.csv", b"a\n1\n2\n".to_vec());
        let wh = MemoryWarehouse::new(store.clone());
        let table = TableRef::new("ds", "t");
        let seeded = MemoryTable {
            header: vec!["a".into()],
            rows: vec![vec!["9".into()]],
        };
        wh.seed_table(table.clone(), seeded.clone());

        wh.fail_next_job("permission denied");
        let uri = store.uri("b1", "k.csv");
        let job = wh
            .submit_load_job("job-1", &uri, &table, &config(WriteMode::Truncate))
            .await
            .unwrap();
        let status = wh.wait_for_completion(&job).await.unwrap();
        assert_eq!(
            status,
            JobStatus::Failed {
                diagnostic: "permission denied".into()
            }
        );
        assert_eq!(wh.table(&table), Some(seeded));
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let store = Arc::new(MemoryObjectStore::new());
        let wh = MemoryWarehouse::new(store);
        let err = wh
            .submit_load_job("job-1", "mem://b1/missing.csv", &TableRef::new("ds", "t"), &config(WriteMode::Truncate))
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::NotFound { .. }));
    }
}
