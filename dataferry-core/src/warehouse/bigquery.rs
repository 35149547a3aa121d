//! BigQuery client over the REST jobs API.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{JobHandle, JobStatus, LoadJobConfig, SchemaMode, TableInfo, TableRef, Warehouse};
use crate::credentials::GcpCredential;
use crate::error::WarehouseError;
use crate::retry::is_transient_status;

const API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";

pub struct BigQueryWarehouse {
    client: reqwest::Client,
    credential: GcpCredential,
    location: String,
    poll_interval: Duration,
    job_timeout: Duration,
    api_base: String,
}

impl BigQueryWarehouse {
    /// `request_timeout` bounds each HTTP call; `with_polling` bounds the
    /// wait for a whole job.
    pub fn new(
        credential: GcpCredential,
        location: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, WarehouseError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("dataferry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WarehouseError::Other {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            credential,
            location: location.into(),
            poll_interval: Duration::from_secs(2),
            job_timeout: Duration::from_secs(600),
            api_base: API_BASE.to_string(),
        })
    }

    /// Point the client at another endpoint (emulators).
    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.job_timeout = timeout;
        self
    }

    fn project_for(&self, table: &TableRef) -> String {
        table
            .project
            .clone()
            .unwrap_or_else(|| self.credential.project_id.clone())
    }

    async fn get_json(&self, url: &str) -> Result<Value, WarehouseError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(self.credential.access_token())
            .send()
            .await
            .map_err(network_error)?;
        read_json(response).await
    }
}

/// Build the `jobs.insert` request body for a load job.
pub fn load_job_body(
    project: &str,
    job_id: &str,
    location: &str,
    source_uri: &str,
    table: &TableRef,
    config: &LoadJobConfig,
) -> Value {
    let mut load = json!({
        "sourceUris": [source_uri],
        "destinationTable": {
            "projectId": project,
            "datasetId": table.dataset,
            "tableId": table.table,
        },
        "sourceFormat": config.source_format.as_str(),
        "skipLeadingRows": config.skip_leading_rows,
        "writeDisposition": config.write_disposition.disposition(),
        "createDisposition": "CREATE_IF_NEEDED",
    });
    match &config.schema {
        SchemaMode::Infer => {
            load["autodetect"] = json!(true);
        }
        SchemaMode::Explicit { fields } => {
            let fields: Vec<Value> = fields
                .iter()
                .map(|f| {
                    json!({
                        "name": f.name,
                        "type": f.field_type.as_str(),
                        "mode": if f.nullable { "NULLABLE" } else { "REQUIRED" },
                    })
                })
                .collect();
            load["autodetect"] = json!(false);
            load["schema"] = json!({ "fields": fields });
        }
    }
    json!({
        "jobReference": {
            "projectId": project,
            "jobId": job_id,
            "location": location,
        },
        "configuration": { "load": load },
    })
}

#[derive(Debug, Deserialize)]
struct JobResource {
    status: JobResourceStatus,
    #[serde(default)]
    statistics: Option<JobStatistics>,
}

#[derive(Debug, Deserialize)]
struct JobStatistics {
    #[serde(default)]
    load: Option<LoadStatistics>,
}

#[derive(Debug, Deserialize)]
struct LoadStatistics {
    #[serde(rename = "outputRows", default)]
    output_rows: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JobResourceStatus {
    state: String,
    #[serde(rename = "errorResult", default)]
    error_result: Option<ErrorProto>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

/// Interpret a job resource. `None` while the job is still running.
pub fn job_status_from_resource(resource: &Value) -> Result<Option<JobStatus>, WarehouseError> {
    let job: JobResource =
        serde_json::from_value(resource.clone()).map_err(|e| WarehouseError::Other {
            message: format!("unexpected job resource: {}", e),
        })?;
    if job.status.state != "DONE" {
        return Ok(None);
    }
    match job.status.error_result {
        None => {
            // outputRows is an int64 encoded as a string.
            let output_rows = job
                .statistics
                .and_then(|s| s.load)
                .and_then(|l| l.output_rows)
                .and_then(|v| int64(&v));
            Ok(Some(JobStatus::Done { output_rows }))
        }
        Some(err) => {
            let mut diagnostic = format!("{}: {}", err.reason, err.message);
            for detail in job.status.errors.iter().take(5) {
                if detail.message != err.message {
                    diagnostic.push_str(&format!("; {}", detail.message));
                }
            }
            Ok(Some(JobStatus::Failed { diagnostic }))
        }
    }
}

fn int64(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse::<u64>().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn network_error(e: reqwest::Error) -> WarehouseError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        WarehouseError::Transient {
            message: e.to_string(),
        }
    } else {
        WarehouseError::Other {
            message: e.to_string(),
        }
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, WarehouseError> {
    let status = response.status().as_u16();
    let body = response.text().await.map_err(network_error)?;
    if !(200..=299).contains(&status) {
        let message = format!("HTTP {}: {}", status, body.trim());
        return Err(match status {
            401 | 403 => WarehouseError::Permission { message },
            404 => WarehouseError::NotFound { message },
            s if is_transient_status(s) => WarehouseError::Transient { message },
            _ => WarehouseError::Other { message },
        });
    }
    serde_json::from_str(&body).map_err(|e| WarehouseError::Other {
        message: format!("invalid JSON response: {}", e),
    })
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn submit_load_job(
        &self,
        job_id: &str,
        source_uri: &str,
        table: &TableRef,
        config: &LoadJobConfig,
    ) -> Result<JobHandle, WarehouseError> {
        let project = self.project_for(table);
        let body = load_job_body(&project, job_id, &self.location, source_uri, table, config);
        let url = format!("{}/projects/{}/jobs", self.api_base, urlencoding::encode(&project));
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.credential.access_token())
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;
        let handle = JobHandle {
            job_id: job_id.to_string(),
            project: Some(project),
            location: Some(self.location.clone()),
        };
        // An earlier attempt with this job id reached the server.
        if response.status().as_u16() == 409 {
            info!(job_id = %job_id, "Load job already submitted; resuming it");
            return Ok(handle);
        }
        read_json(response).await?;
        Ok(handle)
    }

    async fn wait_for_completion(&self, job: &JobHandle) -> Result<JobStatus, WarehouseError> {
        let location = job.location.clone().unwrap_or_else(|| self.location.clone());
        let project = job
            .project
            .clone()
            .unwrap_or_else(|| self.credential.project_id.clone());
        let url = format!(
            "{}/projects/{}/jobs/{}?location={}",
            self.api_base,
            urlencoding::encode(&project),
            urlencoding::encode(&job.job_id),
            urlencoding::encode(&location)
        );
        let started = Instant::now();
        loop {
            let resource = self.get_json(&url).await?;
            if let Some(status) = job_status_from_resource(&resource)? {
                return Ok(status);
            }
            if started.elapsed() >= self.job_timeout {
                return Err(WarehouseError::Other {
                    message: format!(
                        "job {} did not finish within {}s",
                        job.job_id,
                        self.job_timeout.as_secs()
                    ),
                });
            }
            debug!(job_id = %job.job_id, "Load job still running");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn get_table(&self, table: &TableRef) -> Result<TableInfo, WarehouseError> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables/{}",
            self.api_base,
            urlencoding::encode(&self.project_for(table)),
            urlencoding::encode(&table.dataset),
            urlencoding::encode(&table.table)
        );
        let resource = self.get_json(&url).await?;
        let row_count = int64(&resource["numRows"]).ok_or_else(|| WarehouseError::Other {
            message: format!("table {} has no numRows", table),
        })?;
        Ok(TableInfo { row_count })
    }
}
