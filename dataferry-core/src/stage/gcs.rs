//! Google Cloud Storage client over the JSON API.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{classify_status, ObjectStore};
use crate::credentials::GcpCredential;
use crate::error::StoreError;

const API_BASE: &str = "https://storage.googleapis.com/storage/v1";
const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";

pub struct GcsObjectStore {
    client: reqwest::Client,
    credential: GcpCredential,
    api_base: String,
    upload_base: String,
}

impl GcsObjectStore {
    /// `timeout` bounds every request; hitting it is a transient error.
    pub fn new(credential: GcpCredential, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("dataferry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StoreError::Other {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            credential,
            api_base: API_BASE.to_string(),
            upload_base: UPLOAD_BASE.to_string(),
        })
    }

    /// Point the client at another endpoint (emulators).
    pub fn with_endpoint(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        self.api_base = format!("{}/storage/v1", base);
        self.upload_base = format!("{}/upload/storage/v1", base);
        self
    }

    fn bucket_url(&self, bucket: &str) -> String {
        format!("{}/b/{}", self.api_base, urlencoding::encode(bucket))
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/b/{}/o/{}",
            self.api_base,
            urlencoding::encode(bucket),
            urlencoding::encode(key)
        )
    }

    fn upload_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/b/{}/o?uploadType=media&name={}",
            self.upload_base,
            urlencoding::encode(bucket),
            urlencoding::encode(key)
        )
    }

    /// GET a resource; `Ok(false)` on 404.
    async fn exists(&self, url: &str) -> Result<bool, StoreError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(self.credential.access_token())
            .send()
            .await
            .map_err(network_error)?;
        let status = response.status().as_u16();
        match status {
            200..=299 => Ok(true),
            404 => Ok(false),
            _ => Err(classify_status(status, error_body(response).await)),
        }
    }
}

fn network_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        StoreError::Transient {
            message: e.to_string(),
        }
    } else {
        StoreError::Other {
            message: e.to_string(),
        }
    }
}

async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    format!("HTTP {}: {}", status, body.trim())
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError> {
        self.exists(&self.bucket_url(bucket)).await
    }

    async fn create_bucket(&self, bucket: &str, location: &str) -> Result<(), StoreError> {
        let url = format!(
            "{}/b?project={}",
            self.api_base,
            urlencoding::encode(&self.credential.project_id)
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.credential.access_token())
            .json(&json!({ "name": bucket, "location": location }))
            .send()
            .await
            .map_err(network_error)?;
        let status = response.status().as_u16();
        match status {
            200..=299 => Ok(()),
            // Created concurrently or by an earlier partial run.
            409 => Ok(()),
            _ => Err(classify_status(status, error_body(response).await)),
        }
    }

    async fn upload_file(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), StoreError> {
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| StoreError::Other {
                message: format!("cannot read {}: {}", local_path.display(), e),
            })?;
        let response = self
            .client
            .post(self.upload_url(bucket, key))
            .bearer_auth(self.credential.access_token())
            .header(reqwest::header::CONTENT_TYPE, "text/csv")
            .body(bytes)
            .send()
            .await
            .map_err(network_error)?;
        let status = response.status().as_u16();
        if (200..=299).contains(&status) {
            Ok(())
        } else {
            Err(classify_status(status, error_body(response).await))
        }
    }

    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
        self.exists(&self.object_url(bucket, key)).await
    }

    fn uri(&self, bucket: &str, key: &str) -> String {
        format!("gs://{}/{}", bucket, key)
    }
}
