//! Stage Uploader: pushes a local artifact into the intermediate object store.
//!
//! The destination bucket is created on first use. Uploads overwrite the
//! object at the target key, so reruns converge to the same staged state.

pub mod fs;
pub mod gcs;
pub mod memory;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifact::LocalArtifact;
use crate::error::{StageError, StoreError};
use crate::retry::{with_retry, RetryConfig};

pub use fs::FsObjectStore;
pub use gcs::GcsObjectStore;
pub use memory::MemoryObjectStore;

/// Object store capability used by the uploader.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError>;

    async fn create_bucket(&self, bucket: &str, location: &str) -> Result<(), StoreError>;

    /// Upload a local file, replacing any existing object at `key`.
    async fn upload_file(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), StoreError>;

    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError>;

    /// The URI a warehouse uses to read the object.
    fn uri(&self, bucket: &str, key: &str) -> String;
}

/// The artifact's copy inside the object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedObject {
    pub bucket: String,
    pub key: String,
    pub uri: String,
    /// Whether this run had to create the bucket.
    pub bucket_created: bool,
    pub size_bytes: u64,
}

/// The Stage Uploader step.
pub struct StageUploader {
    store: Arc<dyn ObjectStore>,
    location: String,
    retry: RetryConfig,
}

impl StageUploader {
    pub fn new(store: Arc<dyn ObjectStore>, location: impl Into<String>, retry: RetryConfig) -> Self {
        Self {
            store,
            location: location.into(),
            retry,
        }
    }

    pub async fn upload(
        &self,
        artifact: &LocalArtifact,
        bucket: &str,
        key: &str,
    ) -> Result<StagedObject, StageError> {
        // The file may have changed since the fetch step inspected it.
        let artifact = LocalArtifact::inspect(&artifact.path)?;

        let exists = self
            .call("bucket_exists", || self.store.bucket_exists(bucket))
            .await?;
        let bucket_created = if exists {
            debug!(bucket, "Bucket exists");
            false
        } else {
            info!(bucket, location = %self.location, "Bucket not found, creating");
            self.call("create_bucket", || {
                self.store.create_bucket(bucket, &self.location)
            })
            .await?;
            true
        };

        self.call("upload_file", || {
            self.store.upload_file(bucket, key, &artifact.path)
        })
        .await?;

        if !self
            .call("object_exists", || self.store.object_exists(bucket, key))
            .await?
        {
            return Err(StageError::Store {
                op: "upload_file".into(),
                source: StoreError::NotFound {
                    message: format!("{}/{} missing after upload", bucket, key),
                },
            });
        }

        let uri = self.store.uri(bucket, key);
        info!(
            file = %artifact.path.display(),
            uri = %uri,
            bytes = artifact.size_bytes,
            "Uploaded artifact"
        );
        Ok(StagedObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            uri,
            bucket_created,
            size_bytes: artifact.size_bytes,
        })
    }

    async fn call<F, Fut, T>(&self, op: &str, operation: F) -> Result<T, StageError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        with_retry(&self.retry, op, operation)
            .await
            .map_err(|source| StageError::Store {
                op: op.to_string(),
                source,
            })
    }
}

/// Map an HTTP status from a store API to an error class.
pub(crate) fn classify_status(status: u16, message: String) -> StoreError {
    match status {
        401 | 403 => StoreError::Permission { message },
        404 => StoreError::NotFound { message },
        s if crate::retry::is_transient_status(s) => StoreError::Transient { message },
        _ => StoreError::Other { message },
    }
}
