//! Directory-backed object store: buckets are directories under a root.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use url::Url;
use uuid::Uuid;

use super::ObjectStore;
use crate::error::StoreError;

/// Marker file recording the location a bucket was created with.
const LOCATION_FILE: &str = ".location";

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, StoreError> {
        if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket == "." || bucket == ".." {
            return Err(StoreError::Other {
                message: format!("invalid bucket name '{}'", bucket),
            });
        }
        Ok(self.root.join(bucket))
    }

    /// Resolve an object key below its bucket, rejecting traversal.
    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StoreError::Other {
                message: format!("invalid object key '{}'", key),
            });
        }
        Ok(self.bucket_dir(bucket)?.join(relative))
    }
}

fn io_error(context: &str, e: std::io::Error) -> StoreError {
    match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::NotFound {
            message: format!("{}: {}", context, e),
        },
        std::io::ErrorKind::PermissionDenied => StoreError::Permission {
            message: format!("{}: {}", context, e),
        },
        _ => StoreError::Other {
            message: format!("{}: {}", context, e),
        },
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError> {
        Ok(self.bucket_dir(bucket)?.is_dir())
    }

    async fn create_bucket(&self, bucket: &str, location: &str) -> Result<(), StoreError> {
        let dir = self.bucket_dir(bucket)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create bucket", e))?;
        tokio::fs::write(dir.join(LOCATION_FILE), location)
            .await
            .map_err(|e| io_error("write bucket location", e))
    }

    async fn upload_file(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), StoreError> {
        if !self.bucket_dir(bucket)?.is_dir() {
            return Err(StoreError::NotFound {
                message: format!("bucket {} does not exist", bucket),
            });
        }
        let target = self.object_path(bucket, key)?;
        let parent = target.parent().ok_or_else(|| StoreError::Other {
            message: format!("invalid object key '{}'", key),
        })?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error("create object dir", e))?;

        let tmp = parent.join(format!(".upload.{}.tmp", Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::copy(local_path, &tmp).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error("copy artifact", e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error("commit object", e));
        }
        Ok(())
    }

    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self.object_path(bucket, key)?.is_file())
    }

    fn uri(&self, bucket: &str, key: &str) -> String {
        let path = self.root.join(bucket).join(key);
        let absolute = std::path::absolute(&path).unwrap_or(path);
        Url::from_file_path(&absolute)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| format!("file://{}", absolute.display()))
    }
}
