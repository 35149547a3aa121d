//! In-memory object store that records every call.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::ObjectStore;
use crate::error::StoreError;

#[derive(Default)]
struct Bucket {
    location: String,
    objects: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
pub struct MemoryObjectStore {
    buckets: Mutex<HashMap<String, Bucket>>,
    unreachable: AtomicBool,
    transient_uploads: AtomicUsize,
    bucket_exists_calls: AtomicUsize,
    create_bucket_calls: AtomicUsize,
    upload_calls: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with a transient error while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn fail_uploads_transiently(&self, n: usize) {
        self.transient_uploads.store(n, Ordering::SeqCst);
    }

    /// Insert an object directly, creating the bucket if needed.
    pub fn put_object(&self, bucket: &str, key: &str, bytes: Vec<u8>) {
        let mut buckets = self.lock();
        buckets
            .entry(bucket.to_string())
            .or_default()
            .objects
            .insert(key.to_string(), bytes);
    }

    pub fn object_bytes(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.lock()
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .cloned()
    }

    pub fn bucket_location(&self, bucket: &str) -> Option<String> {
        self.lock().get(bucket).map(|b| b.location.clone())
    }

    pub fn bucket_exists_calls(&self) -> usize {
        self.bucket_exists_calls.load(Ordering::SeqCst)
    }

    pub fn create_bucket_calls(&self) -> usize {
        self.create_bucket_calls.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bucket>> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Transient {
                message: "connection refused".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError> {
        self.bucket_exists_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        Ok(self.lock().contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str, location: &str) -> Result<(), StoreError> {
        self.create_bucket_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        self.lock().entry(bucket.to_string()).or_insert_with(|| Bucket {
            location: location.to_string(),
            objects: HashMap::new(),
        });
        Ok(())
    }

    async fn upload_file(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), StoreError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let pending = self.transient_uploads.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_uploads.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::Transient {
                message: "503 service unavailable".into(),
            });
        }
        let bytes = std::fs::read(local_path).map_err(|e| StoreError::Other {
            message: format!("cannot read {}: {}", local_path.display(), e),
        })?;
        let mut buckets = self.lock();
        let target = buckets.get_mut(bucket).ok_or_else(|| StoreError::NotFound {
            message: format!("bucket {} does not exist", bucket),
        })?;
        target.objects.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
        self.check_reachable()?;
        Ok(self.object_bytes(bucket, key).is_some())
    }

    fn uri(&self, bucket: &str, key: &str) -> String {
        format!("mem://{}/{}", bucket, key)
    }
}
