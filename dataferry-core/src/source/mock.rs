//! Scripted sources for tests and offline demos.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{DatasetRef, FallbackSource, HttpBody, PrimarySource, SourceCredential};
use crate::error::SourceError;

#[derive(Debug, Clone)]
enum PrimaryScript {
    Files(Vec<(String, String)>),
    AuthFailure,
    NotFound,
    NetworkFailure,
}

/// A primary source that writes fixed files or fails in a fixed way.
pub struct MockPrimarySource {
    script: PrimaryScript,
    authenticate_calls: AtomicUsize,
    download_calls: AtomicUsize,
}

impl MockPrimarySource {
    fn scripted(script: PrimaryScript) -> Self {
        Self {
            script,
            authenticate_calls: AtomicUsize::new(0),
            download_calls: AtomicUsize::new(0),
        }
    }

    /// Download succeeds and writes these `(file name, contents)` pairs.
    pub fn with_files(files: Vec<(String, String)>) -> Self {
        Self::scripted(PrimaryScript::Files(files))
    }

    pub fn failing_auth() -> Self {
        Self::scripted(PrimaryScript::AuthFailure)
    }

    pub fn failing_not_found() -> Self {
        Self::scripted(PrimaryScript::NotFound)
    }

    pub fn failing_network() -> Self {
        Self::scripted(PrimaryScript::NetworkFailure)
    }

    pub fn authenticate_calls(&self) -> usize {
        self.authenticate_calls.load(Ordering::Relaxed)
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PrimarySource for MockPrimarySource {
    async fn authenticate(&self) -> Result<SourceCredential, SourceError> {
        self.authenticate_calls.fetch_add(1, Ordering::Relaxed);
        match self.script {
            PrimaryScript::AuthFailure => Err(SourceError::Auth {
                message: "401 Unauthorized".into(),
            }),
            _ => Ok(SourceCredential::Anonymous),
        }
    }

    async fn download_archive(
        &self,
        _credential: &SourceCredential,
        dataset: &DatasetRef,
        dest_dir: &Path,
    ) -> Result<(), SourceError> {
        self.download_calls.fetch_add(1, Ordering::Relaxed);
        match &self.script {
            PrimaryScript::Files(files) => {
                for (name, contents) in files {
                    tokio::fs::write(dest_dir.join(name), contents).await?;
                }
                Ok(())
            }
            PrimaryScript::NotFound => Err(SourceError::NotFound {
                message: dataset.to_string(),
            }),
            PrimaryScript::NetworkFailure => Err(SourceError::Network {
                message: "connection reset by peer".into(),
            }),
            PrimaryScript::AuthFailure => Err(SourceError::Auth {
                message: "401 Unauthorized".into(),
            }),
        }
    }
}

/// A fallback that answers every request with the same status and body.
pub struct MockFallbackSource {
    response: Option<HttpBody>,
    calls: AtomicUsize,
    last_url: Mutex<Option<String>>,
}

impl MockFallbackSource {
    pub fn new(status: u16, bytes: Vec<u8>) -> Self {
        Self {
            response: Some(HttpBody { status, bytes }),
            calls: AtomicUsize::new(0),
            last_url: Mutex::new(None),
        }
    }

    /// Every request fails before a response arrives.
    pub fn failing_network() -> Self {
        Self {
            response: None,
            calls: AtomicUsize::new(0),
            last_url: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn last_url(&self) -> Option<String> {
        self.last_url
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl FallbackSource for MockFallbackSource {
    async fn get_bytes(&self, url: &str) -> Result<HttpBody, SourceError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        *self.last_url.lock().unwrap_or_else(|e| e.into_inner()) = Some(url.to_string());
        self.response.clone().ok_or_else(|| SourceError::Network {
            message: format!("failed to connect to {}", url),
        })
    }
}
