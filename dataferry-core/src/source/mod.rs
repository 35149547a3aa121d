//! Source Fetcher: makes the dataset file present in the staging directory.
//!
//! The fetcher is idempotent: a file already matching the artifact patterns is
//! reused without contacting any source. Otherwise the primary source is tried
//! once, and on any failure the fallback URL is tried exactly once.

pub mod http;
pub mod kaggle;
pub mod mock;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::artifact::{ArtifactLocator, LocalArtifact};
use crate::credentials::KaggleCredential;
use crate::error::{ConfigError, FetchError, SourceError};

pub use http::HttpFallback;
pub use kaggle::KaggleSource;
pub use mock::{MockFallbackSource, MockPrimarySource};

/// An `owner/name` dataset slug in the source catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetRef {
    pub owner: String,
    pub name: String,
}

impl DatasetRef {
    pub fn parse(slug: &str) -> Result<Self, ConfigError> {
        let invalid = |message: &str| ConfigError::Invalid {
            field: "dataset".into(),
            message: format!("'{}': {}", slug, message),
        };
        let (owner, name) = slug
            .trim()
            .split_once('/')
            .ok_or_else(|| invalid("expected owner/name"))?;
        let valid_part = |s: &str| {
            !s.is_empty()
                && s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
                && s != "."
                && s != ".."
        };
        if !valid_part(owner) || !valid_part(name) {
            return Err(invalid(
                "owner and name must be non-empty and use only letters, digits, '-', '_' or '.'",
            ));
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl TryFrom<String> for DatasetRef {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DatasetRef> for String {
    fn from(value: DatasetRef) -> Self {
        value.to_string()
    }
}

/// Credential produced by a primary source's authentication step.
#[derive(Debug, Clone)]
pub enum SourceCredential {
    Kaggle(KaggleCredential),
    /// The source needs no credential.
    Anonymous,
}

/// The dataset catalog the pipeline downloads from first.
#[async_trait]
pub trait PrimarySource: Send + Sync {
    async fn authenticate(&self) -> Result<SourceCredential, SourceError>;

    /// Download the dataset archive and expand it into `dest_dir`.
    async fn download_archive(
        &self,
        credential: &SourceCredential,
        dataset: &DatasetRef,
        dest_dir: &Path,
    ) -> Result<(), SourceError>;
}

/// Raw HTTP response body with its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpBody {
    pub status: u16,
    pub bytes: Vec<u8>,
}

/// Plain URL download used when the primary source fails.
#[async_trait]
pub trait FallbackSource: Send + Sync {
    async fn get_bytes(&self, url: &str) -> Result<HttpBody, SourceError>;
}

/// Where the artifact of a fetch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchOrigin {
    AlreadyPresent,
    Primary,
    Fallback,
}

impl fmt::Display for FetchOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchOrigin::AlreadyPresent => write!(f, "already_present"),
            FetchOrigin::Primary => write!(f, "primary"),
            FetchOrigin::Fallback => write!(f, "fallback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub artifact: LocalArtifact,
    pub origin: FetchOrigin,
}

/// The Source Fetcher step.
pub struct SourceFetcher {
    primary: Arc<dyn PrimarySource>,
    fallback: Arc<dyn FallbackSource>,
    locator: ArtifactLocator,
    fallback_url: Option<String>,
    canonical_filename: String,
    reuse_existing: bool,
}

impl SourceFetcher {
    pub fn new(
        primary: Arc<dyn PrimarySource>,
        fallback: Arc<dyn FallbackSource>,
        locator: ArtifactLocator,
    ) -> Self {
        Self {
            primary,
            fallback,
            locator,
            fallback_url: None,
            canonical_filename: "Covid Data.csv".to_string(),
            reuse_existing: true,
        }
    }

    pub fn with_fallback_url(mut self, url: Option<String>) -> Self {
        self.fallback_url = url.filter(|u| !u.trim().is_empty());
        self
    }

    /// File name the fallback download is written to.
    pub fn with_canonical_filename(mut self, name: impl Into<String>) -> Self {
        self.canonical_filename = name.into();
        self
    }

    pub fn with_reuse_existing(mut self, reuse: bool) -> Self {
        self.reuse_existing = reuse;
        self
    }

    pub fn locator(&self) -> &ArtifactLocator {
        &self.locator
    }

    pub async fn fetch(
        &self,
        dataset: &DatasetRef,
        staging_dir: &Path,
    ) -> Result<FetchOutcome, FetchError> {
        tokio::fs::create_dir_all(staging_dir)
            .await
            .map_err(|e| staging_error(staging_dir, e))?;

        if self.reuse_existing {
            if let Some(path) = self.locate(staging_dir)? {
                warn!(
                    file = %path.display(),
                    age_secs = file_age_secs(&path),
                    "Reusing existing artifact without freshness check"
                );
                let artifact = LocalArtifact::inspect(&path)?;
                return Ok(FetchOutcome {
                    artifact,
                    origin: FetchOrigin::AlreadyPresent,
                });
            }
        } else {
            self.clear_existing(staging_dir).await?;
        }

        let origin = match self.fetch_primary(dataset, staging_dir).await {
            Ok(()) => FetchOrigin::Primary,
            Err(primary) => {
                let Some(url) = self.fallback_url.as_deref() else {
                    return Err(FetchError::Primary { source: primary });
                };
                warn!(%dataset, error = %primary, fallback_url = url, "Primary source failed, trying fallback");
                if let Err(fallback) = self.fetch_fallback(url, staging_dir).await {
                    return Err(FetchError::BothFailed { primary, fallback });
                }
                FetchOrigin::Fallback
            }
        };

        let path = self
            .locate(staging_dir)?
            .ok_or_else(|| FetchError::ArtifactMissing {
                dir: staging_dir.to_path_buf(),
                patterns: self.locator.patterns().to_vec(),
            })?;
        let artifact = LocalArtifact::inspect(&path)?;
        info!(
            file = %artifact.path.display(),
            rows = artifact.row_count,
            columns = artifact.column_count,
            %origin,
            "Fetched artifact"
        );
        Ok(FetchOutcome { artifact, origin })
    }

    fn locate(&self, dir: &Path) -> Result<Option<PathBuf>, FetchError> {
        self.locator.locate(dir).map_err(|e| staging_error(dir, e))
    }

    async fn clear_existing(&self, dir: &Path) -> Result<(), FetchError> {
        let stale = self
            .locator
            .matching_files(dir)
            .map_err(|e| staging_error(dir, e))?;
        for path in stale {
            info!(file = %path.display(), "Removing existing artifact before download");
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| staging_error(&path, e))?;
        }
        Ok(())
    }

    async fn fetch_primary(&self, dataset: &DatasetRef, dir: &Path) -> Result<(), SourceError> {
        let credential = self.primary.authenticate().await?;
        self.primary.download_archive(&credential, dataset, dir).await
    }

    async fn fetch_fallback(&self, url: &str, dir: &Path) -> Result<(), SourceError> {
        let body = self.fallback.get_bytes(url).await?;
        if body.status != 200 {
            return Err(SourceError::Status {
                status: body.status,
                url: url.to_string(),
            });
        }
        let target = dir.join(&self.canonical_filename);
        let tmp = dir.join(format!(".{}.part", self.canonical_filename));
        tokio::fs::write(&tmp, &body.bytes).await?;
        tokio::fs::rename(&tmp, &target).await?;
        info!(url, file = %target.display(), bytes = body.bytes.len(), "Downloaded fallback file");
        Ok(())
    }
}

fn staging_error(path: &Path, e: std::io::Error) -> FetchError {
    FetchError::Staging {
        message: format!("{}: {}", path.display(), e),
    }
}

fn file_age_secs(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
