//! Kaggle dataset API client.
//!
//! Downloads the dataset's zip archive with basic auth and expands it into the
//! staging directory. The credential file is resolved lazily so a missing
//! `kaggle.json` surfaces as an authentication failure of this source.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{DatasetRef, PrimarySource, SourceCredential};
use crate::credentials::{resolve_credential_path, KaggleCredential};
use crate::error::SourceError;

const API_BASE: &str = "https://www.kaggle.com/api/v1";

pub struct KaggleSource {
    client: reqwest::Client,
    credential_candidates: Vec<PathBuf>,
    api_base: String,
}

impl KaggleSource {
    pub fn new(credential_candidates: Vec<PathBuf>, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("dataferry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Network {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            credential_candidates,
            api_base: API_BASE.to_string(),
        })
    }

    pub fn download_url(&self, dataset: &DatasetRef) -> String {
        format!(
            "{}/datasets/download/{}/{}",
            self.api_base,
            urlencoding::encode(&dataset.owner),
            urlencoding::encode(&dataset.name)
        )
    }
}

#[async_trait]
impl PrimarySource for KaggleSource {
    async fn authenticate(&self) -> Result<SourceCredential, SourceError> {
        let path = resolve_credential_path("kaggle", &self.credential_candidates).map_err(|e| {
            SourceError::Auth {
                message: e.to_string(),
            }
        })?;
        debug!(path = %path.display(), "Using Kaggle credential");
        let credential = KaggleCredential::from_file(&path).map_err(|e| SourceError::Auth {
            message: e.to_string(),
        })?;
        Ok(SourceCredential::Kaggle(credential))
    }

    async fn download_archive(
        &self,
        credential: &SourceCredential,
        dataset: &DatasetRef,
        dest_dir: &Path,
    ) -> Result<(), SourceError> {
        let SourceCredential::Kaggle(credential) = credential else {
            return Err(SourceError::Auth {
                message: "Kaggle downloads require a Kaggle credential".into(),
            });
        };
        let url = self.download_url(dataset);
        info!(%dataset, url = %url, "Downloading dataset archive");

        let response = self
            .client
            .get(&url)
            .basic_auth(&credential.username, Some(&credential.key))
            .send()
            .await
            .map_err(|e| SourceError::Network {
                message: e.to_string(),
            })?;

        let status = response.status().as_u16();
        match status {
            200..=299 => {}
            401 | 403 => {
                return Err(SourceError::Auth {
                    message: format!("HTTP {} for {}", status, dataset),
                });
            }
            404 => {
                return Err(SourceError::NotFound {
                    message: dataset.to_string(),
                });
            }
            _ => return Err(SourceError::Status { status, url }),
        }

        let bytes = response.bytes().await.map_err(|e| SourceError::Network {
            message: e.to_string(),
        })?;
        let dest = dest_dir.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || extract_zip(&bytes, &dest))
            .await
            .map_err(|e| SourceError::Archive {
                message: format!("extraction task failed: {}", e),
            })??;
        info!(%dataset, files = extracted, "Extracted dataset archive");
        Ok(())
    }
}

/// Expand a zip archive into `dest`, skipping entries that would escape it.
///
/// Returns the number of files written.
pub fn extract_zip(bytes: &[u8], dest: &Path) -> Result<usize, SourceError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| SourceError::Archive {
        message: format!("invalid zip archive: {}", e),
    })?;

    let mut extracted = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| SourceError::Archive {
            message: e.to_string(),
        })?;
        let Some(relative) = entry.enclosed_name() else {
            debug!(name = entry.name(), "Skipping archive entry outside destination");
            continue;
        };
        let out_path = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Expand next to the target and rename; a failed entry leaves no partial file.
        let file_name = out_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = out_path.with_file_name(format!(".{}.part", file_name));
        let written = std::fs::File::create(&tmp).and_then(|mut file| {
            std::io::copy(&mut entry, &mut file)?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(SourceError::Archive {
                message: format!("{}: {}", entry.name(), e),
            });
        }
        std::fs::rename(&tmp, &out_path)?;
        extracted += 1;
    }
    Ok(extracted)
}
