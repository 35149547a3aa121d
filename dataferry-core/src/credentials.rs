//! Credential objects for the dataset source and the cloud backends.
//!
//! Credentials are loaded once at startup from files and handed to client
//! constructors. Nothing here reads or writes the process environment.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// Return the first candidate path that exists.
pub fn resolve_credential_path(kind: &str, candidates: &[PathBuf]) -> Result<PathBuf, ConfigError> {
    candidates
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .ok_or_else(|| ConfigError::CredentialNotFound {
            kind: kind.to_string(),
            candidates: if candidates.is_empty() {
                "(none configured)".to_string()
            } else {
                candidates
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            },
        })
}

/// Kaggle API credential, as stored in `kaggle.json`.
#[derive(Clone, Deserialize)]
pub struct KaggleCredential {
    pub username: String,
    pub key: String,
}

impl KaggleCredential {
    pub fn new(username: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            key: key.into(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::CredentialParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let cred: Self = serde_json::from_str(&raw).map_err(|e| ConfigError::CredentialParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if cred.username.trim().is_empty() || cred.key.trim().is_empty() {
            return Err(ConfigError::CredentialParse {
                path: path.to_path_buf(),
                message: "username and key must be non-empty".into(),
            });
        }
        Ok(cred)
    }
}

impl std::fmt::Debug for KaggleCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KaggleCredential")
            .field("username", &self.username)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Deserialize)]
struct GcpCredentialFile {
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// OAuth bearer credential for Cloud Storage and BigQuery.
#[derive(Clone)]
pub struct GcpCredential {
    pub project_id: String,
    access_token: String,
}

impl GcpCredential {
    pub fn new(project_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            access_token: access_token.into(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Load from a JSON credential file.
    ///
    /// The file must name a `project_id` unless `project_override` is given.
    /// When it carries no `access_token`, one is minted with
    /// `gcloud auth application-default print-access-token`, pointing only that
    /// child process at the credential file.
    pub async fn load(path: &Path, project_override: Option<&str>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::CredentialParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let file: GcpCredentialFile =
            serde_json::from_str(&raw).map_err(|e| ConfigError::CredentialParse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let project_id = project_override
            .map(str::to_string)
            .or(file.project_id)
            .ok_or_else(|| ConfigError::CredentialParse {
                path: path.to_path_buf(),
                message: "no project_id in file and warehouse.project is unset".into(),
            })?;

        let access_token = match file.access_token {
            Some(token) if !token.trim().is_empty() => token,
            _ => mint_access_token(path).await?,
        };

        Ok(Self {
            project_id,
            access_token,
        })
    }
}

impl std::fmt::Debug for GcpCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpCredential")
            .field("project_id", &self.project_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

async fn mint_access_token(path: &Path) -> Result<String, ConfigError> {
    let output = tokio::process::Command::new("gcloud")
        .args(["auth", "application-default", "print-access-token"])
        .env("GOOGLE_APPLICATION_CREDENTIALS", path)
        .output()
        .await
        .map_err(|e| ConfigError::CredentialParse {
            path: path.to_path_buf(),
            message: format!("failed to run gcloud: {e}"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ConfigError::CredentialParse {
            path: path.to_path_buf(),
            message: format!("gcloud could not mint an access token: {}", stderr.trim()),
        });
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(ConfigError::CredentialParse {
            path: path.to_path_buf(),
            message: "gcloud returned an empty access token".into(),
        });
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_first_existing_candidate() {
        let dir = TempDir::new().unwrap();
        let second = dir.path().join("second.json");
        std::fs::write(&second, "{}").unwrap();
        let candidates = vec![dir.path().join("first.json"), second.clone()];
        assert_eq!(resolve_credential_path("kaggle", &candidates).unwrap(), second);
    }

    #[test]
    fn test_resolve_reports_all_candidates() {
        let err = resolve_credential_path(
            "gcp",
            &[PathBuf::from("/no/a.json"), PathBuf::from("/no/b.json")],
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("/no/a.json"));
        assert!(msg.contains("/no/b.json"));
    }

    #[test]
    fn test_kaggle_credential_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kaggle.json");
        std::fs::write(&path, r#"{"username":"meir","key":"abc123"}"#).unwrap();
        let cred = KaggleCredential::from_file(&path).unwrap();
        assert_eq!(cred.username, "meir");
        assert_eq!(cred.key, "abc123");
    }

    #[test]
    fn test_kaggle_credential_debug_redacts_key() {
        let cred = KaggleCredential::new("meir", "supersecret");
        let debug = format!("{:?}", cred);
        assert!(!debug.contains("supersecret"));
        assert!(debug.contains("meir"));
    }

    #[test]
    fn test_kaggle_credential_rejects_blank_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kaggle.json");
        std::fs::write(&path, r#"{"username":"meir","key":""}"#).unwrap();
        assert!(KaggleCredential::from_file(&path).is_err());
    }

    #[tokio::test]
    async fn test_gcp_credential_with_embedded_token() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(
            &path,
            r#"{"project_id":"covid-project","access_token":"ya29.token"}"#,
        )
        .unwrap();
        let cred = GcpCredential::load(&path, None).await.unwrap();
        assert_eq!(cred.project_id, "covid-project");
        assert_eq!(cred.access_token(), "ya29.token");
        assert!(!format!("{:?}", cred).contains("ya29"));
    }

    #[tokio::test]
    async fn test_gcp_credential_project_override() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, r#"{"access_token":"tok"}"#).unwrap();
        let cred = GcpCredential::load(&path, Some("other")).await.unwrap();
        assert_eq!(cred.project_id, "other");
    }

    #[tokio::test]
    async fn test_gcp_credential_requires_project() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, r#"{"access_token":"tok"}"#).unwrap();
        assert!(GcpCredential::load(&path, None).await.is_err());
    }
}
