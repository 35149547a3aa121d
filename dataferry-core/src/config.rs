//! Configuration system for dataferry.
//!
//! Uses `figment` for layered configuration: defaults, then the user config
//! file, then the workspace `dataferry.toml` (or an explicit `--config` file),
//! then `DATAFERRY_`-prefixed environment variables, then the legacy
//! `BUCKET_NAME` / `BQ_DATASET` / `BQ_TABLE` variables, then CLI overrides.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactLocator;
use crate::credentials::resolve_credential_path;
use crate::error::ConfigError;
use crate::retry::RetryConfig;
use crate::source::DatasetRef;
use crate::warehouse::{SchemaMode, TableRef, WriteMode};

/// Name of the workspace-level configuration file.
pub const WORKSPACE_CONFIG_FILE: &str = "dataferry.toml";

/// Top-level configuration for one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Source catalog slug, `owner/name`.
    pub dataset: String,
    /// Directory the dataset file is downloaded into.
    pub staging_dir: PathBuf,
    pub fetch: FetchConfig,
    pub credentials: CredentialsConfig,
    pub store: StoreConfig,
    pub warehouse: WarehouseConfig,
    pub retry: RetryConfig,
    pub schedule: ScheduleConfig,
    pub backend: BackendConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dataset: "meirnizri/covid19-dataset".to_string(),
            staging_dir: PathBuf::from("tmp"),
            fetch: FetchConfig::default(),
            credentials: CredentialsConfig::default(),
            store: StoreConfig::default(),
            warehouse: WarehouseConfig::default(),
            retry: RetryConfig::default(),
            schedule: ScheduleConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Artifact file name patterns in priority order.
    pub patterns: Vec<String>,
    /// Direct download used when the primary source fails.
    pub fallback_url: Option<String>,
    /// File name the fallback download is saved as.
    pub canonical_filename: String,
    /// Reuse a matching file already in the staging directory.
    pub reuse_existing: bool,
    /// HTTP timeout for source downloads.
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            patterns: vec![
                "covid data.csv".to_string(),
                "Covid Data.csv".to_string(),
                "*.csv".to_string(),
            ],
            fallback_url: Some(
                "https://raw.githubusercontent.com/MeirNizri/COVID-19-Vaccine-Finder/main/data/covid%20data.csv"
                    .to_string(),
            ),
            canonical_filename: "Covid Data.csv".to_string(),
            reuse_existing: true,
            timeout_secs: 300,
        }
    }
}

/// Candidate credential file paths. The first one that exists is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub kaggle: Vec<PathBuf>,
    pub gcp: Vec<PathBuf>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        let mut kaggle = vec![PathBuf::from("kaggle/kaggle.json")];
        if let Some(base) = directories::BaseDirs::new() {
            kaggle.push(base.home_dir().join(".kaggle").join("kaggle.json"));
        }
        Self {
            kaggle,
            gcp: vec![PathBuf::from("secretkeys/credentials.json")],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub bucket: String,
    pub object_key: String,
    /// Location used when the bucket has to be created.
    pub location: String,
    /// Per-request HTTP timeout for cloud object storage.
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            object_key: "raw/covid19_data.csv".to_string(),
            location: "EU".to_string(),
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    /// Project for cloud warehouses; defaults to the credential's project.
    pub project: Option<String>,
    pub dataset: String,
    pub table: String,
    pub write_mode: WriteMode,
    pub schema: SchemaMode,
    pub skip_leading_rows: u32,
    pub location: String,
    pub poll_interval_ms: u64,
    pub job_timeout_secs: u64,
    /// Per-request HTTP timeout for cloud warehouse calls.
    pub request_timeout_secs: u64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            project: None,
            dataset: "bronze".to_string(),
            table: "covid_raw".to_string(),
            write_mode: WriteMode::Truncate,
            schema: SchemaMode::Infer,
            skip_leading_rows: 1,
            location: "EU".to_string(),
            poll_interval_ms: 2_000,
            job_timeout_secs: 600,
            request_timeout_secs: 120,
        }
    }
}

impl WarehouseConfig {
    pub fn table_ref(&self) -> TableRef {
        TableRef {
            project: self.project.clone(),
            dataset: self.dataset.clone(),
            table: self.table.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub name: String,
    /// Cron expression with a seconds field.
    pub cron: String,
    /// IANA timezone the expression is evaluated in.
    pub timezone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            name: "daily_ingest".to_string(),
            cron: "0 0 2 * * *".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

/// Which concrete store and warehouse clients to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Directory-backed store and warehouse under `local_root`.
    #[default]
    Local,
    /// Cloud Storage and BigQuery.
    Cloud,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "cloud" => Ok(BackendKind::Cloud),
            other => Err(ConfigError::Invalid {
                field: "backend.kind".into(),
                message: format!("unknown backend '{}', expected local or cloud", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub local_root: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Local,
            local_root: PathBuf::from(".dataferry"),
        }
    }
}

/// Values given on the command line, applied last.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub staging_dir: Option<PathBuf>,
    pub backend: Option<BackendKind>,
    pub bucket: Option<String>,
}

impl PipelineConfig {
    pub fn dataset_ref(&self) -> Result<DatasetRef, ConfigError> {
        DatasetRef::parse(&self.dataset)
    }

    /// Check the whole configuration once, before any step runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dataset_ref()?;
        ArtifactLocator::new(&self.fetch.patterns)?;

        if self.fetch.canonical_filename.trim().is_empty()
            || self.fetch.canonical_filename.contains(['/', '\\'])
        {
            return Err(ConfigError::Invalid {
                field: "fetch.canonical_filename".into(),
                message: "must be a plain file name".into(),
            });
        }
        if let Some(url) = &self.fetch.fallback_url {
            url::Url::parse(url).map_err(|e| ConfigError::Invalid {
                field: "fetch.fallback_url".into(),
                message: e.to_string(),
            })?;
        }

        require("store.bucket", &self.store.bucket)?;
        require("store.object_key", &self.store.object_key)?;
        require("store.location", &self.store.location)?;
        require("warehouse.dataset", &self.warehouse.dataset)?;
        require("warehouse.table", &self.warehouse.table)?;

        if let SchemaMode::Explicit { fields } = &self.warehouse.schema {
            if fields.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "warehouse.schema.fields".into(),
                    message: "explicit schema needs at least one field".into(),
                });
            }
        }
        if self.warehouse.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "warehouse.poll_interval_ms".into(),
                message: "must be greater than zero".into(),
            });
        }
        for (field, secs) in [
            ("store.request_timeout_secs", self.store.request_timeout_secs),
            ("warehouse.request_timeout_secs", self.warehouse.request_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    field: field.into(),
                    message: "must be greater than zero".into(),
                });
            }
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                field: "retry.backoff_multiplier".into(),
                message: "must be at least 1.0".into(),
            });
        }

        crate::trigger::Schedule::from_config(&self.schedule).map_err(|e| {
            ConfigError::Invalid {
                field: "schedule".into(),
                message: e.to_string(),
            }
        })?;

        if self.backend.kind == BackendKind::Cloud {
            resolve_credential_path("gcp", &self.credentials.gcp)?;
        }
        Ok(())
    }

    /// Render the resolved configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

fn require(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Build the layered figment without extracting it.
pub fn figment(workspace: Option<&Path>, explicit: Option<&Path>) -> Result<Figment, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));

    // User-level config
    if let Some(dirs) = directories::ProjectDirs::from("dev", "dataferry", "dataferry") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace config, or the explicitly requested file instead of it
    match explicit {
        Some(path) => {
            if !path.is_file() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }
        None => {
            if let Some(ws) = workspace {
                let ws_config = ws.join(WORKSPACE_CONFIG_FILE);
                if ws_config.exists() {
                    figment = figment.merge(Toml::file(&ws_config));
                }
            }
        }
    }

    // Environment variables (DATAFERRY_STORE__BUCKET, DATAFERRY_WAREHOUSE__TABLE, etc.)
    figment = figment.merge(Env::prefixed("DATAFERRY_").split("__"));

    // Legacy variable names
    figment = figment.merge(
        Env::raw()
            .only(&["BUCKET_NAME", "BQ_DATASET", "BQ_TABLE"])
            .map(|key| legacy_env_key(key.as_str()).into()),
    );

    Ok(figment)
}

fn legacy_env_key(key: &str) -> &'static str {
    match key.to_ascii_uppercase().as_str() {
        "BUCKET_NAME" => "store.bucket",
        "BQ_DATASET" => "warehouse.dataset",
        _ => "warehouse.table",
    }
}

/// Load configuration from all layers.
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
    overrides: Option<&ConfigOverrides>,
) -> Result<PipelineConfig, ConfigError> {
    let mut figment = figment(workspace, explicit)?;

    if let Some(overrides) = overrides {
        if let Some(dir) = &overrides.staging_dir {
            figment = figment.merge(Serialized::default("staging_dir", dir));
        }
        if let Some(kind) = overrides.backend {
            figment = figment.merge(Serialized::default("backend.kind", kind));
        }
        if let Some(bucket) = &overrides.bucket {
            figment = figment.merge(Serialized::default("store.bucket", bucket));
        }
    }

    figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::FieldType;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    fn valid() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.store.bucket = "b1".into();
        config
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.dataset, "meirnizri/covid19-dataset");
        assert_eq!(config.store.object_key, "raw/covid19_data.csv");
        assert_eq!(config.store.location, "EU");
        assert_eq!(config.warehouse.write_mode, WriteMode::Truncate);
        assert_eq!(config.warehouse.skip_leading_rows, 1);
        assert_eq!(config.schedule.cron, "0 0 2 * * *");
        assert_eq!(config.schedule.timezone, "UTC");
        assert_eq!(config.fetch.canonical_filename, "Covid Data.csv");
        assert_eq!(config.backend.kind, BackendKind::Local);
    }

    #[test]
    fn test_validate_requires_bucket() {
        let err = PipelineConfig::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { ref field } if field == "store.bucket"));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_dataset() {
        let mut config = valid();
        config.dataset = "covid19-dataset".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_cron_and_timezone() {
        let mut config = valid();
        config.schedule.cron = "every day".into();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.schedule.timezone = "Mars/Olympus".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_request_timeout() {
        let mut config = valid();
        config.warehouse.request_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "warehouse.request_timeout_secs"
        ));

        let mut config = valid();
        config.store.request_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_explicit_schema() {
        let mut config = valid();
        config.warehouse.schema = SchemaMode::Explicit { fields: Vec::new() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cloud_backend_requires_gcp_credential() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = valid();
        config.backend.kind = BackendKind::Cloud;
        config.credentials.gcp = vec![dir.path().join("credentials.json")];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CredentialNotFound { .. })
        ));

        std::fs::write(dir.path().join("credentials.json"), "{}").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_config_file_must_exist() {
        let err = load_config(None, Some(Path::new("/definitely/not/here.toml")), None).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_load_config_from_workspace() {
        Jail::expect_with(|jail| {
            jail.create_file(
                WORKSPACE_CONFIG_FILE,
                r#"
dataset = "meirnizri/covid19-dataset"

[store]
bucket = "b1"

[warehouse]
dataset = "covid19_dataset"
table = "covid_raw"
write_mode = "append"

[warehouse.schema]
mode = "explicit"
fields = [{ name = "USMER", type = "INTEGER" }]
"#,
            )?;
            let config = load_config(Some(jail.directory()), None, None)
                .map_err(|e| e.to_string())?;
            assert_eq!(config.store.bucket, "b1");
            assert_eq!(config.warehouse.table_ref().to_string(), "covid19_dataset.covid_raw");
            assert_eq!(config.warehouse.write_mode, WriteMode::Append);
            match &config.warehouse.schema {
                SchemaMode::Explicit { fields } => {
                    assert_eq!(fields[0].field_type, FieldType::Integer)
                }
                SchemaMode::Infer => panic!("expected explicit schema"),
            }
            // Untouched sections keep their defaults.
            assert_eq!(config.store.object_key, "raw/covid19_data.csv");
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(WORKSPACE_CONFIG_FILE, "[store]\nbucket = \"from-file\"\n")?;
            jail.set_env("DATAFERRY_STORE__BUCKET", "from-env");
            jail.set_env("DATAFERRY_RETRY__MAX_RETRIES", "7");
            let config = load_config(Some(jail.directory()), None, None)
                .map_err(|e| e.to_string())?;
            assert_eq!(config.store.bucket, "from-env");
            assert_eq!(config.retry.max_retries, 7);
            Ok(())
        });
    }

    #[test]
    fn test_legacy_env_names() {
        Jail::expect_with(|jail| {
            jail.set_env("BUCKET_NAME", "legacy-bucket");
            jail.set_env("BQ_DATASET", "covid19_dataset");
            jail.set_env("BQ_TABLE", "covid_raw");
            let config = load_config(Some(jail.directory()), None, None)
                .map_err(|e| e.to_string())?;
            assert_eq!(config.store.bucket, "legacy-bucket");
            assert_eq!(config.warehouse.dataset, "covid19_dataset");
            assert_eq!(config.warehouse.table, "covid_raw");
            Ok(())
        });
    }

    #[test]
    fn test_cli_overrides_win() {
        Jail::expect_with(|jail| {
            jail.set_env("DATAFERRY_BACKEND__KIND", "cloud");
            let overrides = ConfigOverrides {
                staging_dir: Some(PathBuf::from("/tmp/stage")),
                backend: Some(BackendKind::Local),
                bucket: Some("cli-bucket".into()),
            };
            let config = load_config(Some(jail.directory()), None, Some(&overrides))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.backend.kind, BackendKind::Local);
            assert_eq!(config.staging_dir, PathBuf::from("/tmp/stage"));
            assert_eq!(config.store.bucket, "cli-bucket");
            Ok(())
        });
    }

    #[test]
    fn test_to_toml_round_trips_through_load() {
        Jail::expect_with(|jail| {
            let mut config = valid();
            config.warehouse.dataset = "covid19_dataset".into();
            jail.create_file(WORKSPACE_CONFIG_FILE, &config.to_toml().map_err(|e| e.to_string())?)?;
            let loaded = load_config(Some(jail.directory()), None, None)
                .map_err(|e| e.to_string())?;
            assert_eq!(loaded.warehouse.dataset, "covid19_dataset");
            assert_eq!(loaded.store.bucket, "b1");
            Ok(())
        });
    }

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("Cloud".parse::<BackendKind>().unwrap(), BackendKind::Cloud);
        assert!("s3".parse::<BackendKind>().is_err());
    }
}
