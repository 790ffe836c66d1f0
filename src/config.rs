// ABOUTME: TOML configuration for metadata store, target store, source service and sync policy
// ABOUTME: Loaded once per process; every field has a default except the database URLs

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::changeset::{PayloadFormat, TransverseMercator};
use crate::utils::{validate_connection_string, validate_postgres_identifier};

/// Top-level configuration file.
///
/// ```toml
/// [metadata]
/// url = "postgresql://sync@meta-host:5432/metadata"
///
/// [target]
/// url = "postgresql://sync@gis-host:5432/gis"
/// geometry_column = "shape"
///
/// [source]
/// output_format = "json"
///
/// [sync]
/// max_workers = 4
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Database holding the dataset registry, API keys and run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataConfig {
    pub url: Option<String>,
    /// Server-side limit for registry, key and watermark queries (0 disables)
    #[serde(default = "default_metadata_statement_timeout")]
    pub statement_timeout_secs: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            url: None,
            statement_timeout_secs: default_metadata_statement_timeout(),
        }
    }
}

/// PostGIS database the changesets are applied to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub url: Option<String>,
    /// Schema used for unqualified registry table names
    #[serde(default = "default_schema")]
    pub default_schema: String,
    /// Name of the geometry column in target tables
    #[serde(default = "default_geometry_column")]
    pub geometry_column: String,
    /// Spatial reference of stored geometries
    #[serde(default = "default_srid")]
    pub srid: i32,
    /// Server-side limit for every statement of a run (0 disables)
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: None,
            default_schema: default_schema(),
            geometry_column: default_geometry_column(),
            srid: default_srid(),
            statement_timeout_secs: default_statement_timeout(),
        }
    }
}

/// Remote changeset service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub output_format: PayloadFormat,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            output_format: PayloadFormat::default(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Orchestration policy for a batch of dataset runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Maximum dataset runs in flight
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Window start used when a dataset has never synced successfully
    #[serde(default = "default_epoch")]
    pub epoch: DateTime<Utc>,
    /// Keep watermarks in a JSON file instead of the metadata database
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    /// Retries for runs that failed with a source error
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            epoch: default_epoch(),
            state_file: None,
            retry_attempts: 0,
            retry_delay_secs: default_retry_delay(),
        }
    }
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_geometry_column() -> String {
    "shape".to_string()
}

fn default_srid() -> i32 {
    2193
}

fn default_statement_timeout() -> u64 {
    300
}

fn default_metadata_statement_timeout() -> u64 {
    60
}

fn default_base_url() -> String {
    "https://data.linz.govt.nz".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_workers() -> usize {
    4
}

/// 2000-01-01T00:00:00Z
pub fn default_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn default_retry_delay() -> u64 {
    30
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Invalid TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file at `path`, or the default location if it exists, or defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::debug!("Using config file {:?}", path);
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// `~/.geo-changeset-sync/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".geo-changeset-sync").join("config.toml"))
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.metadata.url {
            validate_connection_string(url).context("Invalid [metadata] url")?;
        }
        if let Some(url) = &self.target.url {
            validate_connection_string(url).context("Invalid [target] url")?;
        }
        validate_postgres_identifier(&self.target.default_schema)
            .context("Invalid [target] default_schema")?;
        validate_postgres_identifier(&self.target.geometry_column)
            .context("Invalid [target] geometry_column")?;
        if self.sync.max_workers == 0 {
            bail!("[sync] max_workers must be at least 1");
        }
        let projected = TransverseMercator::nztm2000().srid;
        if self.target.srid != projected {
            bail!(
                "[target] srid must be {} (the NZTM2000 projection used for geometries), got {}",
                projected,
                self.target.srid
            );
        }
        url::Url::parse(&self.source.base_url).context("Invalid [source] base_url")?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.source.request_timeout_secs)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.target.statement_timeout_secs)
    }

    pub fn metadata_statement_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata.statement_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.sync.retry_delay_secs)
    }
}
