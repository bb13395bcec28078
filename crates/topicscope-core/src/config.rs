//! Configuration management for topicscope
//!
//! Handles loading and validation of `topicscope.toml` configuration files.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::decoder::DecoderKind;
use crate::error::{ConfigError, Result};

/// Environment variable that overrides the config file location
pub const CONFIG_ENV_VAR: &str = "TOPICSCOPE_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Consumer job settings
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Record store settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Known clusters
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// JSON lines for machine consumption
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Data directory path (the record store lives here)
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> String {
    dirs::data_dir().map_or_else(
        || "~/.local/share/topicscope".to_string(),
        |dir| dir.join("topicscope").to_string_lossy().into_owned(),
    )
}

/// What to do with a record whose key or payload cannot be decoded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeErrorPolicy {
    /// Store the record with a placeholder payload and the error message
    #[default]
    Placeholder,
    /// Drop the record
    Skip,
}

/// Consumer job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Per-poll broker timeout in milliseconds. Bounds how long a stop takes.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Maximum records fetched per poll batch
    #[serde(default = "default_max_batch_records")]
    pub max_batch_records: usize,

    /// Timeout for metadata, watermark and timestamp lookups in milliseconds
    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,

    /// Decode failure handling
    #[serde(default)]
    pub on_decode_error: DecodeErrorPolicy,

    /// Payload decoder
    #[serde(default)]
    pub decoder: DecoderKind,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            max_batch_records: default_max_batch_records(),
            metadata_timeout_ms: default_metadata_timeout_ms(),
            on_decode_error: DecodeErrorPolicy::default(),
            decoder: DecoderKind::default(),
        }
    }
}

impl ConsumerConfig {
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    #[must_use]
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }
}

fn default_poll_timeout_ms() -> u64 {
    200
}

fn default_max_batch_records() -> usize {
    500
}

fn default_metadata_timeout_ms() -> u64 {
    10_000
}

/// Record store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file, relative to `general.data_dir` unless absolute
    #[serde(default = "default_db_file")]
    pub db_file: String,

    /// SQLite busy timeout in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_file: default_db_file(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_db_file() -> String {
    "records.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

/// Connection settings for one cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Stable identifier used by every consumer/query call
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Bootstrap servers, comma separated
    pub endpoint: String,

    /// Authentication settings
    #[serde(default)]
    pub authentication: Authentication,

    /// Raw client properties applied last
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Cluster authentication
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Authentication {
    #[default]
    None,
    Sasl {
        username: String,
        password: String,
        /// SCRAM-SHA-256 instead of PLAIN
        #[serde(default)]
        scram: bool,
    },
    Ssl {
        ca_location: Option<String>,
        certificate_location: Option<String>,
        key_location: Option<String>,
        key_password: Option<String>,
    },
}

impl ClusterConfig {
    /// Client properties derived from this cluster's settings.
    ///
    /// Explicit `properties` entries win over derived ones.
    #[must_use]
    pub fn client_properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        props.insert("bootstrap.servers".to_string(), self.endpoint.clone());
        match &self.authentication {
            Authentication::None => {}
            Authentication::Sasl {
                username,
                password,
                scram,
            } => {
                props.insert("security.protocol".to_string(), "SASL_SSL".to_string());
                let mechanism = if *scram { "SCRAM-SHA-256" } else { "PLAIN" };
                props.insert("sasl.mechanisms".to_string(), mechanism.to_string());
                props.insert("sasl.username".to_string(), username.clone());
                props.insert("sasl.password".to_string(), password.clone());
            }
            Authentication::Ssl {
                ca_location,
                certificate_location,
                key_location,
                key_password,
            } => {
                props.insert("security.protocol".to_string(), "SSL".to_string());
                let optional = [
                    ("ssl.ca.location", ca_location),
                    ("ssl.certificate.location", certificate_location),
                    ("ssl.key.location", key_location),
                    ("ssl.key.password", key_password),
                ];
                for (name, value) in optional {
                    if let Some(value) = value {
                        props.insert(name.to_string(), value.clone());
                    }
                }
            }
        }
        for (key, value) in &self.properties {
            props.insert(key.clone(), value.clone());
        }
        props
    }
}

impl Config {
    /// Default config file location (`<config_dir>/topicscope/topicscope.toml`)
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("topicscope").join("topicscope.toml"))
    }

    /// Load configuration from an explicit path, or the default location.
    ///
    /// An explicit path must exist. A missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let display = path.display().to_string();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(display).into());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(display, e.to_string()))?;
        Self::from_toml(&raw)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.consumer.poll_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "consumer.poll_timeout_ms must be greater than 0".to_string(),
            )
            .into());
        }
        if self.consumer.max_batch_records == 0 {
            return Err(ConfigError::ValidationError(
                "consumer.max_batch_records must be greater than 0".to_string(),
            )
            .into());
        }
        let mut seen = HashSet::new();
        for cluster in &self.clusters {
            if cluster.id.trim().is_empty() {
                return Err(
                    ConfigError::ValidationError("cluster id must not be empty".to_string()).into(),
                );
            }
            if !seen.insert(cluster.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate cluster id: {}",
                    cluster.id
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Look up a cluster by id
    pub fn cluster(&self, id: &str) -> Result<&ClusterConfig> {
        self.clusters
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| ConfigError::UnknownCluster(id.to_string()).into())
    }

    /// Data directory with `~` expanded
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.general.data_dir)
    }

    /// Record store file location
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        let file = expand_home(&self.storage.db_file);
        if file.is_absolute() {
            file
        } else {
            self.data_dir().join(file)
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
