//! Error types for topicscope-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for topicscope-core
#[derive(Error, Debug)]
pub enum Error {
    /// Consumer control errors (validation, registry lookups)
    #[error("Consumer error: {0}")]
    Consumer(#[from] ConsumerError),

    /// Broker adapter errors
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Record store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, channel closures)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Consumer(err) => Some(err.remediation()),
            Self::Broker(err) => Some(err.remediation()),
            Self::Storage(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Show config", "topicscope config")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json"),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Retry the command.")
                    .command("Show config", "topicscope config")
                    .alternative("If the issue persists, run with RUST_LOG=debug and report it."),
            ),
        }
    }

    /// Whether this error was rejected before any consumer job was created.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Consumer(ConsumerError::Validation(_)))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::from(err))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Runtime(format!("task join error: {err}"))
    }
}

/// Consumer control errors surfaced directly to the caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    #[error("Invalid consumption settings: {0}")]
    Validation(String),

    #[error("A consumer is already running for {cluster_id}/{topic}")]
    AlreadyRunning { cluster_id: String, topic: String },

    #[error("No consumer found for {cluster_id}/{topic}")]
    NotFound { cluster_id: String, topic: String },

    #[error("Record {row_index} not found ({count} records cached)")]
    RowNotFound { row_index: i64, count: i64 },
}

impl ConsumerError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Validation(_) => Remediation::new(
                "Fix the consumption settings. A stop timestamp must not precede the start timestamp.",
            )
            .command(
                "Custom range",
                "topicscope consume --cluster <id> --topic <name> --from custom --start-ms <ms> --stop-ms <ms>",
            ),
            Self::AlreadyRunning { cluster_id, topic } => Remediation::new(format!(
                "Stop the running consumer for {cluster_id}/{topic} before starting a new one."
            ))
            .command(
                "Cached records",
                format!("topicscope count --cluster {cluster_id} --topic {topic}"),
            ),
            Self::NotFound { cluster_id, topic } => Remediation::new(format!(
                "No consumer was started for {cluster_id}/{topic}."
            ))
            .command(
                "Start",
                format!("topicscope consume --cluster {cluster_id} --topic {topic}"),
            ),
            Self::RowNotFound { .. } => {
                Remediation::new("The requested row is past the end of the cached records.")
                    .command("Count", "topicscope count --cluster <id> --topic <name>")
                    .alternative("Wait for the consumer to fetch more records.")
            }
        }
    }
}

/// Broker adapter errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Unable to connect to the cluster: {0}")]
    Connection(String),

    #[error("Unable to fetch metadata: {0}")]
    Metadata(String),

    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Offset lookup failed: {0}")]
    OffsetLookup(String),

    #[error("Partition assignment failed: {0}")]
    Assignment(String),

    #[error("Poll failed: {0}")]
    Poll(String),

    #[error("Broker support unavailable: {0}")]
    Unsupported(String),
}

impl BrokerError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Connection(_) | Self::Metadata(_) => Remediation::new(
                "Check that the cluster endpoint is reachable and the credentials are valid.",
            )
            .command("List topics", "topicscope topics --cluster <id>")
            .alternative("Review the [[clusters]] section of topicscope.toml."),
            Self::TopicNotFound(topic) => {
                Remediation::new(format!("Topic {topic} does not exist on this cluster."))
                    .command("List topics", "topicscope topics --cluster <id>")
            }
            Self::OffsetLookup(_) | Self::Assignment(_) | Self::Poll(_) => Remediation::new(
                "The consumer failed against the broker. Restart it once the cluster is healthy.",
            )
            .command(
                "Restart",
                "topicscope consume --cluster <id> --topic <name>",
            )
            .alternative("Consumers are never retried automatically."),
            Self::Unsupported(_) => {
                Remediation::new("This build has no broker adapter. Rebuild with Kafka support.")
                    .command("Build", "cargo build --release -p topicscope --features kafka")
            }
        }
    }

    /// Connectivity failures as opposed to protocol or request errors.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Record store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Row offset out of range: {0}")]
    OutOfRange(i64),

    #[error("Database corruption detected: {details}")]
    Corruption { details: String },
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) => Remediation::new(
                "Database operation failed. Check data directory permissions and free disk space.",
            )
            .command("Show config", "topicscope config")
            .alternative("Ensure the data directory is writable."),
            Self::OutOfRange(_) => Remediation::new("Row offsets must be zero or positive.")
                .command("First page", "topicscope records --cluster <id> --topic <name> --offset 0"),
            Self::Corruption { .. } => {
                Remediation::new("The record cache is corrupted. It only holds cached data.")
                    .command("Show config", "topicscope config")
                    .alternative("Delete the database file and consume the topic again.")
            }
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
                ) =>
            {
                Self::Corruption {
                    details: err.to_string(),
                }
            }
            _ => Self::Database(err.to_string()),
        }
    }
}

/// Per-record decode failures. Never fails a consumer job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{field} is not valid UTF-8 (valid up to byte {valid_up_to})")]
    InvalidUtf8 {
        field: &'static str,
        valid_up_to: usize,
    },

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Cluster not configured: {0}")]
    UnknownCluster(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\"")),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the syntax and retry.")
                .command("Show config", "topicscope config")
                .alternative("Validate the TOML syntax of topicscope.toml."),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Show config", "topicscope config")
            }
            Self::UnknownCluster(id) => Remediation::new(format!(
                "Add a [[clusters]] entry with id = \"{id}\" to topicscope.toml."
            ))
            .command("Show config", "topicscope config"),
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remediation_available_for_error_variants() {
        let json_err = serde_json::from_str::<serde_json::Value>("").unwrap_err();
        let errors = vec![
            Error::Consumer(ConsumerError::Validation("stop before start".to_string())),
            Error::Consumer(ConsumerError::AlreadyRunning {
                cluster_id: "c1".to_string(),
                topic: "orders".to_string(),
            }),
            Error::Consumer(ConsumerError::NotFound {
                cluster_id: "c1".to_string(),
                topic: "orders".to_string(),
            }),
            Error::Consumer(ConsumerError::RowNotFound {
                row_index: 5,
                count: 2,
            }),
            Error::Broker(BrokerError::Connection("refused".to_string())),
            Error::Broker(BrokerError::Metadata("timeout".to_string())),
            Error::Broker(BrokerError::TopicNotFound("orders".to_string())),
            Error::Broker(BrokerError::OffsetLookup("timeout".to_string())),
            Error::Broker(BrokerError::Assignment("bad".to_string())),
            Error::Broker(BrokerError::Poll("disconnect".to_string())),
            Error::Broker(BrokerError::Unsupported("kafka".to_string())),
            Error::Storage(StorageError::Database("db".to_string())),
            Error::Storage(StorageError::OutOfRange(-1)),
            Error::Storage(StorageError::Corruption {
                details: "bad page".to_string(),
            }),
            Error::Config(ConfigError::FileNotFound("topicscope.toml".to_string())),
            Error::Config(ConfigError::ReadFailed(
                "topicscope.toml".to_string(),
                "io".to_string(),
            )),
            Error::Config(ConfigError::ParseFailed("parse".to_string())),
            Error::Config(ConfigError::ValidationError("invalid".to_string())),
            Error::Config(ConfigError::UnknownCluster("c9".to_string())),
            Error::Io(std::io::Error::other("io")),
            Error::Json(json_err),
            Error::Runtime("runtime".to_string()),
        ];

        for error in errors {
            let remediation = error.remediation().expect("missing remediation");
            assert!(
                !remediation.summary.is_empty(),
                "remediation summary empty for {error:?}"
            );
            assert!(
                !remediation.commands.is_empty(),
                "remediation commands empty for {error:?}"
            );
        }
    }

    #[test]
    fn remediation_builder_chain() {
        let r = Remediation::new("summary")
            .command("Run", "topicscope topics --cluster local")
            .alternative("Try something else");

        assert_eq!(r.summary, "summary");
        assert_eq!(r.commands.len(), 1);
        assert_eq!(r.commands[0].label, "Run");
        assert_eq!(r.alternatives, vec!["Try something else"]);
    }

    #[test]
    fn render_plain_includes_sections() {
        let output = Remediation::new("Fix it")
            .command("Diagnose", "topicscope config")
            .alternative("Or not")
            .render_plain();
        assert!(output.contains("To fix:"));
        assert!(output.contains("Diagnose: topicscope config"));
        assert!(output.contains("Alternatives:"));
    }

    #[test]
    fn format_error_includes_remediation() {
        let err = Error::Consumer(ConsumerError::AlreadyRunning {
            cluster_id: "c1".to_string(),
            topic: "orders".to_string(),
        });
        let output = format_error_with_remediation(&err);
        assert!(output.starts_with("Error: Consumer error: A consumer is already running"));
        assert!(output.contains("topicscope count --cluster c1 --topic orders"));
    }

    #[test]
    fn sqlite_corruption_maps_to_corruption() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
            Some("malformed".to_string()),
        );
        assert!(matches!(
            StorageError::from(err),
            StorageError::Corruption { .. }
        ));
    }

    #[test]
    fn validation_errors_are_flagged() {
        let err = Error::from(ConsumerError::Validation("x".to_string()));
        assert!(err.is_validation());
        assert!(!Error::Runtime("x".to_string()).is_validation());
    }
}
