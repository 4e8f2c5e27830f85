//! Error taxonomy for the ingestion pipeline.
//!
//! Only global setup failures surface as `Err` from a run. Per-file and
//! per-batch failures are recorded in the run summary instead.

use std::time::Duration;

/// Missing or invalid credential/connection parameters. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("graph connection URI is empty")]
    MissingGraphUri,

    #[error("unsupported graph store scheme in '{0}' (expected sqlite://<path> or sqlite::memory:)")]
    UnsupportedScheme(String),

    #[error("graph principal '{0}' was given without a credential")]
    MissingCredential(String),

    #[error("environment variable {0} is referenced by the configuration but not set")]
    MissingEnv(String),

    #[error("invalid repository coordinate '{0}'")]
    InvalidRepository(String),

    #[error("repository root {0} does not exist or is not a directory")]
    MissingRoot(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// A failure talking to the remote hosting API.
#[derive(Debug, Clone, thiserror::Error)]
#[error("fetch of {path} failed{}: {message}", status.map(|s| format!(" with status {s}")).unwrap_or_default())]
pub struct FetchError {
    pub path: String,
    pub status: Option<u16>,
    pub message: String,
    pub retryable: bool,
    /// Server-provided delay hint (`Retry-After` or rate-limit reset).
    pub retry_after: Option<Duration>,
}

impl FetchError {
    pub fn transport(path: &str, err: impl std::fmt::Display) -> Self {
        Self {
            path: path.to_string(),
            status: None,
            message: err.to_string(),
            retryable: true,
            retry_after: None,
        }
    }
}

/// A single file could not be parsed. Isolated to that file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("parse error in {path}{}: {message}", line.map(|l| format!(" at line {l}")).unwrap_or_default())]
pub struct ParseError {
    pub path: String,
    pub line: Option<i64>,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("graph store rejected batch: {0}")]
    Rejected(String),

    #[error("graph store unavailable: {0}")]
    Unavailable(String),
}

/// Fatal pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("source unavailable: {0}")]
    Fetch(#[from] FetchError),

    #[error("graph store error: {0}")]
    Store(#[from] StoreError),

    #[error("run cancelled before any work started")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
pub type StoreResult<T> = Result<T, StoreError>;
