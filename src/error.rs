// src/error.rs

//! Error types for the packaging pipeline and drift monitor

use thiserror::Error;

/// Result type alias using autodeb's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for autodeb
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or contradictory configuration, raised before any state mutation
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO operation failed
    #[error("IO error: {0}")]
    IoError(String),

    /// Network fetch failed (index, reference package, webhook)
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Parsing failed (index stanza, changelog, state document)
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// External command could not be spawned or exited non-zero
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Merging the upstream tag requires manual intervention
    #[error("Merge conflict while preparing {version}: {detail}")]
    MergeConflict { version: String, detail: String },

    /// A carried patch no longer applies
    #[error("Patch failure while preparing {version}: {detail}")]
    PatchFailure { version: String, detail: String },

    /// Build for one architecture failed, timed out or was cancelled
    #[error("Build failed for {version} on {arch}: {detail}")]
    BuildFailed {
        version: String,
        arch: String,
        detail: String,
    },

    /// Copying artifacts into the staging pool or pushing refs failed
    #[error("Publish error: {0}")]
    PublishError(String),

    /// State change rejected by the state store
    #[error("Invalid transition for {version}: {detail}")]
    InvalidTransition { version: String, detail: String },

    /// State document could not be read or written
    #[error("State error: {0}")]
    StateError(String),

    /// Another process holds an exclusive lock
    #[error("Lock held: {0}")]
    LockHeld(String),

    /// Notification delivery failed
    #[error("Notification error: {0}")]
    NotifyError(String),

    /// Variable required by an action template was not supplied
    #[error("Missing required variable: {0}")]
    MissingVariable(String),
}

impl Error {
    /// Network and remote-index failures: nothing was mutated, retry on the next run
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::DownloadError(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ParseError(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::ConfigError(err.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Error::ConfigError(format!("Invalid pattern: {}", err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::DownloadError(err.to_string())
    }
}
