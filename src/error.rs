//! Error types for the image cache

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can surface from the image cache
#[derive(Error, Debug)]
pub enum Error {
    /// No payload could be produced for a locator (transport or decode failure)
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchFailure),

    /// Locator cannot be used to derive a key
    #[error("Invalid locator: {0}")]
    InvalidLocator(String),

    /// Disk tier could not persist an entry
    #[error("Storage write failed for {path}: {reason}")]
    StorageWrite { path: PathBuf, reason: String },

    /// Disk tier entry is truncated or fails its checksum
    #[error("Corrupt cache entry at {path}: {reason}")]
    StorageCorruption { path: PathBuf, reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file parse error
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error means "no data is available" for the caller
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, Error::Fetch(_))
    }
}

/// Failure of the underlying retrieval of a payload.
///
/// Cloned to every caller joined on the same in-flight fetch, so it carries
/// rendered messages rather than source errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// Transport could not reach the resource
    #[error("transport error for {locator}: {reason}")]
    Transport { locator: String, reason: String },

    /// Resource answered with a non-success status
    #[error("unexpected status {status} for {locator}")]
    Status { locator: String, status: u16 },

    /// Transport gave up after the per-priority timeout
    #[error("timed out after {timeout_ms}ms fetching {locator}")]
    Timeout { locator: String, timeout_ms: u64 },

    /// Bytes arrived but are not a usable image payload
    #[error("undecodable payload for {locator}: {reason}")]
    Decode { locator: String, reason: String },
}

impl FetchFailure {
    /// Build a transport failure
    pub fn transport(locator: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        FetchFailure::Transport {
            locator: locator.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a decode failure
    pub fn decode(locator: impl Into<String>, reason: impl Into<String>) -> Self {
        FetchFailure::Decode {
            locator: locator.into(),
            reason: reason.into(),
        }
    }

    /// Check if bytes were retrieved but rejected
    pub fn is_decode(&self) -> bool {
        matches!(self, FetchFailure::Decode { .. })
    }

    /// Locator the failure refers to
    pub fn locator(&self) -> &str {
        match self {
            FetchFailure::Transport { locator, .. }
            | FetchFailure::Status { locator, .. }
            | FetchFailure::Timeout { locator, .. }
            | FetchFailure::Decode { locator, .. } => locator,
        }
    }
}
