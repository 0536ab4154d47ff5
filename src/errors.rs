//! Error types for the status poller

use std::fmt;

pub type Result<T> = std::result::Result<T, PollerError>;

#[derive(Debug)]
pub enum PollerError {
    /// IO operation failed (e.g. the reachability tool could not be spawned)
    Io(std::io::Error),

    /// HTTP client could not be built
    Http(reqwest::Error),

    /// Database query failed
    Database(sqlx::Error),

    /// JSON serialization failed
    Json(serde_json::Error),

    /// Configuration error
    Config(String),

    /// Probe produced output that could not be interpreted
    ProbeOutput(String),

    /// Repository rejected an operation
    Repository(String),

    /// The cycle was cancelled before this service was probed
    Cancelled,

    /// Generic error with message
    Other(String),
}

impl fmt::Display for PollerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollerError::Io(err) => write!(f, "IO error: {}", err),
            PollerError::Http(err) => write!(f, "HTTP error: {}", err),
            PollerError::Database(err) => write!(f, "Database error: {}", err),
            PollerError::Json(err) => write!(f, "JSON error: {}", err),
            PollerError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PollerError::ProbeOutput(msg) => write!(f, "Malformed probe output: {}", msg),
            PollerError::Repository(msg) => write!(f, "Repository error: {}", msg),
            PollerError::Cancelled => write!(f, "Cycle cancelled"),
            PollerError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for PollerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollerError::Io(err) => Some(err),
            PollerError::Http(err) => Some(err),
            PollerError::Database(err) => Some(err),
            PollerError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PollerError {
    fn from(err: std::io::Error) -> Self {
        PollerError::Io(err)
    }
}

impl From<reqwest::Error> for PollerError {
    fn from(err: reqwest::Error) -> Self {
        PollerError::Http(err)
    }
}

impl From<sqlx::Error> for PollerError {
    fn from(err: sqlx::Error) -> Self {
        PollerError::Database(err)
    }
}

impl From<serde_json::Error> for PollerError {
    fn from(err: serde_json::Error) -> Self {
        PollerError::Json(err)
    }
}
