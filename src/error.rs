//! Huginn error types

use std::time::Duration;

use crate::recorder::RequestStatus;

/// Huginn error types
#[derive(Debug, thiserror::Error)]
pub enum HuginnError {
    // Metric contract violations
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Admission errors
    #[error("no concurrency slot within {waited:?}")]
    AdmissionTimeout { waited: Duration },

    // Upstream/network errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("{0} timeout elapsed")]
    Timeout(&'static str),

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl HuginnError {
    /// The status a request is finalized with when it ends in this error.
    pub fn status(&self) -> RequestStatus {
        match self {
            HuginnError::AdmissionTimeout { .. } => RequestStatus::Rejected,
            _ => RequestStatus::Error,
        }
    }

    /// Whether the error came from talking to the upstream server.
    pub fn is_upstream(&self) -> bool {
        matches!(self, HuginnError::Http(_) | HuginnError::Timeout(_))
    }
}

impl From<reqwest::Error> for HuginnError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            if err.is_connect() {
                HuginnError::Timeout("connect")
            } else {
                HuginnError::Timeout("request")
            }
        } else {
            HuginnError::Http(err.to_string())
        }
    }
}

/// Result type alias for Huginn operations
pub type Result<T> = std::result::Result<T, HuginnError>;
