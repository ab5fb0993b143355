//! Client and cache error types.

use taskrun_api::SchemeError;
use thiserror::Error;

/// Errors returned by cluster API calls.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The object does not exist.
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },

    /// An object with the same name already exists.
    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: String, name: String },

    /// The write was based on a stale resource version.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other non-success answer from the server.
    #[error("server returned {code}: {message}")]
    Status { code: u16, message: String },

    /// Transport failure.
    #[error("http error: {0}")]
    Http(String),

    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn not_found(kind: &str, name: &str) -> Self {
        ApiError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn already_exists(kind: &str, name: &str) -> Self {
        ApiError::AlreadyExists {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ApiError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict(_))
    }

    /// Returns true if a watch must be restarted from a fresh list.
    pub fn is_gone(&self) -> bool {
        matches!(self, ApiError::Status { code: 410, .. })
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Http(err.to_string())
    }
}

impl From<SchemeError> for ApiError {
    fn from(err: SchemeError) -> Self {
        ApiError::Decode(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

/// Errors returned by local cache reads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The cached collection does not exist.
    #[error("{0} not found in cache")]
    NotFound(String),

    /// The cache could not serve the read.
    #[error("cache read failed: {0}")]
    Unavailable(String),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound(_))
    }
}
