//! Error types for keys and the type registry.

use thiserror::Error;

/// Errors that can occur when deriving or parsing an object key.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The object has no name, so no key can be derived.
    #[error("object has no name")]
    MissingName,

    /// The key string does not have the `namespace/name` shape.
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
}

/// Errors raised by [`crate::Scheme`] while encoding or decoding objects.
#[derive(Debug, Error)]
pub enum SchemeError {
    /// The type was never registered with the scheme.
    #[error("type {api_version}/{kind} is not registered")]
    NotRegistered { api_version: String, kind: String },

    /// The payload declares a different type than the one requested.
    #[error("expected {expected}, got {actual}")]
    KindMismatch { expected: String, actual: String },

    /// The payload is not a JSON object.
    #[error("payload is not an object")]
    NotAnObject,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KeyError {
    /// Returns true if the key can never become valid.
    pub fn is_malformed(&self) -> bool {
        matches!(self, KeyError::Malformed(_))
    }
}
