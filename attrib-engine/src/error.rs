//! Error types for attrib-engine

use thiserror::Error;

/// Engine error type
#[derive(Debug, Error)]
pub enum EngineError {
    /// Record store failure that survived retries
    #[error("Store error: {0}")]
    Store(#[from] attrib_common::Error),

    /// A stored record could not be decoded
    #[error("Malformed record {key}: {reason}")]
    Malformed { key: String, reason: String },

    /// Referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// No recovery pass with this name is configured or built in
    #[error("Unknown recovery pass: {0}")]
    UnknownPass(String),

    /// Caller supplied an unusable argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Encoding one of our own records failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn malformed(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        EngineError::Malformed {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
