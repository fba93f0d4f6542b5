//! Error types for job model handling.

use thiserror::Error;

/// Errors that can occur when decoding persisted job records.
#[derive(Debug, Error, Clone)]
pub enum ModelError {
    /// The status string is not a known task status.
    #[error("unknown task status: {0}")]
    UnknownStatus(String),

    /// The launch type string is not recognized.
    #[error("unknown launch type: {0}")]
    UnknownLaunchType(String),

    /// The node type string is not recognized.
    #[error("unknown node type: {0}")]
    UnknownNodeType(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::Serialization(err.to_string())
    }
}
