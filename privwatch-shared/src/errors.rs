//! Error types used across the privwatch detector.

use thiserror::Error;

/// Result type for detector operations.
pub type DetectorResult<T> = Result<T, DetectorError>;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("probe error: {0}")]
    Probe(String),

    #[error("malformed event record: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("forwarder error: {0}")]
    Forward(String),

    #[error("internal error: {0}")]
    Internal(String),
}

// Implement From for common error types to enable `?` operator
impl From<std::io::Error> for DetectorError {
    fn from(err: std::io::Error) -> Self {
        DetectorError::Internal(format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for DetectorError {
    fn from(err: serde_json::Error) -> Self {
        DetectorError::Internal(format!("JSON error: {}", err))
    }
}

impl From<String> for DetectorError {
    fn from(err: String) -> Self {
        DetectorError::Internal(err)
    }
}

impl From<&str> for DetectorError {
    fn from(err: &str) -> Self {
        DetectorError::Internal(err.to_string())
    }
}
