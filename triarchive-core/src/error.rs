//! Error taxonomy for triarchive operations.
//!
//! Mirrors the five kinds the design calls out: transient external errors
//! (retryable), expected non-zero exits from external tools, configuration
//! or invariant violations, resource errors, and fatal errors that should
//! stop a worker outright.

use thiserror::Error;

/// Main error type for triarchive operations.
#[derive(Error, Debug)]
pub enum TriarchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transient external error: {0}")]
    Transient(String),

    #[error("external tool exited with status {code}: {message}")]
    ToolExit { code: i32, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("other error: {0}")]
    Other(String),
}

/// Result type alias for triarchive operations.
pub type TriarchiveResult<T> = Result<T, TriarchiveError>;

impl TriarchiveError {
    /// True for error kinds a caller may reasonably retry (transient
    /// external errors and a subset of tool exits and resource errors).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TriarchiveError::Transient(_) | TriarchiveError::Resource(_)
        )
    }
}

impl From<serde_json::Error> for TriarchiveError {
    fn from(err: serde_json::Error) -> Self {
        TriarchiveError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for TriarchiveError {
    fn from(err: anyhow::Error) -> Self {
        TriarchiveError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_resource_are_retryable() {
        assert!(TriarchiveError::Transient("timeout".into()).is_retryable());
        assert!(TriarchiveError::Resource("disk full".into()).is_retryable());
    }

    #[test]
    fn configuration_errors_are_not_retryable() {
        assert!(!TriarchiveError::Configuration("bad regex".into()).is_retryable());
        assert!(!TriarchiveError::Fatal("unrecoverable".into()).is_retryable());
    }
}
