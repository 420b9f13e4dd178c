//! Error types for the permits pipeline
//!
//! Record-level problems are `Validation` and never abort a batch. Store
//! outages and timeouts are `Connectivity` and are the only retryable kind.
//! `Schema` and `Consistency` always escalate to a failed run.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Main error type for the pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connectivity error ({service}): {message}")]
    Connectivity { service: String, message: String },

    #[error("Schema error ({target}): {message}")]
    Schema { target: String, message: String },

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Run {run_id} is already in progress for dataset '{dataset_key}'")]
    ConcurrencyConflict { dataset_key: String, run_id: String },

    #[error("Run cancelled before stage '{0}'")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification used in run records and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Connectivity,
    Schema,
    Consistency,
    NotFound,
    ConcurrencyConflict,
    Cancelled,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Schema => "schema",
            ErrorKind::Consistency => "consistency",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ConcurrencyConflict => "concurrency_conflict",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        PipelineError::Validation(message.into())
    }

    pub fn connectivity(service: impl Into<String>, message: impl std::fmt::Display) -> Self {
        PipelineError::Connectivity {
            service: service.into(),
            message: message.to_string(),
        }
    }

    /// A remote call that exceeded its deadline. Counts as connectivity.
    pub fn timeout(service: impl Into<String>, after: Duration) -> Self {
        PipelineError::Connectivity {
            service: service.into(),
            message: format!("timed out after {}ms", after.as_millis()),
        }
    }

    pub fn schema(target: impl Into<String>, message: impl std::fmt::Display) -> Self {
        PipelineError::Schema {
            target: target.into(),
            message: message.to_string(),
        }
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        PipelineError::Consistency(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        PipelineError::NotFound(what.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::Config(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::Connectivity { .. } => ErrorKind::Connectivity,
            PipelineError::Schema { .. } => ErrorKind::Schema,
            PipelineError::Consistency(_) => ErrorKind::Consistency,
            PipelineError::NotFound(_) => ErrorKind::NotFound,
            PipelineError::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            PipelineError::Cancelled(_) => ErrorKind::Cancelled,
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::Io(_) | PipelineError::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Only connectivity failures (including timeouts) are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Connectivity { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connectivity_is_retryable() {
        assert!(PipelineError::connectivity("s3", "connection refused").is_retryable());
        assert!(PipelineError::timeout("postgres", Duration::from_secs(5)).is_retryable());
        assert!(!PipelineError::schema("permits_staging", "missing column").is_retryable());
        assert!(!PipelineError::consistency("count mismatch").is_retryable());
        assert!(!PipelineError::validation("missing PERMIT").is_retryable());
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(PipelineError::not_found("raw/x.json").kind().as_str(), "not_found");
        let conflict = PipelineError::ConcurrencyConflict {
            dataset_key: "ottawa".to_string(),
            run_id: "r1".to_string(),
        };
        assert_eq!(conflict.kind(), ErrorKind::ConcurrencyConflict);
        assert_eq!(
            serde_json::to_string(&ErrorKind::Connectivity).unwrap(),
            "\"connectivity\""
        );
    }

    #[test]
    fn test_timeout_message() {
        let err = PipelineError::timeout("elasticsearch", Duration::from_millis(1500));
        assert_eq!(
            err.to_string(),
            "Connectivity error (elasticsearch): timed out after 1500ms"
        );
    }
}
