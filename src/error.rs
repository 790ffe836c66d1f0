// ABOUTME: Error kinds a dataset run can end with
// ABOUTME: Each stage classifies its failure so the pipeline can decide on watermark handling

use thiserror::Error;

/// Failure kinds for a single dataset run.
///
/// Collaborators (stores, HTTP client, database) report `anyhow` errors; the
/// pipeline maps them onto one of these kinds at the stage boundary. The
/// reason string keeps the full context chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Watermark, registry or credential store could not be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Transport failure or non-success HTTP status from the changeset service.
    #[error("source error: {0}")]
    Source(String),

    /// The payload could not be decoded into change records.
    #[error("parse error: {0}")]
    Parse(String),

    /// A single geometry element could not be reconstructed.
    #[error("geometry error: {0}")]
    Geometry(String),

    /// Any SQL failure while staging or applying the changeset.
    #[error("database error: {0}")]
    Database(String),
}

impl SyncError {
    /// Short, stable name of the error kind (used in logs and run records).
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::StoreUnavailable(_) => "StoreUnavailable",
            SyncError::Source(_) => "SourceError",
            SyncError::Parse(_) => "ParseError",
            SyncError::Geometry(_) => "GeometryError",
            SyncError::Database(_) => "DatabaseError",
        }
    }

    /// Build a store error from an `anyhow` chain, keeping every context layer.
    pub fn store(err: &anyhow::Error) -> Self {
        SyncError::StoreUnavailable(format!("{:#}", err))
    }

    /// Build a source error from an `anyhow` chain.
    pub fn source(err: &anyhow::Error) -> Self {
        SyncError::Source(format!("{:#}", err))
    }

    /// Build a database error from an `anyhow` chain.
    pub fn database(err: &anyhow::Error) -> Self {
        SyncError::Database(format!("{:#}", err))
    }

    /// Whether an orchestration layer may retry the run.
    ///
    /// Only source failures are transient by nature; everything else would
    /// fail the same way on a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Source(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_kind_names() {
        assert_eq!(SyncError::Parse("x".into()).kind(), "ParseError");
        assert_eq!(SyncError::Source("x".into()).kind(), "SourceError");
        assert_eq!(
            SyncError::StoreUnavailable("x".into()).kind(),
            "StoreUnavailable"
        );
    }

    #[test]
    fn test_store_error_keeps_context_chain() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("connection refused"));
        let err = err.context("Failed to read latest watermark").unwrap_err();
        let classified = SyncError::store(&err);
        let message = classified.to_string();
        assert!(message.contains("Failed to read latest watermark"));
        assert!(message.contains("connection refused"));
    }

    #[test]
    fn test_only_source_errors_are_retryable() {
        assert!(SyncError::Source("503".into()).is_retryable());
        assert!(!SyncError::Parse("bad".into()).is_retryable());
        assert!(!SyncError::Database("deadlock".into()).is_retryable());
    }
}
