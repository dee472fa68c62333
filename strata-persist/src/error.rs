//! Error types for every tier of the persistence pipeline.
//!
//! Each component owns a narrow error enum; [`PersistError`] wraps them so
//! lifecycle handlers can propagate any failure with `?`.

use thiserror::Error;

/// Cache backend failures. Never surfaced past [`crate::cache::DocumentCache`].
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache operation timed out")]
    Timeout,
}

/// Binary document state could not be turned into nodes.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    #[error("malformed document state: {0}")]
    Malformed(String),
    #[error("node {node} references unknown parent {parent}")]
    DanglingParent { node: String, parent: String },
    #[error("parent cycle through node {0}")]
    Cycle(String),
    #[error("invalid node entry {key}: {reason}")]
    InvalidEntry { key: String, reason: String },
}

/// Failures reported by the sync engine collaborator.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine rejected state for {page_id}: {reason}")]
    Rejected { page_id: String, reason: String },
}

/// Relational projection / snapshot log failures.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("node {node_id} appears twice in one commit of page {page_id}")]
    DuplicateNode { page_id: String, node_id: String },
}

/// Durable job queue failures.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(String),
    #[error("queue serialization error: {0}")]
    Serialization(String),
    #[error("queue deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),
    #[error("job {0} not found in the expected state")]
    JobNotFound(u64),
}

impl From<rocksdb::Error> for QueueError {
    fn from(e: rocksdb::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}

/// A single job failed to process.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    #[error("worker task panicked: {0}")]
    Panicked(String),
}

impl WorkerError {
    /// Malformed state never decodes on a later attempt; store failures may.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            WorkerError::Decode(_) | WorkerError::Projection(ProjectionError::DuplicateNode { .. })
        )
    }
}

/// Lifecycle event rejected at the boundary.
#[derive(Debug, Clone, Error)]
pub enum EventError {
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
}

/// Invalid configuration value.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Crate-level error returned by lifecycle handlers.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("user {user_id} is not allowed to open page {page_id}")]
    Unauthorized { user_id: String, page_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_errors_are_not_retryable() {
        let err = WorkerError::Decode(DecodeError::Malformed("eof".into()));
        assert!(!err.is_retryable());

        let err = WorkerError::Projection(ProjectionError::Unavailable("down".into()));
        assert!(err.is_retryable());

        let err = WorkerError::Projection(ProjectionError::DuplicateNode {
            page_id: "p".into(),
            node_id: "a".into(),
        });
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = PersistError::Unauthorized {
            user_id: "u1".into(),
            page_id: "p1".into(),
        };
        assert!(err.to_string().contains("u1"));
        assert!(err.to_string().contains("p1"));

        let err = ConfigError::Invalid { key: "STRATA_MODE", value: "sideways".into() };
        assert!(err.to_string().contains("STRATA_MODE"));
    }
}
