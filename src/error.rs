//! Store Error Types

use std::io;
use thiserror::Error;

/// Errors produced by the versioned store and session layer.
///
/// Variants group into four classes:
/// - **NotFound**: dataset/category/chunk/commit/session lookups with no match
/// - **Conflict**: uniqueness violations (duplicate user-facing chunk id,
///   dataset name already taken)
/// - **InvalidInput**: malformed or out-of-bounds caller input
/// - **Unavailable**: transient persistence failures (the only class eligible
///   for retry at the store boundary)
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error from the persistence backend
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Dataset not found
    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    /// Dataset already exists
    #[error("Dataset already exists: {0}")]
    DatasetExists(String),

    /// Category not found (by stable identifier)
    #[error("Category '{category}' not found in dataset '{dataset}'")]
    CategoryNotFound { dataset: String, category: String },

    /// Chunk not found (by stable identifier)
    #[error("Chunk '{chunk}' not found in dataset '{dataset}'")]
    ChunkNotFound { dataset: String, chunk: String },

    /// Commit not found in a dataset's history
    #[error("Commit '{commit}' not found in history of dataset '{dataset}'")]
    CommitNotFound { dataset: String, commit: String },

    /// Duplicate user-facing chunk id within a dataset
    #[error("Chunk id '{id}' already in use in dataset '{dataset}'")]
    DuplicateChunkId { dataset: String, id: String },

    /// Session code has no active session
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Too many concurrent sessions
    #[error("Maximum number of sessions ({0}) exceeded")]
    SessionLimit(usize),

    /// Malformed or out-of-bounds input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Transient persistence failure (retried with bounded attempts)
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether this error is in the not-found class.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::DatasetNotFound(_)
                | StoreError::CategoryNotFound { .. }
                | StoreError::ChunkNotFound { .. }
                | StoreError::CommitNotFound { .. }
                | StoreError::SessionNotFound(_)
        )
    }

    /// Whether this error is in the conflict class.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::DatasetExists(_) | StoreError::DuplicateChunkId { .. }
        )
    }

    /// Whether this error is a transient persistence failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
