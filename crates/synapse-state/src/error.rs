//! Error types for synapse-state

use thiserror::Error;

use crate::storage_traits::MemoryTier;

/// Errors raised while opening or migrating a backend.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors returned by [`crate::MemoryBackend`] operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend could not serve the request right now; retrying may help.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Permanent backend failure.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("memory item not found: {id}")]
    NotFound { id: String },

    /// The item was handed to a backend serving a different tier.
    #[error("tier mismatch: backend serves {expected}, item belongs to {actual}")]
    TierMismatch {
        expected: MemoryTier,
        actual: MemoryTier,
    },

    /// The item failed structural validation before being written.
    #[error("invalid memory item {id}: {reason}")]
    InvalidItem { id: String, reason: String },
}

impl StorageError {
    /// True when the caller may retry the same operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_) | StorageError::Connection(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Connection(msg) => StorageError::Connection(msg),
            StateError::Query(msg) | StateError::SchemaSetup(msg) => StorageError::Backend(msg),
        }
    }
}
