//! Synapse-State: tenant-scoped memory tier storage
//!
//! This crate is the Memory Backend Adapter layer of Agent Synapse. Every
//! memory tier is reached through the [`MemoryBackend`] trait; the core never
//! talks to a storage engine directly.
//!
//! ## Key Components
//!
//! - [`MemoryItem`] / [`MemoryTier`]: the stored unit and the five tiers
//! - [`MemoryBackend`]: put / query / delete contract, always tenant-scoped
//! - [`similarity`]: hint-based ranking shared by every backend
//! - [`fakes::InMemoryBackend`]: in-process backend with fault injection
//! - [`SurrealMemoryBackend`]: SurrealDB adapter sharing one `memory_items` table

mod error;
pub mod fakes;
pub mod migrations;
mod schema;
pub mod similarity;
pub mod storage_traits;
pub mod surreal_backend;

pub use error::{StateError, StorageError};
pub use schema::MemoryItemRow;
pub use storage_traits::{
    DeleteTarget, MemoryBackend, MemoryFilter, MemoryItem, MemoryItemId, MemoryTier, ScanCursor,
    StorageResult, TenantId,
};
pub use surreal_backend::SurrealMemoryBackend;

/// Result type for connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
