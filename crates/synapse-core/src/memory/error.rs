//! Error types for the memory subsystem.

use synapse_state::{MemoryTier, StorageError, TenantId};

/// Errors produced by memory operations.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// A backend returned an item that fails the tenant, tier or shape
    /// checks. Logged and discarded; never returned from `retrieve`.
    #[error("consistency violation in {tier} tier for tenant {tenant}: {reason}")]
    Consistency {
        tier: MemoryTier,
        tenant: TenantId,
        reason: String,
    },

    #[error("no backend configured for the {0} tier")]
    TierUnavailable(MemoryTier),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{tier} tier did not answer within {timeout_ms}ms")]
    Timeout { tier: MemoryTier, timeout_ms: u64 },

    #[error("invalid memory: {0}")]
    Invalid(String),
}

/// Result type for memory operations.
pub type MemoryResult<T> = std::result::Result<T, MemoryError>;
