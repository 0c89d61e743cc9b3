//! Crate-level error taxonomy.

use synapse_state::StorageError;

use crate::agent::AgentError;
use crate::config::ConfigError;
use crate::memory::MemoryError;
use crate::orchestration::OrchestrationError;

/// Any error the Synapse core can return.
#[derive(Debug, thiserror::Error)]
pub enum SynapseError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("orchestration error: {0}")]
    Orchestration(#[from] OrchestrationError),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for Synapse core operations.
pub type Result<T> = std::result::Result<T, SynapseError>;
