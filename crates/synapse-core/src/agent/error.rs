//! Error types for agent execution.

use synapse_state::StorageError;

use crate::agent::provider::ProviderError;
use crate::agent::tools::ToolExecutionError;
use crate::domain::Usage;
use crate::memory::MemoryError;

/// Errors produced while running one agent step.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("duplicate agent registration: {0}")]
    DuplicateAgent(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("recursion depth {depth} exceeds maximum {max}")]
    RecursionLimitExceeded { depth: u32, max: u32 },

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolExecutionError),

    #[error("agent exceeded {0} completion rounds")]
    MaxIterationsExceeded(u32),

    #[error("completion timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    /// A failure that happened after the step had already consumed budget.
    #[error("{error}")]
    Spent { spent: Usage, error: Box<AgentError> },
}

impl AgentError {
    /// Attach the usage consumed before this error; a no-op for zero usage.
    pub fn with_spend(self, usage: Usage) -> Self {
        if usage.tokens == 0 && usage.cost_usd <= 0.0 {
            return self;
        }
        match self {
            Self::Spent { mut spent, error } => {
                spent.add(usage);
                Self::Spent { spent, error }
            }
            error => Self::Spent {
                spent: usage,
                error: Box::new(error),
            },
        }
    }

    /// Usage consumed before the failure.
    pub fn spent(&self) -> Usage {
        match self {
            Self::Spent { spent, .. } => *spent,
            _ => Usage::default(),
        }
    }

    /// The underlying error with any spend annotation removed.
    pub fn root(&self) -> &AgentError {
        match self {
            Self::Spent { error, .. } => error.root(),
            other => other,
        }
    }

    /// Whether retrying the whole step may succeed.
    pub fn is_transient(&self) -> bool {
        match self.root() {
            Self::Provider(e) => e.is_transient(),
            Self::Timeout { .. } => true,
            Self::Memory(MemoryError::Storage(e)) => e.is_transient(),
            Self::Memory(MemoryError::Timeout { .. }) => true,
            _ => false,
        }
    }
}

impl From<StorageError> for AgentError {
    fn from(e: StorageError) -> Self {
        Self::Memory(MemoryError::Storage(e))
    }
}

/// Result type for agent operations.
pub type AgentResult<T> = std::result::Result<T, AgentError>;
