//! Agent Synapse core library
//!
//! Multi-agent orchestration over tenant-isolated layered memory:
//! the Orchestrator schedules agent steps over a validated task graph, the
//! Agent Executor runs each step against the Memory Router, a Completion
//! Provider and Tool Executors, and the Decay Job ages and consolidates
//! stored memory in the background.

pub mod agent;
pub mod config;
pub mod domain;
pub mod memory;
pub mod metrics;
pub mod obs;
pub mod orchestration;
pub mod telemetry;

pub use agent::{
    AgentError, AgentExecutor, AgentInvocation, AgentOutput, AgentProfile, AgentRegistry,
    AgentRunner, Completion, CompletionProvider, ModelParameters, PromptContext, ProviderError,
    ToolDescriptor, ToolDispatcher, ToolExecutionError, ToolExecutor, ToolKind, ToolOutput,
};
pub use config::{ConfigError, SynapseConfig};
pub use domain::{Budgets, ExecutionContext, Result, SynapseError, Usage};
pub use memory::{
    DecayJob, DecayReport, MemoryError, MemoryQuery, MemoryRouter, MemoryTiers, NewMemory,
    QueryKind, RankedContext,
};
pub use orchestration::{
    OrchestrationError, OrchestrationRequest, OrchestrationResult, OrchestrationStatus,
    Orchestrator, PlanDefect, PlanSpec, SubmissionId, SubmissionRegistry, TaskSpec, TaskStatus,
};

pub use synapse_state::{MemoryItem, MemoryTier, TenantId};

/// Crate version, reported by the binaries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
