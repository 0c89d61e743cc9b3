//! Agent Executor and its external collaborators.

pub mod error;
pub mod executor;
pub mod provider;
pub mod registry;
pub mod runner;
pub mod tools;

pub use error::{AgentError, AgentResult};
pub use executor::AgentExecutor;
pub use provider::{
    Completion, CompletionProvider, ModelParameters, PromptContext, PromptMessage, PromptRole,
    ProviderError, ToolCallRequest,
};
pub use registry::{AgentProfile, AgentRegistry};
pub use runner::{AgentInvocation, AgentOutput, AgentRunner, UpstreamOutput};
pub use tools::{
    ToolDescriptor, ToolDispatcher, ToolExecutionError, ToolExecutor, ToolKind, ToolOutput,
};
