//! The seam between the orchestrator and whatever runs an agent step.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agent::error::AgentResult;
use crate::domain::{ExecutionContext, Usage};

/// Output of a finished upstream task, passed along a dependency edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamOutput {
    pub task_id: String,
    pub agent_id: String,
    pub output: String,
}

/// One agent step as scheduled by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub task_id: String,
    pub agent_id: String,
    pub message: String,
    #[serde(default)]
    pub upstream: Vec<UpstreamOutput>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub text: String,
    pub usage: Usage,
    /// Tool calls made during the step.
    pub tool_calls: usize,
}

impl AgentOutput {
    pub fn new(text: impl Into<String>, usage: Usage) -> Self {
        Self {
            text: text.into(),
            usage,
            tool_calls: 0,
        }
    }
}

/// Runs agent steps on behalf of the orchestrator.
///
/// `ctx.budgets` is the allowance for this step; implementations must stop
/// before exceeding it and return promptly once `cancel` fires.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        invocation: AgentInvocation,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> AgentResult<AgentOutput>;

    /// Whether `agent_id` can be resolved. Checked when a plan is built.
    fn has_agent(&self, _agent_id: &str) -> bool {
        true
    }
}
