//! Task and orchestration outcomes as returned to callers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::agent::AgentError;
use crate::domain::{redact, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    PartialFailure,
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::PartialFailure)
    }
}

/// Classification of a failed or skipped task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BudgetExceeded,
    RecursionLimitExceeded,
    Provider,
    Tool,
    Memory,
    Timeout,
    Cancelled,
    MaxIterations,
    UnknownAgent,
    /// A nested plan did not fully succeed.
    Subplan,
    /// A dependency did not succeed.
    UpstreamFailed,
    /// A critical task failed before this one started.
    Aborted,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BudgetExceeded => "budget_exceeded",
            Self::RecursionLimitExceeded => "recursion_limit_exceeded",
            Self::Provider => "provider",
            Self::Tool => "tool",
            Self::Memory => "memory",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::MaxIterations => "max_iterations",
            Self::UnknownAgent => "unknown_agent",
            Self::Subplan => "subplan",
            Self::UpstreamFailed => "upstream_failed",
            Self::Aborted => "aborted",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&AgentError> for FailureKind {
    fn from(e: &AgentError) -> Self {
        match e.root() {
            AgentError::UnknownAgent(_) | AgentError::DuplicateAgent(_) => Self::UnknownAgent,
            AgentError::BudgetExceeded(_) => Self::BudgetExceeded,
            AgentError::RecursionLimitExceeded { .. } => Self::RecursionLimitExceeded,
            AgentError::Provider(_) => Self::Provider,
            AgentError::Tool(_) => Self::Tool,
            AgentError::MaxIterationsExceeded(_) => Self::MaxIterations,
            AgentError::Timeout { .. } => Self::Timeout,
            AgentError::Cancelled => Self::Cancelled,
            AgentError::Memory(_) => Self::Memory,
            AgentError::Spent { .. } => Self::Internal,
        }
    }
}

/// Why a task did not succeed. The diagnostic is redacted on construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub diagnostic: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, diagnostic: impl fmt::Display) -> Self {
        Self {
            kind,
            diagnostic: redact(&diagnostic.to_string()),
        }
    }
}

impl From<&AgentError> for TaskFailure {
    fn from(e: &AgentError) -> Self {
        Self::new(FailureKind::from(e), e)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_id: String,
    pub status: TaskStatus,
    pub output: Option<String>,
    pub failure: Option<TaskFailure>,
    /// Executions attempted, retries included. Zero when never started.
    pub attempts: u32,
    pub usage: Usage,
}

impl TaskResult {
    pub fn succeeded(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        output: String,
        attempts: u32,
        usage: Usage,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            status: TaskStatus::Succeeded,
            output: Some(output),
            failure: None,
            attempts,
            usage,
        }
    }

    pub fn failed(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        failure: TaskFailure,
        attempts: u32,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            status: TaskStatus::Failed,
            output: None,
            failure: Some(failure),
            attempts,
            usage: Usage::default(),
        }
    }

    /// Budget the task consumed, including failed attempts.
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn skipped(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        failure: TaskFailure,
    ) -> Self {
        Self {
            status: TaskStatus::Skipped,
            ..Self::failed(task_id, agent_id, failure, 0)
        }
    }
}

/// Aggregated outcome of one submitted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub orchestration_id: String,
    pub status: OrchestrationStatus,
    /// One entry per plan task, in plan order.
    pub task_results: Vec<TaskResult>,
    pub final_output: Option<String>,
    pub usage: Usage,
}

impl OrchestrationResult {
    pub fn task(&self, task_id: &str) -> Option<&TaskResult> {
        self.task_results.iter().find(|r| r.task_id == task_id)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.task_results
            .iter()
            .filter(|r| r.status == status)
            .count()
    }
}
