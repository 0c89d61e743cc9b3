//! Error types for plan building and submission handling.

/// Why a plan was rejected before anything ran.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanDefect {
    #[error("plan has no tasks")]
    Empty,

    #[error("duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("task {task_id} depends on unknown task {dependency}")]
    UnknownDependency { task_id: String, dependency: String },

    #[error("dependency cycle through tasks {0:?}")]
    Cycle(Vec<String>),

    #[error("plan nesting depth {depth} exceeds maximum {max}")]
    RecursionLimitExceeded { depth: u32, max: u32 },

    #[error("task {task_id} names unknown agent {agent_id:?}")]
    MissingAgent { task_id: String, agent_id: String },
}

/// Errors returned by the orchestrator itself. Task-level failures are
/// never errors here; they are captured in the task's result.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("invalid plan: {0}")]
    PlanInvalid(#[from] PlanDefect),

    #[error("invalid plan spec: {0}")]
    Spec(#[from] serde_json::Error),

    #[error("submission not found: {0}")]
    SubmissionNotFound(String),
}
