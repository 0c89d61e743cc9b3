//! Orchestration Engine: plan building, scheduling and aggregation.

pub mod budget;
pub mod error;
pub mod plan;
pub mod result;
pub mod scheduler;
pub mod submission;

pub use budget::{BudgetLedger, Reservation};
pub use error::{OrchestrationError, PlanDefect};
pub use plan::{OrchestrationPlan, PlanSpec, TaskNode, TaskSpec};
pub use result::{
    FailureKind, OrchestrationResult, OrchestrationStatus, TaskFailure, TaskResult, TaskStatus,
};
pub use scheduler::{OrchestrationRequest, Orchestrator, RequestTarget};
pub use submission::{SubmissionId, SubmissionRegistry, SubmissionStatus};
