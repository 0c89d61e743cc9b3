//! Domain values shared by the orchestrator, agent executor and memory router.

pub mod context;
pub mod error;
pub mod redact;

pub use context::{Budgets, ExecutionContext, Usage};
pub use error::{Result, SynapseError};
pub use redact::redact;
