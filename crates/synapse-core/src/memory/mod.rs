//! Layered memory: tenant-scoped retrieval, tier-aware writes and the
//! background decay & consolidation job.

pub mod consolidation;
pub mod decay;
pub mod error;
pub mod job;
pub mod ranking;
pub mod router;
pub mod tiers;

pub use consolidation::{merge_cluster, plan_merges, MergePlan};
pub use decay::{apply_decay, DecayOutcome};
pub use error::{MemoryError, MemoryResult};
pub use job::{DecayJob, DecayReport};
pub use ranking::{RankedContext, RankedItem};
pub use router::{MemoryQuery, MemoryRouter, NewMemory, QueryKind, StoreReceipt};
pub use tiers::MemoryTiers;
