//! Structured observability hooks for orchestration and memory lifecycle events.
//!
//! This module provides:
//! - Orchestration-scoped tracing spans via the `OrchestrationSpan` RAII guard
//! - Emission functions for key lifecycle events
//!
//! Events are emitted at `info!` level, except consistency violations which
//! are warnings. Set `RUST_LOG` to filter and pass `--json` to the binaries
//! for JSON output.

use synapse_state::{MemoryTier, TenantId};
use tracing::{info, warn};

use crate::memory::DecayReport;
use crate::orchestration::{OrchestrationResult, TaskResult};

/// RAII guard that enters an orchestration-scoped tracing span.
///
/// # Example
///
/// ```ignore
/// let _span = OrchestrationSpan::enter("0b6c…", &tenant);
/// // every event below carries orchestration_id and tenant_id
/// ```
pub struct OrchestrationSpan {
    _span: tracing::span::EnteredSpan,
}

impl OrchestrationSpan {
    pub fn enter(orchestration_id: &str, tenant_id: &TenantId) -> Self {
        Self {
            _span: orchestration_span(orchestration_id, tenant_id).entered(),
        }
    }
}

/// The orchestration span itself, for instrumenting futures that must stay
/// `Send` (an entered span guard cannot be held across an await).
pub fn orchestration_span(orchestration_id: &str, tenant_id: &TenantId) -> tracing::Span {
    tracing::info_span!(
        "synapse.orchestration",
        orchestration_id = %orchestration_id,
        tenant_id = %tenant_id,
    )
}

/// Emit event: orchestration accepted with its task count.
pub fn emit_orchestration_started(orchestration_id: &str, tenant_id: &TenantId, tasks: usize) {
    info!(
        event = "orchestration.started",
        orchestration_id = %orchestration_id,
        tenant_id = %tenant_id,
        tasks = tasks,
    );
}

/// Emit event: orchestration finished with status, duration and usage.
pub fn emit_orchestration_finished(result: &OrchestrationResult, duration_ms: u64) {
    info!(
        event = "orchestration.finished",
        orchestration_id = %result.orchestration_id,
        status = ?result.status,
        tasks = result.task_results.len(),
        tokens = result.usage.tokens,
        cost_usd = result.usage.cost_usd,
        duration_ms = duration_ms,
    );
}

/// Emit event: one task reached a terminal state.
pub fn emit_task_finished(orchestration_id: &str, result: &TaskResult) {
    info!(
        event = "task.finished",
        orchestration_id = %orchestration_id,
        task_id = %result.task_id,
        agent_id = %result.agent_id,
        status = ?result.status,
        attempts = result.attempts,
        failure = result.failure.as_ref().map(|f| f.kind.as_str()).unwrap_or("none"),
    );
}

/// Emit event: an item returned by a tier failed the read-side checks.
pub fn emit_item_discarded(tier: MemoryTier, tenant_id: &TenantId, reason: &dyn std::fmt::Display) {
    warn!(
        event = "memory.item_discarded",
        tier = %tier,
        tenant_id = %tenant_id,
        reason = %reason,
    );
}

/// Emit event: a decay & consolidation pass completed.
pub fn emit_decay_pass_finished(report: &DecayReport) {
    info!(
        event = "decay.pass_finished",
        tenants = report.tenants_processed,
        scanned = report.items_scanned,
        decayed = report.items_decayed,
        expired = report.items_expired,
        consolidated = report.items_consolidated,
        errors = report.errors,
        duration_ms = report.duration.as_millis() as u64,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_enter_does_not_panic() {
        let _span = OrchestrationSpan::enter("orch-1", &TenantId::new("acme"));
        emit_item_discarded(MemoryTier::Semantic, &TenantId::new("acme"), &"foreign tenant");
    }
}
