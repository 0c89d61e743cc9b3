//! Structured tracing events for orchestration and memory lifecycle.

use std::sync::Arc;

use synapse_core::memory::DecayReport;
use synapse_core::obs::{
    emit_decay_pass_finished, emit_item_discarded, emit_orchestration_finished,
    emit_orchestration_started, emit_task_finished, OrchestrationSpan,
};
use synapse_core::orchestration::{OrchestrationResult, TaskResult};
use synapse_core::{MemoryTier, OrchestrationStatus, TenantId, Usage};
use tracing_test::traced_test;

#[traced_test]
#[test]
fn orchestration_events_carry_ids_and_status() {
    let tenant = TenantId::new("acme");
    let _span = OrchestrationSpan::enter("orch-42", &tenant);
    emit_orchestration_started("orch-42", &tenant, 3);

    let task = TaskResult::succeeded("t1", "sql", "ok".to_string(), 1, Usage::new(12, 0.0));
    emit_task_finished("orch-42", &task);
    emit_orchestration_finished(
        &OrchestrationResult {
            orchestration_id: "orch-42".to_string(),
            status: OrchestrationStatus::Succeeded,
            task_results: vec![task],
            final_output: Some("ok".to_string()),
            usage: Usage::new(12, 0.0),
        },
        250,
    );

    assert!(logs_contain("orchestration.started"));
    assert!(logs_contain("task.finished"));
    assert!(logs_contain("orchestration.finished"));
    assert!(logs_contain("orch-42"));
}

#[traced_test]
#[test]
fn discarded_items_are_warnings() {
    emit_item_discarded(
        MemoryTier::KnowledgeGraph,
        &TenantId::new("acme"),
        &"item belongs to another tenant",
    );
    assert!(logs_contain("memory.item_discarded"));
    assert!(logs_contain("WARN"));
}

#[traced_test]
#[test]
fn decay_pass_summary_is_logged() {
    emit_decay_pass_finished(&DecayReport {
        tenants_processed: 2,
        items_expired: 5,
        ..DecayReport::default()
    });
    assert!(logs_contain("decay.pass_finished"));
    assert!(logs_contain("expired=5"));
}

#[traced_test]
#[tokio::test]
async fn a_real_run_logs_its_lifecycle() {
    use async_trait::async_trait;
    use synapse_core::agent::{AgentInvocation, AgentOutput, AgentResult, AgentRunner};
    use synapse_core::config::OrchestratorConfig;
    use synapse_core::{ExecutionContext, OrchestrationRequest, Orchestrator};
    use tokio_util::sync::CancellationToken;

    struct Quiet;

    #[async_trait]
    impl AgentRunner for Quiet {
        async fn run(
            &self,
            _invocation: AgentInvocation,
            _ctx: &ExecutionContext,
            _cancel: CancellationToken,
        ) -> AgentResult<AgentOutput> {
            Ok(AgentOutput::new("done", Usage::new(1, 0.0)))
        }
    }

    let orchestrator = Orchestrator::new(Arc::new(Quiet), OrchestratorConfig::default());
    let ctx = ExecutionContext::new(TenantId::new("acme"), "u1", "s1");
    orchestrator
        .submit(OrchestrationRequest::agent("helper", "hi"), ctx)
        .await
        .unwrap();

    assert!(logs_contain("orchestration.started"));
    assert!(logs_contain("orchestration.finished"));
    assert!(logs_contain("metric=\"flush\"") || logs_contain("metric=flush"));
}
