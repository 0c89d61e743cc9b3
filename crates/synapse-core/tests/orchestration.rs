//! Orchestrator scheduling: dependency order, failure isolation, retries,
//! concurrency caps, budgets, timeouts and cancellation.
//!
//! Uses a stub runner with per-agent delays and scripted failures instead of
//! the real Agent Executor.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use synapse_core::agent::{AgentInvocation, AgentOutput, AgentResult, AgentRunner};
use synapse_core::config::OrchestratorConfig;
use synapse_core::metrics::METRICS;
use synapse_core::orchestration::{FailureKind, OrchestrationError, PlanDefect};
use synapse_core::{
    AgentError, Budgets, ExecutionContext, OrchestrationRequest, OrchestrationStatus, Orchestrator,
    PlanSpec, ProviderError, TaskSpec, TaskStatus, TenantId, ToolExecutionError, Usage,
};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct StubRunner {
    delays: HashMap<String, Duration>,
    failures: Mutex<HashMap<String, VecDeque<AgentError>>>,
    /// `(agent_id, token allowance)` per call, in call order.
    calls: Mutex<Vec<(String, u64)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl StubRunner {
    fn new() -> Self {
        Self::default()
    }

    fn with_delay(mut self, agent_id: &str, delay: Duration) -> Self {
        self.delays.insert(agent_id.to_string(), delay);
        self
    }

    /// Serve `errors` in order before `agent_id` starts succeeding.
    fn failing(self, agent_id: &str, errors: impl IntoIterator<Item = AgentError>) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(agent_id.to_string(), errors.into_iter().collect());
        self
    }

    fn calls_to(&self, agent_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == agent_id)
            .count()
    }

    fn allowance_of(&self, agent_id: &str) -> Option<u64> {
        self.allowances_of(agent_id).first().copied()
    }

    /// Token allowance of every call to `agent_id`, in call order.
    fn allowances_of(&self, agent_id: &str) -> Vec<u64> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == agent_id)
            .map(|(_, tokens)| *tokens)
            .collect()
    }
}

#[async_trait]
impl AgentRunner for StubRunner {
    async fn run(
        &self,
        invocation: AgentInvocation,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> AgentResult<AgentOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((invocation.agent_id.clone(), ctx.budgets.tokens));
        if invocation.agent_id == "panics" {
            panic!("agent blew up");
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = self
            .delays
            .get(&invocation.agent_id)
            .copied()
            .unwrap_or_default();
        let waited = tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        waited?;

        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&invocation.agent_id)
            .and_then(|queue| queue.pop_front());
        if let Some(e) = scripted {
            return Err(e);
        }

        let upstream: Vec<&str> = invocation.upstream.iter().map(|u| u.task_id.as_str()).collect();
        Ok(AgentOutput::new(
            format!("{}<-[{}]", invocation.agent_id, upstream.join(",")),
            Usage::new(10, 0.001),
        ))
    }
}

fn ctx() -> ExecutionContext {
    ExecutionContext::new(TenantId::new("acme"), "user-1", "session-1")
}

fn fast_retries() -> OrchestratorConfig {
    OrchestratorConfig {
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..OrchestratorConfig::default()
    }
}

fn throttled_after(tokens: u64) -> AgentError {
    AgentError::Provider(ProviderError::Throttled("429".into())).with_spend(Usage::new(tokens, 0.0))
}

fn tool_failure() -> AgentError {
    AgentError::Tool(ToolExecutionError::Failed {
        tool_id: "sql".to_string(),
        message: "relation \"orders\" does not exist".to_string(),
    })
}

#[tokio::test]
async fn nesting_beyond_the_recursion_limit_is_rejected_before_running() {
    let runner = Arc::new(StubRunner::new());
    let orchestrator = Orchestrator::new(
        runner.clone(),
        OrchestratorConfig {
            max_recursion_depth: 1,
            ..OrchestratorConfig::default()
        },
    );
    let spec = PlanSpec::new(vec![TaskSpec::nested(
        "outer",
        PlanSpec::new(vec![TaskSpec::nested("inner", PlanSpec::single("leaf"))]),
    )]);

    let err = orchestrator
        .submit(OrchestrationRequest::plan(spec.clone(), "q"), ctx())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestrationError::PlanInvalid(PlanDefect::RecursionLimitExceeded { depth: 2, max: 1 })
    ));
    assert!(runner.calls.lock().unwrap().is_empty());

    let deeper = Orchestrator::new(
        runner.clone(),
        OrchestratorConfig {
            max_recursion_depth: 2,
            ..OrchestratorConfig::default()
        },
    );
    let result = deeper
        .submit(OrchestrationRequest::plan(spec, "q"), ctx())
        .await
        .unwrap();
    assert_eq!(result.status, OrchestrationStatus::Succeeded);
    assert_eq!(result.final_output.as_deref(), Some("leaf<-[]"));
}

#[tokio::test]
async fn a_non_critical_tool_failure_only_skips_its_dependents() {
    let runner = Arc::new(StubRunner::new().failing("sql", [tool_failure()]));
    let orchestrator = Orchestrator::new(runner.clone(), fast_retries());
    let spec = PlanSpec::new(vec![
        TaskSpec::new("t1", "planner"),
        TaskSpec::new("t2", "sql").depends_on(["t1"]),
        TaskSpec::new("t3", "writer").depends_on(["t2"]),
        TaskSpec::new("t4", "web"),
    ]);

    let result = orchestrator
        .submit(OrchestrationRequest::plan(spec, "revenue by region"), ctx())
        .await
        .unwrap();

    assert_eq!(result.status, OrchestrationStatus::PartialFailure);
    let t1 = result.task("t1").unwrap();
    assert_eq!(t1.status, TaskStatus::Succeeded);
    assert_eq!(t1.output.as_deref(), Some("planner<-[]"));

    let t2 = result.task("t2").unwrap();
    assert_eq!(t2.status, TaskStatus::Failed);
    assert_eq!(t2.failure.as_ref().unwrap().kind, FailureKind::Tool);
    assert_eq!(t2.attempts, 1);

    let t3 = result.task("t3").unwrap();
    assert_eq!(t3.status, TaskStatus::Skipped);
    assert_eq!(t3.failure.as_ref().unwrap().kind, FailureKind::UpstreamFailed);
    assert_eq!(runner.calls_to("writer"), 0);

    assert_eq!(result.task("t4").unwrap().status, TaskStatus::Succeeded);
    assert_eq!(result.task_results.len(), 4);
}

#[tokio::test]
async fn a_non_critical_failure_leaves_a_running_critical_task_alone() {
    let runner = Arc::new(
        StubRunner::new()
            .with_delay("auditor", Duration::from_millis(50))
            .failing("scraper", [tool_failure()]),
    );
    let orchestrator = Orchestrator::new(runner.clone(), fast_retries());
    let spec = PlanSpec::new(vec![
        TaskSpec::new("a", "auditor").critical(),
        TaskSpec::new("b", "scraper"),
    ]);

    let result = orchestrator
        .submit(OrchestrationRequest::plan(spec, "q"), ctx())
        .await
        .unwrap();

    assert_eq!(result.status, OrchestrationStatus::PartialFailure);
    let a = result.task("a").unwrap();
    assert_eq!(a.status, TaskStatus::Succeeded);
    assert_eq!(a.output.as_deref(), Some("auditor<-[]"));
    let b = result.task("b").unwrap();
    assert_eq!(b.status, TaskStatus::Failed);
    assert_eq!(b.failure.as_ref().unwrap().kind, FailureKind::Tool);
    assert_eq!(result.final_output.as_deref(), Some("auditor<-[]"));
}

#[tokio::test]
async fn a_critical_failure_stops_further_admission() {
    let runner = Arc::new(
        StubRunner::new().failing("gate", [AgentError::Provider(ProviderError::Rejected("policy".into()))]),
    );
    let orchestrator = Orchestrator::new(
        runner.clone(),
        OrchestratorConfig {
            max_parallel_agents: 1,
            ..fast_retries()
        },
    );
    let spec = PlanSpec::new(vec![
        TaskSpec::new("check", "gate").critical(),
        TaskSpec::new("later", "worker"),
    ]);

    let result = orchestrator
        .submit(OrchestrationRequest::plan(spec, "q"), ctx())
        .await
        .unwrap();

    assert_eq!(result.status, OrchestrationStatus::PartialFailure);
    assert_eq!(result.task("check").unwrap().status, TaskStatus::Failed);
    let later = result.task("later").unwrap();
    assert_eq!(later.status, TaskStatus::Skipped);
    assert_eq!(later.failure.as_ref().unwrap().kind, FailureKind::Aborted);
    assert_eq!(runner.calls_to("worker"), 0);
}

#[tokio::test]
async fn transient_failures_are_retried_up_to_the_limit() {
    let unavailable = || AgentError::Provider(ProviderError::Unavailable("503".into()));
    let retried_before = METRICS.tasks_retried();

    let runner = Arc::new(StubRunner::new().failing("flaky", [unavailable(), unavailable()]));
    let orchestrator = Orchestrator::new(
        runner.clone(),
        OrchestratorConfig {
            max_task_retries: 2,
            ..fast_retries()
        },
    );
    let result = orchestrator
        .submit(OrchestrationRequest::agent("flaky", "q"), ctx())
        .await
        .unwrap();
    assert_eq!(result.status, OrchestrationStatus::Succeeded);
    assert_eq!(result.task("flaky").unwrap().attempts, 3);
    assert!(METRICS.tasks_retried() >= retried_before + 2);

    let runner = Arc::new(StubRunner::new().failing("flaky", [unavailable(), unavailable()]));
    let orchestrator = Orchestrator::new(
        runner.clone(),
        OrchestratorConfig {
            max_task_retries: 1,
            ..fast_retries()
        },
    );
    let result = orchestrator
        .submit(OrchestrationRequest::agent("flaky", "q"), ctx())
        .await
        .unwrap();
    assert_eq!(result.status, OrchestrationStatus::Failed);
    let task = result.task("flaky").unwrap();
    assert_eq!(task.attempts, 2);
    assert_eq!(task.failure.as_ref().unwrap().kind, FailureKind::Provider);
}

#[tokio::test]
async fn parallelism_never_exceeds_the_cap() {
    let runner = Arc::new(StubRunner::new().with_delay("worker", Duration::from_millis(40)));
    let orchestrator = Orchestrator::new(
        runner.clone(),
        OrchestratorConfig {
            max_parallel_agents: 2,
            ..OrchestratorConfig::default()
        },
    );
    let tasks = (0..6)
        .map(|i| TaskSpec::new(format!("w{i}"), "worker"))
        .collect();

    let result = orchestrator
        .submit(OrchestrationRequest::plan(PlanSpec::new(tasks), "q"), ctx())
        .await
        .unwrap();

    assert_eq!(result.status, OrchestrationStatus::Succeeded);
    assert_eq!(result.count(TaskStatus::Succeeded), 6);
    assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn spend_is_tracked_against_the_budget() {
    let runner = Arc::new(StubRunner::new());
    let orchestrator = Orchestrator::new(runner.clone(), OrchestratorConfig::default());
    let spec = PlanSpec::new(vec![
        TaskSpec::new("a", "first"),
        TaskSpec::new("b", "second").depends_on(["a"]),
        TaskSpec::new("c", "third").depends_on(["b"]),
        TaskSpec::new("d", "fourth").depends_on(["c"]),
    ]);
    let ctx = ctx().with_budgets(Budgets::new(10.0, 20));

    let result = orchestrator
        .submit(OrchestrationRequest::plan(spec, "q"), ctx)
        .await
        .unwrap();

    assert_eq!(runner.allowance_of("first"), Some(20));
    assert_eq!(runner.allowance_of("second"), Some(10));
    let c = result.task("c").unwrap();
    assert_eq!(c.status, TaskStatus::Failed);
    assert_eq!(c.failure.as_ref().unwrap().kind, FailureKind::BudgetExceeded);
    assert_eq!(runner.calls_to("third"), 0);
    assert_eq!(result.task("d").unwrap().status, TaskStatus::Skipped);
    assert_eq!(result.usage.tokens, 20);
    assert_eq!(result.status, OrchestrationStatus::PartialFailure);
}

#[tokio::test]
async fn retries_draw_on_what_earlier_attempts_left() {
    let runner = Arc::new(
        StubRunner::new().failing("flaky", [throttled_after(60), throttled_after(30)]),
    );
    let orchestrator = Orchestrator::new(
        runner.clone(),
        OrchestratorConfig {
            max_task_retries: 2,
            ..fast_retries()
        },
    );
    let ctx = ctx().with_budgets(Budgets::new(10.0, 100));

    let result = orchestrator
        .submit(OrchestrationRequest::agent("flaky", "q"), ctx)
        .await
        .unwrap();

    assert_eq!(runner.allowances_of("flaky"), vec![100, 40, 10]);
    assert_eq!(result.status, OrchestrationStatus::Succeeded);
    let task = result.task("flaky").unwrap();
    assert_eq!(task.attempts, 3);
    assert_eq!(task.usage.tokens, 100);
    assert_eq!(result.usage.tokens, 100);
}

#[tokio::test]
async fn no_retry_starts_once_failed_attempts_spent_the_allowance() {
    let runner = Arc::new(
        StubRunner::new().failing("flaky", [throttled_after(60), throttled_after(40)]),
    );
    let orchestrator = Orchestrator::new(
        runner.clone(),
        OrchestratorConfig {
            max_task_retries: 5,
            ..fast_retries()
        },
    );
    let ctx = ctx().with_budgets(Budgets::new(10.0, 100));

    let result = orchestrator
        .submit(OrchestrationRequest::agent("flaky", "q"), ctx)
        .await
        .unwrap();

    assert_eq!(runner.calls_to("flaky"), 2);
    assert_eq!(result.status, OrchestrationStatus::Failed);
    let task = result.task("flaky").unwrap();
    assert_eq!(task.attempts, 2);
    assert_eq!(task.failure.as_ref().unwrap().kind, FailureKind::BudgetExceeded);
    assert_eq!(task.usage.tokens, 100);
    assert_eq!(result.usage.tokens, 100);
}

#[tokio::test]
async fn concurrent_siblings_split_the_budget() {
    let mut runner = StubRunner::new();
    for i in 0..4 {
        runner = runner.with_delay(&format!("s{i}"), Duration::from_millis(20));
    }
    let runner = Arc::new(runner);
    let orchestrator = Orchestrator::new(runner.clone(), OrchestratorConfig::default());
    let tasks = (0..4)
        .map(|i| TaskSpec::new(format!("t{i}"), format!("s{i}")))
        .collect();
    let ctx = ctx().with_budgets(Budgets::new(10.0, 100));

    let result = orchestrator
        .submit(OrchestrationRequest::plan(PlanSpec::new(tasks), "q"), ctx)
        .await
        .unwrap();

    assert_eq!(result.status, OrchestrationStatus::Succeeded);
    assert_eq!(runner.peak.load(Ordering::SeqCst), 4);
    let granted: Vec<u64> = (0..4)
        .filter_map(|i| runner.allowance_of(&format!("s{i}")))
        .collect();
    assert_eq!(granted, vec![25, 25, 25, 25]);
    assert!(granted.iter().sum::<u64>() <= 100);
    assert_eq!(result.usage.tokens, 40);
}

#[tokio::test]
async fn nested_plans_share_the_parallelism_cap() {
    let runner = Arc::new(StubRunner::new().with_delay("worker", Duration::from_millis(20)));
    let orchestrator = Orchestrator::new(
        runner.clone(),
        OrchestratorConfig {
            max_parallel_agents: 2,
            ..OrchestratorConfig::default()
        },
    );
    let inner = || {
        PlanSpec::new(
            (0..3)
                .map(|i| TaskSpec::new(format!("i{i}"), "worker"))
                .collect(),
        )
    };
    let spec = PlanSpec::new(vec![
        TaskSpec::nested("n1", inner()),
        TaskSpec::nested("n2", inner()),
        TaskSpec::new("top1", "worker"),
        TaskSpec::new("top2", "worker"),
    ]);

    let result = orchestrator
        .submit(OrchestrationRequest::plan(spec, "q"), ctx())
        .await
        .unwrap();

    assert_eq!(result.status, OrchestrationStatus::Succeeded);
    assert_eq!(runner.calls_to("worker"), 8);
    assert!(runner.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn a_single_slot_still_completes_nested_plans_and_synthesis() {
    let runner = Arc::new(StubRunner::new());
    let orchestrator = Orchestrator::new(
        runner.clone(),
        OrchestratorConfig {
            max_parallel_agents: 1,
            ..OrchestratorConfig::default()
        },
    );
    let spec = PlanSpec::new(vec![
        TaskSpec::nested(
            "inner",
            PlanSpec::new(vec![TaskSpec::new("x", "a"), TaskSpec::new("y", "b")])
                .with_synthesizer("merge"),
        ),
        TaskSpec::new("side", "c"),
    ])
    .with_synthesizer("editor");

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.submit(OrchestrationRequest::plan(spec, "q"), ctx()),
    )
    .await
    .expect("scheduling deadlocked")
    .unwrap();

    assert_eq!(result.status, OrchestrationStatus::Succeeded);
    assert_eq!(result.final_output.as_deref(), Some("editor<-[inner,side]"));
    assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn a_failed_synthesizer_falls_back_to_task_outputs() {
    let runner = Arc::new(StubRunner::new().failing("editor", [tool_failure()]));
    let orchestrator = Orchestrator::new(runner, fast_retries());
    let spec = PlanSpec::new(vec![TaskSpec::new("x", "a"), TaskSpec::new("y", "b")])
        .with_synthesizer("editor");

    let result = orchestrator
        .submit(OrchestrationRequest::plan(spec, "q"), ctx())
        .await
        .unwrap();

    assert_eq!(result.status, OrchestrationStatus::Succeeded);
    assert_eq!(result.final_output.as_deref(), Some("a<-[]\n\nb<-[]"));
}

#[tokio::test]
async fn a_failing_subplan_fails_its_parent_task() {
    let runner = Arc::new(StubRunner::new().failing("inner", [tool_failure()]));
    let orchestrator = Orchestrator::new(runner, fast_retries());
    let spec = PlanSpec::new(vec![
        TaskSpec::nested("research", PlanSpec::single("inner")),
        TaskSpec::new("report", "writer").depends_on(["research"]),
    ]);

    let result = orchestrator
        .submit(OrchestrationRequest::plan(spec, "q"), ctx())
        .await
        .unwrap();

    let research = result.task("research").unwrap();
    assert_eq!(research.status, TaskStatus::Failed);
    assert_eq!(research.failure.as_ref().unwrap().kind, FailureKind::Subplan);
    assert_eq!(result.task("report").unwrap().status, TaskStatus::Skipped);
    assert_eq!(result.status, OrchestrationStatus::Failed);
}

#[tokio::test]
async fn a_panicking_agent_is_contained() {
    let runner = Arc::new(StubRunner::new());
    let orchestrator = Orchestrator::new(runner, fast_retries());
    let spec = PlanSpec::new(vec![TaskSpec::new("bad", "panics"), TaskSpec::new("good", "worker")]);

    let result = orchestrator
        .submit(OrchestrationRequest::plan(spec, "q"), ctx())
        .await
        .unwrap();

    let bad = result.task("bad").unwrap();
    assert_eq!(bad.status, TaskStatus::Failed);
    assert_eq!(bad.failure.as_ref().unwrap().kind, FailureKind::Internal);
    assert_eq!(result.task("good").unwrap().status, TaskStatus::Succeeded);
    assert_eq!(result.status, OrchestrationStatus::PartialFailure);
}

#[tokio::test(start_paused = true)]
async fn a_slow_task_times_out_after_its_retries() {
    let runner = Arc::new(StubRunner::new().with_delay("slow", Duration::from_secs(30)));
    let orchestrator = Orchestrator::new(
        runner.clone(),
        OrchestratorConfig {
            task_timeout_secs: 1,
            max_task_retries: 1,
            ..fast_retries()
        },
    );

    let result = orchestrator
        .submit(OrchestrationRequest::agent("slow", "q"), ctx())
        .await
        .unwrap();

    let task = result.task("slow").unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failure.as_ref().unwrap().kind, FailureKind::Timeout);
    assert_eq!(task.attempts, 2);
    assert_eq!(runner.calls_to("slow"), 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_keeps_finished_results() {
    let runner = Arc::new(StubRunner::new().with_delay("slow", Duration::from_secs(60)));
    let orchestrator = Orchestrator::new(runner, OrchestratorConfig::default());
    let spec = PlanSpec::new(vec![
        TaskSpec::new("quick", "fast"),
        TaskSpec::new("long", "slow"),
        TaskSpec::new("after", "writer").depends_on(["long"]),
    ]);
    let cancel = CancellationToken::new();

    let handle = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        async move {
            orchestrator
                .submit_with_cancel(OrchestrationRequest::plan(spec, "q"), ctx(), cancel)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let result = handle.await.unwrap().unwrap();

    assert_eq!(result.status, OrchestrationStatus::PartialFailure);
    assert_eq!(result.task("quick").unwrap().status, TaskStatus::Succeeded);
    let long = result.task("long").unwrap();
    assert_eq!(long.status, TaskStatus::Failed);
    assert_eq!(long.failure.as_ref().unwrap().kind, FailureKind::Cancelled);
    assert_eq!(result.task("after").unwrap().status, TaskStatus::Skipped);
}

#[tokio::test(start_paused = true)]
async fn the_orchestration_timeout_cancels_in_flight_work() {
    let runner = Arc::new(StubRunner::new().with_delay("slow", Duration::from_secs(600)));
    let orchestrator = Orchestrator::new(
        runner,
        OrchestratorConfig {
            orchestration_timeout_secs: 2,
            task_timeout_secs: 3_600,
            ..OrchestratorConfig::default()
        },
    );

    let result = orchestrator
        .submit(OrchestrationRequest::agent("slow", "q"), ctx())
        .await
        .unwrap();

    assert_eq!(result.status, OrchestrationStatus::Failed);
    let task = result.task("slow").unwrap();
    assert_eq!(task.failure.as_ref().unwrap().kind, FailureKind::Cancelled);
}
