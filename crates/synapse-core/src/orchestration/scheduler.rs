//! Orchestrator: dependency-ordered scheduling of agent steps.
//!
//! One scheduling loop per plan owns every piece of mutable run state:
//! task statuses, the ready queue and the [`BudgetLedger`]. Tasks run as
//! spawned futures that only report an outcome back; they never touch the
//! ledger or each other. Admission is gated by one semaphore per submitted
//! request, sized to the configured parallelism and shared by every nested
//! plan, so eligible agent steps beyond the cap wait in their ready queue
//! until a slot frees up anywhere in the request. A nested-plan task only
//! coordinates its children and holds no slot itself.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use crate::agent::{AgentError, AgentInvocation, AgentOutput, AgentRunner, UpstreamOutput};
use crate::config::OrchestratorConfig;
use crate::domain::{Budgets, ExecutionContext, Usage};
use crate::metrics::METRICS;
use crate::obs::{self, OrchestrationSpan};
use crate::orchestration::budget::BudgetLedger;
use crate::orchestration::error::OrchestrationError;
use crate::orchestration::plan::{OrchestrationPlan, PlanSpec};
use crate::orchestration::result::{
    FailureKind, OrchestrationResult, OrchestrationStatus, TaskFailure, TaskResult, TaskStatus,
};

/// What a request asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestTarget {
    /// A single agent answers the message.
    Agent(String),
    /// A decomposed plan.
    Plan(PlanSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    pub message: String,
    pub target: RequestTarget,
}

impl OrchestrationRequest {
    pub fn agent(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            target: RequestTarget::Agent(agent_id.into()),
        }
    }

    pub fn plan(spec: PlanSpec, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            target: RequestTarget::Plan(spec),
        }
    }
}

/// Everything a spawned task needs, owned.
struct TaskJob {
    idx: usize,
    task_id: String,
    agent_id: String,
    message: String,
    upstream: Vec<UpstreamOutput>,
    subplan: Option<Arc<OrchestrationPlan>>,
    /// Charged for attempts whose real spend cannot be observed.
    estimate: Usage,
}

struct StepFailure {
    failure: TaskFailure,
    transient: bool,
    /// Budget consumed by the failed attempt.
    spent: Usage,
}

impl StepFailure {
    fn agent(e: &AgentError) -> Self {
        Self {
            failure: TaskFailure::from(e),
            transient: e.is_transient(),
            spent: e.spent(),
        }
    }

    fn new(kind: FailureKind, diagnostic: impl std::fmt::Display, transient: bool) -> Self {
        Self {
            failure: TaskFailure::new(kind, diagnostic),
            transient,
            spent: Usage::default(),
        }
    }

    fn charging(mut self, spent: Usage) -> Self {
        self.spent = spent;
        self
    }

    fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "cancelled while running", false)
    }
}

struct TaskOutcome {
    idx: usize,
    result: Result<AgentOutput, StepFailure>,
    attempts: u32,
    /// Total across all attempts, failed ones included.
    spent: Usage,
}

/// Schedules plans over an [`AgentRunner`].
#[derive(Clone)]
pub struct Orchestrator {
    runner: Arc<dyn AgentRunner>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(runner: Arc<dyn AgentRunner>, config: OrchestratorConfig) -> Self {
        Self { runner, config }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Validate the request's plan at the context's nesting depth.
    pub fn build_plan(
        &self,
        request: &OrchestrationRequest,
        ctx: &ExecutionContext,
    ) -> Result<OrchestrationPlan, OrchestrationError> {
        let spec = match &request.target {
            RequestTarget::Agent(agent_id) => PlanSpec::single(agent_id.clone()),
            RequestTarget::Plan(spec) => spec.clone(),
        };
        let runner = &self.runner;
        let plan = OrchestrationPlan::build(
            &spec,
            ctx.recursion_depth,
            self.config.max_recursion_depth,
            &|agent_id: &str| runner.has_agent(agent_id),
        )?;
        Ok(plan)
    }

    pub async fn submit(
        &self,
        request: OrchestrationRequest,
        ctx: ExecutionContext,
    ) -> Result<OrchestrationResult, OrchestrationError> {
        self.submit_with_cancel(request, ctx, CancellationToken::new())
            .await
    }

    /// Run `request` to completion, or until `cancel` fires or the
    /// orchestration timeout elapses.
    ///
    /// Only an invalid plan is an error; every task-level failure is
    /// reported inside the returned result.
    pub async fn submit_with_cancel(
        &self,
        request: OrchestrationRequest,
        ctx: ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<OrchestrationResult, OrchestrationError> {
        let plan = {
            let _span = OrchestrationSpan::enter(&ctx.orchestration_id, &ctx.tenant_id);
            let plan = match self.build_plan(&request, &ctx) {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(error = %e, "plan rejected");
                    return Err(e);
                }
            };
            obs::emit_orchestration_started(&ctx.orchestration_id, &ctx.tenant_id, plan.len());
            Arc::new(plan)
        };

        let started = Instant::now();
        let run_cancel = cancel.child_token();
        let span = obs::orchestration_span(&ctx.orchestration_id, &ctx.tenant_id);
        let slots = Arc::new(Semaphore::new(self.config.max_parallel_agents.max(1)));
        let run = self
            .execute(plan, request.message, ctx.clone(), run_cancel.clone(), slots)
            .instrument(span);
        tokio::pin!(run);

        let result = tokio::select! {
            result = &mut run => result,
            _ = tokio::time::sleep(self.config.orchestration_timeout()) => {
                warn!(
                    orchestration_id = %ctx.orchestration_id,
                    timeout_secs = self.config.orchestration_timeout_secs,
                    "orchestration timed out, cancelling in-flight tasks"
                );
                run_cancel.cancel();
                run.await
            }
        };

        obs::emit_orchestration_finished(&result, started.elapsed().as_millis() as u64);
        METRICS.flush();
        Ok(result)
    }

    /// Boxed so nested plans can recurse through spawned tasks.
    fn execute(
        &self,
        plan: Arc<OrchestrationPlan>,
        message: String,
        ctx: ExecutionContext,
        cancel: CancellationToken,
        slots: Arc<Semaphore>,
    ) -> BoxFuture<'static, OrchestrationResult> {
        let this = self.clone();
        async move { this.run_plan(&plan, &message, &ctx, &cancel, &slots).await }.boxed()
    }

    async fn run_plan(
        &self,
        plan: &OrchestrationPlan,
        message: &str,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
        slots: &Arc<Semaphore>,
    ) -> OrchestrationResult {
        let mut state = RunState::new(plan, &ctx.orchestration_id, ctx.budgets);
        let mut running: JoinSet<TaskOutcome> = JoinSet::new();
        let mut cancel_seen = false;
        let mut spare: Option<OwnedSemaphorePermit> = None;

        loop {
            if !state.aborted && !cancel.is_cancelled() {
                self.admit(&mut state, slots, spare.take(), &mut running, message, ctx, cancel);
            }
            // Anything left in the ready queue is waiting for a slot.
            let waiting = !state.aborted && !cancel.is_cancelled() && !state.ready.is_empty();
            if running.is_empty() && !waiting {
                break;
            }
            tokio::select! {
                biased;
                joined = running.join_next(), if !running.is_empty() => match joined {
                    Some(Ok(outcome)) => state.complete(outcome),
                    Some(Err(e)) => warn!(error = %e, "task join failed"),
                    None => {}
                },
                _ = cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    debug!(in_flight = running.len(), "cancellation received, draining tasks");
                }
                permit = slots.clone().acquire_owned(), if waiting => {
                    spare = permit.ok();
                }
            }
        }

        let cancelled = cancel.is_cancelled();
        let task_results = state.finish(cancelled);
        let succeeded = task_results
            .iter()
            .filter(|r| r.status == TaskStatus::Succeeded)
            .count();
        let status = if state.aborted {
            OrchestrationStatus::PartialFailure
        } else if succeeded == task_results.len() {
            OrchestrationStatus::Succeeded
        } else if succeeded > 0 {
            OrchestrationStatus::PartialFailure
        } else {
            OrchestrationStatus::Failed
        };

        let mut usage = state.ledger.spent();
        let mut final_output = default_output(plan, &task_results);
        if let Some(synthesizer) = plan.synthesizer() {
            if !state.aborted && !cancelled && succeeded > 0 {
                let remaining = state.ledger.remaining();
                match self
                    .synthesize(synthesizer, plan, &task_results, message, ctx, remaining, cancel, slots)
                    .await
                {
                    Ok(out) => {
                        usage.add(out.usage);
                        final_output = Some(out.text);
                    }
                    Err(f) => {
                        usage.add(f.spent);
                        warn!(
                            agent_id = synthesizer,
                            kind = %f.failure.kind,
                            diagnostic = %f.failure.diagnostic,
                            "synthesis failed, falling back to task outputs"
                        );
                    }
                }
            }
        }

        OrchestrationResult {
            orchestration_id: ctx.orchestration_id.clone(),
            status,
            task_results,
            final_output,
            usage,
        }
    }

    /// Start ready tasks while capacity and budget allow.
    ///
    /// Agent steps need a slot: `spare` first, then whatever the semaphore
    /// has free. Nested-plan tasks start without one.
    #[allow(clippy::too_many_arguments)]
    fn admit(
        &self,
        state: &mut RunState<'_>,
        slots: &Arc<Semaphore>,
        mut spare: Option<OwnedSemaphorePermit>,
        running: &mut JoinSet<TaskOutcome>,
        message: &str,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) {
        let plan = state.plan;
        while !state.aborted {
            let Some(&idx) = state.ready.front() else {
                break;
            };
            let node = plan.task(idx);
            let permit = if node.subplan.is_some() {
                None
            } else if let Some(permit) = spare.take() {
                Some(permit)
            } else if let Ok(permit) = slots.clone().try_acquire_owned() {
                Some(permit)
            } else {
                break;
            };
            // Every task still in the queue competes for the same budget.
            let share = state.ready.len();
            state.ready.pop_front();

            if ctx.recursion_depth > self.config.max_recursion_depth {
                let failure = TaskFailure::new(
                    FailureKind::RecursionLimitExceeded,
                    format!(
                        "depth {} exceeds maximum {}",
                        ctx.recursion_depth, self.config.max_recursion_depth
                    ),
                );
                state.fail(idx, failure, 0, Usage::default());
                continue;
            }
            let reservation = match state.ledger.try_reserve(node.estimate, share) {
                Ok(reservation) => reservation,
                Err(reason) => {
                    let failure = TaskFailure::new(FailureKind::BudgetExceeded, reason);
                    state.fail(idx, failure, 0, Usage::default());
                    continue;
                }
            };
            state.held[idx] = reservation.held;

            state.status[idx] = TaskStatus::Running;
            METRICS.inc_tasks_started();
            debug!(
                task_id = %node.id,
                agent_id = %node.agent_id,
                allowance_tokens = reservation.allowance.tokens,
                "task admitted"
            );

            let job = TaskJob {
                idx,
                task_id: node.id.clone(),
                agent_id: node.agent_id.clone(),
                message: node.message.clone().unwrap_or_else(|| message.to_string()),
                upstream: state.upstream(idx),
                subplan: node.subplan.clone(),
                estimate: node.estimate,
            };
            let estimate = node.estimate;
            let this = self.clone();
            let task_ctx = ctx.with_allowance(reservation.allowance);
            let token = cancel.child_token();
            let slots = slots.clone();
            running.spawn(async move {
                let _permit = permit;
                AssertUnwindSafe(this.run_task(job, task_ctx, token, slots))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| TaskOutcome {
                        idx,
                        result: Err(StepFailure::new(FailureKind::Internal, "task panicked", false)
                            .charging(estimate)),
                        attempts: 1,
                        spent: estimate,
                    })
            });
        }
    }

    /// One task with its timeout and transient-failure retries.
    ///
    /// Every attempt draws on the same allowance: an attempt may only spend
    /// what earlier attempts left, and no retry starts once it is gone.
    async fn run_task(
        &self,
        job: TaskJob,
        ctx: ExecutionContext,
        cancel: CancellationToken,
        slots: Arc<Semaphore>,
    ) -> TaskOutcome {
        let timeout = self.config.task_timeout();
        let mut attempts = 0u32;
        let mut spent = Usage::default();
        loop {
            attempts += 1;
            let attempt_ctx = ctx.with_allowance(ctx.budgets.minus(spent));
            let step = self.run_step(&job, &attempt_ctx, &cancel, &slots);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StepFailure::cancelled()),
                step = tokio::time::timeout(timeout, step) => match step {
                    Ok(result) => result,
                    Err(_) => Err(StepFailure::new(
                        FailureKind::Timeout,
                        format!("task exceeded {}s", self.config.task_timeout_secs),
                        true,
                    )
                    .charging(job.estimate)),
                },
            };
            let result = match result {
                Ok(mut output) => {
                    spent.add(output.usage);
                    output.usage = spent;
                    Ok(output)
                }
                Err(f) => {
                    spent.add(f.spent);
                    Err(f)
                }
            };

            match result {
                Err(f)
                    if f.transient
                        && attempts <= self.config.max_task_retries
                        && !cancel.is_cancelled() =>
                {
                    if ctx.budgets.minus(spent).is_exhausted() {
                        let failure = StepFailure::new(
                            FailureKind::BudgetExceeded,
                            format!(
                                "allowance spent after {attempts} attempts, last error: {}",
                                f.failure.diagnostic
                            ),
                            false,
                        );
                        return TaskOutcome {
                            idx: job.idx,
                            result: Err(failure),
                            attempts,
                            spent,
                        };
                    }
                    let delay = self.config.retry_delay(attempts - 1);
                    METRICS.inc_tasks_retried();
                    debug!(
                        task_id = %job.task_id,
                        attempt = attempts,
                        kind = %f.failure.kind,
                        spent_tokens = spent.tokens,
                        delay_ms = delay.as_millis() as u64,
                        "retrying task"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return TaskOutcome {
                                idx: job.idx,
                                result: Err(StepFailure::cancelled()),
                                attempts,
                                spent,
                            };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                result => {
                    return TaskOutcome {
                        idx: job.idx,
                        result,
                        attempts,
                        spent,
                    }
                }
            }
        }
    }

    async fn run_step(
        &self,
        job: &TaskJob,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
        slots: &Arc<Semaphore>,
    ) -> Result<AgentOutput, StepFailure> {
        let Some(subplan) = &job.subplan else {
            let invocation = AgentInvocation {
                task_id: job.task_id.clone(),
                agent_id: job.agent_id.clone(),
                message: job.message.clone(),
                upstream: job.upstream.clone(),
            };
            return self
                .runner
                .run(invocation, ctx, cancel.clone())
                .await
                .map_err(|e| StepFailure::agent(&e));
        };

        let nested = self
            .execute(
                subplan.clone(),
                job.message.clone(),
                ctx.nested(ctx.budgets),
                cancel.child_token(),
                slots.clone(),
            )
            .await;
        if nested.status == OrchestrationStatus::Succeeded {
            Ok(AgentOutput {
                text: nested.final_output.unwrap_or_default(),
                usage: nested.usage,
                tool_calls: 0,
            })
        } else {
            Err(StepFailure::new(
                FailureKind::Subplan,
                format!(
                    "nested plan finished {:?} with {} of {} tasks succeeded",
                    nested.status,
                    nested.count(TaskStatus::Succeeded),
                    nested.task_results.len()
                ),
                false,
            )
            .charging(nested.usage))
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn synthesize(
        &self,
        agent_id: &str,
        plan: &OrchestrationPlan,
        results: &[TaskResult],
        message: &str,
        ctx: &ExecutionContext,
        remaining: Budgets,
        cancel: &CancellationToken,
        slots: &Arc<Semaphore>,
    ) -> Result<AgentOutput, StepFailure> {
        if remaining.is_exhausted() {
            return Err(StepFailure::new(
                FailureKind::BudgetExceeded,
                "no budget left for synthesis",
                false,
            ));
        }
        let upstream = plan
            .order()
            .iter()
            .filter_map(|&i| {
                let r = &results[i];
                r.output.as_ref().map(|output| UpstreamOutput {
                    task_id: r.task_id.clone(),
                    agent_id: r.agent_id.clone(),
                    output: output.clone(),
                })
            })
            .collect();
        let invocation = AgentInvocation {
            task_id: "synthesis".to_string(),
            agent_id: agent_id.to_string(),
            message: message.to_string(),
            upstream,
        };
        let _permit = tokio::select! {
            permit = slots.clone().acquire_owned() => permit.ok(),
            _ = cancel.cancelled() => return Err(StepFailure::cancelled()),
        };
        let synth_ctx = ctx.with_allowance(remaining);
        let step = self.runner.run(invocation, &synth_ctx, cancel.child_token());
        match tokio::time::timeout(self.config.task_timeout(), step).await {
            Ok(result) => result.map_err(|e| StepFailure::agent(&e)),
            Err(_) => Err(StepFailure::new(FailureKind::Timeout, "synthesis timed out", false)),
        }
    }
}

/// Mutable state of one plan run, owned by its scheduling loop.
struct RunState<'p> {
    plan: &'p OrchestrationPlan,
    orchestration_id: &'p str,
    status: Vec<TaskStatus>,
    results: Vec<Option<TaskResult>>,
    /// Unfinished dependencies per task.
    waiting_on: Vec<usize>,
    ready: VecDeque<usize>,
    ledger: BudgetLedger,
    /// Ledger reservation per running task.
    held: Vec<Usage>,
    aborted: bool,
}

impl<'p> RunState<'p> {
    fn new(plan: &'p OrchestrationPlan, orchestration_id: &'p str, budgets: Budgets) -> Self {
        let waiting_on: Vec<usize> = plan.tasks().iter().map(|t| t.depends_on.len()).collect();
        let ready = plan
            .order()
            .iter()
            .copied()
            .filter(|&i| waiting_on[i] == 0)
            .collect();
        Self {
            plan,
            orchestration_id,
            status: vec![TaskStatus::Pending; plan.len()],
            results: vec![None; plan.len()],
            waiting_on,
            ready,
            ledger: BudgetLedger::new(budgets),
            held: vec![Usage::default(); plan.len()],
            aborted: false,
        }
    }

    fn complete(&mut self, outcome: TaskOutcome) {
        let TaskOutcome {
            idx,
            result,
            attempts,
            spent,
        } = outcome;
        let plan = self.plan;
        let node = plan.task(idx);
        let held = std::mem::take(&mut self.held[idx]);
        self.ledger.settle(held, spent);
        match result {
            Ok(output) => {
                let result = TaskResult::succeeded(
                    node.id.clone(),
                    node.agent_id.clone(),
                    output.text,
                    attempts,
                    output.usage,
                );
                self.record(idx, result);
                for &d in &node.dependents {
                    self.waiting_on[d] = self.waiting_on[d].saturating_sub(1);
                    if self.waiting_on[d] == 0 && self.status[d] == TaskStatus::Pending {
                        self.ready.push_back(d);
                    }
                }
            }
            Err(f) => self.fail(idx, f.failure, attempts, spent),
        }
    }

    fn fail(&mut self, idx: usize, failure: TaskFailure, attempts: u32, spent: Usage) {
        let plan = self.plan;
        let node = plan.task(idx);
        METRICS.inc_tasks_failed();
        self.record(
            idx,
            TaskResult::failed(node.id.clone(), node.agent_id.clone(), failure, attempts)
                .with_usage(spent),
        );
        if node.critical {
            warn!(task_id = %node.id, "critical task failed, aborting plan");
            self.aborted = true;
        }

        let mut stack: Vec<usize> = node.dependents.clone();
        while let Some(d) = stack.pop() {
            if self.status[d] != TaskStatus::Pending {
                continue;
            }
            let reason = format!("upstream task {} did not succeed", node.id);
            self.skip(d, TaskFailure::new(FailureKind::UpstreamFailed, reason));
            stack.extend(plan.task(d).dependents.iter().copied());
        }
    }

    fn skip(&mut self, idx: usize, failure: TaskFailure) {
        let plan = self.plan;
        let node = plan.task(idx);
        METRICS.inc_tasks_skipped();
        self.record(
            idx,
            TaskResult::skipped(node.id.clone(), node.agent_id.clone(), failure),
        );
    }

    fn record(&mut self, idx: usize, result: TaskResult) {
        obs::emit_task_finished(self.orchestration_id, &result);
        self.status[idx] = result.status;
        self.results[idx] = Some(result);
    }

    /// Outputs of `idx`'s dependencies, in declaration order.
    fn upstream(&self, idx: usize) -> Vec<UpstreamOutput> {
        self.plan
            .task(idx)
            .depends_on
            .iter()
            .filter_map(|&d| self.results[d].as_ref())
            .filter_map(|r| {
                r.output.as_ref().map(|output| UpstreamOutput {
                    task_id: r.task_id.clone(),
                    agent_id: r.agent_id.clone(),
                    output: output.clone(),
                })
            })
            .collect()
    }

    /// Settle tasks that never ran and return results in plan order.
    fn finish(&mut self, cancelled: bool) -> Vec<TaskResult> {
        for idx in 0..self.plan.len() {
            match self.status[idx] {
                TaskStatus::Pending => {
                    let failure = if self.aborted {
                        TaskFailure::new(FailureKind::Aborted, "plan aborted by a critical failure")
                    } else if cancelled {
                        TaskFailure::new(FailureKind::Cancelled, "orchestration cancelled")
                    } else {
                        TaskFailure::new(FailureKind::Internal, "task was never scheduled")
                    };
                    self.skip(idx, failure);
                }
                TaskStatus::Running => {
                    let failure =
                        TaskFailure::new(FailureKind::Internal, "task did not report an outcome");
                    self.fail(idx, failure, 1, Usage::default());
                }
                _ => {}
            }
        }
        self.results.iter().flatten().cloned().collect()
    }
}

/// Outputs of succeeded tasks that no succeeded task consumed.
fn default_output(plan: &OrchestrationPlan, results: &[TaskResult]) -> Option<String> {
    let outputs: Vec<&str> = plan
        .order()
        .iter()
        .copied()
        .filter(|&i| results[i].status == TaskStatus::Succeeded)
        .filter(|&i| {
            !plan
                .task(i)
                .dependents
                .iter()
                .any(|&d| results[d].status == TaskStatus::Succeeded)
        })
        .filter_map(|i| results[i].output.as_deref())
        .collect();
    if outputs.is_empty() {
        None
    } else {
        Some(outputs.join("\n\n"))
    }
}
