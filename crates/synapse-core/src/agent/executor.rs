//! Agent Executor: one agent step as an explicit state machine.
//!
//! ```text
//! AwaitingContext -> AwaitingCompletion -> (AwaitingTool)* -> Done
//!                          ^                    |
//!                          +--------------------+
//! ```
//!
//! The step suspends only while retrieving context, awaiting the
//! Completion Provider or awaiting a Tool Executor call; each suspension
//! point races the cancellation token. Budgets and recursion depth are
//! checked before every provider and tool call.

use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use synapse_state::MemoryTier;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::agent::error::{AgentError, AgentResult};
use crate::agent::provider::{
    CompletionProvider, ModelParameters, PromptContext, PromptMessage, ToolCallRequest,
};
use crate::agent::registry::{AgentProfile, AgentRegistry};
use crate::agent::runner::{AgentInvocation, AgentOutput, AgentRunner};
use crate::agent::tools::ToolDispatcher;
use crate::config::{ExecutorConfig, SynapseConfig};
use crate::domain::{ExecutionContext, Usage};
use crate::memory::{MemoryQuery, MemoryRouter, NewMemory, RankedContext};

enum StepState {
    AwaitingContext,
    AwaitingCompletion {
        prompt: PromptContext,
        round: u32,
    },
    AwaitingTool {
        prompt: PromptContext,
        pending: VecDeque<ToolCallRequest>,
        round: u32,
    },
    Done(String),
}

/// Spend and tool use accumulated by one step.
#[derive(Default)]
struct StepProgress {
    usage: Usage,
    tools_used: BTreeSet<String>,
    tool_calls: usize,
}

/// Runs agent steps against the memory router, provider and tools.
pub struct AgentExecutor {
    registry: AgentRegistry,
    provider: Arc<dyn CompletionProvider>,
    tools: ToolDispatcher,
    memory: Arc<MemoryRouter>,
    config: ExecutorConfig,
    max_recursion_depth: u32,
    max_context_tokens: usize,
}

impl AgentExecutor {
    pub fn new(
        registry: AgentRegistry,
        provider: Arc<dyn CompletionProvider>,
        tools: ToolDispatcher,
        memory: Arc<MemoryRouter>,
        config: &SynapseConfig,
    ) -> Self {
        Self {
            registry,
            provider,
            tools,
            memory,
            config: config.executor.clone(),
            max_recursion_depth: config.orchestrator.max_recursion_depth,
            max_context_tokens: config.memory.max_context_tokens,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Run one step for `invocation` under `ctx`.
    #[instrument(
        skip(self, invocation, ctx, cancel),
        fields(task_id = %invocation.task_id, agent_id = %invocation.agent_id, tenant_id = %ctx.tenant_id)
    )]
    pub async fn execute(
        &self,
        invocation: &AgentInvocation,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> AgentResult<AgentOutput> {
        let profile = self
            .registry
            .get(&invocation.agent_id)
            .ok_or_else(|| AgentError::UnknownAgent(invocation.agent_id.clone()))?;

        let mut progress = StepProgress::default();
        let reply = match self.drive(profile, invocation, ctx, cancel, &mut progress).await {
            Ok(reply) => reply,
            Err(e) => return Err(e.with_spend(progress.usage)),
        };
        let StepProgress {
            usage,
            tools_used,
            tool_calls,
        } = progress;

        self.write_back(profile, invocation, &reply, tools_used, ctx)
            .await
            .map_err(|e| e.with_spend(usage))?;

        Ok(AgentOutput {
            text: reply,
            usage,
            tool_calls,
        })
    }

    /// Run the state machine to a reply, recording spend in `progress` as
    /// it happens so a failure still reports what was consumed.
    async fn drive(
        &self,
        profile: &AgentProfile,
        invocation: &AgentInvocation,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
        progress: &mut StepProgress,
    ) -> AgentResult<String> {
        let mut state = StepState::AwaitingContext;
        loop {
            state = match state {
                StepState::AwaitingContext => {
                    let query = MemoryQuery::new(invocation.message.clone(), profile.query_kind);
                    let budget = self
                        .max_context_tokens
                        .min(usize::try_from(ctx.budgets.tokens).unwrap_or(usize::MAX));
                    let context =
                        until_cancelled(cancel, self.memory.retrieve(&query, ctx, budget)).await?;
                    StepState::AwaitingCompletion {
                        prompt: self.compose_prompt(profile, invocation, &context),
                        round: 0,
                    }
                }
                StepState::AwaitingCompletion { mut prompt, round } => {
                    if round >= self.config.max_iterations {
                        return Err(AgentError::MaxIterationsExceeded(self.config.max_iterations));
                    }
                    self.check_bounds(ctx, progress.usage)?;
                    let params = self.params_for(profile, ctx, progress.usage);

                    let completion = until_cancelled(
                        cancel,
                        tokio::time::timeout(
                            self.config.completion_timeout(),
                            self.provider.complete(&prompt, &params),
                        ),
                    )
                    .await?
                    .map_err(|_| AgentError::Timeout {
                        timeout_ms: self.config.completion_timeout().as_millis() as u64,
                    })??;
                    progress.usage.add(completion.usage);
                    debug!(round, tokens = completion.usage.tokens, calls = completion.tool_calls.len(), "completion received");

                    if completion.tool_calls.is_empty() {
                        StepState::Done(completion.text)
                    } else {
                        if !completion.text.is_empty() {
                            prompt.push(PromptMessage::assistant(completion.text));
                        }
                        StepState::AwaitingTool {
                            prompt,
                            pending: completion.tool_calls.into(),
                            round: round + 1,
                        }
                    }
                }
                StepState::AwaitingTool {
                    mut prompt,
                    mut pending,
                    round,
                } => match pending.pop_front() {
                    None => StepState::AwaitingCompletion { prompt, round },
                    Some(call) => {
                        self.check_bounds(ctx, progress.usage)?;
                        let output = until_cancelled(
                            cancel,
                            self.tools.invoke(&call.tool_id, &call.input, ctx.auth_token()),
                        )
                        .await??;
                        progress.usage.cost_usd += output.cost_usd;
                        progress.tool_calls += 1;
                        progress.tools_used.insert(call.tool_id.clone());
                        prompt.push(PromptMessage::tool(call.call_id, output.output.to_string()));
                        StepState::AwaitingTool {
                            prompt,
                            pending,
                            round,
                        }
                    }
                },
                StepState::Done(text) => return Ok(text),
            };
        }
    }

    fn check_bounds(&self, ctx: &ExecutionContext, used: Usage) -> AgentResult<()> {
        if ctx.recursion_depth > self.max_recursion_depth {
            return Err(AgentError::RecursionLimitExceeded {
                depth: ctx.recursion_depth,
                max: self.max_recursion_depth,
            });
        }
        if used.tokens >= self.config.max_tokens_per_step {
            return Err(AgentError::BudgetExceeded(format!(
                "step used {} of {} tokens",
                used.tokens, self.config.max_tokens_per_step
            )));
        }
        if !ctx.budgets.admits(used, Usage::default()) {
            return Err(AgentError::BudgetExceeded(format!(
                "used {} tokens / ${:.4} of the allowance",
                used.tokens, used.cost_usd
            )));
        }
        Ok(())
    }

    /// Profile parameters with `max_tokens` capped by what is left to spend.
    fn params_for(&self, profile: &AgentProfile, ctx: &ExecutionContext, used: Usage) -> ModelParameters {
        let left = ctx
            .budgets
            .tokens
            .min(self.config.max_tokens_per_step)
            .saturating_sub(used.tokens);
        let mut params = profile.params.clone();
        params.max_tokens = params.max_tokens.min(u32::try_from(left).unwrap_or(u32::MAX));
        params
    }

    fn compose_prompt(
        &self,
        profile: &AgentProfile,
        invocation: &AgentInvocation,
        context: &RankedContext,
    ) -> PromptContext {
        let mut prompt = PromptContext {
            messages: vec![PromptMessage::system(profile.system_prompt.clone())],
            tools: self.tools.available(&profile.tool_ids),
        };
        if !context.is_empty() {
            prompt.push(PromptMessage::system(format!(
                "Relevant memory:\n{}",
                context.render()
            )));
        }
        for upstream in &invocation.upstream {
            prompt.push(PromptMessage::system(format!(
                "Output of task {} ({}):\n{}",
                upstream.task_id, upstream.agent_id, upstream.output
            )));
        }
        prompt.push(PromptMessage::user(invocation.message.clone()));
        prompt
    }

    async fn write_back(
        &self,
        profile: &AgentProfile,
        invocation: &AgentInvocation,
        reply: &str,
        tools_used: BTreeSet<String>,
        ctx: &ExecutionContext,
    ) -> AgentResult<()> {
        let memory = NewMemory::new(
            format!("User: {}\nAgent: {}", invocation.message, reply),
            [MemoryTier::Ephemeral, MemoryTier::Episodic],
        )
        .with_entities(tools_used)
        .with_source(format!("agent:{}", profile.id));

        match self.memory.store(memory, ctx).await {
            Ok(receipt) => {
                debug!(written = receipt.written.len(), dispatched = receipt.dispatched.len(), "interaction stored");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "failed to store interaction");
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl AgentRunner for AgentExecutor {
    async fn run(
        &self,
        invocation: AgentInvocation,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> AgentResult<AgentOutput> {
        self.execute(&invocation, ctx, &cancel).await
    }

    fn has_agent(&self, agent_id: &str) -> bool {
        self.registry.contains(agent_id)
    }
}

async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> AgentResult<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        out = fut => Ok(out),
    }
}
