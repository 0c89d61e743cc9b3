//! Agent Synapse CLI
//!
//! The `synapse` command inspects configuration and plans, and runs
//! maintenance against the memory store named by `SYNAPSE_DB_URL`.
//!
//! ## Commands
//!
//! - `plan validate`: check a plan file and print its execution order
//! - `config show` / `config check`: print or validate the effective config
//! - `memory query` / `memory forget`: read or clear a tenant's memory
//! - `decay run`: run one decay & consolidation pass

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use synapse_core::memory::{DecayJob, MemoryQuery, MemoryRouter, MemoryTiers, QueryKind};
use synapse_core::orchestration::OrchestrationPlan;
use synapse_core::telemetry::init_tracing;
use synapse_core::{ExecutionContext, PlanSpec, SynapseConfig, TenantId};
use synapse_state::surreal_backend;
use synapse_state::SurrealMemoryBackend;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "synapse")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Agent Synapse orchestration and memory tooling", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Path to synapse.toml
    #[arg(short, long, global = true, env = "SYNAPSE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan files
    Plan {
        #[command(subcommand)]
        action: PlanAction,
    },

    /// Effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Tenant memory
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Decay & consolidation
    Decay {
        #[command(subcommand)]
        action: DecayAction,
    },
}

#[derive(Subcommand)]
enum PlanAction {
    /// Validate a JSON plan and print its execution order
    Validate {
        /// Path to the plan (JSON)
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the configuration and exit
    Check,
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Retrieve ranked context for a tenant
    Query {
        #[arg(long)]
        tenant: String,

        #[arg(long, default_value = "cli")]
        session: String,

        /// conversation, knowledge, procedural or general
        #[arg(long, default_value = "general")]
        kind: String,

        /// Token budget for the returned context
        #[arg(long)]
        budget: Option<usize>,

        /// Query text
        text: String,
    },

    /// Delete a session's ephemeral and episodic memory
    Forget {
        #[arg(long)]
        tenant: String,

        #[arg(long)]
        session: String,
    },
}

#[derive(Subcommand)]
enum DecayAction {
    /// Run one pass now and print the report as JSON
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = SynapseConfig::load(cli.config.as_deref())
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;

    match cli.command {
        Commands::Plan { action } => match action {
            PlanAction::Validate { file } => cmd_plan_validate(&file, &config),
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => cmd_config_show(&config),
            ConfigAction::Check => {
                println!("configuration OK");
                Ok(())
            }
        },
        Commands::Memory { action } => {
            let router = open_router(&config).await?;
            match action {
                MemoryAction::Query {
                    tenant,
                    session,
                    kind,
                    budget,
                    text,
                } => {
                    let kind = parse_kind(&kind)?;
                    let budget = budget.unwrap_or(config.memory.max_context_tokens);
                    cmd_memory_query(&router, &tenant, &session, kind, &text, budget).await
                }
                MemoryAction::Forget { tenant, session } => {
                    cmd_memory_forget(&router, &tenant, &session).await
                }
            }
        }
        Commands::Decay { action } => match action {
            DecayAction::Run => cmd_decay_run(&config).await,
        },
    }
}

async fn open_tiers() -> Result<MemoryTiers> {
    let db = surreal_backend::open_from_env()
        .await
        .context("Failed to connect to the memory store")?;
    Ok(SurrealMemoryBackend::all_tiers(&db)
        .into_iter()
        .fold(MemoryTiers::new(), |tiers, backend| {
            tiers.with_backend(Arc::new(backend))
        }))
}

async fn open_router(config: &SynapseConfig) -> Result<MemoryRouter> {
    Ok(MemoryRouter::new(open_tiers().await?, config.memory.clone()))
}

fn parse_kind(raw: &str) -> Result<QueryKind> {
    serde_json::from_value(Value::String(raw.to_lowercase()))
        .with_context(|| format!("Unknown query kind '{}'", raw))
}

/// Parse and validate a plan file; returns the task ids in execution order.
fn validate_plan(path: &Path, config: &SynapseConfig) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan file: {:?}", path))?;
    let spec = PlanSpec::from_json(&raw)?;
    // Agents are resolved at submission time; only structure is checked here.
    let plan = OrchestrationPlan::build(
        &spec,
        0,
        config.orchestrator.max_recursion_depth,
        &|agent_id: &str| !agent_id.trim().is_empty(),
    )?;
    Ok(plan
        .order()
        .iter()
        .map(|&i| plan.task(i).id.clone())
        .collect())
}

fn cmd_plan_validate(path: &Path, config: &SynapseConfig) -> Result<()> {
    let order = validate_plan(path, config)?;
    println!("Plan OK: {} task(s)", order.len());
    for (step, task_id) in order.iter().enumerate() {
        println!("  {:>3}. {}", step + 1, task_id);
    }
    Ok(())
}

fn cmd_config_show(config: &SynapseConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
    println!("{}", rendered);
    Ok(())
}

async fn cmd_memory_query(
    router: &MemoryRouter,
    tenant: &str,
    session: &str,
    kind: QueryKind,
    text: &str,
    budget: usize,
) -> Result<()> {
    if tenant.trim().is_empty() {
        bail!("--tenant must not be empty");
    }
    let ctx = ExecutionContext::new(TenantId::new(tenant), "cli", session);
    let context = router
        .retrieve(&MemoryQuery::new(text, kind), &ctx, budget)
        .await;
    router.flush().await;
    println!("{}", serde_json::to_string_pretty(&context)?);
    Ok(())
}

async fn cmd_memory_forget(router: &MemoryRouter, tenant: &str, session: &str) -> Result<()> {
    if tenant.trim().is_empty() {
        bail!("--tenant must not be empty");
    }
    let ctx = ExecutionContext::new(TenantId::new(tenant), "cli", session);
    let removed = router.forget(session, &ctx).await?;
    info!(tenant, session, removed, "session forgotten");
    println!("Removed {} item(s) from session {}", removed, session);
    Ok(())
}

async fn cmd_decay_run(config: &SynapseConfig) -> Result<()> {
    let job = DecayJob::new(open_tiers().await?, config.decay.clone());
    let report = job.run_once().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
