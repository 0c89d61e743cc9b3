//! synapsed: runs the memory decay & consolidation job on its schedule.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use synapse_core::memory::{DecayJob, MemoryTiers};
use synapse_core::telemetry::init_tracing;
use synapse_core::SynapseConfig;
use synapse_state::{surreal_backend, SurrealMemoryBackend};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "synapsed")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Agent Synapse memory maintenance daemon", long_about = None)]
struct Args {
    /// Path to synapse.toml
    #[arg(short, long, env = "SYNAPSE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(
        args.json,
        if args.verbose { Level::DEBUG } else { Level::INFO },
    );

    let config = SynapseConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    let db = surreal_backend::open_from_env()
        .await
        .context("Failed to connect to the memory store")?;
    let tiers = SurrealMemoryBackend::all_tiers(&db)
        .into_iter()
        .fold(MemoryTiers::new(), |tiers, backend| {
            tiers.with_backend(Arc::new(backend))
        });

    let job = Arc::new(DecayJob::new(tiers, config.decay.clone()));
    let cancel = CancellationToken::new();
    let handle = job.spawn(cancel.clone());
    info!(
        version = synapse_core::VERSION,
        interval_secs = config.decay.interval_secs,
        "synapsed started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutdown requested");
    cancel.cancel();
    handle.await.context("Decay job panicked")?;
    info!("synapsed stopped");
    Ok(())
}
