//! Runtime configuration.
//!
//! Loaded from TOML, then overridden by `SYNAPSE_*` environment variables,
//! then validated. Every section has serde defaults, so an empty file is a
//! valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use synapse_state::MemoryTier;

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for environment variable {var}")]
    Env { var: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynapseConfig {
    pub orchestrator: OrchestratorConfig,
    pub executor: ExecutorConfig,
    pub memory: MemoryConfig,
    pub decay: DecayConfig,
}

/// Scheduling bounds for the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_parallel_agents: usize,
    pub max_recursion_depth: u32,
    /// Per-task timeout.
    pub task_timeout_secs: u64,
    /// Whole-orchestration timeout.
    pub orchestration_timeout_secs: u64,
    pub max_task_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_agents: 10,
            max_recursion_depth: 5,
            task_timeout_secs: 300,
            orchestration_timeout_secs: 900,
            max_task_retries: 2,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 5_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn orchestration_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestration_timeout_secs)
    }

    /// Backoff before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.retry_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }
}

/// Agent step limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Completion rounds per step before the step fails.
    pub max_iterations: u32,
    pub completion_timeout_secs: u64,
    /// Hard token ceiling for a single step, applied on top of the task allowance.
    pub max_tokens_per_step: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            completion_timeout_secs: 120,
            max_tokens_per_step: 100_000,
        }
    }
}

impl ExecutorConfig {
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }
}

/// Memory router retrieval settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Token budget for context handed to an agent step.
    pub max_context_tokens: usize,
    /// Per-tier result limit for semantic, knowledge-graph and procedural tiers.
    pub top_k_semantic: usize,
    /// Per-tier result limit for ephemeral and episodic tiers.
    pub history_limit: usize,
    /// How far back episodic history is searched.
    pub episodic_window_secs: u64,
    /// Time constant of the episodic recency relevance.
    pub recency_half_life_secs: u64,
    pub tier_timeout_ms: u64,
    /// Retries of a sub-query after a transient backend error.
    pub query_retries: u32,
    pub chars_per_token: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 200_000,
            top_k_semantic: 10,
            history_limit: 20,
            episodic_window_secs: 7 * 86_400,
            recency_half_life_secs: 86_400,
            tier_timeout_ms: 2_000,
            query_retries: 1,
            chars_per_token: 4,
        }
    }
}

impl MemoryConfig {
    pub fn tier_timeout(&self) -> Duration {
        Duration::from_millis(self.tier_timeout_ms)
    }
}

/// Decay and expiry constants for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub half_life_secs: u64,
    pub expiry_threshold: f64,
    pub retention_secs: u64,
}

impl TierPolicy {
    const HOUR: u64 = 3_600;
    const DAY: u64 = 86_400;

    pub fn default_for(tier: MemoryTier) -> Self {
        let (half_life_secs, expiry_threshold, retention_secs) = match tier {
            MemoryTier::Ephemeral => (Self::HOUR, 0.05, Self::HOUR),
            MemoryTier::Episodic => (7 * Self::DAY, 0.05, 90 * Self::DAY),
            MemoryTier::Semantic => (30 * Self::DAY, 0.02, 365 * Self::DAY),
            MemoryTier::KnowledgeGraph => (60 * Self::DAY, 0.02, 730 * Self::DAY),
            MemoryTier::Procedural => (180 * Self::DAY, 0.01, 3_650 * Self::DAY),
        };
        Self {
            half_life_secs,
            expiry_threshold,
            retention_secs,
        }
    }
}

/// Background decay & consolidation job settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    pub interval_secs: u64,
    /// Pairwise similarity above which semantic / graph items are merged.
    pub consolidation_threshold: f64,
    /// Items loaded per page while walking a tenant partition.
    pub scan_limit: usize,
    pub ephemeral: TierPolicy,
    pub episodic: TierPolicy,
    pub semantic: TierPolicy,
    pub knowledge_graph: TierPolicy,
    pub procedural: TierPolicy,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,
            consolidation_threshold: 0.92,
            scan_limit: 10_000,
            ephemeral: TierPolicy::default_for(MemoryTier::Ephemeral),
            episodic: TierPolicy::default_for(MemoryTier::Episodic),
            semantic: TierPolicy::default_for(MemoryTier::Semantic),
            knowledge_graph: TierPolicy::default_for(MemoryTier::KnowledgeGraph),
            procedural: TierPolicy::default_for(MemoryTier::Procedural),
        }
    }
}

impl DecayConfig {
    pub fn policy(&self, tier: MemoryTier) -> &TierPolicy {
        match tier {
            MemoryTier::Ephemeral => &self.ephemeral,
            MemoryTier::Episodic => &self.episodic,
            MemoryTier::Semantic => &self.semantic,
            MemoryTier::KnowledgeGraph => &self.knowledge_graph,
            MemoryTier::Procedural => &self.procedural,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl SynapseConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Load from `path` when given, otherwise defaults; then apply the
    /// environment and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SYNAPSE_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, "SYNAPSE_MAX_PARALLEL_AGENTS")? {
            self.orchestrator.max_parallel_agents = v;
        }
        if let Some(v) = parse_var(&lookup, "SYNAPSE_MAX_RECURSION_DEPTH")? {
            self.orchestrator.max_recursion_depth = v;
        }
        if let Some(v) = parse_var(&lookup, "SYNAPSE_TASK_TIMEOUT_SECS")? {
            self.orchestrator.task_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "SYNAPSE_MAX_TASK_RETRIES")? {
            self.orchestrator.max_task_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "SYNAPSE_MAX_CONTEXT_TOKENS")? {
            self.memory.max_context_tokens = v;
        }
        if let Some(v) = parse_var(&lookup, "SYNAPSE_DECAY_INTERVAL_SECS")? {
            self.decay.interval_secs = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let o = &self.orchestrator;
        if o.max_parallel_agents == 0 {
            return Err(invalid("orchestrator.max_parallel_agents must be > 0"));
        }
        if o.task_timeout_secs == 0 || o.orchestration_timeout_secs == 0 {
            return Err(invalid("orchestrator timeouts must be > 0"));
        }
        if o.retry_base_delay_ms > o.retry_max_delay_ms {
            return Err(invalid(
                "orchestrator.retry_base_delay_ms must not exceed retry_max_delay_ms",
            ));
        }
        if self.executor.max_iterations == 0 {
            return Err(invalid("executor.max_iterations must be > 0"));
        }
        if self.memory.chars_per_token == 0 {
            return Err(invalid("memory.chars_per_token must be > 0"));
        }
        if self.memory.recency_half_life_secs == 0 {
            return Err(invalid("memory.recency_half_life_secs must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.decay.consolidation_threshold) {
            return Err(invalid("decay.consolidation_threshold must be within [0,1]"));
        }
        if self.decay.interval_secs == 0 {
            return Err(invalid("decay.interval_secs must be > 0"));
        }
        for tier in MemoryTier::ALL {
            let policy = self.decay.policy(tier);
            if policy.half_life_secs == 0 {
                return Err(invalid(format!("decay.{tier}.half_life_secs must be > 0")));
            }
            if !(0.0..=1.0).contains(&policy.expiry_threshold) {
                return Err(invalid(format!(
                    "decay.{tier}.expiry_threshold must be within [0,1]"
                )));
            }
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn parse_var<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError::Env {
            var: var.to_string(),
            value: raw,
        }),
    }
}
