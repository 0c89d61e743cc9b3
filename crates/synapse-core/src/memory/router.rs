//! Memory Router: tenant-scoped fan-out reads and tier-aware writes.
//!
//! `retrieve` queries every relevant tier concurrently, re-checks each
//! returned item against the caller's tenant (a backend leaking a foreign
//! item is a contract violation, not data), scores and packs the survivors
//! under the token budget. `store` stamps the caller's tenant on the item,
//! writes the ephemeral tier synchronously under a per-session lock and
//! dispatches the other tiers in the background.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use synapse_state::{
    DeleteTarget, MemoryBackend, MemoryFilter, MemoryItem, MemoryItemId, MemoryTier, TenantId,
};
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::config::MemoryConfig;
use crate::domain::ExecutionContext;
use crate::memory::error::{MemoryError, MemoryResult};
use crate::memory::ranking::{estimate_tokens, pack, RankedContext, RankedItem, RelevanceInputs};
use crate::memory::tiers::MemoryTiers;
use crate::metrics::METRICS;
use crate::obs;

/// What a retrieval is for; decides which tiers are consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Session working memory and history only.
    Conversation,
    /// Facts: semantic index and knowledge graph.
    Knowledge,
    /// Learned workflow patterns.
    Procedural,
    /// Every tier.
    General,
}

/// A context request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryQuery {
    pub text: String,
    pub kind: QueryKind,
    pub embedding: Option<Vec<f32>>,
    pub entities: Vec<String>,
    /// Include the caller's session (ephemeral tier).
    pub session_scoped: bool,
    /// Include episodic history within the recency window.
    pub include_history: bool,
}

impl MemoryQuery {
    pub fn new(text: impl Into<String>, kind: QueryKind) -> Self {
        Self {
            text: text.into(),
            kind,
            embedding: None,
            entities: Vec::new(),
            session_scoped: true,
            include_history: true,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities = entities.into_iter().map(Into::into).collect();
        self
    }

    /// Drop the session scope: no ephemeral tier, tenant-wide history.
    pub fn tenant_wide(mut self) -> Self {
        self.session_scoped = false;
        self
    }

    pub fn without_history(mut self) -> Self {
        self.include_history = false;
        self
    }

    /// Tiers consulted for this query.
    pub fn tiers(&self) -> Vec<MemoryTier> {
        let mut tiers = Vec::new();
        if self.session_scoped {
            tiers.push(MemoryTier::Ephemeral);
        }
        if self.include_history {
            tiers.push(MemoryTier::Episodic);
        }
        match self.kind {
            QueryKind::Conversation => {}
            QueryKind::Knowledge => {
                tiers.extend([MemoryTier::Semantic, MemoryTier::KnowledgeGraph]);
            }
            QueryKind::Procedural => tiers.push(MemoryTier::Procedural),
            QueryKind::General => {
                tiers.extend([
                    MemoryTier::Semantic,
                    MemoryTier::KnowledgeGraph,
                    MemoryTier::Procedural,
                ]);
            }
        }
        tiers
    }
}

/// A memory to be written. Carries no tenant: the router stamps the
/// caller's tenant from the [`ExecutionContext`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMemory {
    pub content: String,
    pub tiers: Vec<MemoryTier>,
    pub embedding: Option<Vec<f32>>,
    pub entities: Vec<String>,
    pub confidence: f64,
    pub sources: Vec<String>,
}

impl NewMemory {
    pub fn new(content: impl Into<String>, tiers: impl IntoIterator<Item = MemoryTier>) -> Self {
        Self {
            content: content.into(),
            tiers: tiers.into_iter().collect(),
            embedding: None,
            entities: Vec::new(),
            confidence: 1.0,
            sources: Vec::new(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities = entities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }
}

/// Ids assigned by `store`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreReceipt {
    /// Written before `store` returned.
    pub written: Vec<(MemoryTier, MemoryItemId)>,
    /// Dispatched in the background; visible eventually.
    pub dispatched: Vec<(MemoryTier, MemoryItemId)>,
}

type SessionKey = (TenantId, String);

/// Fans reads and writes across the configured tiers.
pub struct MemoryRouter {
    tiers: MemoryTiers,
    config: MemoryConfig,
    /// Per-session serialization point; guards the last write timestamp.
    sessions: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<DateTime<Utc>>>>>,
    background: Mutex<JoinSet<()>>,
}

impl MemoryRouter {
    pub fn new(tiers: MemoryTiers, config: MemoryConfig) -> Self {
        Self {
            tiers,
            config,
            sessions: Mutex::new(HashMap::new()),
            background: Mutex::new(JoinSet::new()),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn tiers(&self) -> &MemoryTiers {
        &self.tiers
    }

    /// Ranked, tenant-filtered context for `query`, at most `token_budget` tokens.
    ///
    /// Never fails: tiers that error or time out are logged and treated as empty.
    #[instrument(skip(self, query, ctx), fields(tenant_id = %ctx.tenant_id, kind = ?query.kind))]
    pub async fn retrieve(
        &self,
        query: &MemoryQuery,
        ctx: &ExecutionContext,
        token_budget: usize,
    ) -> RankedContext {
        let now = Utc::now();
        let plan: Vec<(MemoryTier, Arc<dyn MemoryBackend>, MemoryFilter, usize)> = query
            .tiers()
            .into_iter()
            .filter_map(|tier| {
                let backend = self.tiers.get(tier)?.clone();
                let (filter, limit) = self.filter_for(tier, query, ctx, now);
                Some((tier, backend, filter, limit))
            })
            .collect();

        let results = join_all(
            plan.iter()
                .map(|(tier, backend, filter, limit)| self.query_tier(*tier, backend, filter, *limit)),
        )
        .await;

        let mut accepted: Vec<MemoryItem> = Vec::new();
        let mut degraded = Vec::new();
        for ((tier, _, filter, _), result) in plan.iter().zip(results) {
            match result {
                Ok(items) => {
                    for item in items {
                        match check_item(*tier, filter, &item) {
                            Ok(()) => accepted.push(item),
                            Err(violation) => {
                                METRICS.inc_items_discarded();
                                obs::emit_item_discarded(*tier, &ctx.tenant_id, &violation);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(tier = %tier, error = %e, "tier query failed, treating as empty");
                    degraded.push(*tier);
                }
            }
        }

        let graph_items: Vec<MemoryItem> = accepted
            .iter()
            .filter(|i| i.tier == MemoryTier::KnowledgeGraph)
            .cloned()
            .collect();
        let inputs =
            RelevanceInputs::new(query, &graph_items, self.config.recency_half_life_secs, now);

        // The same content may come back from several tiers; keep the best copy.
        let mut best: HashMap<String, RankedItem> = HashMap::new();
        for item in accepted {
            let relevance = inputs.relevance(&item);
            let score = relevance * item.decay_score * item.confidence;
            if score <= 0.0 {
                continue;
            }
            let tokens = estimate_tokens(&item.content, self.config.chars_per_token);
            let digest = item.content_digest();
            let candidate = RankedItem {
                item,
                relevance,
                score,
                tokens,
            };
            match best.get(&digest) {
                Some(existing) if existing.score >= candidate.score => {}
                _ => {
                    best.insert(digest, candidate);
                }
            }
        }

        let mut context = pack(best.into_values().collect(), token_budget);
        context.degraded_tiers = degraded;
        debug!(
            selected = context.items.len(),
            tokens = context.total_tokens,
            dropped = context.dropped,
            "context retrieved"
        );

        self.record_access(context.items.iter().map(|r| r.item.clone()).collect());
        context
    }

    /// Write `memory` to its tiers under the caller's tenant.
    ///
    /// The ephemeral copy is written before returning; every other tier is
    /// written in the background and a failure there is only logged.
    #[instrument(skip(self, memory, ctx), fields(tenant_id = %ctx.tenant_id, session_id = %ctx.session_id))]
    pub async fn store(
        &self,
        memory: NewMemory,
        ctx: &ExecutionContext,
    ) -> MemoryResult<StoreReceipt> {
        if memory.tiers.is_empty() {
            return Err(MemoryError::Invalid("no target tier".to_string()));
        }
        let mut targets = Vec::with_capacity(memory.tiers.len());
        for tier in &memory.tiers {
            let backend = self
                .tiers
                .get(*tier)
                .ok_or(MemoryError::TierUnavailable(*tier))?;
            targets.push((*tier, backend.clone()));
        }

        let session = self.session_lock(&ctx.tenant_id, &ctx.session_id);
        let mut last_write = session.lock().await;
        let now = Utc::now();
        let created_at = if now > *last_write {
            now
        } else {
            *last_write + chrono::Duration::microseconds(1)
        };
        *last_write = created_at;

        let mut items = Vec::with_capacity(targets.len());
        for (tier, backend) in targets {
            let item = build_item(tier, &memory, ctx, created_at);
            item.validate().map_err(MemoryError::Invalid)?;
            items.push((backend, item));
        }

        let mut receipt = StoreReceipt::default();
        for (backend, item) in items {
            let tier = item.tier;
            let id = item.id.clone();
            if tier == MemoryTier::Ephemeral {
                backend.put(item).await?;
                receipt.written.push((tier, id));
            } else {
                self.spawn_background(async move {
                    if let Err(e) = backend.put(item).await {
                        warn!(tier = %tier, error = %e, "background memory write failed");
                    }
                });
                receipt.dispatched.push((tier, id));
            }
        }
        drop(last_write);

        Ok(receipt)
    }

    /// Remove the session's ephemeral and episodic items for the caller's
    /// tenant. Returns how many items were deleted.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id))]
    pub async fn forget(&self, session_id: &str, ctx: &ExecutionContext) -> MemoryResult<usize> {
        let filter = MemoryFilter::tenant(ctx.tenant_id.clone()).with_session(session_id);
        let mut removed = 0;
        for tier in [MemoryTier::Ephemeral, MemoryTier::Episodic] {
            if let Some(backend) = self.tiers.get(tier) {
                removed += backend.delete(&DeleteTarget::Filter(filter.clone())).await?;
            }
        }

        let key = (ctx.tenant_id.clone(), session_id.to_string());
        lock_or_recover(&self.sessions).remove(&key);
        debug!(session_id, removed, "session forgotten");
        Ok(removed)
    }

    /// Wait for every background write and access update dispatched so far.
    pub async fn flush(&self) {
        let mut pending = std::mem::take(&mut *lock_or_recover(&self.background));
        while pending.join_next().await.is_some() {}
    }

    fn filter_for(
        &self,
        tier: MemoryTier,
        query: &MemoryQuery,
        ctx: &ExecutionContext,
        now: DateTime<Utc>,
    ) -> (MemoryFilter, usize) {
        let base = MemoryFilter::tenant(ctx.tenant_id.clone());
        match tier {
            MemoryTier::Ephemeral => (
                base.with_session(ctx.session_id.clone()),
                self.config.history_limit,
            ),
            MemoryTier::Episodic => {
                // Capped well inside chrono's representable range.
                let window =
                    chrono::Duration::seconds(self.config.episodic_window_secs.min(1 << 40) as i64);
                let mut filter = base.after(now - window);
                if query.session_scoped {
                    filter = filter.with_session(ctx.session_id.clone());
                }
                (filter, self.config.history_limit)
            }
            MemoryTier::Semantic | MemoryTier::KnowledgeGraph | MemoryTier::Procedural => {
                let mut filter = base
                    .with_text(query.text.clone())
                    .with_entities(query.entities.clone());
                if let Some(embedding) = &query.embedding {
                    filter = filter.with_embedding(embedding.clone());
                }
                (filter, self.config.top_k_semantic)
            }
        }
    }

    /// One tier sub-query: retried on transient errors, bounded by the tier timeout.
    async fn query_tier(
        &self,
        tier: MemoryTier,
        backend: &Arc<dyn MemoryBackend>,
        filter: &MemoryFilter,
        limit: usize,
    ) -> MemoryResult<Vec<MemoryItem>> {
        let retries = self.config.query_retries;
        let attempt_loop = async {
            let mut attempt = 0u32;
            loop {
                match backend.query(filter, limit).await {
                    Ok(items) => return Ok(items),
                    Err(e) if e.is_transient() && attempt < retries => {
                        debug!(tier = %tier, attempt, error = %e, "retrying tier query");
                        tokio::time::sleep(Duration::from_millis(25 << attempt.min(6))).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(MemoryError::from(e)),
                }
            }
        };

        match tokio::time::timeout(self.config.tier_timeout(), attempt_loop).await {
            Ok(result) => result,
            Err(_) => Err(MemoryError::Timeout {
                tier,
                timeout_ms: self.config.tier_timeout_ms,
            }),
        }
    }

    /// Bump access statistics in the background. Items deleted in the
    /// meantime stay deleted.
    fn record_access(&self, items: Vec<MemoryItem>) {
        let at = Utc::now();
        for item in items {
            let Some(backend) = self.tiers.get(item.tier).cloned() else {
                continue;
            };
            self.spawn_background(async move {
                match backend.record_access(item.tenant_id(), &item.id, at).await {
                    Ok(true) => {}
                    Ok(false) => debug!(item_id = %item.id, "accessed item no longer stored"),
                    Err(e) => debug!(error = %e, "access update failed"),
                }
            });
        }
    }

    fn spawn_background<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut background = lock_or_recover(&self.background);
        while background.try_join_next().is_some() {}
        background.spawn(fut);
    }

    fn session_lock(
        &self,
        tenant: &TenantId,
        session_id: &str,
    ) -> Arc<tokio::sync::Mutex<DateTime<Utc>>> {
        let mut sessions = lock_or_recover(&self.sessions);
        sessions
            .entry((tenant.clone(), session_id.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(DateTime::<Utc>::MIN_UTC)))
            .clone()
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Read-side defence: the item must match the tier, the filter (tenant,
/// session, window) and the structural invariants.
fn check_item(tier: MemoryTier, filter: &MemoryFilter, item: &MemoryItem) -> Result<(), MemoryError> {
    let reason = if !item.belongs_to(&filter.tenant_id) {
        Some(format!("item {} belongs to another tenant", item.id))
    } else if item.tier != tier {
        Some(format!("item {} is stamped {}", item.id, item.tier))
    } else if !filter.matches(item) {
        Some(format!("item {} is outside the requested scope", item.id))
    } else {
        item.validate().err().map(|e| format!("item {} is malformed: {e}", item.id))
    };

    match reason {
        None => Ok(()),
        Some(reason) => Err(MemoryError::Consistency {
            tier,
            tenant: filter.tenant_id.clone(),
            reason,
        }),
    }
}

fn build_item(
    tier: MemoryTier,
    memory: &NewMemory,
    ctx: &ExecutionContext,
    created_at: DateTime<Utc>,
) -> MemoryItem {
    let mut item = MemoryItem::new(tier, ctx.tenant_id.clone(), memory.content.clone())
        .with_entities(memory.entities.iter().cloned())
        .with_confidence(memory.confidence)
        .created_at(created_at);
    if tier.is_session_scoped() {
        item = item.with_session(ctx.session_id.clone());
    }
    if let Some(embedding) = &memory.embedding {
        item = item.with_embedding(embedding.clone());
    }
    for source in &memory.sources {
        item = item.with_source(source.clone());
    }
    item
}
