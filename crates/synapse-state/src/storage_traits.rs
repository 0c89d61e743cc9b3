//! Storage trait definitions for the memory tiers
//!
//! Every tier (ephemeral session store, episodic log, semantic index,
//! knowledge graph, procedural pattern store) is reached through the single
//! [`MemoryBackend`] contract. Concrete engines live behind it; the core only
//! ever sees [`MemoryItem`] values scoped by [`TenantId`].

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Tenant partition key. Every read and write path filters on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        TenantId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of a stored memory item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryItemId(pub String);

impl MemoryItemId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        MemoryItemId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MemoryItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemoryItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// MemoryTier
// ---------------------------------------------------------------------------

/// The five memory stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    /// Per-session working memory; read-after-write within a session.
    Ephemeral,
    /// Append-only interaction log, ordered by write time per session.
    Episodic,
    /// Similarity-searchable fact index.
    Semantic,
    /// Entity-relation graph. Items carry their endpoints in `entities`.
    KnowledgeGraph,
    /// Learned workflow patterns.
    Procedural,
}

impl MemoryTier {
    pub const ALL: [MemoryTier; 5] = [
        MemoryTier::Ephemeral,
        MemoryTier::Episodic,
        MemoryTier::Semantic,
        MemoryTier::KnowledgeGraph,
        MemoryTier::Procedural,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::Ephemeral => "ephemeral",
            MemoryTier::Episodic => "episodic",
            MemoryTier::Semantic => "semantic",
            MemoryTier::KnowledgeGraph => "knowledge_graph",
            MemoryTier::Procedural => "procedural",
        }
    }

    /// Tiers whose items are scoped to a single session.
    pub fn is_session_scoped(&self) -> bool {
        matches!(self, MemoryTier::Ephemeral | MemoryTier::Episodic)
    }
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryTier {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ephemeral" => Ok(MemoryTier::Ephemeral),
            "episodic" => Ok(MemoryTier::Episodic),
            "semantic" => Ok(MemoryTier::Semantic),
            "knowledge_graph" => Ok(MemoryTier::KnowledgeGraph),
            "procedural" => Ok(MemoryTier::Procedural),
            other => Err(StorageError::Serialization(format!(
                "unknown memory tier: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryItem
// ---------------------------------------------------------------------------

/// A single stored memory.
///
/// `tenant_id` is fixed at construction and has no setter; a backend that
/// hands back an item stamped with another tenant is violating its contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: MemoryItemId,
    pub tier: MemoryTier,
    tenant_id: TenantId,
    pub session_id: Option<String>,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    /// Entity names (graph endpoints for knowledge-graph items, tags otherwise).
    #[serde(default)]
    pub entities: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub confidence: f64,
    pub decay_score: f64,
    /// When decay was last applied. `None` until the first decay pass.
    #[serde(default)]
    pub decayed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source_attribution: BTreeSet<String>,
}

impl MemoryItem {
    /// Create a fresh item with full confidence and no decay.
    pub fn new(tier: MemoryTier, tenant_id: TenantId, content: impl Into<String>) -> Self {
        let now = Utc::now();
        MemoryItem {
            id: MemoryItemId::new(),
            tier,
            tenant_id,
            session_id: None,
            content: content.into(),
            embedding: None,
            entities: Vec::new(),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            confidence: 1.0,
            decay_score: 1.0,
            decayed_at: None,
            source_attribution: BTreeSet::new(),
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn belongs_to(&self, tenant: &TenantId) -> bool {
        &self.tenant_id == tenant
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
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
        self.source_attribution.insert(source.into());
        self
    }

    /// Backdate the item (creation and last access).
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.last_accessed_at = at;
        self
    }

    /// SHA-256 hex digest of the content.
    pub fn content_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.content.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Structural validation: scores in `[0,1]`, non-empty content, finite
    /// embedding components.
    pub fn validate(&self) -> Result<(), String> {
        if self.content.trim().is_empty() {
            return Err("empty content".to_string());
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0,1]", self.confidence));
        }
        if !(0.0..=1.0).contains(&self.decay_score) {
            return Err(format!("decay_score {} outside [0,1]", self.decay_score));
        }
        if let Some(embedding) = &self.embedding {
            if embedding.iter().any(|v| !v.is_finite()) {
                return Err("embedding contains non-finite values".to_string());
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Query / delete targets
// ---------------------------------------------------------------------------

/// Query filter. `tenant_id` is mandatory; the structural fields
/// (`session_id`, `created_after`) narrow results, while `text`, `embedding`
/// and `entities` are ranking hints a similarity-capable engine may use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFilter {
    pub tenant_id: TenantId,
    pub session_id: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub entities: Vec<String>,
}

impl MemoryFilter {
    pub fn tenant(tenant_id: TenantId) -> Self {
        MemoryFilter {
            tenant_id,
            session_id: None,
            created_after: None,
            text: None,
            embedding: None,
            entities: Vec::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_entities(mut self, entities: Vec<String>) -> Self {
        self.entities = entities;
        self
    }

    /// Whether `item` satisfies the structural part of the filter.
    pub fn matches(&self, item: &MemoryItem) -> bool {
        if !item.belongs_to(&self.tenant_id) {
            return false;
        }
        if let Some(session) = &self.session_id {
            if item.session_id.as_deref() != Some(session.as_str()) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if item.created_at < after {
                return false;
            }
        }
        true
    }
}

/// Position in a partition scan: the last item already seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor {
    pub created_at: DateTime<Utc>,
    pub id: MemoryItemId,
}

impl ScanCursor {
    pub fn after(item: &MemoryItem) -> Self {
        ScanCursor {
            created_at: item.created_at,
            id: item.id.clone(),
        }
    }

    /// Whether `item` sorts strictly after the cursor in scan order.
    pub fn precedes(&self, item: &MemoryItem) -> bool {
        (item.created_at, &item.id) > (self.created_at, &self.id)
    }
}

/// What to delete.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteTarget {
    /// One item, only if it belongs to `tenant_id`.
    Id {
        tenant_id: TenantId,
        id: MemoryItemId,
    },
    /// Every item matching the filter's structural fields.
    Filter(MemoryFilter),
}

// ---------------------------------------------------------------------------
// MemoryBackend
// ---------------------------------------------------------------------------

/// Per-tier storage adapter.
///
/// Guarantees:
/// - `put` is an upsert keyed by `(tenant_id, id)`.
/// - `query` only returns items of `filter.tenant_id`, at most `limit` of
///   them. With ranking hints (`text`, `entities`, `embedding`) the best
///   matches come first, see [`crate::similarity::rank_by_hints`]; without
///   hints, or on equal scores, newest first. Within a session, items
///   written later sort first.
/// - `record_access` and `set_decay` only modify an existing row and never
///   recreate a deleted one.
/// - `scan` visits a whole tenant partition in `(created_at, id)` order,
///   one page at a time.
/// - `delete` returns the number of items removed; deleting nothing is `Ok(0)`.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// The tier this backend serves.
    fn tier(&self) -> MemoryTier;

    /// Insert or replace an item.
    async fn put(&self, item: MemoryItem) -> StorageResult<()>;

    /// Fetch items matching `filter`, best match first.
    async fn query(&self, filter: &MemoryFilter, limit: usize) -> StorageResult<Vec<MemoryItem>>;

    /// Count one read of an item and stamp its access time. Returns `false`
    /// when the item does not exist.
    async fn record_access(
        &self,
        tenant: &TenantId,
        id: &MemoryItemId,
        at: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Store a new decay score for an item. Returns `false` when the item
    /// does not exist.
    async fn set_decay(
        &self,
        tenant: &TenantId,
        id: &MemoryItemId,
        decay_score: f64,
        decayed_at: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Up to `limit` items of `tenant` that sort after `after`, oldest first.
    async fn scan(
        &self,
        tenant: &TenantId,
        after: Option<&ScanCursor>,
        limit: usize,
    ) -> StorageResult<Vec<MemoryItem>>;

    /// Remove items; returns how many were removed.
    async fn delete(&self, target: &DeleteTarget) -> StorageResult<usize>;

    /// Tenant partitions that currently hold at least one item.
    async fn tenants(&self) -> StorageResult<Vec<TenantId>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_round_trips_through_str() {
        for tier in MemoryTier::ALL {
            let parsed: MemoryTier = tier.as_str().parse().unwrap();
            assert_eq!(parsed, tier);
        }
        assert!("vector".parse::<MemoryTier>().is_err());
    }

    #[test]
    fn tier_serializes_snake_case() {
        let json = serde_json::to_string(&MemoryTier::KnowledgeGraph).unwrap();
        assert_eq!(json, "\"knowledge_graph\"");
    }

    #[test]
    fn validate_rejects_out_of_range_scores() {
        let tenant = TenantId::new("acme");
        let ok = MemoryItem::new(MemoryTier::Semantic, tenant.clone(), "fact");
        assert!(ok.validate().is_ok());

        let bad = ok.clone().with_confidence(1.5);
        assert!(bad.validate().is_err());

        let mut decayed = ok.clone();
        decayed.decay_score = -0.1;
        assert!(decayed.validate().is_err());

        let empty = MemoryItem::new(MemoryTier::Semantic, tenant, "   ");
        assert!(empty.validate().is_err());
    }

    #[test]
    fn filter_matches_tenant_session_and_window() {
        let tenant = TenantId::new("acme");
        let now = Utc::now();
        let item = MemoryItem::new(MemoryTier::Episodic, tenant.clone(), "hello")
            .with_session("s1")
            .created_at(now);

        assert!(MemoryFilter::tenant(tenant.clone()).matches(&item));
        assert!(!MemoryFilter::tenant(TenantId::new("other")).matches(&item));
        assert!(!MemoryFilter::tenant(tenant.clone())
            .with_session("s2")
            .matches(&item));
        assert!(!MemoryFilter::tenant(tenant)
            .after(now + chrono::Duration::seconds(1))
            .matches(&item));
    }

    #[test]
    fn content_digest_is_stable() {
        let tenant = TenantId::new("acme");
        let a = MemoryItem::new(MemoryTier::Semantic, tenant.clone(), "same");
        let b = MemoryItem::new(MemoryTier::Semantic, tenant, "same");
        assert_eq!(a.content_digest(), b.content_digest());
        assert_eq!(a.content_digest().len(), 64);
    }
}
