//! Row types for the SurrealDB `memory_items` table
//!
//! Rows are converted to and from [`MemoryItem`] at the adapter boundary so
//! the storage layout never leaks into the core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{MemoryItem, MemoryItemId, MemoryTier, TenantId};

/// Module for serializing chrono DateTime to SurrealDB datetime format
pub(crate) mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
pub(crate) mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = date.map(SurrealDatetime::from);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// One memory item as stored in SurrealDB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItemRow {
    /// SurrealDB record ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub item_id: String,
    /// Tier name (`MemoryTier::as_str`)
    pub tier: String,
    pub tenant_id: String,
    pub session_id: Option<String>,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub confidence: f64,
    pub decay_score: f64,
    #[serde(default, with = "surreal_datetime_opt")]
    pub decayed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source_attribution: Vec<String>,
}

impl From<&MemoryItem> for MemoryItemRow {
    fn from(item: &MemoryItem) -> Self {
        MemoryItemRow {
            id: None,
            item_id: item.id.0.clone(),
            tier: item.tier.as_str().to_string(),
            tenant_id: item.tenant_id().0.clone(),
            session_id: item.session_id.clone(),
            content: item.content.clone(),
            embedding: item.embedding.clone(),
            entities: item.entities.clone(),
            created_at: item.created_at,
            last_accessed_at: item.last_accessed_at,
            access_count: item.access_count,
            confidence: item.confidence,
            decay_score: item.decay_score,
            decayed_at: item.decayed_at,
            source_attribution: item.source_attribution.iter().cloned().collect(),
        }
    }
}

impl TryFrom<MemoryItemRow> for MemoryItem {
    type Error = StorageError;

    fn try_from(row: MemoryItemRow) -> Result<Self, Self::Error> {
        let tier: MemoryTier = row.tier.parse()?;
        let mut item = MemoryItem::new(tier, TenantId(row.tenant_id), row.content);
        item.id = MemoryItemId(row.item_id);
        item.session_id = row.session_id;
        item.embedding = row.embedding;
        item.entities = row.entities;
        item.created_at = row.created_at;
        item.last_accessed_at = row.last_accessed_at;
        item.access_count = row.access_count;
        item.confidence = row.confidence;
        item.decay_score = row.decay_score;
        item.decayed_at = row.decayed_at;
        item.source_attribution = row.source_attribution.into_iter().collect();
        Ok(item)
    }
}

/// Projection used when listing tenant partitions.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantRow {
    pub tenant_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_conversion_preserves_fields() {
        let item = MemoryItem::new(MemoryTier::KnowledgeGraph, TenantId::new("acme"), "a->b")
            .with_entities(["a", "b"])
            .with_source("agent:sql")
            .with_confidence(0.7);

        let row = MemoryItemRow::from(&item);
        assert_eq!(row.tier, "knowledge_graph");
        assert_eq!(row.tenant_id, "acme");

        let back = MemoryItem::try_from(row).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn unknown_tier_is_rejected() {
        let item = MemoryItem::new(MemoryTier::Semantic, TenantId::new("acme"), "x");
        let mut row = MemoryItemRow::from(&item);
        row.tier = "blob".to_string();
        assert!(matches!(
            MemoryItem::try_from(row),
            Err(StorageError::Serialization(_))
        ));
    }
}
