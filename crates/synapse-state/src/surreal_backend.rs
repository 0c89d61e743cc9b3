//! SurrealDB-backed [`MemoryBackend`] implementation
//!
//! All tiers share one `memory_items` table; each backend instance is bound
//! to a single tier and adds `tier = $tier AND tenant_id = $tenant` to every
//! statement.
//!
//! Ranking hints are scored in process with [`rank_by_hints`] over the
//! structurally matching rows, so both backends order results the same way.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use surrealdb::engine::any::Any;
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::{MemoryItemRow, TenantRow};
use crate::similarity::{rank_by_hints, HintScorer};
use crate::storage_traits::{
    DeleteTarget, MemoryBackend, MemoryFilter, MemoryItem, MemoryItemId, MemoryTier, ScanCursor,
    StorageResult, TenantId,
};

/// Environment variable naming the SurrealDB endpoint.
pub const DB_URL_ENV: &str = "SYNAPSE_DB_URL";

const NAMESPACE: &str = "synapse";
/// Matches exactly one item of this backend's tier.
const ONE_ROW: &str = "tier = $tier AND tenant_id = $tenant AND item_id = $item_id";
const DATABASE: &str = "memory";

/// Open a connection, select the Synapse namespace and run migrations.
///
/// `url` is anything `surrealdb::engine::any::connect` accepts
/// (`mem://`, `surrealkv://path`, `ws://host:port`).
pub async fn open(url: &str) -> crate::Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(url)
        .await
        .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

    db.use_ns(NAMESPACE)
        .use_db(DATABASE)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;

    migrations::init_schema(&db).await?;
    info!(url, "SurrealDB memory store connected");
    Ok(db)
}

/// Open the connection named by `SYNAPSE_DB_URL`, defaulting to `mem://`.
pub async fn open_from_env() -> crate::Result<Surreal<Any>> {
    let url = std::env::var(DB_URL_ENV).unwrap_or_else(|_| "mem://".to_string());
    open(&url).await
}

/// SurrealDB-backed implementation of [`MemoryBackend`] for one tier.
#[derive(Clone)]
pub struct SurrealMemoryBackend {
    db: Surreal<Any>,
    tier: MemoryTier,
}

impl SurrealMemoryBackend {
    /// Bind an already-open connection to `tier`.
    pub fn new(db: Surreal<Any>, tier: MemoryTier) -> Self {
        Self { db, tier }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory(tier: MemoryTier) -> crate::Result<Self> {
        let db = open("mem://").await?;
        Ok(Self::new(db, tier))
    }

    /// One backend per tier, all sharing the same connection.
    pub fn all_tiers(db: &Surreal<Any>) -> Vec<Self> {
        MemoryTier::ALL
            .into_iter()
            .map(|tier| Self::new(db.clone(), tier))
            .collect()
    }

    fn where_clause(filter: &MemoryFilter) -> String {
        let mut clause = String::from("tier = $tier AND tenant_id = $tenant");
        if filter.session_id.is_some() {
            clause.push_str(" AND session_id = $session_id");
        }
        if filter.created_after.is_some() {
            clause.push_str(" AND created_at >= $created_after");
        }
        clause
    }

    fn backend_err(e: surrealdb::Error) -> StorageError {
        StorageError::Backend(e.to_string())
    }
}

#[async_trait]
impl MemoryBackend for SurrealMemoryBackend {
    fn tier(&self) -> MemoryTier {
        self.tier
    }

    async fn put(&self, item: MemoryItem) -> StorageResult<()> {
        if item.tier != self.tier {
            return Err(StorageError::TierMismatch {
                expected: self.tier,
                actual: item.tier,
            });
        }
        item.validate()
            .map_err(|reason| StorageError::InvalidItem {
                id: item.id.to_string(),
                reason,
            })?;

        let row = MemoryItemRow::from(&item);
        debug!(tier = %self.tier, item_id = %item.id, "upserting memory item");

        self.db
            .query(
                "BEGIN TRANSACTION; \
                 DELETE memory_items WHERE tenant_id = $tenant AND item_id = $item_id; \
                 CREATE memory_items CONTENT $row; \
                 COMMIT TRANSACTION;",
            )
            .bind(("tenant", row.tenant_id.clone()))
            .bind(("item_id", row.item_id.clone()))
            .bind(("row", row))
            .await
            .map_err(Self::backend_err)?
            .check()
            .map_err(Self::backend_err)?;

        Ok(())
    }

    async fn query(&self, filter: &MemoryFilter, limit: usize) -> StorageResult<Vec<MemoryItem>> {
        // With hints every structural match is a candidate; otherwise the
        // newest `limit` rows are the answer.
        let sql = if HintScorer::for_filter(filter).is_some() {
            format!(
                "SELECT * FROM memory_items WHERE {} ORDER BY created_at DESC",
                Self::where_clause(filter)
            )
        } else {
            format!(
                "SELECT * FROM memory_items WHERE {} ORDER BY created_at DESC LIMIT $limit",
                Self::where_clause(filter)
            )
        };

        let mut res = self
            .db
            .query(sql)
            .bind(("tier", self.tier.as_str().to_string()))
            .bind(("tenant", filter.tenant_id.0.clone()))
            .bind(("session_id", filter.session_id.clone()))
            .bind((
                "created_after",
                filter.created_after.map(SurrealDatetime::from),
            ))
            .bind(("limit", limit as u64))
            .await
            .map_err(Self::backend_err)?;

        let rows: Vec<MemoryItemRow> = res.take(0).map_err(Self::backend_err)?;
        let items = rows
            .into_iter()
            .map(MemoryItem::try_from)
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(rank_by_hints(filter, items, limit))
    }

    async fn record_access(
        &self,
        tenant: &TenantId,
        id: &MemoryItemId,
        at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let sql = format!(
            "UPDATE memory_items SET access_count += 1, last_accessed_at = $at \
             WHERE {ONE_ROW} RETURN AFTER"
        );
        let mut res = self
            .db
            .query(sql)
            .bind(("tier", self.tier.as_str().to_string()))
            .bind(("tenant", tenant.0.clone()))
            .bind(("item_id", id.0.clone()))
            .bind(("at", SurrealDatetime::from(at)))
            .await
            .map_err(Self::backend_err)?;

        let updated: Vec<MemoryItemRow> = res.take(0).map_err(Self::backend_err)?;
        Ok(!updated.is_empty())
    }

    async fn set_decay(
        &self,
        tenant: &TenantId,
        id: &MemoryItemId,
        decay_score: f64,
        decayed_at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let sql = format!(
            "UPDATE memory_items SET decay_score = $score, decayed_at = $at \
             WHERE {ONE_ROW} RETURN AFTER"
        );
        let mut res = self
            .db
            .query(sql)
            .bind(("tier", self.tier.as_str().to_string()))
            .bind(("tenant", tenant.0.clone()))
            .bind(("item_id", id.0.clone()))
            .bind(("score", decay_score))
            .bind(("at", SurrealDatetime::from(decayed_at)))
            .await
            .map_err(Self::backend_err)?;

        let updated: Vec<MemoryItemRow> = res.take(0).map_err(Self::backend_err)?;
        Ok(!updated.is_empty())
    }

    async fn scan(
        &self,
        tenant: &TenantId,
        after: Option<&ScanCursor>,
        limit: usize,
    ) -> StorageResult<Vec<MemoryItem>> {
        let mut clause = String::from("tier = $tier AND tenant_id = $tenant");
        if after.is_some() {
            clause.push_str(
                " AND (created_at > $at OR (created_at = $at AND item_id > $item_id))",
            );
        }
        let sql = format!(
            "SELECT * FROM memory_items WHERE {clause} \
             ORDER BY created_at ASC, item_id ASC LIMIT $limit"
        );

        let mut res = self
            .db
            .query(sql)
            .bind(("tier", self.tier.as_str().to_string()))
            .bind(("tenant", tenant.0.clone()))
            .bind(("at", after.map(|c| SurrealDatetime::from(c.created_at))))
            .bind(("item_id", after.map(|c| c.id.0.clone())))
            .bind(("limit", limit as u64))
            .await
            .map_err(Self::backend_err)?;

        let rows: Vec<MemoryItemRow> = res.take(0).map_err(Self::backend_err)?;
        rows.into_iter().map(MemoryItem::try_from).collect()
    }

    async fn delete(&self, target: &DeleteTarget) -> StorageResult<usize> {
        let mut res = match target {
            DeleteTarget::Id { tenant_id, id } => self
                .db
                .query(format!("DELETE memory_items WHERE {ONE_ROW} RETURN BEFORE"))
                .bind(("tier", self.tier.as_str().to_string()))
                .bind(("tenant", tenant_id.0.clone()))
                .bind(("item_id", id.0.clone()))
                .await
                .map_err(Self::backend_err)?,
            DeleteTarget::Filter(filter) => {
                let sql = format!(
                    "DELETE memory_items WHERE {} RETURN BEFORE",
                    Self::where_clause(filter)
                );
                self.db
                    .query(sql)
                    .bind(("tier", self.tier.as_str().to_string()))
                    .bind(("tenant", filter.tenant_id.0.clone()))
                    .bind(("session_id", filter.session_id.clone()))
                    .bind((
                        "created_after",
                        filter.created_after.map(SurrealDatetime::from),
                    ))
                    .await
                    .map_err(Self::backend_err)?
            }
        };

        let removed: Vec<MemoryItemRow> = res.take(0).map_err(Self::backend_err)?;
        Ok(removed.len())
    }

    async fn tenants(&self) -> StorageResult<Vec<TenantId>> {
        let mut res = self
            .db
            .query("SELECT tenant_id FROM memory_items WHERE tier = $tier GROUP BY tenant_id")
            .bind(("tier", self.tier.as_str().to_string()))
            .await
            .map_err(Self::backend_err)?;

        let rows: Vec<TenantRow> = res.take(0).map_err(Self::backend_err)?;
        let mut tenants: Vec<TenantId> = rows.into_iter().map(|r| TenantId(r.tenant_id)).collect();
        tenants.sort();
        Ok(tenants)
    }
}
