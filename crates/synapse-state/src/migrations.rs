//! SurrealDB schema initialization
//!
//! Safe to call on every connect: every DEFINE is `IF NOT EXISTS`.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::Result;

/// Initialize all Synapse tables.
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Synapse SurrealDB schema");
    init_memory_items_table(db).await?;
    info!("Synapse schema initialization complete");
    Ok(())
}

/// Initialize the `memory_items` table shared by all tiers.
///
/// Schema:
/// ```text
/// TABLE memory_items {
///   item_id:            STRING (unique per tenant)
///   tier:               STRING (ephemeral | episodic | semantic | knowledge_graph | procedural)
///   tenant_id:          STRING (every statement filters on it)
///   session_id:         STRING?
///   content:            STRING
///   embedding:          ARRAY<FLOAT>?
///   entities:           ARRAY<STRING>
///   created_at:         DATETIME
///   last_accessed_at:   DATETIME
///   access_count:       INT
///   confidence:         FLOAT
///   decay_score:        FLOAT
///   decayed_at:         DATETIME?
///   source_attribution: ARRAY<STRING>
/// }
/// ```
async fn init_memory_items_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing memory_items table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS memory_items
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete FULL;

        DEFINE INDEX IF NOT EXISTS idx_tenant_item ON TABLE memory_items COLUMNS tenant_id, item_id UNIQUE;

        -- Tier scans per tenant partition (router fan-out, decay job)
        DEFINE INDEX IF NOT EXISTS idx_tier_tenant ON TABLE memory_items COLUMNS tier, tenant_id;

        -- Session-scoped reads (ephemeral / episodic)
        DEFINE INDEX IF NOT EXISTS idx_tier_tenant_session ON TABLE memory_items COLUMNS tier, tenant_id, session_id;

        DEFINE INDEX IF NOT EXISTS idx_created_at ON TABLE memory_items COLUMNS created_at;
    "#;

    db.query(sql)
        .await
        .map_err(|e| crate::StateError::SchemaSetup(e.to_string()))?
        .check()
        .map_err(|e| crate::StateError::SchemaSetup(e.to_string()))?;
    info!("✓ memory_items table initialized");
    Ok(())
}
