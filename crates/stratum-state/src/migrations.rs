//! SurrealDB schema migrations and initialization
//!
//! Sets up the `documents` table with the indexes the engine's filtered
//! queries rely on. Safe to call multiple times (idempotent).

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize the Stratum tables in SurrealDB.
///
/// Called once on connection setup; idempotent.
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Stratum SurrealDB schema");
    init_documents_table(db).await?;
    info!("Stratum schema initialization complete");
    Ok(())
}

/// Initialize `documents` table with constraints and indexes
///
/// Schema:
/// ```text
/// TABLE documents {
///   doc_id:           STRING (unique within collection)
///   collection:       STRING (entries | surprises | patterns)
///   owner:            STRING? (agent id)
///   channel:          STRING?
///   stratum:          STRING? (entry documents only)
///   tags:             ARRAY<STRING>
///   importance:       INT? (1-5, entry documents only)
///   last_accessed_at: DATETIME?
///   expires_at:       DATETIME? (TTL bound)
///   created_at:       DATETIME
///   payload:          OBJECT
/// }
/// ```
async fn init_documents_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing documents table");

    let sql = r#"
        DEFINE TABLE documents
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete FULL;

        -- (collection, doc_id) is the logical primary key
        DEFINE INDEX idx_collection_doc_id ON TABLE documents COLUMNS collection, doc_id UNIQUE;

        -- Stratum-scoped listing is the hottest query path
        DEFINE INDEX idx_collection_stratum ON TABLE documents COLUMNS collection, stratum;

        -- Owner/channel scoping for per-agent queries
        DEFINE INDEX idx_owner ON TABLE documents COLUMNS owner;
        DEFINE INDEX idx_channel ON TABLE documents COLUMNS channel;

        -- Importance ordering for retrieval ranking
        DEFINE INDEX idx_importance ON TABLE documents COLUMNS importance;

        -- TTL sweep scans expires_at
        DEFINE INDEX idx_expires_at ON TABLE documents COLUMNS expires_at;

        -- Recency queries
        DEFINE INDEX idx_last_accessed ON TABLE documents COLUMNS last_accessed_at;
        DEFINE INDEX idx_created_at ON TABLE documents COLUMNS created_at;
    "#;

    db.query(sql).await?;
    info!("✓ documents table initialized");
    Ok(())
}
