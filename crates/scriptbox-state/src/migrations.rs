//! SurrealDB schema migrations and initialization
//!
//! Sets up the `sessions` and `history` tables with their unique and
//! time-range indexes.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all scriptbox tables in SurrealDB.
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing scriptbox SurrealDB schema");

    init_sessions_table(db).await?;
    init_history_table(db).await?;

    info!("scriptbox schema initialization complete");
    Ok(())
}

/// Initialize `sessions` table
///
/// Schema:
/// ```text
/// TABLE sessions {
///   session_id:        STRING (unique)
///   values_json:       STRING (encoded key/value map)
///   created_at:        DATETIME
///   last_accessed_at:  DATETIME (indexed, drives cleanup)
/// }
/// ```
async fn init_sessions_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing sessions table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS sessions SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_session_id ON TABLE sessions COLUMNS session_id UNIQUE;

        -- Idle sweeps scan by last access
        DEFINE INDEX IF NOT EXISTS idx_session_last_accessed ON TABLE sessions COLUMNS last_accessed_at;
    "#;

    db.query(sql).await?.check()?;
    debug!("sessions table initialized");
    Ok(())
}

/// Initialize `history` table
///
/// Schema:
/// ```text
/// TABLE history {
///   execution_id:   STRING (unique)
///   session_id:     STRING? (indexed)
///   script:         STRING (preview)
///   script_digest:  STRING
///   outcome:        STRING
///   exit_code:      INT
///   started_at:     DATETIME
///   finished_at:    DATETIME (indexed, drives ordering and retention)
///   ...
/// }
/// ```
///
/// Entries are append-only; rows are removed only by retention pruning.
async fn init_history_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing history table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS history SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_execution_id ON TABLE history COLUMNS execution_id UNIQUE;

        DEFINE INDEX IF NOT EXISTS idx_history_session ON TABLE history COLUMNS session_id;

        DEFINE INDEX IF NOT EXISTS idx_history_finished_at ON TABLE history COLUMNS finished_at;
    "#;

    db.query(sql).await?.check()?;
    debug!("history table initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_schema_is_idempotent() {
        let db = surrealdb::engine::any::connect("mem://").await.unwrap();
        db.use_ns("scriptbox").use_db("test").await.unwrap();

        init_schema(&db).await.unwrap();
        init_schema(&db).await.unwrap();
    }
}
