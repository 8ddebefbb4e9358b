//! SurrealDB-backed HistoryStore implementation

use async_trait::async_trait;
use chrono::Utc;
use surrealdb::sql::Datetime as SurrealDatetime;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::handle::SurrealHandle;
use crate::schema::{CountRow, ExecutionIdRow, HistoryRow};
use crate::storage_traits::*;

/// SurrealDB-backed implementation of [`HistoryStore`].
pub struct SurrealHistoryStore {
    handle: SurrealHandle,
}

impl SurrealHistoryStore {
    pub fn new(handle: SurrealHandle) -> Self {
        Self { handle }
    }

    /// In-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(SurrealHandle::in_memory().await?))
    }

    async fn fetch(&self, execution_id: &str) -> StorageResult<Option<HistoryRow>> {
        let eid = execution_id.to_string();
        let mut res = self
            .handle
            .db()
            .query("SELECT * FROM history WHERE execution_id = $eid")
            .bind(("eid", eid))
            .await?;
        let rows: Vec<HistoryRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl HistoryStore for SurrealHistoryStore {
    async fn append(&self, entry: HistoryEntry) -> StorageResult<()> {
        if self.fetch(&entry.execution_id).await?.is_some() {
            return Err(StorageError::DuplicateEntry {
                execution_id: entry.execution_id,
            });
        }

        debug!(execution_id = %entry.execution_id, "appending history entry");
        let _created: Option<HistoryRow> = self
            .handle
            .db()
            .create("history")
            .content(HistoryRow::from(entry))
            .await?;
        Ok(())
    }

    async fn query(&self, query: &HistoryQuery) -> StorageResult<Vec<HistoryEntry>> {
        // LIMIT is formatted in; it is a plain integer, never caller text.
        let rows: Vec<HistoryRow> = match &query.session_id {
            Some(sid) => {
                let sql = format!(
                    "SELECT * FROM history WHERE session_id = $sid ORDER BY finished_at DESC LIMIT {}",
                    query.limit
                );
                let mut res = self
                    .handle
                    .db()
                    .query(sql)
                    .bind(("sid", sid.clone()))
                    .await?;
                res.take(0)?
            }
            None => {
                let sql = format!(
                    "SELECT * FROM history ORDER BY finished_at DESC LIMIT {}",
                    query.limit
                );
                let mut res = self.handle.db().query(sql).await?;
                res.take(0)?
            }
        };
        Ok(rows.into_iter().map(HistoryEntry::from).collect())
    }

    async fn get(&self, execution_id: &str) -> StorageResult<Option<HistoryEntry>> {
        Ok(self.fetch(execution_id).await?.map(HistoryEntry::from))
    }

    async fn count(&self) -> StorageResult<usize> {
        let mut res = self
            .handle
            .db()
            .query("SELECT count() FROM history GROUP ALL")
            .await?;
        let rows: Vec<CountRow> = res.take(0)?;
        Ok(rows.first().map(|row| row.count).unwrap_or(0))
    }

    async fn prune(&self, retention: &HistoryRetention) -> StorageResult<usize> {
        let mut evicted = 0;

        if let Some(cutoff) = retention.cutoff(Utc::now()) {
            let mut res = self
                .handle
                .db()
                .query("DELETE history WHERE finished_at < $cutoff RETURN BEFORE")
                .bind(("cutoff", SurrealDatetime::from(cutoff)))
                .await?;
            let removed: Vec<HistoryRow> = res.take(0)?;
            evicted += removed.len();
        }

        if let Some(max_entries) = retention.max_entries {
            let total = self.count().await?;
            if total > max_entries {
                let excess = total - max_entries;
                let sql = format!(
                    "SELECT execution_id, finished_at FROM history ORDER BY finished_at ASC LIMIT {excess}"
                );
                let mut res = self.handle.db().query(sql).await?;
                let oldest: Vec<ExecutionIdRow> = res.take(0)?;
                let ids: Vec<String> = oldest.into_iter().map(|row| row.execution_id).collect();

                let mut res = self
                    .handle
                    .db()
                    .query("DELETE history WHERE execution_id IN $ids RETURN BEFORE")
                    .bind(("ids", ids))
                    .await?;
                let removed: Vec<HistoryRow> = res.take(0)?;
                evicted += removed.len();
            }
        }

        if evicted > 0 {
            info!(evicted, "pruned execution history");
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> HistoryEntry {
        let now = Utc::now();
        HistoryEntry {
            execution_id: id.into(),
            session_id: None,
            script: "return 1".into(),
            script_truncated: false,
            script_digest: "ab".into(),
            security_level: "Minimal".into(),
            success: true,
            outcome: "Completed".into(),
            exit_code: 0,
            result_summary: Some("1".into()),
            error: None,
            started_at: now,
            finished_at: now,
            duration_ms: 1,
            memory_bytes: 0,
        }
    }

    #[tokio::test]
    async fn test_surreal_history_count_on_empty_table() {
        let store = SurrealHistoryStore::in_memory().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_surreal_history_get_roundtrip() {
        let store = SurrealHistoryStore::in_memory().await.unwrap();
        store.append(entry("e-1")).await.unwrap();

        let got = store.get("e-1").await.unwrap().unwrap();
        assert_eq!(got.execution_id, "e-1");
        assert!(store.get("missing").await.unwrap().is_none());
        assert!(matches!(
            store.append(entry("e-1")).await,
            Err(StorageError::DuplicateEntry { .. })
        ));
    }
}
