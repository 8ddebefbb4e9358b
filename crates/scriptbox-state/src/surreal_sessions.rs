//! SurrealDB-backed SessionStore implementation
//!
//! Uses `schema::SessionRow` for persistence, converting to/from
//! `storage_traits` types at the boundary.


use async_trait::async_trait;
use chrono::Utc;
use surrealdb::sql::Datetime as SurrealDatetime;
use tracing::debug;

use crate::error::StorageError;
use crate::locks::SessionLocks;
use crate::handle::SurrealHandle;
use crate::schema::SessionRow;
use crate::storage_traits::*;

/// SurrealDB-backed implementation of [`SessionStore`].
pub struct SurrealSessionStore {
    handle: SurrealHandle,
    /// Serializes read-modify-write cycles per session within this process.
    locks: SessionLocks,
}

impl SurrealSessionStore {
    pub fn new(handle: SurrealHandle) -> Self {
        Self {
            handle,
            locks: SessionLocks::new(),
        }
    }

    /// In-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(SurrealHandle::in_memory().await?))
    }

    async fn fetch(&self, session_id: &SessionId) -> StorageResult<Option<SessionRow>> {
        let sid = session_id.as_str().to_string();
        let mut res = self
            .handle
            .db()
            .query("SELECT * FROM sessions WHERE session_id = $sid")
            .bind(("sid", sid))
            .await?;
        let rows: Vec<SessionRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn store(&self, row: SessionRow, exists: bool) -> StorageResult<()> {
        if exists {
            let sid = row.session_id.clone();
            self.handle
                .db()
                .query("UPDATE sessions CONTENT $row WHERE session_id = $sid")
                .bind(("row", row))
                .bind(("sid", sid))
                .await?
                .check()?;
        } else {
            let _created: Option<SessionRow> =
                self.handle.db().create("sessions").content(row).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SurrealSessionStore {
    async fn load(&self, session_id: &SessionId) -> StorageResult<Option<SessionRecord>> {
        let _guard = self.locks.lock(session_id).await;

        let Some(row) = self.fetch(session_id).await? else {
            return Ok(None);
        };
        let now = Utc::now();
        let sid = session_id.as_str().to_string();
        self.handle
            .db()
            .query("UPDATE sessions SET last_accessed_at = $now WHERE session_id = $sid")
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("sid", sid))
            .await?
            .check()?;

        let mut record = row.into_record()?;
        record.last_accessed_at = now;
        Ok(Some(record))
    }

    async fn peek(&self, session_id: &SessionId) -> StorageResult<Option<SessionRecord>> {
        self.fetch(session_id)
            .await?
            .map(SessionRow::into_record)
            .transpose()
    }

    async fn apply(&self, session_id: &SessionId, ops: &[SessionOp]) -> StorageResult<()> {
        let _guard = self.locks.lock(session_id).await;

        let existing = self.fetch(session_id).await?;
        let exists = existing.is_some();
        let mut record = match existing {
            Some(row) => row.into_record()?,
            None => SessionRecord::new(session_id.clone()),
        };
        record.apply(ops);
        record.last_accessed_at = Utc::now();

        debug!(session_id = %session_id, ops = ops.len(), exists, "persisting session");
        self.store(SessionRow::from_record(&record)?, exists).await
    }

    async fn delete(&self, session_id: &SessionId) -> StorageResult<bool> {
        let _guard = self.locks.lock(session_id).await;

        let sid = session_id.as_str().to_string();
        let mut res = self
            .handle
            .db()
            .query("DELETE sessions WHERE session_id = $sid RETURN BEFORE")
            .bind(("sid", sid))
            .await?;
        let removed: Vec<SessionRow> = res.take(0)?;
        Ok(!removed.is_empty())
    }

    async fn sessions(&self) -> StorageResult<Vec<SessionSummary>> {
        let mut res = self
            .handle
            .db()
            .query("SELECT * FROM sessions ORDER BY session_id ASC")
            .await?;
        let rows: Vec<SessionRow> = res.take(0)?;
        rows.into_iter()
            .map(|row| Ok(row.into_record()?.summary()))
            .collect()
    }

    async fn cleanup(&self, max_idle: chrono::Duration) -> StorageResult<Vec<SessionId>> {
        let cutoff = SurrealDatetime::from(idle_cutoff(Utc::now(), max_idle));
        let mut res = self
            .handle
            .db()
            .query("DELETE sessions WHERE last_accessed_at < $cutoff RETURN BEFORE")
            .bind(("cutoff", cutoff))
            .await?;
        let removed: Vec<SessionRow> = res.take(0)?;

        let mut ids = removed
            .iter()
            .map(SessionRow::parsed_id)
            .collect::<Result<Vec<_>, StorageError>>()?;
        ids.sort();
        Ok(ids)
    }
}
