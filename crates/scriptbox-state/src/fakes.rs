//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemorySessionStore` and `MemoryHistoryStore` that satisfy the
//! trait contracts without any external dependencies. Neither survives a
//! process restart.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// MemorySessionStore
// ---------------------------------------------------------------------------

/// In-memory session store backed by a `HashMap<session id, record>`.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_id: &SessionId) -> StorageResult<Option<SessionRecord>> {
        let mut sessions = lock(&self.sessions);
        Ok(sessions.get_mut(session_id).map(|record| {
            record.last_accessed_at = Utc::now();
            record.clone()
        }))
    }

    async fn peek(&self, session_id: &SessionId) -> StorageResult<Option<SessionRecord>> {
        Ok(lock(&self.sessions).get(session_id).cloned())
    }

    async fn apply(&self, session_id: &SessionId, ops: &[SessionOp]) -> StorageResult<()> {
        let mut sessions = lock(&self.sessions);
        let record = sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionRecord::new(session_id.clone()));
        record.apply(ops);
        record.last_accessed_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, session_id: &SessionId) -> StorageResult<bool> {
        Ok(lock(&self.sessions).remove(session_id).is_some())
    }

    async fn sessions(&self) -> StorageResult<Vec<SessionSummary>> {
        let mut out: Vec<SessionSummary> = lock(&self.sessions)
            .values()
            .map(SessionRecord::summary)
            .collect();
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(out)
    }

    async fn cleanup(&self, max_idle: chrono::Duration) -> StorageResult<Vec<SessionId>> {
        let cutoff = idle_cutoff(Utc::now(), max_idle);
        let mut sessions = lock(&self.sessions);
        let mut removed: Vec<SessionId> = sessions
            .values()
            .filter(|record| record.last_accessed_at < cutoff)
            .map(|record| record.session_id.clone())
            .collect();
        for id in &removed {
            sessions.remove(id);
        }
        removed.sort();
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// MemoryHistoryStore
// ---------------------------------------------------------------------------

/// In-memory history store; entries are kept in append order.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, entry: HistoryEntry) -> StorageResult<()> {
        let mut entries = lock(&self.entries);
        if entries
            .iter()
            .any(|existing| existing.execution_id == entry.execution_id)
        {
            return Err(StorageError::DuplicateEntry {
                execution_id: entry.execution_id,
            });
        }
        entries.push(entry);
        Ok(())
    }

    async fn query(&self, query: &HistoryQuery) -> StorageResult<Vec<HistoryEntry>> {
        let entries = lock(&self.entries);
        let mut matching: Vec<(usize, &HistoryEntry)> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| match &query.session_id {
                Some(sid) => e.session_id.as_deref() == Some(sid.as_str()),
                None => true,
            })
            .collect();
        // Newest first; append order breaks timestamp ties.
        matching.sort_by(|(ia, a), (ib, b)| b.finished_at.cmp(&a.finished_at).then(ib.cmp(ia)));
        Ok(matching
            .into_iter()
            .take(query.limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn get(&self, execution_id: &str) -> StorageResult<Option<HistoryEntry>> {
        Ok(lock(&self.entries)
            .iter()
            .find(|e| e.execution_id == execution_id)
            .cloned())
    }

    async fn count(&self) -> StorageResult<usize> {
        Ok(lock(&self.entries).len())
    }

    async fn prune(&self, retention: &HistoryRetention) -> StorageResult<usize> {
        let mut entries = lock(&self.entries);
        let before = entries.len();

        if let Some(cutoff) = retention.cutoff(Utc::now()) {
            entries.retain(|e| e.finished_at >= cutoff);
        }

        if let Some(max_entries) = retention.max_entries {
            if entries.len() > max_entries {
                // Oldest first, stable so append order breaks ties.
                entries.sort_by(|a, b| a.finished_at.cmp(&b.finished_at));
                let excess = entries.len() - max_entries;
                entries.drain(..excess);
            }
        }

        Ok(before - entries.len())
    }
}
