//! Filesystem-backed session store.
//!
//! Layout: `<root>/sessions/<session id>.json`, one pretty-printed
//! [`SessionRecord`] per file. Every write goes to a temp file in the same
//! directory, is fsynced, then renamed over the old record, so a crash leaves
//! either the previous or the new version on disk and never a torn file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::locks::SessionLocks;
use crate::storage_traits::*;

const RECORD_EXT: &str = "json";

/// Durable session store writing one JSON document per session.
pub struct FsSessionStore {
    sessions_dir: PathBuf,
    /// Per-session async locks; serializes read-modify-write cycles.
    locks: SessionLocks,
}

impl FsSessionStore {
    /// Create a store rooted at `root`. Creates `root/sessions/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let sessions_dir = root.as_ref().join("sessions");
        fs::create_dir_all(&sessions_dir)?;
        Ok(Self {
            sessions_dir,
            locks: SessionLocks::new(),
        })
    }

    fn record_path(&self, session_id: &SessionId) -> PathBuf {
        self.sessions_dir
            .join(format!("{}.{RECORD_EXT}", session_id.as_str()))
    }

    async fn read(&self, session_id: &SessionId) -> StorageResult<Option<SessionRecord>> {
        let path = self.record_path(session_id);
        run_blocking(move || read_record(&path)).await
    }

    async fn write(&self, record: SessionRecord) -> StorageResult<()> {
        let path = self.record_path(&record.session_id);
        run_blocking(move || write_record(&path, &record)).await
    }
}

async fn run_blocking<T, F>(f: F) -> StorageResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Backend(format!("blocking task failed: {e}")))?
}

fn read_record(path: &Path) -> StorageResult<Option<SessionRecord>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Io(e)),
    }
}

fn write_record(path: &Path, record: &SessionRecord) -> StorageResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| StorageError::Backend(format!("record path {path:?} has no parent")))?;
    let bytes = serde_json::to_vec_pretty(record)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StorageError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl SessionStore for FsSessionStore {
    async fn load(&self, session_id: &SessionId) -> StorageResult<Option<SessionRecord>> {
        let _guard = self.locks.lock(session_id).await;

        let Some(mut record) = self.read(session_id).await? else {
            return Ok(None);
        };
        record.last_accessed_at = Utc::now();
        self.write(record.clone()).await?;
        Ok(Some(record))
    }

    async fn peek(&self, session_id: &SessionId) -> StorageResult<Option<SessionRecord>> {
        let _guard = self.locks.lock(session_id).await;
        self.read(session_id).await
    }

    async fn apply(&self, session_id: &SessionId, ops: &[SessionOp]) -> StorageResult<()> {
        let _guard = self.locks.lock(session_id).await;

        let mut record = self
            .read(session_id)
            .await?
            .unwrap_or_else(|| SessionRecord::new(session_id.clone()));
        record.apply(ops);
        record.last_accessed_at = Utc::now();

        debug!(session_id = %session_id, ops = ops.len(), "persisting session");
        self.write(record).await
    }

    async fn delete(&self, session_id: &SessionId) -> StorageResult<bool> {
        let _guard = self.locks.lock(session_id).await;

        let path = self.record_path(session_id);
        run_blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        })
        .await
    }

    async fn sessions(&self) -> StorageResult<Vec<SessionSummary>> {
        let dir = self.sessions_dir.clone();
        let mut summaries = run_blocking(move || {
            let mut out = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                    continue;
                }
                match read_record(&path) {
                    Ok(Some(record)) => out.push(record.summary()),
                    Ok(None) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable session"),
                }
            }
            Ok(out)
        })
        .await?;
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(summaries)
    }

    async fn cleanup(&self, max_idle: chrono::Duration) -> StorageResult<Vec<SessionId>> {
        let cutoff = idle_cutoff(Utc::now(), max_idle);
        let mut removed = Vec::new();

        for summary in self.sessions().await? {
            if summary.last_accessed_at >= cutoff {
                continue;
            }
            let _guard = self.locks.lock(&summary.session_id).await;

            // Re-check under the lock; a writer may have touched it meanwhile.
            let still_stale = self
                .read(&summary.session_id)
                .await?
                .map(|record| record.last_accessed_at < cutoff)
                .unwrap_or(false);
            if !still_stale {
                continue;
            }

            let path = self.record_path(&summary.session_id);
            run_blocking(move || match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StorageError::Io(e)),
            })
            .await?;
            removed.push(summary.session_id);
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsSessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSessionStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_record_written_as_single_file() {
        let (dir, store) = make_store();
        let sid = SessionId::parse("alpha").unwrap();
        store.set(&sid, "k", serde_json::json!(1)).await.unwrap();
        store.set(&sid, "k", serde_json::json!(2)).await.unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path().join("sessions"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_session_is_false() {
        let (_dir, store) = make_store();
        let sid = SessionId::parse("ghost").unwrap();
        assert!(!store.delete(&sid).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_entries_do_not_accumulate() {
        let (_dir, store) = make_store();
        for n in 0..50 {
            let sid = SessionId::parse(&format!("s-{n}")).unwrap();
            store.set(&sid, "k", serde_json::json!(n)).await.unwrap();
            store.load(&sid).await.unwrap();
            if n % 2 == 0 {
                store.delete(&sid).await.unwrap();
            }
        }
        store.cleanup(chrono::Duration::zero()).await.unwrap();
        assert_eq!(store.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_sessions_skips_foreign_files() {
        let (dir, store) = make_store();
        fs::write(dir.path().join("sessions").join("notes.txt"), b"x").unwrap();
        let sid = SessionId::parse("real").unwrap();
        store.set(&sid, "k", serde_json::json!("v")).await.unwrap();

        let summaries = store.sessions().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].session_id, sid);
    }
}
