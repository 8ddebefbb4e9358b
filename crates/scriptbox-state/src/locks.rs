//! Per-session async locks for read-modify-write cycles.
//!
//! Entries exist only while some task holds or awaits the lock, so the map
//! stays as small as the number of sessions currently being touched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;

use crate::storage_traits::SessionId;

type SessionMutex = Arc<tokio::sync::Mutex<()>>;

#[derive(Default)]
pub(crate) struct SessionLocks {
    entries: Mutex<HashMap<SessionId, SessionMutex>>,
}

impl SessionLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<SessionId, SessionMutex>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for exclusive access to `session_id`.
    pub(crate) async fn lock(&self, session_id: &SessionId) -> SessionLockGuard<'_> {
        let mutex = Arc::clone(
            self.entries()
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        );
        let guard = mutex.lock_owned().await;
        SessionLockGuard {
            locks: self,
            session_id: session_id.clone(),
            guard: Some(guard),
        }
    }

    /// Number of sessions with a live lock entry.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }
}

/// Held for the duration of one read-modify-write cycle.
pub(crate) struct SessionLockGuard<'a> {
    locks: &'a SessionLocks,
    session_id: SessionId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionLockGuard<'_> {
    fn drop(&mut self) {
        // Release first so the map holds the only remaining reference when
        // nobody else is waiting.
        self.guard.take();
        let mut entries = self.locks.entries();
        let idle = entries
            .get(&self.session_id)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1);
        if idle {
            entries.remove(&self.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_entry_removed_after_last_guard() {
        let locks = SessionLocks::new();
        for n in 0..100 {
            let _guard = locks.lock(&id(&format!("s-{n}"))).await;
            assert_eq!(locks.len(), 1);
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiter_keeps_entry_and_excludes() {
        let locks = Arc::new(SessionLocks::new());
        let first = locks.lock(&id("shared")).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock(&id("shared")).await;
                locks.len()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        // The waiter's clone kept the entry alive through the handover.
        assert_eq!(waiter.await.unwrap(), 1);
        assert_eq!(locks.len(), 0);
    }
}
