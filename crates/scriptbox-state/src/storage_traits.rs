//! Storage trait definitions for scriptbox
//!
//! These traits define the two durable collaborators of the execution engine:
//! - `SessionStore`: key/value state scoped by session id, surviving restarts
//! - `HistoryStore`: append-only audit record of past executions
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

fn session_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.:\-]{1,128}$").expect("static regex"))
}

/// Caller-chosen session identifier.
///
/// Restricted to `[A-Za-z0-9_.:-]{1,128}` so it can be used verbatim as a
/// file name or a record key by every backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(raw: impl Into<String>) -> StorageResult<Self> {
        let raw = raw.into();
        if raw == "." || raw == ".." {
            return Err(StorageError::InvalidSessionId {
                session_id: raw,
                reason: "reserved path component".into(),
            });
        }
        if !session_id_pattern().is_match(&raw) {
            return Err(StorageError::InvalidSessionId {
                session_id: raw,
                reason: "expected 1-128 characters from [A-Za-z0-9_.:-]".into(),
            });
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionId {
    type Error = StorageError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        SessionId::parse(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Full contents of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub values: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(session_id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            values: BTreeMap::new(),
            created_at: now,
            last_accessed_at: now,
        }
    }

    /// Apply a batch of operations in order.
    pub fn apply(&mut self, ops: &[SessionOp]) {
        for op in ops {
            match op {
                SessionOp::Set { key, value } => {
                    self.values.insert(key.clone(), value.clone());
                }
                SessionOp::Remove { key } => {
                    self.values.remove(key);
                }
                SessionOp::Clear => self.values.clear(),
            }
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            key_count: self.values.len(),
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
        }
    }
}

/// Listing view of a session without its values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub key_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

/// One mutation in a session write batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SessionOp {
    Set {
        key: String,
        value: serde_json::Value,
    },
    Remove {
        key: String,
    },
    Clear,
}

/// Durable session key/value store.
///
/// Guarantees:
/// - A session is created on first write (`apply`/`set`) and never removed
///   implicitly; only `delete` and the age-based `cleanup` sweep remove it.
/// - Operations on one session id are serialized; concurrent writers to the
///   same key resolve last-writer-wins. Sessions never interfere.
/// - Writes are durable when the call returns.
/// - `load` and `apply` refresh `last_accessed_at`; `get` and `list` do not.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the full session, refreshing its last-access time.
    async fn load(&self, session_id: &SessionId) -> StorageResult<Option<SessionRecord>>;

    /// Apply a batch of operations atomically, creating the session if needed.
    async fn apply(&self, session_id: &SessionId, ops: &[SessionOp]) -> StorageResult<()>;

    /// Remove the session entirely. Returns `true` if it existed.
    async fn delete(&self, session_id: &SessionId) -> StorageResult<bool>;

    /// Summaries of every stored session.
    async fn sessions(&self) -> StorageResult<Vec<SessionSummary>>;

    /// Remove sessions whose last access is older than `max_idle`.
    /// Returns the removed session ids.
    async fn cleanup(&self, max_idle: chrono::Duration) -> StorageResult<Vec<SessionId>>;

    /// Read a single value.
    async fn get(&self, session_id: &SessionId, key: &str) -> StorageResult<Option<serde_json::Value>> {
        Ok(self
            .peek(session_id)
            .await?
            .and_then(|record| record.values.get(key).cloned()))
    }

    /// Write a single value.
    async fn set(
        &self,
        session_id: &SessionId,
        key: &str,
        value: serde_json::Value,
    ) -> StorageResult<()> {
        self.apply(
            session_id,
            &[SessionOp::Set {
                key: key.to_string(),
                value,
            }],
        )
        .await
    }

    /// Keys of the session in sorted order (empty when the session is absent).
    async fn list(&self, session_id: &SessionId) -> StorageResult<Vec<String>> {
        Ok(self
            .peek(session_id)
            .await?
            .map(|record| record.values.into_keys().collect())
            .unwrap_or_default())
    }

    /// Drop every value but keep the session itself.
    async fn clear(&self, session_id: &SessionId) -> StorageResult<()> {
        self.apply(session_id, &[SessionOp::Clear]).await
    }

    /// Read the session without refreshing its last-access time.
    async fn peek(&self, session_id: &SessionId) -> StorageResult<Option<SessionRecord>>;
}

// ---------------------------------------------------------------------------
// Execution history
// ---------------------------------------------------------------------------

/// One completed execution, success or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub execution_id: String,
    pub session_id: Option<String>,
    /// Script text, truncated to the configured preview length.
    pub script: String,
    pub script_truncated: bool,
    /// SHA-256 hex of the full script text.
    pub script_digest: String,
    pub security_level: String,
    pub success: bool,
    /// Terminal state name (`Completed`, `Failed`, `TimedOut`, ...).
    pub outcome: String,
    pub exit_code: i32,
    pub result_summary: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub memory_bytes: u64,
}

/// Filter for [`HistoryStore::query`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub session_id: Option<String>,
    pub limit: usize,
}

impl HistoryQuery {
    pub fn recent(limit: usize) -> Self {
        Self {
            session_id: None,
            limit,
        }
    }

    pub fn for_session(session_id: impl Into<String>, limit: usize) -> Self {
        Self {
            session_id: Some(session_id.into()),
            limit,
        }
    }
}

/// Explicit retention policy for the history store.
///
/// Entries beyond `max_entries` are evicted oldest-first; entries that
/// finished more than `max_age_secs` ago are evicted regardless of count.
/// Nothing is evicted unless [`HistoryStore::prune`] is called.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRetention {
    pub max_entries: Option<usize>,
    pub max_age_secs: Option<u64>,
}

/// `now - max_idle`, saturating at the representable range.
pub fn idle_cutoff(now: DateTime<Utc>, max_idle: chrono::Duration) -> DateTime<Utc> {
    now.checked_sub_signed(max_idle).unwrap_or(if max_idle > chrono::Duration::zero() {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

impl Default for HistoryRetention {
    fn default() -> Self {
        Self {
            max_entries: Some(10_000),
            max_age_secs: None,
        }
    }
}

impl HistoryRetention {
    /// Cutoff timestamp for age-based eviction, if configured.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // Clamp to ~100 years so the conversion can never overflow.
        const MAX_AGE_SECS: u64 = 100 * 365 * 24 * 60 * 60;
        self.max_age_secs
            .map(|secs| now - chrono::Duration::seconds(secs.min(MAX_AGE_SECS) as i64))
    }
}

/// Append-only execution history.
///
/// Guarantees:
/// - `append` writes each execution id exactly once.
/// - `query` returns entries newest first (by `finished_at`).
/// - Eviction happens only through `prune` with an explicit policy.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, entry: HistoryEntry) -> StorageResult<()>;

    async fn query(&self, query: &HistoryQuery) -> StorageResult<Vec<HistoryEntry>>;

    async fn get(&self, execution_id: &str) -> StorageResult<Option<HistoryEntry>>;

    async fn count(&self) -> StorageResult<usize>;

    /// Apply the retention policy; returns how many entries were evicted.
    async fn prune(&self, retention: &HistoryRetention) -> StorageResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_accepts_common_forms() {
        for raw in ["abc", "user-42", "tenant:alpha.session_1", "A"] {
            assert!(SessionId::parse(raw).is_ok(), "{raw} should parse");
        }
    }

    #[test]
    fn test_session_id_rejects_path_tricks() {
        let long = "z".repeat(129);
        for raw in ["", "..", ".", "a/b", "a b", "x\\y", long.as_str()] {
            assert!(SessionId::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn test_session_id_serde_validates() {
        let ok: SessionId = serde_json::from_str("\"s-1\"").unwrap();
        assert_eq!(ok.as_str(), "s-1");
        assert!(serde_json::from_str::<SessionId>("\"../etc\"").is_err());
    }

    #[test]
    fn test_record_apply_in_order() {
        let mut record = SessionRecord::new(SessionId::parse("s").unwrap());
        record.apply(&[
            SessionOp::Set {
                key: "a".into(),
                value: serde_json::json!(1),
            },
            SessionOp::Set {
                key: "b".into(),
                value: serde_json::json!(2),
            },
            SessionOp::Remove { key: "a".into() },
        ]);
        assert_eq!(record.values.len(), 1);
        assert_eq!(record.values["b"], serde_json::json!(2));

        record.apply(&[SessionOp::Clear]);
        assert!(record.values.is_empty());
    }

    #[test]
    fn test_retention_cutoff() {
        let now = Utc::now();
        let retention = HistoryRetention {
            max_entries: None,
            max_age_secs: Some(60),
        };
        assert_eq!(
            retention.cutoff(now),
            Some(now - chrono::Duration::seconds(60))
        );
        assert!(HistoryRetention::default().cutoff(now).is_none());
    }

    #[test]
    fn test_idle_cutoff_saturates() {
        let now = Utc::now();
        assert_eq!(
            idle_cutoff(now, chrono::Duration::seconds(60)),
            now - chrono::Duration::seconds(60)
        );
        assert_eq!(idle_cutoff(now, chrono::Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(idle_cutoff(now, chrono::Duration::MIN), DateTime::<Utc>::MAX_UTC);
    }
}
