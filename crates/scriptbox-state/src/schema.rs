//! Schema definitions for scriptbox SurrealDB tables
//!
//! Tables:
//! - sessions: one row per session id, values kept as an encoded JSON document
//! - history: one row per finished execution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{HistoryEntry, SessionId, SessionRecord, StorageResult};

/// Module for serializing chrono DateTime to SurrealDB datetime format
pub(crate) mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Row in the `sessions` table.
///
/// `values_json` holds the serialized key/value map so values round-trip
/// exactly (integer vs float, nulls, nested objects).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub session_id: String,
    pub values_json: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub last_accessed_at: DateTime<Utc>,
}

impl SessionRow {
    pub fn from_record(record: &SessionRecord) -> StorageResult<Self> {
        Ok(Self {
            id: None,
            session_id: record.session_id.as_str().to_string(),
            values_json: serde_json::to_string(&record.values)?,
            created_at: record.created_at,
            last_accessed_at: record.last_accessed_at,
        })
    }

    pub fn into_record(self) -> StorageResult<SessionRecord> {
        Ok(SessionRecord {
            session_id: SessionId::parse(self.session_id)?,
            values: serde_json::from_str(&self.values_json)?,
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
        })
    }
}

/// Row in the `history` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub execution_id: String,
    pub session_id: Option<String>,
    pub script: String,
    pub script_truncated: bool,
    pub script_digest: String,
    pub security_level: String,
    pub success: bool,
    pub outcome: String,
    pub exit_code: i32,
    pub result_summary: Option<String>,
    pub error: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub memory_bytes: u64,
}

impl From<HistoryEntry> for HistoryRow {
    fn from(entry: HistoryEntry) -> Self {
        Self {
            id: None,
            execution_id: entry.execution_id,
            session_id: entry.session_id,
            script: entry.script,
            script_truncated: entry.script_truncated,
            script_digest: entry.script_digest,
            security_level: entry.security_level,
            success: entry.success,
            outcome: entry.outcome,
            exit_code: entry.exit_code,
            result_summary: entry.result_summary,
            error: entry.error,
            started_at: entry.started_at,
            finished_at: entry.finished_at,
            duration_ms: entry.duration_ms,
            memory_bytes: entry.memory_bytes,
        }
    }
}

impl From<HistoryRow> for HistoryEntry {
    fn from(row: HistoryRow) -> Self {
        Self {
            execution_id: row.execution_id,
            session_id: row.session_id,
            script: row.script,
            script_truncated: row.script_truncated,
            script_digest: row.script_digest,
            security_level: row.security_level,
            success: row.success,
            outcome: row.outcome,
            exit_code: row.exit_code,
            result_summary: row.result_summary,
            error: row.error,
            started_at: row.started_at,
            finished_at: row.finished_at,
            duration_ms: row.duration_ms,
            memory_bytes: row.memory_bytes,
        }
    }
}

/// Result row of `SELECT count() ... GROUP ALL`.
#[derive(Debug, Deserialize)]
pub(crate) struct CountRow {
    pub count: usize,
}

/// Projection used when collecting ids to evict.
#[derive(Debug, Deserialize)]
pub(crate) struct ExecutionIdRow {
    pub execution_id: String,
}

impl SessionRow {
    /// Parse only the id column, for sweeps that do not need the values.
    pub fn parsed_id(&self) -> StorageResult<SessionId> {
        SessionId::parse(self.session_id.clone()).map_err(|e| match e {
            StorageError::InvalidSessionId { session_id, reason } => StorageError::Backend(
                format!("stored session id {session_id:?} is invalid: {reason}"),
            ),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_row_preserves_value_types() {
        let mut record = SessionRecord::new(SessionId::parse("s").unwrap());
        record.values.insert("int".into(), serde_json::json!(3));
        record.values.insert("float".into(), serde_json::json!(3.0));
        record.values.insert("nested".into(), serde_json::json!({"a": [1, null]}));

        let row = SessionRow::from_record(&record).unwrap();
        let back = row.into_record().unwrap();
        assert_eq!(back, record);
        assert!(back.values["int"].is_i64());
        assert!(back.values["float"].is_f64());
    }

    #[test]
    fn test_parsed_id_reports_corrupt_rows_as_backend_errors() {
        let row = SessionRow {
            id: None,
            session_id: "../bad".into(),
            values_json: "{}".into(),
            created_at: Utc::now(),
            last_accessed_at: Utc::now(),
        };
        assert!(matches!(row.parsed_id(), Err(StorageError::Backend(_))));
    }
}
