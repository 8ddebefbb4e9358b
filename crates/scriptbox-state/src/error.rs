//! Error types for scriptbox-state

use thiserror::Error;

/// Errors raised while connecting to or preparing a storage backend.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),

    /// Filesystem error while preparing a data directory
    #[error("Storage directory error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors surfaced by the [`SessionStore`](crate::SessionStore) and
/// [`HistoryStore`](crate::HistoryStore) contracts.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("invalid session id {session_id:?}: {reason}")]
    InvalidSessionId { session_id: String, reason: String },

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("history entry not found: {execution_id}")]
    EntryNotFound { execution_id: String },

    #[error("duplicate history entry: {execution_id}")]
    DuplicateEntry { execution_id: String },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::SessionNotFound {
            session_id: "abc".into(),
        };
        assert!(err.to_string().contains("abc"));

        let err = StorageError::InvalidSessionId {
            session_id: "bad id".into(),
            reason: "whitespace".into(),
        };
        assert!(err.to_string().contains("whitespace"));
    }

    #[test]
    fn test_state_error_converts_to_storage_error() {
        let err: StorageError = StateError::Connection("refused".into()).into();
        assert!(matches!(err, StorageError::Backend(msg) if msg.contains("refused")));
    }
}
