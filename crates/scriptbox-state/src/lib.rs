//! scriptbox-state: session and execution-history persistence
//!
//! ## Key Components
//!
//! - `SessionStore`: durable key/value state keyed by session id
//! - `HistoryStore`: append-only record of finished executions
//! - `FsSessionStore`: one JSON document per session, atomic replace on write
//! - `SurrealSessionStore` / `SurrealHistoryStore`: SurrealDB backends
//!   (`mem://` for tests, `surrealkv://` on disk, `ws(s)://` remote)
//! - `fakes`: in-memory stores for tests and ephemeral engines

pub mod backend;
mod error;
pub mod fakes;
pub mod fs_sessions;
mod handle;
mod locks;
pub mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_history;
pub mod surreal_sessions;

pub use backend::{open_stores, StorageBackend, Stores};
pub use error::{StateError, StorageError};
pub use fakes::{MemoryHistoryStore, MemorySessionStore};
pub use fs_sessions::FsSessionStore;
pub use handle::{CloudConfig, SurrealHandle};
pub use schema::{HistoryRow, SessionRow};
pub use storage_traits::{
    HistoryEntry, HistoryQuery, HistoryRetention, HistoryStore, SessionId, SessionOp,
    SessionRecord, SessionStore, SessionSummary, StorageResult,
};
pub use surreal_history::SurrealHistoryStore;
pub use surreal_sessions::SurrealSessionStore;

/// Result type for scriptbox-state setup operations
pub type Result<T> = std::result::Result<T, StateError>;
