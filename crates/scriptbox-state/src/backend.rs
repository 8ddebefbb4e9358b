//! Backend selection: turns a storage configuration into a pair of stores.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::fakes::{MemoryHistoryStore, MemorySessionStore};
use crate::fs_sessions::FsSessionStore;
use crate::handle::{CloudConfig, SurrealHandle};
use crate::storage_traits::{HistoryStore, SessionStore};
use crate::surreal_history::SurrealHistoryStore;
use crate::surreal_sessions::SurrealSessionStore;
use crate::{Result, StateError};

/// Where sessions and history live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process-local maps; nothing survives a restart.
    Memory,
    /// Sessions as JSON files under `data_dir/sessions`, history in an
    /// embedded SurrealDB under `data_dir/history`.
    Local { data_dir: PathBuf },
    /// Both stores in one SurrealDB reachable at `url`
    /// (`mem://`, `surrealkv://...`, `ws://...`).
    Surreal { url: String },
    /// Remote SurrealDB with credentials from `SCRIPTBOX_SURREALDB_*`.
    Cloud,
}

impl Default for StorageBackend {
    fn default() -> Self {
        StorageBackend::Local {
            data_dir: PathBuf::from(".scriptbox"),
        }
    }
}

/// The two durable collaborators of the engine.
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub history: Arc<dyn HistoryStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            sessions: Arc::new(MemorySessionStore::new()),
            history: Arc::new(MemoryHistoryStore::new()),
        }
    }
}

/// Open the stores described by `backend`.
pub async fn open_stores(backend: &StorageBackend) -> Result<Stores> {
    let stores = match backend {
        StorageBackend::Memory => Stores::in_memory(),
        StorageBackend::Local { data_dir } => {
            let sessions = FsSessionStore::new(data_dir)
                .map_err(|e| StateError::Connection(e.to_string()))?;
            let handle = SurrealHandle::local(data_dir.join("history")).await?;
            Stores {
                sessions: Arc::new(sessions),
                history: Arc::new(SurrealHistoryStore::new(handle)),
            }
        }
        StorageBackend::Surreal { url } => {
            let handle = SurrealHandle::connect(url).await?;
            surreal_stores(handle)
        }
        StorageBackend::Cloud => {
            let config = CloudConfig::from_env().map_err(StateError::Connection)?;
            let handle = SurrealHandle::connect_cloud(&config).await?;
            surreal_stores(handle)
        }
    };
    info!(?backend, "storage opened");
    Ok(stores)
}

fn surreal_stores(handle: SurrealHandle) -> Stores {
    Stores {
        sessions: Arc::new(SurrealSessionStore::new(handle.clone())),
        history: Arc::new(SurrealHistoryStore::new(handle)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_serde_shape() {
        let backend: StorageBackend =
            serde_json::from_str(r#"{"kind":"surreal","url":"mem://"}"#).unwrap();
        assert_eq!(
            backend,
            StorageBackend::Surreal {
                url: "mem://".into()
            }
        );
    }

    #[tokio::test]
    async fn test_open_surreal_mem_backend() {
        let stores = open_stores(&StorageBackend::Surreal {
            url: "mem://".into(),
        })
        .await
        .unwrap();
        assert_eq!(stores.history.count().await.unwrap(), 0);
        assert!(stores.sessions.sessions().await.unwrap().is_empty());
    }
}
