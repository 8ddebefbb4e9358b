//! SurrealDB Handle - connection setup shared by the session and history stores
//!
//! Supports in-memory (`mem://`), embedded on-disk (`surrealkv://`) and remote
//! (`ws://` / `wss://`) connections.

use std::path::Path;

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::info;

use crate::error::StateError;
use crate::migrations;
use crate::Result;

const DEFAULT_NAMESPACE: &str = "scriptbox";
const DEFAULT_DATABASE: &str = "main";

/// Credentials for a remote SurrealDB deployment.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://db.example.net")
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub namespace: String,
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl CloudConfig {
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            is_root: false,
        }
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - SCRIPTBOX_SURREALDB_ENDPOINT (required)
    /// - SCRIPTBOX_SURREALDB_USERNAME (required)
    /// - SCRIPTBOX_SURREALDB_PASSWORD (required)
    /// - SCRIPTBOX_SURREALDB_NAMESPACE (optional, default: "scriptbox")
    /// - SCRIPTBOX_SURREALDB_DATABASE (optional, default: "main")
    /// - SCRIPTBOX_SURREALDB_ROOT (optional, default: "false")
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint = std::env::var("SCRIPTBOX_SURREALDB_ENDPOINT")
            .map_err(|_| "SCRIPTBOX_SURREALDB_ENDPOINT not set")?;
        let username = std::env::var("SCRIPTBOX_SURREALDB_USERNAME")
            .map_err(|_| "SCRIPTBOX_SURREALDB_USERNAME not set")?;
        let password = std::env::var("SCRIPTBOX_SURREALDB_PASSWORD")
            .map_err(|_| "SCRIPTBOX_SURREALDB_PASSWORD not set")?;
        let namespace = std::env::var("SCRIPTBOX_SURREALDB_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let database = std::env::var("SCRIPTBOX_SURREALDB_DATABASE")
            .unwrap_or_else(|_| DEFAULT_DATABASE.to_string());
        let is_root = std::env::var("SCRIPTBOX_SURREALDB_ROOT")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

/// Schema-initialized SurrealDB connection.
#[derive(Clone)]
pub struct SurrealHandle {
    db: Surreal<Any>,
}

impl SurrealHandle {
    /// In-memory database, lost on drop. Used by tests.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("mem://").await
    }

    /// Embedded on-disk database under `dir`.
    pub async fn local(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {e}",
                dir.display()
            ))
        })?;
        Self::connect(&format!("surrealkv://{}", dir.display())).await
    }

    /// Connect to any URL understood by `surrealdb::engine::any`.
    pub async fn connect(url: &str) -> Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {url}: {e}")))?;

        db.use_ns(DEFAULT_NAMESPACE)
            .use_db(DEFAULT_DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!(url, "SurrealDB connected");
        Ok(Self { db })
    }

    /// Connect to a remote deployment and sign in.
    pub async fn connect_cloud(config: &CloudConfig) -> Result<Self> {
        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        if config.is_root {
            db.signin(Root {
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("Root auth failed: {e}")))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("DB auth failed: {e}")))?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!(endpoint = %config.endpoint, "SurrealDB connected (cloud)");
        Ok(Self { db })
    }

    pub fn db(&self) -> &Surreal<Any> {
        &self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_config_builders() {
        let config = CloudConfig::new("wss://db.example.net", "u", "p")
            .with_namespace("ns")
            .with_database("db")
            .with_root(true);
        assert_eq!(config.namespace, "ns");
        assert_eq!(config.database, "db");
        assert!(config.is_root);
    }

    #[tokio::test]
    async fn test_in_memory_handle_connects() {
        let handle = SurrealHandle::in_memory().await.unwrap();
        handle.db().health().await.unwrap();
    }
}
