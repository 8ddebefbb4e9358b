//! `ScriptEngine`: the public face of the crate.
//!
//! Owns the interpreter pool, the context builder and the stores, and runs
//! each request through the [`pipeline`](crate::pipeline). Cheap to clone;
//! clones share everything.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use scriptbox_state::{
    open_stores, HistoryEntry, HistoryQuery, HistoryStore, SessionStore, StateError, StorageError,
    Stores,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::context::{ContextBuilder, ExecuteRequest};
use crate::interp::{InterpreterFactory, TclFactory};
use crate::metrics::METRICS;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::pool::{InterpreterPool, PoolError, PoolStats, ShutdownReport};
use crate::result::ExecutionResult;

/// Failures while assembling an engine. Executions never fail this way.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("storage setup failed: {0}")]
    Storage(#[from] StateError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// What one maintenance pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub interpreters_evicted: usize,
    pub sessions_removed: usize,
    pub history_pruned: usize,
}

struct EngineInner {
    config: EngineConfig,
    builder: ContextBuilder,
    pool: InterpreterPool,
    stores: Stores,
    settings: PipelineSettings,
    packages: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct ScriptEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("pool", &self.inner.pool.stats())
            .field("storage", &self.inner.config.storage)
            .finish()
    }
}

impl ScriptEngine {
    /// Assemble an engine from explicit parts.
    pub fn new(
        config: EngineConfig,
        stores: Stores,
        factory: Arc<dyn InterpreterFactory>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let pool = InterpreterPool::new(config.pool.clone(), factory)?;
        let settings = PipelineSettings {
            acquire_timeout: config.pool.acquire_timeout(),
            grace_period: config.execution.grace_period(),
            worker_stack_bytes: config.execution.worker_stack_bytes,
            history_preview_chars: config.history.script_preview_chars,
        };
        let mut packages = BTreeMap::new();
        packages.insert("scriptbox".to_string(), env!("CARGO_PKG_VERSION").to_string());

        info!(
            max_size = config.pool.max_size,
            max_timeout_secs = config.execution.max_timeout_secs,
            "script engine ready"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                builder: ContextBuilder::new(config.execution.limits()),
                pool,
                stores,
                settings,
                packages,
                config,
            }),
        })
    }

    /// Open the configured storage and use the built-in interpreter.
    pub async fn open(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let stores = open_stores(&config.storage).await?;
        Self::new(config, stores, Arc::new(TclFactory::default()))
    }

    /// In-memory engine with default limits.
    pub fn ephemeral() -> EngineResult<Self> {
        Self::new(
            EngineConfig::ephemeral(),
            Stores::in_memory(),
            Arc::new(TclFactory::default()),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Run one script. Every failure is reported in the result.
    pub async fn execute(&self, request: ExecuteRequest) -> ExecutionResult {
        let inner = &*self.inner;
        Pipeline {
            builder: &inner.builder,
            pool: &inner.pool,
            stores: &inner.stores,
            settings: &inner.settings,
            packages: &inner.packages,
        }
        .execute(request)
        .await
    }

    pub async fn history(&self, query: &HistoryQuery) -> Result<Vec<HistoryEntry>, StorageError> {
        self.inner.stores.history.query(query).await
    }

    pub async fn history_entry(&self, execution_id: &str) -> Result<Option<HistoryEntry>, StorageError> {
        self.inner.stores.history.get(execution_id).await
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.inner.stores.sessions
    }

    pub fn history_store(&self) -> &Arc<dyn HistoryStore> {
        &self.inner.stores.history
    }

    pub fn pool(&self) -> &InterpreterPool {
        &self.inner.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Evict stale interpreters, sweep idle sessions and prune history.
    pub async fn maintain(&self) -> MaintenanceReport {
        let inner = &*self.inner;
        let mut report = MaintenanceReport {
            interpreters_evicted: inner.pool.evict_idle(),
            ..MaintenanceReport::default()
        };

        match inner.config.sessions.max_idle() {
            Ok(max_idle) => match inner.stores.sessions.cleanup(max_idle).await {
                Ok(removed) => report.sessions_removed = removed.len(),
                Err(err) => warn!(error = %err, "session cleanup failed"),
            },
            Err(err) => warn!(error = %err, "session cleanup skipped"),
        }
        match inner
            .stores
            .history
            .prune(&inner.config.history.retention())
            .await
        {
            Ok(pruned) => report.history_pruned = pruned,
            Err(err) => warn!(error = %err, "history pruning failed"),
        }
        METRICS.flush();
        info!(
            interpreters_evicted = report.interpreters_evicted,
            sessions_removed = report.sessions_removed,
            history_pruned = report.history_pruned,
            "maintenance pass complete"
        );
        report
    }

    /// Run [`maintain`](Self::maintain) every `interval` until the engine is dropped.
    pub fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                ScriptEngine { inner }.maintain().await;
            }
        })
    }

    /// Refuse new work and wait up to `deadline` for in-flight executions.
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        let report = self.inner.pool.shutdown(deadline).await;
        METRICS.flush();
        if report.drained {
            info!(idle_destroyed = report.idle_destroyed, "engine shut down");
        } else {
            warn!(
                in_flight = report.in_flight_remaining,
                "engine shut down with executions still running"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ExecutionState;

    #[tokio::test]
    async fn test_ephemeral_engine_runs_script() {
        let engine = ScriptEngine::ephemeral().unwrap();
        let result = engine
            .execute(ExecuteRequest::new("set x 20; expr {$x + 22}"))
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result.as_deref(), Some("42"));
        assert_eq!(result.final_state, ExecutionState::Completed);
        assert_eq!(engine.pool_stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_history_recorded() {
        let engine = ScriptEngine::ephemeral().unwrap();
        let result = engine.execute(ExecuteRequest::new("return ok")).await;
        let entry = engine
            .history_entry(&result.execution_id)
            .await
            .unwrap()
            .expect("history entry");
        assert!(entry.success);
        assert_eq!(entry.outcome, "Completed");
        assert_eq!(entry.script, "return ok");
        assert_eq!(entry.script_digest.len(), 64);
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let mut config = EngineConfig::ephemeral();
        config.pool.max_size = 0;
        let err = ScriptEngine::new(config, Stores::in_memory(), Arc::new(TclFactory::default()))
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn test_maintenance_prunes_history() {
        let mut config = EngineConfig::ephemeral();
        config.history.max_entries = Some(2);
        let engine =
            ScriptEngine::new(config, Stores::in_memory(), Arc::new(TclFactory::default())).unwrap();
        for i in 0..5 {
            engine.execute(ExecuteRequest::new(format!("return {i}"))).await;
        }
        let report = engine.maintain().await;
        assert_eq!(report.history_pruned, 3);
        assert_eq!(engine.history_store().count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let engine = ScriptEngine::ephemeral().unwrap();
        let report = engine.shutdown(Duration::from_millis(100)).await;
        assert!(report.drained);
        let result = engine.execute(ExecuteRequest::new("return 1")).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, 4);
    }
}
