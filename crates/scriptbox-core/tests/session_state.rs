//! Session state across executions and engine restarts.

use std::sync::Arc;

use scriptbox_core::{
    EngineConfig, ExecuteRequest, ExecutionState, ScriptEngine, SessionId, StorageBackend, Stores,
    TclFactory,
};
use scriptbox_state::{FsSessionStore, MemoryHistoryStore};

fn fs_engine(dir: &std::path::Path) -> ScriptEngine {
    let stores = Stores {
        sessions: Arc::new(FsSessionStore::new(dir).unwrap()),
        history: Arc::new(MemoryHistoryStore::new()),
    };
    ScriptEngine::new(
        EngineConfig::ephemeral(),
        stores,
        Arc::new(TclFactory::default()),
    )
    .unwrap()
}

fn session(id: &str) -> SessionId {
    SessionId::parse(id).unwrap()
}

#[tokio::test]
async fn test_values_persist_between_executions() {
    let engine = ScriptEngine::ephemeral().unwrap();

    let first = engine
        .execute(ExecuteRequest::new("session set counter 1; session set name box").with_session("s-1"))
        .await;
    assert!(first.success, "{:?}", first.error);
    assert_eq!(first.session_id.as_deref(), Some("s-1"));
    assert_eq!(first.metrics.custom.get("session_writes"), Some(&2));

    let second = engine
        .execute(
            ExecuteRequest::new(
                "session set counter [expr {[session get counter] + 1}]; session get counter",
            )
            .with_session("s-1"),
        )
        .await;
    assert!(second.success, "{:?}", second.error);
    assert_eq!(second.result.as_deref(), Some("2"));

    let stored = engine
        .sessions()
        .get(&session("s-1"), "counter")
        .await
        .unwrap();
    assert_eq!(stored, Some(serde_json::json!(2)));
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let engine = ScriptEngine::ephemeral().unwrap();
    engine
        .execute(ExecuteRequest::new("session set k a").with_session("alpha"))
        .await;

    let other = engine
        .execute(ExecuteRequest::new("session get k missing").with_session("beta"))
        .await;
    assert_eq!(other.result.as_deref(), Some("missing"));
}

#[tokio::test]
async fn test_session_command_absent_without_session() {
    let result = ScriptEngine::ephemeral()
        .unwrap()
        .execute(ExecuteRequest::new("session get k"))
        .await;
    assert!(!result.success);
    assert_eq!(result.exit_code, 1);
}

#[tokio::test]
async fn test_writes_discarded_on_policy_violation() {
    let engine = ScriptEngine::ephemeral().unwrap();
    let result = engine
        .execute(
            ExecuteRequest::new("session set secret 1; set c ex; append c it; $c 0")
                .with_session("guarded"),
        )
        .await;
    assert_eq!(result.final_state, ExecutionState::SecurityViolation);

    let record = engine.sessions().peek(&session("guarded")).await.unwrap();
    assert!(record.map_or(true, |r| r.values.is_empty()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_writes_discarded_on_timeout() {
    let engine = ScriptEngine::ephemeral().unwrap();
    let result = engine
        .execute(
            ExecuteRequest::new("session set partial 1; while {1} {}")
                .with_session("slow")
                .with_timeout_seconds(1),
        )
        .await;
    assert_eq!(result.final_state, ExecutionState::TimedOut);
    assert_eq!(
        engine.sessions().get(&session("slow"), "partial").await.unwrap(),
        None
    );
}

#[tokio::test]
async fn test_writes_kept_on_script_error() {
    let engine = ScriptEngine::ephemeral().unwrap();
    let result = engine
        .execute(ExecuteRequest::new("session set step 1; error late").with_session("errs"))
        .await;
    assert!(!result.success);
    assert_eq!(
        engine.sessions().get(&session("errs"), "step").await.unwrap(),
        Some(serde_json::json!(1))
    );
}

#[tokio::test]
async fn test_invalid_session_id_rejected() {
    let result = ScriptEngine::ephemeral()
        .unwrap()
        .execute(ExecuteRequest::new("return 1").with_session("../etc/passwd"))
        .await;
    assert!(!result.success);
    assert_eq!(result.exit_code, 2);
}

#[tokio::test]
async fn test_session_survives_engine_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let engine = fs_engine(dir.path());
        let result = engine
            .execute(
                ExecuteRequest::new("session set items [list a b c]; session set owner me")
                    .with_session("durable"),
            )
            .await;
        assert!(result.success, "{:?}", result.error);
    }

    let engine = fs_engine(dir.path());
    let result = engine
        .execute(
            ExecuteRequest::new("list [llength [session get items]] [session list o*]")
                .with_session("durable"),
        )
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result.as_deref(), Some("3 owner"));
}

#[tokio::test]
async fn test_open_with_memory_backend() {
    let engine = ScriptEngine::open(EngineConfig {
        storage: StorageBackend::Memory,
        ..EngineConfig::default()
    })
    .await
    .unwrap();
    let result = engine
        .execute(ExecuteRequest::new("session set a 1").with_session("m"))
        .await;
    assert!(result.success);
    assert_eq!(engine.sessions().sessions().await.unwrap().len(), 1);
}
