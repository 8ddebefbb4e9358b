//! End-to-end tests for the execution pipeline through `ScriptEngine`.

use std::time::{Duration, Instant};

use scriptbox_core::interp::{EvalStats, InterpreterFault};
use scriptbox_core::{
    Bindings, CancelToken, EngineConfig, ExecuteRequest, ExecutionFailure, ExecutionMode,
    ExecutionState, Evaluation, Interpreter, InterpreterFactory, ScriptEngine, SecurityLevel,
    SecurityPolicy, Stores, TclFactory, Value,
};
use std::sync::Arc;

fn engine() -> ScriptEngine {
    ScriptEngine::ephemeral().unwrap()
}

fn engine_with(config: EngineConfig) -> ScriptEngine {
    ScriptEngine::new(config, Stores::in_memory(), Arc::new(TclFactory::default())).unwrap()
}

// -------------------------------------------------------------------------
// Happy path
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_minimal_arithmetic_return() {
    let result = engine()
        .execute(
            ExecuteRequest::new("return 1 + 1")
                .with_security_level("Minimal")
                .with_timeout_seconds(5),
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result.as_deref(), Some("2"));
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.security_level, "Minimal");
    assert!(result.security_violations.is_empty());
    assert_eq!(result.metrics.timeout_ms, 5000);
    assert!(result.metrics.interpreter_id.is_some());
}

#[tokio::test]
async fn test_variables_and_output_are_captured() {
    let result = engine()
        .execute(
            ExecuteRequest::new("puts \"hello $name\"; expr {$n * 2}")
                .with_variable("name", serde_json::json!("world"))
                .with_variable("n", serde_json::json!(21)),
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output, "hello world\n");
    assert_eq!(result.result.as_deref(), Some("42"));
    assert!(result.metrics.commands_executed >= 2);
    assert_eq!(result.metrics.custom.get("output_bytes"), Some(&12));
}

#[tokio::test]
async fn test_json_format_round_trips_structure() {
    let result = engine()
        .execute(
            ExecuteRequest::new("dict create name scriptbox tags [list a b] count 3")
                .with_output_format("json"),
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    let formatted = result.formatted.expect("formatted output");
    let parsed: serde_json::Value = serde_json::from_str(&formatted).unwrap();
    assert_eq!(
        parsed,
        serde_json::json!({"name": "scriptbox", "tags": ["a", "b"], "count": 3})
    );
    assert_eq!(result.value, Some(parsed));
}

#[tokio::test]
async fn test_csv_of_nested_value_is_format_failure() {
    let result = engine()
        .execute(
            ExecuteRequest::new("list [list 1 [list 2 3]]").with_output_format("csv"),
        )
        .await;

    assert!(!result.success);
    assert!(matches!(result.error, Some(ExecutionFailure::Format { .. })));
    assert_eq!(result.exit_code, 5);
    assert_eq!(result.final_state, ExecutionState::Failed);
}

// -------------------------------------------------------------------------
// Validation
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_validation_failures_never_touch_the_pool() {
    let engine = engine();
    let cases = [
        ExecuteRequest::new(""),
        ExecuteRequest::new("return 1").with_security_level("Paranoid"),
        ExecuteRequest::new("return 1").with_output_format("pdf"),
        ExecuteRequest::new("return 1").with_timeout_seconds(0),
        ExecuteRequest::new("return 1").with_variable("bad name", serde_json::json!(1)),
    ];
    for request in cases {
        let result = engine.execute(request).await;
        assert!(!result.success);
        assert!(
            matches!(result.error, Some(ExecutionFailure::Validation { .. })),
            "{:?}",
            result.error
        );
        assert_eq!(result.exit_code, 2);
        assert!(result.metrics.interpreter_id.is_none());
    }
    assert_eq!(engine.pool_stats().created, 0);
}

#[tokio::test]
async fn test_timeout_is_clamped_to_policy() {
    let result = engine()
        .execute(
            ExecuteRequest::new("return ok")
                .with_security_level("Minimal")
                .with_timeout_seconds(3600),
        )
        .await;
    assert!(result.success);
    assert_eq!(
        result.metrics.timeout_ms,
        SecurityPolicy::minimal().max_execution_secs * 1000
    );
}

// -------------------------------------------------------------------------
// Policy enforcement
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_restricted_command_is_refused_before_running() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");
    let script = format!("exec touch {}", marker.display());

    let result = engine()
        .execute(ExecuteRequest::new(script).with_security_level("Standard"))
        .await;

    assert!(!result.success);
    assert_eq!(result.security_violations, vec!["exec".to_string()]);
    assert_eq!(result.final_state, ExecutionState::SecurityViolation);
    assert_eq!(result.exit_code, 3);
    assert!(result.metrics.interpreter_id.is_none());
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_dynamic_command_name_is_caught_at_dispatch() {
    let result = engine()
        .execute(
            ExecuteRequest::new("set c ex; append c it; $c 3").with_security_level("Standard"),
        )
        .await;

    assert!(!result.success);
    match result.error {
        Some(ExecutionFailure::PolicyViolation { command, .. }) => {
            assert_eq!(command.as_deref(), Some("exit"))
        }
        other => panic!("expected policy violation, got {other:?}"),
    }
    assert_eq!(result.security_violations, vec!["exit".to_string()]);
    assert_eq!(result.final_state, ExecutionState::SecurityViolation);
}

#[tokio::test]
async fn test_environment_requirement_under_minimal() {
    let result = engine()
        .execute(
            ExecuteRequest::new("return 1")
                .with_security_level("Minimal")
                .with_env("HOME", "/root")
                .requiring_environment(),
        )
        .await;

    assert!(!result.success);
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.security_violations, vec!["environment".to_string()]);

    // Without the requirement the variables are dropped silently.
    let result = engine()
        .execute(
            ExecuteRequest::new("info commands env")
                .with_security_level("Minimal")
                .with_env("HOME", "/root"),
        )
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result.as_deref(), Some(""));
}

#[tokio::test]
async fn test_env_visible_under_standard() {
    let result = engine()
        .execute(ExecuteRequest::new("env get GREETING").with_env("GREETING", "hi"))
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result.as_deref(), Some("hi"));
}

/// Anything a lower level accepts, every higher level accepts too.
#[tokio::test]
async fn test_policy_monotonicity() {
    let engine = engine();
    let scripts = [
        "return 1",
        "set x [list a b c]; llength $x",
        "proc sq {n} { expr {$n * $n} }; sq 7",
        "info commands puts",
        "pwd",
        "env names",
        "exec echo hi",
    ];
    let levels = [
        SecurityLevel::Minimal,
        SecurityLevel::Standard,
        SecurityLevel::Elevated,
        SecurityLevel::Maximum,
    ];
    for script in scripts {
        let mut accepted_below = false;
        for level in levels {
            let result = engine
                .execute(
                    ExecuteRequest::new(script)
                        .with_security_level(level.to_string())
                        .with_timeout_seconds(5),
                )
                .await;
            let refused = !result.security_violations.is_empty();
            if accepted_below {
                assert!(!refused, "{script:?} accepted below {level} but refused at it");
            }
            accepted_below |= !refused;
        }
    }
}

// -------------------------------------------------------------------------
// Failures inside the script
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_script_error_is_reported() {
    let result = engine()
        .execute(ExecuteRequest::new("puts before; error {something broke}"))
        .await;

    assert!(!result.success);
    assert_eq!(
        result.error,
        Some(ExecutionFailure::ScriptError {
            message: "something broke".into()
        })
    );
    assert_eq!(result.exit_code, 1);
    assert_eq!(result.output, "before\n");
    assert_eq!(result.final_state, ExecutionState::Failed);
}

#[tokio::test]
async fn test_caught_error_is_success() {
    let result = engine()
        .execute(ExecuteRequest::new("catch {error nope} msg; return $msg"))
        .await;
    assert!(result.success);
    assert_eq!(result.result.as_deref(), Some("nope"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_infinite_loop_times_out_and_frees_capacity() {
    let mut config = EngineConfig::ephemeral();
    config.pool.max_size = 1;
    let engine = engine_with(config);

    let started = Instant::now();
    let result = engine
        .execute(ExecuteRequest::new("while {1} {}").with_timeout_seconds(1))
        .await;
    let elapsed = started.elapsed();

    assert!(!result.success);
    assert_eq!(result.final_state, ExecutionState::TimedOut);
    assert_eq!(result.exit_code, 124);
    assert!(
        matches!(result.error, Some(ExecutionFailure::TimedOut { limit_ms: 1000, .. })),
        "{:?}",
        result.error
    );
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");

    // The only slot is usable again and the timed-out instance was not recycled.
    let stats = engine.pool_stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 0);
    let next = engine.execute(ExecuteRequest::new("return again")).await;
    assert!(next.success, "{:?}", next.error);
    assert_ne!(next.metrics.interpreter_id, result.metrics.interpreter_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sleep_is_cancelled_on_timeout() {
    let started = Instant::now();
    let result = engine()
        .execute(ExecuteRequest::new("after 20000").with_timeout_seconds(1))
        .await;
    assert_eq!(result.final_state, ExecutionState::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(3));
}

/// Echoes its script, except `hang`, which blocks without looking at the
/// cancel token.
struct Stubborn;

impl Interpreter for Stubborn {
    fn evaluate(&mut self, script: &str, _bindings: &Bindings, _cancel: &CancelToken) -> Evaluation {
        if script == "hang" {
            std::thread::sleep(Duration::from_secs(5));
        }
        Evaluation {
            outcome: Ok(Value::from(script)),
            output: String::new(),
            stats: EvalStats::default(),
        }
    }

    fn reset(&mut self) -> Result<(), InterpreterFault> {
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

struct StubbornFactory;

impl InterpreterFactory for StubbornFactory {
    fn create(&self) -> Result<Box<dyn Interpreter>, InterpreterFault> {
        Ok(Box::new(Stubborn))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interpreter_ignoring_cancellation_is_abandoned() {
    let mut config = EngineConfig::ephemeral();
    config.pool.max_size = 1;
    config.execution.grace_period_ms = 200;
    let engine = ScriptEngine::new(config, Stores::in_memory(), Arc::new(StubbornFactory)).unwrap();

    let started = Instant::now();
    let result = engine
        .execute(ExecuteRequest::new("hang").with_timeout_seconds(1))
        .await;
    let elapsed = started.elapsed();

    assert_eq!(result.final_state, ExecutionState::TimedOut);
    assert!(
        matches!(result.error, Some(ExecutionFailure::TimedOut { limit_ms: 1000, .. })),
        "{:?}",
        result.error
    );
    assert!(elapsed >= Duration::from_millis(1200), "took {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2500), "took {elapsed:?}");

    // The slot was freed even though the worker thread is still blocked.
    let stats = engine.pool_stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.live, 0);

    let next = engine.execute(ExecuteRequest::new("echo")).await;
    assert!(next.success, "{:?}", next.error);
    assert_eq!(next.result.as_deref(), Some("echo"));
    assert_eq!(engine.pool_stats().created, 2);
    assert_ne!(next.metrics.interpreter_id, result.metrics.interpreter_id);
}

#[tokio::test]
async fn test_deeply_nested_substitution_is_rejected_up_front() {
    let engine = engine();
    let script = format!("set x {}1{}", "[".repeat(1000), "]".repeat(1000));
    let result = engine.execute(ExecuteRequest::new(script)).await;

    assert!(!result.success);
    match &result.error {
        Some(ExecutionFailure::Validation { field, .. }) => assert_eq!(field, "script"),
        other => panic!("expected validation failure, got {other:?}"),
    }
    assert_eq!(engine.pool_stats().created, 0);

    let nested = engine
        .execute(ExecuteRequest::new("llength [list [list [list a b] c] d]"))
        .await;
    assert_eq!(nested.result.as_deref(), Some("2"));
}

#[tokio::test]
async fn test_nested_bodies_fail_instead_of_overflowing() {
    let script = format!("{}set x 1{}", "if 1 {".repeat(2_000), "}".repeat(2_000));
    let result = engine().execute(ExecuteRequest::new(script)).await;

    assert!(!result.success);
    assert!(
        matches!(&result.error, Some(ExecutionFailure::ScriptError { message }) if message.contains("too many nested evaluations")),
        "{:?}",
        result.error
    );
}

#[tokio::test]
async fn test_huge_format_width_hits_memory_limit() {
    let engine = engine();
    let result = engine
        .execute(ExecuteRequest::new("format %99999999999d 1").with_security_level("Minimal"))
        .await;

    assert!(!result.success);
    assert!(
        matches!(
            result.error,
            Some(ExecutionFailure::ResourceExhausted { ref resource, .. }) if resource == "memory"
        ),
        "{:?}",
        result.error
    );
    let after = engine.execute(ExecuteRequest::new("format %5d 1")).await;
    assert_eq!(after.result.as_deref(), Some("    1"));
}

#[tokio::test]
async fn test_memory_limit_is_enforced() {
    let result = engine()
        .execute(
            ExecuteRequest::new(
                "set s x; while {1} { append s $s }",
            )
            .with_security_level("Minimal")
            .with_timeout_seconds(10),
        )
        .await;

    assert!(!result.success);
    match result.error {
        Some(ExecutionFailure::ResourceExhausted { resource, used, limit }) => {
            assert_eq!(resource, "memory");
            assert!(used > limit);
        }
        other => panic!("expected memory exhaustion, got {other:?}"),
    }
    assert_eq!(result.exit_code, 4);
}

#[tokio::test]
async fn test_debug_mode_runs_like_batch() {
    let result = engine()
        .execute(ExecuteRequest::new("return dbg").with_mode(ExecutionMode::Debug))
        .await;
    assert!(result.success);
    assert_eq!(result.result.as_deref(), Some("dbg"));
}

#[tokio::test]
async fn test_history_records_every_outcome() {
    let engine = engine();
    let ok = engine.execute(ExecuteRequest::new("return 1")).await;
    let bad = engine.execute(ExecuteRequest::new("exec ls")).await;
    let invalid = engine.execute(ExecuteRequest::new("")).await;

    let history = engine
        .history(&scriptbox_core::HistoryQuery::recent(10))
        .await
        .unwrap();
    assert_eq!(history.len(), 3);

    let outcome = |id: &str| {
        history
            .iter()
            .find(|e| e.execution_id == id)
            .map(|e| (e.outcome.clone(), e.exit_code))
    };
    assert_eq!(outcome(&ok.execution_id), Some(("Completed".into(), 0)));
    assert_eq!(
        outcome(&bad.execution_id),
        Some(("SecurityViolation".into(), 3))
    );
    assert_eq!(outcome(&invalid.execution_id), Some(("Failed".into(), 2)));
}
