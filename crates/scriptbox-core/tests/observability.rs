//! Structured tracing for the execution lifecycle.

use scriptbox_core::metrics::METRICS;
use scriptbox_core::obs::{emit_interpreter_created, emit_state_transition, execution_span, ExecutionSpan};
use scriptbox_core::{ExecuteRequest, ScriptEngine};
use tracing_test::traced_test;

#[traced_test]
#[tokio::test]
async fn test_execution_emits_lifecycle_events() {
    let engine = ScriptEngine::ephemeral().unwrap();
    let result = engine.execute(ExecuteRequest::new("return traced")).await;
    assert!(result.success);

    assert!(logs_contain("execution.started"));
    assert!(logs_contain("execution.state"));
    assert!(logs_contain("execution.finished"));
    assert!(logs_contain("pool.interpreter_created"));
    assert!(logs_contain(&result.execution_id));
}

#[traced_test]
#[tokio::test]
async fn test_violation_is_logged() {
    let engine = ScriptEngine::ephemeral().unwrap();
    let result = engine
        .execute(ExecuteRequest::new("exec rm -rf /").with_security_level("Standard"))
        .await;
    assert!(!result.success);
    assert!(logs_contain("execution.policy_violation"));
    assert!(logs_contain("subject=exec"));
}

#[traced_test]
#[test]
fn test_span_guard_and_events() {
    let _span = ExecutionSpan::enter(execution_span("exec-obs", "Elevated"));
    emit_state_transition("exec-obs", "Running", "Completed");
    emit_interpreter_created(7);
    assert!(logs_contain("to=Completed"));
}

#[tokio::test]
async fn test_global_counters_advance() {
    let before = METRICS.snapshot();
    let engine = ScriptEngine::ephemeral().unwrap();
    engine.execute(ExecuteRequest::new("return 1")).await;
    engine.execute(ExecuteRequest::new("error boom")).await;
    let after = METRICS.snapshot();

    assert!(after.executions_started >= before.executions_started + 2);
    assert!(after.executions_completed > before.executions_completed);
    assert!(after.executions_failed > before.executions_failed);
}
