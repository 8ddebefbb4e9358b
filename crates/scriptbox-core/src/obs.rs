//! Structured observability hooks for the execution lifecycle.
//!
//! This module provides:
//! - Execution-scoped tracing spans: [`execution_span`] for async code
//!   (attach with `Instrument`) and the [`ExecutionSpan`] RAII guard for
//!   the evaluation worker thread
//! - Emission functions for lifecycle events: start, state transitions,
//!   policy violations, finish, pool churn, storage failures
//!
//! Events are emitted at `info!` level (`warn!` for storage failures);
//! filter with `RUST_LOG`.

use tracing::{info, warn};

/// Span tagged with the execution id and security level.
pub fn execution_span(execution_id: &str, security_level: &str) -> tracing::Span {
    tracing::info_span!(
        "scriptbox.execution",
        execution_id = %execution_id,
        security_level = %security_level
    )
}

/// RAII guard that keeps an execution span entered on the current thread.
///
/// # Example
///
/// ```ignore
/// let _span = ExecutionSpan::enter(span.clone());
/// // tracing calls on this thread now carry execution_id
/// ```
pub struct ExecutionSpan {
    _span: tracing::span::EnteredSpan,
}

impl ExecutionSpan {
    pub fn enter(span: tracing::Span) -> Self {
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: execution accepted by the engine.
pub fn emit_execution_started(execution_id: &str, security_level: &str, session_id: Option<&str>) {
    info!(
        event = "execution.started",
        execution_id = %execution_id,
        security_level = %security_level,
        session_id = session_id.unwrap_or("-"),
    );
}

/// Emit event: pipeline state transition.
pub fn emit_state_transition(execution_id: &str, from: &str, to: &str) {
    info!(event = "execution.state", execution_id = %execution_id, from = %from, to = %to);
}

/// Emit event: a command or capability was refused by policy.
pub fn emit_policy_violation(execution_id: &str, subject: &str, reason: &str) {
    info!(
        event = "execution.policy_violation",
        execution_id = %execution_id,
        subject = %subject,
        reason = %reason,
    );
}

/// Emit event: execution finished with its terminal state.
pub fn emit_execution_finished(execution_id: &str, state: &str, duration_ms: u64, success: bool) {
    info!(
        event = "execution.finished",
        execution_id = %execution_id,
        state = %state,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Emit event: the pool created an interpreter.
pub fn emit_interpreter_created(interpreter_id: u64) {
    info!(event = "pool.interpreter_created", interpreter_id = interpreter_id);
}

/// Emit event: the pool destroyed an interpreter.
pub fn emit_interpreter_destroyed(interpreter_id: u64, reason: &str) {
    info!(
        event = "pool.interpreter_destroyed",
        interpreter_id = interpreter_id,
        reason = %reason,
    );
}

/// Emit event: history append failed (warning level).
pub fn emit_history_append_failed(execution_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "history.append_failed", execution_id = %execution_id, error = %error);
}

/// Emit event: staged session writes could not be committed (warning level).
pub fn emit_session_commit_failed(execution_id: &str, session_id: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "session.commit_failed",
        execution_id = %execution_id,
        session_id = %session_id,
        error = %error,
    );
}
