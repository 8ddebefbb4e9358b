//! Execution pipeline: one request from raw input to a definitive result.
//!
//! ```text
//! Created → ContextBuilt → InterpreterAcquired → BindingsInjected → Running
//!         → { Completed | Failed | TimedOut | SecurityViolation } → Released
//! ```
//!
//! Validation and policy checks run before the pool is touched. The script
//! is evaluated on a dedicated thread while the async side waits on a
//! oneshot channel under the clamped timeout. On expiry the evaluation is
//! cancelled cooperatively; an interpreter that ran past its deadline is
//! destroyed, never recycled. Every path ends in `Released`: the lease is
//! released, discarded, or dropped (which destroys it).

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use scriptbox_state::{HistoryEntry, Stores};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::{debug, Instrument};
use uuid::Uuid;

use crate::context::{ContextBuilder, ContextError, ExecuteRequest, ExecutionContext, ExecutionMode};
use crate::format::{format_value, structured_view, OutputFormat};
use crate::host::{install_host_commands, SessionBinding};
use crate::interp::{Bindings, CancelToken, EvalError, Evaluation, Value};
use crate::metrics::METRICS;
use crate::obs::{self, ExecutionSpan};
use crate::policy::{preflight, Capability, PolicyGuard};
use crate::pool::{InterpreterPool, Lease, PoolError};
use crate::result::{ExecutionFailure, ExecutionMetrics, ExecutionResult};

/// Pipeline states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    Created,
    ContextBuilt,
    InterpreterAcquired,
    BindingsInjected,
    Running,
    Completed,
    Failed,
    TimedOut,
    SecurityViolation,
    Released,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::Failed
                | ExecutionState::TimedOut
                | ExecutionState::SecurityViolation
        )
    }

    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        match (self, next) {
            (Created, ContextBuilt | Failed | SecurityViolation) => true,
            (ContextBuilt, InterpreterAcquired | Failed | SecurityViolation) => true,
            (InterpreterAcquired, BindingsInjected | Failed) => true,
            (BindingsInjected, Running | Failed) => true,
            (Running, Completed | Failed | TimedOut | SecurityViolation) => true,
            (from, Released) => from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Records and validates the transitions of one execution.
#[derive(Debug)]
pub struct StateTracker {
    execution_id: String,
    path: Vec<ExecutionState>,
}

impl StateTracker {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            path: vec![ExecutionState::Created],
        }
    }

    pub fn current(&self) -> ExecutionState {
        self.path
            .last()
            .copied()
            .unwrap_or(ExecutionState::Created)
    }

    /// Every state visited, in order.
    pub fn path(&self) -> &[ExecutionState] {
        &self.path
    }

    pub fn advance(&mut self, next: ExecutionState) -> Result<(), ExecutionFailure> {
        let from = self.current();
        if !from.can_transition_to(next) {
            return Err(ExecutionFailure::Internal {
                message: format!("invalid pipeline transition {from} -> {next}"),
            });
        }
        obs::emit_state_transition(&self.execution_id, &from.to_string(), &next.to_string());
        self.path.push(next);
        Ok(())
    }

    /// The last terminal state reached, if any.
    pub fn terminal(&self) -> Option<ExecutionState> {
        self.path.iter().rev().copied().find(|s| s.is_terminal())
    }
}

/// Knobs the pipeline reads from the engine configuration.
#[derive(Debug, Clone)]
pub(crate) struct PipelineSettings {
    pub acquire_timeout: Duration,
    pub grace_period: Duration,
    pub worker_stack_bytes: usize,
    pub history_preview_chars: usize,
}

/// Successful evaluation, rendered.
struct Completion {
    value: Value,
    formatted: String,
}

/// How the worker thread came back.
enum Evaluated {
    Finished(Evaluation),
    TimedOut {
        elapsed: Duration,
        partial: Option<Evaluation>,
    },
    Lost(String),
}

/// Cancels the evaluation if the pipeline future is dropped mid-run.
struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Mutable record of one execution in progress.
struct Run {
    execution_id: String,
    session_id: Option<String>,
    security_level: String,
    format: OutputFormat,
    tracker: StateTracker,
    metrics: ExecutionMetrics,
    violations: Vec<String>,
    output: String,
    clock: Instant,
    started_at: chrono::DateTime<Utc>,
}

impl Run {
    fn new(execution_id: &Uuid, request: &ExecuteRequest) -> Self {
        let id = execution_id.to_string();
        Self {
            tracker: StateTracker::new(id.clone()),
            execution_id: id,
            session_id: request.session_id.clone(),
            security_level: request.security_level.clone(),
            format: request.output_format.parse().unwrap_or(OutputFormat::Plain),
            metrics: ExecutionMetrics::default(),
            violations: Vec::new(),
            output: String::new(),
            clock: Instant::now(),
            started_at: Utc::now(),
        }
    }

    fn advance(&mut self, next: ExecutionState) -> Result<(), ExecutionFailure> {
        self.tracker.advance(next)
    }

    /// Move to the terminal state for `outcome` unless already there.
    fn settle(&mut self, outcome: &Result<Completion, ExecutionFailure>) {
        if self.tracker.terminal().is_some() {
            return;
        }
        let terminal = match outcome {
            Ok(_) => ExecutionState::Completed,
            Err(failure) => failure.terminal_state(),
        };
        if let Err(err) = self.advance(terminal) {
            tracing::error!(error = %err, "pipeline state machine rejected terminal state");
        }
    }

    fn record_violation(&mut self, subject: &str, reason: &str) {
        METRICS.inc_policy_violations();
        obs::emit_policy_violation(&self.execution_id, subject, reason);
        if !self.violations.iter().any(|v| v == subject) {
            self.violations.push(subject.to_string());
        }
    }

    fn absorb(&mut self, evaluation: &Evaluation) {
        let stats = &evaluation.stats;
        self.metrics.execution_ms = stats.execution_time_us / 1000;
        self.metrics.peak_memory_bytes = stats.peak_memory_bytes;
        self.metrics.commands_executed = stats.commands_executed;
        self.metrics.variables_created = stats.variables_created;
        self.metrics.procedures_created = stats.procedures_created;
        self.metrics.security_checks = stats.security_checks;
        self.metrics.parse_time_us = stats.parse_time_us;
        self.metrics
            .custom
            .insert("output_bytes".to_string(), stats.output_bytes);
        self.output = evaluation.output.clone();
    }

    fn finish(mut self, outcome: Result<Completion, ExecutionFailure>) -> ExecutionResult {
        self.settle(&outcome);
        if self.tracker.current() != ExecutionState::Released {
            if let Err(err) = self.advance(ExecutionState::Released) {
                tracing::error!(error = %err, "pipeline state machine rejected release");
            }
        }
        let final_state = self.tracker.terminal().unwrap_or(ExecutionState::Failed);
        self.metrics.duration_ms = self.clock.elapsed().as_millis() as u64;

        let (success, result, value, formatted, error) = match outcome {
            Ok(done) => (
                true,
                Some(done.value.as_str().into_owned()),
                Some(structured_view(&done.value)),
                Some(done.formatted),
                None,
            ),
            Err(failure) => (false, None, None, None, Some(failure)),
        };
        let exit_code = error.as_ref().map_or(0, ExecutionFailure::exit_code);

        match final_state {
            ExecutionState::Completed => METRICS.inc_executions_completed(),
            ExecutionState::TimedOut => METRICS.inc_executions_timed_out(),
            _ => METRICS.inc_executions_failed(),
        }
        obs::emit_execution_finished(
            &self.execution_id,
            &final_state.to_string(),
            self.metrics.duration_ms,
            success,
        );

        ExecutionResult {
            execution_id: self.execution_id,
            session_id: self.session_id,
            success,
            result,
            value,
            formatted,
            format: self.format,
            output: self.output,
            error,
            security_violations: self.violations,
            security_level: self.security_level,
            final_state,
            exit_code,
            metrics: self.metrics,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

fn context_failure(run: &mut Run, err: ContextError) -> ExecutionFailure {
    match err {
        ContextError::Validation(v) => ExecutionFailure::Validation {
            field: v.field,
            reason: v.reason,
        },
        ContextError::PolicyViolation { capability, reason } => {
            run.record_violation(&capability, &reason);
            ExecutionFailure::PolicyViolation {
                command: None,
                capability: Some(capability),
                reason,
            }
        }
    }
}

fn pool_failure(err: PoolError) -> ExecutionFailure {
    match err {
        PoolError::Exhausted {
            max_size,
            waited_ms,
        } => ExecutionFailure::PoolExhausted {
            max_size,
            waited_ms,
        },
        PoolError::ShuttingDown => ExecutionFailure::Unavailable {
            reason: err.to_string(),
        },
        PoolError::Creation(message) => ExecutionFailure::Internal { message },
    }
}

fn storage_failure(err: impl fmt::Display) -> ExecutionFailure {
    ExecutionFailure::Storage {
        message: err.to_string(),
    }
}

/// Preview of `script` cut at a char boundary.
fn preview(script: &str, max_chars: usize) -> (String, bool) {
    match script.char_indices().nth(max_chars) {
        Some((cut, _)) => (script[..cut].to_string(), true),
        None => (script.to_string(), false),
    }
}

/// One execution against borrowed engine parts.
pub(crate) struct Pipeline<'a> {
    pub builder: &'a ContextBuilder,
    pub pool: &'a InterpreterPool,
    pub stores: &'a Stores,
    pub settings: &'a PipelineSettings,
    pub packages: &'a BTreeMap<String, String>,
}

impl Pipeline<'_> {
    pub async fn execute(&self, request: ExecuteRequest) -> ExecutionResult {
        let execution_id = Uuid::new_v4();
        let span = obs::execution_span(&execution_id.to_string(), &request.security_level);
        async move {
            METRICS.inc_executions_started();
            let mut run = Run::new(&execution_id, &request);
            obs::emit_execution_started(
                &run.execution_id,
                &request.security_level,
                request.session_id.as_deref(),
            );
            let outcome = self.drive(execution_id, &request, &mut run).await;
            let result = run.finish(outcome);
            self.record_history(&request, &result).await;
            result
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        execution_id: Uuid,
        request: &ExecuteRequest,
        run: &mut Run,
    ) -> Result<Completion, ExecutionFailure> {
        let ctx = match self.builder.build_for(execution_id, request) {
            Ok(ctx) => ctx,
            Err(err) => return Err(context_failure(run, err)),
        };
        run.advance(ExecutionState::ContextBuilt)?;
        run.security_level = ctx.policy().name.clone();
        run.format = ctx.format();
        run.metrics.timeout_ms = ctx.timeout().as_millis() as u64;
        if ctx.mode() == ExecutionMode::Debug {
            debug!(script = %ctx.script(), timeout_ms = run.metrics.timeout_ms, "debug execution");
        }

        // Any literal restricted command fails the run before it starts.
        let guard = Arc::new(PolicyGuard::new(Arc::clone(ctx.policy())));
        let denials = preflight(ctx.script(), guard.as_ref());
        if let Some(first) = denials.first() {
            for denial in &denials {
                run.record_violation(&denial.command, &denial.reason);
            }
            return Err(ExecutionFailure::PolicyViolation {
                command: Some(first.command.clone()),
                capability: guard.withheld_capability(&first.command).map(|c| c.to_string()),
                reason: first.reason.clone(),
            });
        }

        let session = match ctx.session_id() {
            Some(id) => {
                let record = self.stores.sessions.load(id).await.map_err(storage_failure)?;
                Some(Arc::new(SessionBinding::new(id.clone(), record)))
            }
            None => None,
        };

        let waiting = Instant::now();
        let mut lease = self
            .pool
            .acquire(self.settings.acquire_timeout)
            .await
            .map_err(pool_failure)?;
        run.metrics.queue_wait_ms = waiting.elapsed().as_millis() as u64;
        run.metrics.interpreter_id = Some(lease.interpreter_id());
        run.advance(ExecutionState::InterpreterAcquired)?;

        let mut bindings = Bindings::new(guard, ctx.memory_limit_bytes());
        bindings.variables = ctx.variables().clone();
        bindings.working_dir = ctx.working_dir().map(Path::to_path_buf);
        bindings.packages = self.packages.clone();
        for namespace in ctx.imported_namespaces() {
            bindings
                .packages
                .insert(namespace.clone(), "1.0".to_string());
        }
        let installed = install_host_commands(&ctx, &mut bindings, session.clone());
        run.metrics
            .custom
            .insert("bindings_installed".to_string(), installed.len() as u64);
        debug!(bindings = ?installed, "host bindings installed");
        run.advance(ExecutionState::BindingsInjected)?;

        run.advance(ExecutionState::Running)?;
        let evaluated = self.evaluate(&ctx, &mut lease, bindings).await;

        let (outcome, commit) = match evaluated {
            Evaluated::Finished(evaluation) => {
                run.absorb(&evaluation);
                if ctx.mode() == ExecutionMode::Debug {
                    debug!(stats = ?evaluation.stats, "evaluation stats");
                }
                let commit = matches!(evaluation.outcome, Ok(_) | Err(EvalError::Script { .. }));
                (self.conclude(run, &ctx, evaluation.outcome), commit)
            }
            Evaluated::TimedOut { elapsed, partial } => {
                if let Some(evaluation) = &partial {
                    run.absorb(evaluation);
                }
                let failure = ExecutionFailure::TimedOut {
                    elapsed_ms: elapsed.as_millis() as u64,
                    limit_ms: ctx.timeout().as_millis() as u64,
                };
                (Err(failure), false)
            }
            Evaluated::Lost(message) => (Err(ExecutionFailure::Internal { message }), false),
        };

        let mut outcome = outcome;
        if let Some(session) = session {
            run.metrics
                .custom
                .insert("session_reads".to_string(), session.reads());
            run.metrics
                .custom
                .insert("session_writes".to_string(), session.writes());
            let ops = session.staged_ops();
            if commit && !ops.is_empty() {
                if let Err(err) = self.stores.sessions.apply(session.session_id(), &ops).await {
                    obs::emit_session_commit_failed(
                        &run.execution_id,
                        session.session_id().as_str(),
                        &err,
                    );
                    // Keep a script error; only a clean run turns into a storage failure.
                    if outcome.is_ok() {
                        outcome = Err(storage_failure(err));
                    }
                }
            }
        }

        run.settle(&outcome);
        match run.tracker.terminal() {
            Some(
                ExecutionState::Completed
                | ExecutionState::Failed
                | ExecutionState::SecurityViolation,
            ) if !matches!(outcome, Err(ExecutionFailure::Internal { .. })) =>
            {
                lease.release()
            }
            Some(state) => lease.discard(&format!("execution ended {state}")),
            None => lease.discard("execution ended without a terminal state"),
        }
        run.advance(ExecutionState::Released)?;
        outcome
    }

    /// Map the interpreter's answer to a completion or failure.
    fn conclude(
        &self,
        run: &mut Run,
        ctx: &ExecutionContext,
        outcome: Result<Value, EvalError>,
    ) -> Result<Completion, ExecutionFailure> {
        match outcome {
            Ok(value) => {
                let formatted = format_value(&value, ctx.format()).map_err(|e| {
                    ExecutionFailure::Format {
                        message: e.to_string(),
                    }
                })?;
                Ok(Completion { value, formatted })
            }
            Err(EvalError::Script { message }) => Err(ExecutionFailure::ScriptError { message }),
            Err(EvalError::Denied { command, reason }) => {
                run.record_violation(&command, &reason);
                Err(ExecutionFailure::PolicyViolation {
                    capability: Capability::for_command(&command).map(|c| c.to_string()),
                    command: Some(command),
                    reason,
                })
            }
            Err(EvalError::MemoryLimit { used, limit }) => Err(ExecutionFailure::ResourceExhausted {
                resource: "memory".to_string(),
                used,
                limit,
            }),
            Err(EvalError::Cancelled) => Err(ExecutionFailure::Internal {
                message: "evaluation cancelled".to_string(),
            }),
        }
    }

    /// Run the script on a dedicated thread under the context's timeout.
    async fn evaluate(
        &self,
        ctx: &ExecutionContext,
        lease: &mut Lease,
        bindings: Bindings,
    ) -> Evaluated {
        let Some(mut interp) = lease.detach() else {
            return Evaluated::Lost("lease holds no interpreter".to_string());
        };
        let cancel = CancelToken::new();
        let _cancel_on_drop = CancelOnDrop(cancel.clone());
        let (tx, mut rx) = oneshot::channel();

        let script = ctx.script().to_string();
        let worker_cancel = cancel.clone();
        let span = tracing::Span::current();
        let spawned = std::thread::Builder::new()
            .name(format!("scriptbox-eval-{}", interp.id()))
            .stack_size(self.settings.worker_stack_bytes)
            .spawn(move || {
                let _span = ExecutionSpan::enter(span);
                let evaluation = interp
                    .interpreter()
                    .evaluate(&script, &bindings, &worker_cancel);
                // The receiver is gone once the pipeline has given up.
                let _ = tx.send((interp, evaluation));
            });
        if let Err(err) = spawned {
            return Evaluated::Lost(format!("failed to start evaluation thread: {err}"));
        }

        let started = Instant::now();
        match tokio::time::timeout(ctx.timeout(), &mut rx).await {
            Ok(Ok((interp, evaluation))) => {
                lease.attach(interp);
                Evaluated::Finished(evaluation)
            }
            Ok(Err(_)) => Evaluated::Lost("evaluation thread panicked".to_string()),
            Err(_) => {
                cancel.cancel();
                let partial = match tokio::time::timeout(self.settings.grace_period, &mut rx).await
                {
                    Ok(Ok((interp, evaluation))) => {
                        lease.attach(interp);
                        Some(evaluation)
                    }
                    _ => {
                        tracing::warn!(
                            grace_ms = self.settings.grace_period.as_millis() as u64,
                            "evaluation ignored cancellation; abandoning interpreter"
                        );
                        None
                    }
                };
                Evaluated::TimedOut {
                    elapsed: started.elapsed(),
                    partial,
                }
            }
        }
    }

    async fn record_history(&self, request: &ExecuteRequest, result: &ExecutionResult) {
        let (script, script_truncated) = preview(&request.script, self.settings.history_preview_chars);
        let result_summary = result.result.as_deref().map(|r| preview(r, 256).0);
        let entry = HistoryEntry {
            execution_id: result.execution_id.clone(),
            session_id: result.session_id.clone(),
            script,
            script_truncated,
            script_digest: hex::encode(Sha256::digest(request.script.as_bytes())),
            security_level: result.security_level.clone(),
            success: result.success,
            outcome: result.final_state.to_string(),
            exit_code: result.exit_code,
            result_summary,
            error: result.error_message(),
            started_at: result.started_at,
            finished_at: result.finished_at,
            duration_ms: result.metrics.duration_ms,
            memory_bytes: result.metrics.peak_memory_bytes,
        };
        if let Err(err) = self.stores.history.append(entry).await {
            METRICS.inc_history_failures();
            obs::emit_history_append_failed(&result.execution_id, &err);
        }
    }
}
