//! Embedded interpreter capability.
//!
//! The pool and pipeline only see the narrow [`Interpreter`] trait:
//! evaluate a script against a set of [`Bindings`], honoring a
//! [`CancelToken`]. [`TclInterpreter`] is the built-in implementation, a
//! small Tcl-family dialect.
//!
//! # Modules
//!
//! - [`value`]: `Value` and list string forms
//! - [`parser`]: script parsing into commands and words
//! - `expr`: the `expr` language
//! - `machine`: `TclInterpreter`, call frames, dispatch
//! - `builtins`: core command set

pub(crate) mod builtins;
pub(crate) mod expr;
mod machine;
pub mod parser;
pub mod value;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use machine::{TclFactory, TclInterpreter};
pub use value::Value;

/// Cooperative cancellation flag shared between the host and a running
/// evaluation. Checked at every command dispatch and loop iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A refused command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub command: String,
    pub reason: String,
}

/// Consulted before every command dispatch.
pub trait CommandGuard: Send + Sync {
    fn check(&self, command: &str) -> Result<(), Denial>;
}

/// What a host command sees of the running evaluation.
pub struct HostContext<'a> {
    pub cancel: &'a CancelToken,
    pub working_dir: Option<&'a Path>,
    pub memory_limit_bytes: u64,
}

/// Failure raised by a host command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// Ordinary script error; catchable.
    Script(String),
    /// Policy refusal; aborts the evaluation.
    Denied { command: String, reason: String },
    Cancelled,
}

impl HostError {
    pub fn script(message: impl Into<String>) -> Self {
        HostError::Script(message.into())
    }
}

/// A command implemented by the host and installed per execution.
pub trait HostCommand: Send + Sync {
    fn call(&self, args: &[Value], cx: &HostContext<'_>) -> Result<Value, HostError>;
}

/// Everything injected into one evaluation.
#[derive(Clone)]
pub struct Bindings {
    pub variables: BTreeMap<String, Value>,
    commands: BTreeMap<String, Arc<dyn HostCommand>>,
    pub guard: Arc<dyn CommandGuard>,
    pub memory_limit_bytes: u64,
    pub working_dir: Option<PathBuf>,
    /// Packages available to `package require` (name -> version).
    pub packages: BTreeMap<String, String>,
}

impl fmt::Debug for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bindings")
            .field("variables", &self.variables.keys().collect::<Vec<_>>())
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .field("memory_limit_bytes", &self.memory_limit_bytes)
            .field("working_dir", &self.working_dir)
            .field("packages", &self.packages)
            .finish()
    }
}

impl Bindings {
    pub fn new(guard: Arc<dyn CommandGuard>, memory_limit_bytes: u64) -> Self {
        Self {
            variables: BTreeMap::new(),
            commands: BTreeMap::new(),
            guard,
            memory_limit_bytes,
            working_dir: None,
            packages: BTreeMap::new(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn install(&mut self, name: impl Into<String>, command: Arc<dyn HostCommand>) {
        self.commands.insert(name.into(), command);
    }

    pub fn command(&self, name: &str) -> Option<&Arc<dyn HostCommand>> {
        self.commands.get(name)
    }

    pub fn command_names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }
}

/// Counters gathered during one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalStats {
    pub commands_executed: u64,
    pub variables_created: u64,
    pub procedures_created: u64,
    pub security_checks: u64,
    pub parse_time_us: u64,
    pub execution_time_us: u64,
    pub peak_memory_bytes: u64,
    pub output_bytes: u64,
}

/// Why an evaluation did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    /// Runtime script error (also what `catch` traps).
    #[error("{message}")]
    Script { message: String },

    #[error("command \"{command}\" denied: {reason}")]
    Denied { command: String, reason: String },

    #[error("evaluation cancelled")]
    Cancelled,

    #[error("memory limit exceeded: {used} bytes used, limit {limit}")]
    MemoryLimit { used: u64, limit: u64 },
}

/// Outcome of [`Interpreter::evaluate`], with whatever output and counters
/// were produced before it finished.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub outcome: Result<Value, EvalError>,
    pub output: String,
    pub stats: EvalStats,
}

/// The interpreter could not be created or returned to a clean state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("interpreter fault: {0}")]
pub struct InterpreterFault(pub String);

/// An embeddable interpreter instance. Owned by one execution at a time.
pub trait Interpreter: Send {
    fn evaluate(&mut self, script: &str, bindings: &Bindings, cancel: &CancelToken) -> Evaluation;

    /// Drop user-defined state (variables, procedures, caches).
    fn reset(&mut self) -> Result<(), InterpreterFault>;

    /// `false` once the instance should not be reused.
    fn is_healthy(&self) -> bool;
}

/// Creates interpreter instances for the pool.
pub trait InterpreterFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Interpreter>, InterpreterFault>;
}
