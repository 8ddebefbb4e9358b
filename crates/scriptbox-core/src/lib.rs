//! scriptbox-core: policy-constrained, pooled execution of untrusted scripts
//!
//! # Modules
//!
//! - `policy`: security levels, capabilities, custom policies, preflight scan
//! - `context`: request validation into an immutable `ExecutionContext`
//! - `interp`: interpreter capability and the built-in Tcl-family interpreter
//! - `host`: policy-filtered host commands (`session`, `env`, `file`, `exec`)
//! - `pool`: bounded interpreter pool with RAII leases
//! - `pipeline`: the per-execution state machine
//! - `engine`: `ScriptEngine`, tying pool, stores and pipeline together
//! - `format`: rendering results as plain, JSON, XML, YAML, table, CSV, Markdown
//! - `config`: `EngineConfig` from TOML and `SCRIPTBOX_*` variables
//! - `metrics`, `obs`, `telemetry`: counters, lifecycle events, tracing setup

pub mod config;
pub mod context;
pub mod engine;
pub mod format;
pub mod host;
pub mod interp;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod policy;
pub mod pool;
pub mod result;
pub mod telemetry;

pub use config::{ConfigError, EngineConfig, ExecutionConfig, HistoryConfig, SessionConfig};
pub use context::{
    ContextBuilder, ContextError, ContextLimits, ExecuteRequest, ExecutionContext, ExecutionMode,
    ValidationError,
};
pub use engine::{EngineError, EngineResult, MaintenanceReport, ScriptEngine};
pub use format::{format_value, FormatError, OutputFormat};
pub use interp::{
    Bindings, CancelToken, EvalError, Evaluation, Interpreter, InterpreterFactory, TclFactory,
    Value,
};
pub use metrics::{MetricsSnapshot, METRICS};
pub use pipeline::{ExecutionState, StateTracker};
pub use policy::{Capability, PolicyError, SecurityLevel, SecurityPolicy};
pub use pool::{InterpreterPool, Lease, PoolConfig, PoolError, PoolStats, ShutdownReport};
pub use result::{ExecutionFailure, ExecutionMetrics, ExecutionResult};

pub use scriptbox_state::{
    HistoryEntry, HistoryQuery, HistoryRetention, SessionId, SessionRecord, StorageBackend,
    Stores,
};
