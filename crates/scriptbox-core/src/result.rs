//! What `execute` hands back: always a value, never a host fault.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::format::OutputFormat;
use crate::pipeline::ExecutionState;

/// Why an execution did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionFailure {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    /// A forbidden command or capability; `command` is set for commands
    /// the script tried to run.
    #[error("policy violation: {reason}")]
    PolicyViolation {
        command: Option<String>,
        capability: Option<String>,
        reason: String,
    },

    #[error("interpreter pool exhausted after {waited_ms} ms (max {max_size})")]
    PoolExhausted { max_size: usize, waited_ms: u64 },

    #[error("{resource} limit exceeded: {used} of {limit}")]
    ResourceExhausted {
        resource: String,
        used: u64,
        limit: u64,
    },

    #[error("engine unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("timed out after {elapsed_ms} ms (limit {limit_ms} ms)")]
    TimedOut { elapsed_ms: u64, limit_ms: u64 },

    #[error("{message}")]
    ScriptError { message: String },

    #[error("output formatting failed: {message}")]
    Format { message: String },

    #[error("storage failure: {message}")]
    Storage { message: String },

    #[error("internal fault: {message}")]
    Internal { message: String },
}

impl ExecutionFailure {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecutionFailure::ScriptError { .. } => 1,
            ExecutionFailure::Validation { .. } => 2,
            ExecutionFailure::PolicyViolation { .. } => 3,
            ExecutionFailure::PoolExhausted { .. }
            | ExecutionFailure::ResourceExhausted { .. }
            | ExecutionFailure::Unavailable { .. } => 4,
            ExecutionFailure::Format { .. } => 5,
            ExecutionFailure::Storage { .. } => 6,
            ExecutionFailure::Internal { .. } => 70,
            ExecutionFailure::TimedOut { .. } => 124,
        }
    }

    /// Terminal pipeline state this failure ends in.
    pub fn terminal_state(&self) -> ExecutionState {
        match self {
            ExecutionFailure::PolicyViolation { .. } => ExecutionState::SecurityViolation,
            ExecutionFailure::TimedOut { .. } => ExecutionState::TimedOut,
            _ => ExecutionState::Failed,
        }
    }

    /// Short kind name, as serialized.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionFailure::Validation { .. } => "validation",
            ExecutionFailure::PolicyViolation { .. } => "policy_violation",
            ExecutionFailure::PoolExhausted { .. } => "pool_exhausted",
            ExecutionFailure::ResourceExhausted { .. } => "resource_exhausted",
            ExecutionFailure::Unavailable { .. } => "unavailable",
            ExecutionFailure::TimedOut { .. } => "timed_out",
            ExecutionFailure::ScriptError { .. } => "script_error",
            ExecutionFailure::Format { .. } => "format",
            ExecutionFailure::Storage { .. } => "storage",
            ExecutionFailure::Internal { .. } => "internal",
        }
    }
}

/// Figures captured for one execution, frozen at release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    /// Wall time from request to result.
    pub duration_ms: u64,
    /// Time spent waiting for an interpreter.
    pub queue_wait_ms: u64,
    /// Time spent evaluating.
    pub execution_ms: u64,
    pub timeout_ms: u64,
    pub peak_memory_bytes: u64,
    pub commands_executed: u64,
    pub variables_created: u64,
    pub procedures_created: u64,
    pub security_checks: u64,
    pub parse_time_us: u64,
    pub interpreter_id: Option<u64>,
    /// `session_reads`, `session_writes`, `output_bytes`, `bindings_installed`.
    pub custom: BTreeMap<String, u64>,
}

/// Outcome of one `execute` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: String,
    pub session_id: Option<String>,
    pub success: bool,
    /// String form of the script's return value.
    pub result: Option<String>,
    /// Structured view of the return value.
    pub value: Option<serde_json::Value>,
    /// Return value rendered in `format`.
    pub formatted: Option<String>,
    pub format: OutputFormat,
    /// Text written with `puts`.
    pub output: String,
    pub error: Option<ExecutionFailure>,
    pub security_violations: Vec<String>,
    pub security_level: String,
    pub final_state: ExecutionState,
    pub exit_code: i32,
    pub metrics: ExecutionMetrics,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let cases = [
            (
                ExecutionFailure::ScriptError {
                    message: "x".into(),
                },
                1,
            ),
            (
                ExecutionFailure::Validation {
                    field: "script".into(),
                    reason: "empty".into(),
                },
                2,
            ),
            (
                ExecutionFailure::PolicyViolation {
                    command: Some("exec".into()),
                    capability: None,
                    reason: "restricted".into(),
                },
                3,
            ),
            (
                ExecutionFailure::PoolExhausted {
                    max_size: 5,
                    waited_ms: 100,
                },
                4,
            ),
            (
                ExecutionFailure::TimedOut {
                    elapsed_ms: 1000,
                    limit_ms: 1000,
                },
                124,
            ),
            (
                ExecutionFailure::Internal {
                    message: "panic".into(),
                },
                70,
            ),
        ];
        for (failure, code) in cases {
            assert_eq!(failure.exit_code(), code, "{failure:?}");
        }
    }

    #[test]
    fn test_failure_serializes_with_kind_tag() {
        let failure = ExecutionFailure::TimedOut {
            elapsed_ms: 1002,
            limit_ms: 1000,
        };
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["kind"], failure.kind());
        assert_eq!(json["elapsed_ms"], 1002);
        let back: ExecutionFailure = serde_json::from_value(json).unwrap();
        assert_eq!(back, failure);
    }

    #[test]
    fn test_terminal_states() {
        let violation = ExecutionFailure::PolicyViolation {
            command: None,
            capability: Some("environment".into()),
            reason: "withheld".into(),
        };
        assert_eq!(violation.terminal_state(), ExecutionState::SecurityViolation);
        assert_eq!(
            ExecutionFailure::Storage {
                message: "down".into()
            }
            .terminal_state(),
            ExecutionState::Failed
        );
    }
}
