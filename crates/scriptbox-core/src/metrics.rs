//! Process-wide atomic counters for the execution engine.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. from the maintenance loop or at shutdown).
//! Per-execution figures live in [`ExecutionMetrics`](crate::result::ExecutionMetrics).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters: no allocations, no locking.
pub struct Metrics {
    executions_started: AtomicU64,
    executions_completed: AtomicU64,
    executions_failed: AtomicU64,
    executions_timed_out: AtomicU64,
    policy_violations: AtomicU64,
    pool_exhausted: AtomicU64,
    interpreters_created: AtomicU64,
    interpreters_destroyed: AtomicU64,
    history_failures: AtomicU64,
}

/// Copy of every counter at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub executions_started: u64,
    pub executions_completed: u64,
    pub executions_failed: u64,
    pub executions_timed_out: u64,
    pub policy_violations: u64,
    pub pool_exhausted: u64,
    pub interpreters_created: u64,
    pub interpreters_destroyed: u64,
    pub history_failures: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($field), "counter incremented");
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            executions_started: AtomicU64::new(0),
            executions_completed: AtomicU64::new(0),
            executions_failed: AtomicU64::new(0),
            executions_timed_out: AtomicU64::new(0),
            policy_violations: AtomicU64::new(0),
            pool_exhausted: AtomicU64::new(0),
            interpreters_created: AtomicU64::new(0),
            interpreters_destroyed: AtomicU64::new(0),
            history_failures: AtomicU64::new(0),
        }
    }

    counter!(inc_executions_started, executions_started);
    counter!(inc_executions_completed, executions_completed);
    counter!(inc_executions_failed, executions_failed);
    counter!(inc_executions_timed_out, executions_timed_out);
    counter!(inc_policy_violations, policy_violations);
    counter!(inc_pool_exhausted, pool_exhausted);
    counter!(inc_interpreters_created, interpreters_created);
    counter!(inc_interpreters_destroyed, interpreters_destroyed);
    counter!(inc_history_failures, history_failures);

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            executions_started: self.executions_started.load(Ordering::Relaxed),
            executions_completed: self.executions_completed.load(Ordering::Relaxed),
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
            executions_timed_out: self.executions_timed_out.load(Ordering::Relaxed),
            policy_violations: self.policy_violations.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            interpreters_created: self.interpreters_created.load(Ordering::Relaxed),
            interpreters_destroyed: self.interpreters_destroyed.load(Ordering::Relaxed),
            history_failures: self.history_failures.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (maintenance tick, shutdown)
    /// rather than on every increment.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            executions_started = s.executions_started,
            executions_completed = s.executions_completed,
            executions_failed = s.executions_failed,
            executions_timed_out = s.executions_timed_out,
            policy_violations = s.policy_violations,
            pool_exhausted = s.pool_exhausted,
            interpreters_created = s.interpreters_created,
            interpreters_destroyed = s.interpreters_destroyed,
            history_failures = s.history_failures,
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.executions_started,
            &self.executions_completed,
            &self.executions_failed,
            &self.executions_timed_out,
            &self.policy_violations,
            &self.pool_exhausted,
            &self.interpreters_created,
            &self.interpreters_destroyed,
            &self.history_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
        m.inc_executions_started();
        m.inc_executions_started();
        m.inc_executions_timed_out();
        m.inc_interpreters_destroyed();

        let s = m.snapshot();
        assert_eq!(s.executions_started, 2);
        assert_eq!(s.executions_timed_out, 1);
        assert_eq!(s.interpreters_destroyed, 1);
        assert_eq!(s.executions_completed, 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_executions_completed();
        m.inc_policy_violations();
        m.inc_pool_exhausted();
        m.inc_history_failures();
        m.reset();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }
}
