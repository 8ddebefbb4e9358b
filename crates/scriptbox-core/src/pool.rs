//! Interpreter pool manager.
//!
//! # Architecture
//!
//! ```text
//! InterpreterPool
//! ├─ slots: Semaphore(max_size)   (FIFO; one permit per lease)
//! ├─ idle:  [Interp, Interp, ...] (reset, ready for reuse)
//! └─ leases held by executions    (exclusive, one interpreter each)
//! ```
//!
//! Every interpreter is created while holding a slot permit, or against
//! the `live` counter for warm instances, so no more than `max_size`
//! interpreters ever exist or run at once. The idle list is the only
//! shared mutable state and is locked for pushes and pops only; no
//! evaluation or reset happens under the lock.
//!
//! A [`Lease`] owns its interpreter and its permit. [`Lease::release`]
//! resets the interpreter and returns it to the idle list, destroying it
//! instead when the reset fails or the instance is unhealthy. Dropping a
//! lease without releasing it destroys the interpreter.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::interp::{Interpreter, InterpreterFactory};
use crate::metrics::METRICS;
use crate::obs;

/// Pool sizing and recycling limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum interpreters alive at once.
    pub max_size: usize,
    /// Warm instances kept idle.
    pub min_idle: usize,
    pub acquire_timeout_ms: u64,
    /// Recycle an instance after this many executions (0 = never).
    pub max_executions_per_instance: u64,
    /// Idle instances older than this are destroyed by [`InterpreterPool::evict_idle`].
    pub max_idle_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            min_idle: 0,
            acquire_timeout_ms: 5_000,
            max_executions_per_instance: 1_000,
            max_idle_secs: 300,
        }
    }
}

impl PoolConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn max_idle_age(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

/// Errors from [`InterpreterPool::acquire`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("interpreter pool exhausted: all {max_size} interpreters busy after waiting {waited_ms} ms")]
    Exhausted { max_size: usize, waited_ms: u64 },

    #[error("interpreter pool is shutting down")]
    ShuttingDown,

    #[error("failed to create interpreter: {0}")]
    Creation(String),
}

/// Result type for pool operations.
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub peak_in_use: usize,
    pub created: u64,
    pub destroyed: u64,
    pub waiters: usize,
    pub closed: bool,
}

/// Outcome of [`InterpreterPool::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// `true` when every lease was returned before the deadline.
    pub drained: bool,
    pub in_flight_remaining: usize,
    pub idle_destroyed: usize,
}

/// An interpreter owned by the pool, with its usage history.
pub struct PooledInterpreter {
    id: u64,
    interpreter: Box<dyn Interpreter>,
    executions: u64,
    last_used: Instant,
}

impl PooledInterpreter {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn interpreter(&mut self) -> &mut dyn Interpreter {
        self.interpreter.as_mut()
    }
}

impl std::fmt::Debug for PooledInterpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledInterpreter")
            .field("id", &self.id)
            .field("executions", &self.executions)
            .finish()
    }
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn InterpreterFactory>,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<PooledInterpreter>>,
    live: AtomicUsize,
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
    waiters: AtomicUsize,
    created: AtomicU64,
    destroyed: AtomicU64,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl PoolInner {
    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<PooledInterpreter>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim room for one more live interpreter.
    fn try_reserve_live(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.config.max_size).then_some(live + 1)
            })
            .is_ok()
    }

    /// Create an interpreter against an already reserved live slot.
    fn create_reserved(&self) -> PoolResult<PooledInterpreter> {
        match self.factory.create() {
            Ok(interpreter) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                self.created.fetch_add(1, Ordering::Relaxed);
                METRICS.inc_interpreters_created();
                obs::emit_interpreter_created(id);
                Ok(PooledInterpreter {
                    id,
                    interpreter,
                    executions: 0,
                    last_used: Instant::now(),
                })
            }
            Err(fault) => {
                self.live.fetch_sub(1, Ordering::AcqRel);
                Err(PoolError::Creation(fault.to_string()))
            }
        }
    }

    fn destroy(&self, id: u64, reason: &str) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        METRICS.inc_interpreters_destroyed();
        obs::emit_interpreter_destroyed(id, reason);
    }

    /// Top the idle list up to `min_idle`, within `max_size`.
    fn replenish(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        while self.idle().len() < self.config.min_idle && self.try_reserve_live() {
            match self.create_reserved() {
                Ok(interp) => self.idle().push(interp),
                Err(err) => {
                    warn!(error = %err, "failed to replenish idle interpreter");
                    break;
                }
            }
        }
    }

    /// Return an interpreter to the idle list or destroy it.
    fn recycle(&self, mut interp: PooledInterpreter) {
        interp.executions += 1;
        interp.last_used = Instant::now();

        let limit = self.config.max_executions_per_instance;
        let reason = if self.closed.load(Ordering::Acquire) {
            Some("pool closed".to_string())
        } else if !interp.interpreter.is_healthy() {
            Some("unhealthy".to_string())
        } else if limit > 0 && interp.executions >= limit {
            Some("execution limit reached".to_string())
        } else {
            interp
                .interpreter
                .reset()
                .err()
                .map(|fault| format!("reset failed: {fault}"))
        };

        match reason {
            None => self.idle().push(interp),
            Some(reason) => {
                self.destroy(interp.id, &reason);
                drop(interp);
                self.replenish();
            }
        }
    }
}

/// Bounded, FIFO-fair pool of interpreters.
#[derive(Clone)]
pub struct InterpreterPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for InterpreterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl InterpreterPool {
    /// Create the pool and warm `min_idle` instances.
    pub fn new(config: PoolConfig, factory: Arc<dyn InterpreterFactory>) -> PoolResult<Self> {
        // tokio's semaphore hands out permits in request order.
        let slots = Arc::new(Semaphore::new(config.max_size));
        let pool = Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                slots,
                idle: Mutex::new(Vec::new()),
                live: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
                peak_in_use: AtomicUsize::new(0),
                waiters: AtomicUsize::new(0),
                created: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        };
        for _ in 0..pool.inner.config.min_idle.min(pool.inner.config.max_size) {
            if !pool.inner.try_reserve_live() {
                break;
            }
            let interp = pool.inner.create_reserved()?;
            pool.inner.idle().push(interp);
        }
        info!(
            max_size = pool.inner.config.max_size,
            min_idle = pool.inner.config.min_idle,
            "interpreter pool ready"
        );
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Wait up to `timeout` for an interpreter.
    pub async fn acquire(&self, timeout: Duration) -> PoolResult<Lease> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::ShuttingDown);
        }

        let started = Instant::now();
        inner.waiters.fetch_add(1, Ordering::AcqRel);
        let permit = tokio::time::timeout(timeout, Arc::clone(&inner.slots).acquire_owned()).await;
        inner.waiters.fetch_sub(1, Ordering::AcqRel);

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(PoolError::ShuttingDown),
            Err(_elapsed) => {
                METRICS.inc_pool_exhausted();
                return Err(PoolError::Exhausted {
                    max_size: inner.config.max_size,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        };
        if inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::ShuttingDown);
        }

        let popped = inner.idle().pop();
        let interp = match popped {
            Some(interp) => interp,
            None => {
                // A permit guarantees room unless warm instances raced us;
                // in that case one of them is idle by now.
                if inner.try_reserve_live() {
                    inner.create_reserved()?
                } else {
                    let popped = inner.idle().pop();
                    match popped {
                        Some(interp) => interp,
                        None => {
                            return Err(PoolError::Creation(
                                "no interpreter available despite a free slot".to_string(),
                            ))
                        }
                    }
                }
            }
        };

        let in_use = inner.in_use.fetch_add(1, Ordering::AcqRel) + 1;
        inner.peak_in_use.fetch_max(in_use, Ordering::AcqRel);
        debug!(
            interpreter_id = interp.id,
            in_use,
            waited_ms = started.elapsed().as_millis() as u64,
            "interpreter acquired"
        );
        Ok(Lease {
            inner: Arc::clone(inner),
            permit: Some(permit),
            interpreter_id: interp.id,
            interpreter: Some(interp),
            finished: false,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            capacity: inner.config.max_size,
            live: inner.live.load(Ordering::Acquire),
            idle: inner.idle().len(),
            in_use: inner.in_use.load(Ordering::Acquire),
            peak_in_use: inner.peak_in_use.load(Ordering::Acquire),
            created: inner.created.load(Ordering::Relaxed),
            destroyed: inner.destroyed.load(Ordering::Relaxed),
            waiters: inner.waiters.load(Ordering::Acquire),
            closed: inner.closed.load(Ordering::Acquire),
        }
    }

    /// Destroy idle instances unused for longer than `max_idle_secs`,
    /// keeping `min_idle`. Returns how many were destroyed.
    pub fn evict_idle(&self) -> usize {
        let inner = &self.inner;
        let max_age = inner.config.max_idle_age();
        let expired: Vec<PooledInterpreter> = {
            let mut idle = inner.idle();
            let mut keep = Vec::with_capacity(idle.len());
            let mut expired = Vec::new();
            // Newest first so the warmest instances are the ones kept.
            idle.sort_by_key(|interp| std::cmp::Reverse(interp.last_used));
            for interp in idle.drain(..) {
                if keep.len() >= inner.config.min_idle && interp.last_used.elapsed() >= max_age {
                    expired.push(interp);
                } else {
                    keep.push(interp);
                }
            }
            keep.reverse();
            *idle = keep;
            expired
        };
        let count = expired.len();
        for interp in expired {
            inner.destroy(interp.id, "idle timeout");
        }
        if count > 0 {
            debug!(evicted = count, "evicted idle interpreters");
        }
        count
    }

    /// Periodically evict idle instances until the pool is dropped or
    /// shut down.
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                InterpreterPool { inner }.evict_idle();
            }
        })
    }

    /// Refuse new acquires, wait for in-flight leases until `deadline`,
    /// then destroy idle instances.
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::Release);
        inner.slots.close();
        info!(in_use = inner.in_use.load(Ordering::Acquire), "pool shutting down");

        let until = tokio::time::Instant::now() + deadline;
        while inner.in_use.load(Ordering::Acquire) > 0 && tokio::time::Instant::now() < until {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let in_flight_remaining = inner.in_use.load(Ordering::Acquire);

        let idle: Vec<PooledInterpreter> = inner.idle().drain(..).collect();
        let idle_destroyed = idle.len();
        for interp in idle {
            inner.destroy(interp.id, "pool shutdown");
        }
        if in_flight_remaining > 0 {
            warn!(in_flight_remaining, "pool shutdown deadline passed with leases outstanding");
        }
        ShutdownReport {
            drained: in_flight_remaining == 0,
            in_flight_remaining,
            idle_destroyed,
        }
    }
}

/// Exclusive use of one interpreter and one pool slot.
///
/// The interpreter can be detached to run on another thread and attached
/// again when it comes back. A lease finished without its interpreter
/// counts the interpreter as destroyed.
pub struct Lease {
    inner: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
    interpreter: Option<PooledInterpreter>,
    interpreter_id: u64,
    finished: bool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("interpreter_id", &self.interpreter_id)
            .field("attached", &self.interpreter.is_some())
            .finish()
    }
}

enum Disposition {
    Recycle,
    Destroy(String),
}

impl Lease {
    pub fn interpreter_id(&self) -> u64 {
        self.interpreter_id
    }

    /// Take the interpreter out, e.g. to move it onto a worker thread.
    pub fn detach(&mut self) -> Option<PooledInterpreter> {
        self.interpreter.take()
    }

    pub fn attach(&mut self, interpreter: PooledInterpreter) {
        self.interpreter = Some(interpreter);
    }

    /// Reset and return the interpreter to the pool (or destroy it if it
    /// cannot be reused), then free the slot.
    pub fn release(mut self) {
        self.finish(Disposition::Recycle);
    }

    /// Destroy the interpreter instead of recycling it.
    pub fn discard(mut self, reason: &str) {
        self.finish(Disposition::Destroy(reason.to_string()));
    }

    fn finish(&mut self, disposition: Disposition) {
        if self.finished {
            return;
        }
        self.finished = true;
        let inner = Arc::clone(&self.inner);

        match (self.interpreter.take(), disposition) {
            (Some(interp), Disposition::Recycle) => inner.recycle(interp),
            (Some(interp), Disposition::Destroy(reason)) => {
                inner.destroy(interp.id, &reason);
                drop(interp);
                inner.replenish();
            }
            (None, disposition) => {
                let reason = match disposition {
                    Disposition::Destroy(reason) => reason,
                    Disposition::Recycle => "abandoned by its execution".to_string(),
                };
                inner.destroy(self.interpreter_id, &reason);
                inner.replenish();
            }
        }

        inner.in_use.fetch_sub(1, Ordering::AcqRel);
        // Freed last so a waiter woken by it finds the recycled instance.
        self.permit.take();
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(Disposition::Destroy("lease dropped without release".to_string()));
        }
    }
}
