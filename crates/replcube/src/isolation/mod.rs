//! Disposable execution units
//!
//! Every execution gets a fresh [`IsolationUnit`] loaded from the shared
//! [`IsolationDomain`]. The unit owns the compiled code, the task running it
//! and the captured output. Releasing the unit drops all of them, which is
//! what makes per-execution memory reclaimable.
//!
//! # Release
//!
//! Call [`IsolationUnit::unload`] on every path. If a unit is dropped without
//! it, `Drop` releases it and logs a warning.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

pub use crate::isolation::monitor::ResourceMonitor;
use crate::engine::{
    CompiledUnit, Completion, ContinuationToken, ExecutionContext, ExecutionFault, OutputBuffer,
};
use crate::types::Value;

mod monitor;

/// How long an aborted task gets to wind down before cleanup is called degraded
const ABORT_GRACE: Duration = Duration::from_millis(50);

/// Errors from the isolation layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IsolationError {
    #[error("isolation domain is closed and cannot load new units")]
    Unavailable,

    #[error("unit {generation} has already been run")]
    AlreadyRun { generation: u64 },

    #[error("unit {generation} was released while its task was still running")]
    StillRunning { generation: u64 },
}

/// What happened when a unit ran
#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        value: Option<Value>,
        continuation: ContinuationToken,
    },
    Faulted(ExecutionFault),
    TimedOut(Duration),
    Cancelled,
    MemoryExceeded {
        usage: u64,
        limit: u64,
    },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }
}

#[derive(Debug, Default)]
struct Counters {
    loaded: AtomicU64,
    released: AtomicU64,
    degraded: AtomicU64,
}

/// Snapshot of domain activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DomainStats {
    pub capacity: usize,
    pub available: usize,
    /// Units loaded but not yet released
    pub live: u64,
    pub loaded: u64,
    pub released: u64,
    /// Units released while their task was still running
    pub degraded: u64,
}

/// Loads units and caps how many are live at once
#[derive(Debug)]
pub struct IsolationDomain {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    next_generation: AtomicU64,
    counters: Arc<Counters>,
}

impl IsolationDomain {
    pub fn new(max_units: usize) -> Self {
        let capacity = max_units.max(1);
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            next_generation: AtomicU64::new(1),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Load a compiled unit, waiting for capacity if every slot is in use
    #[instrument(skip(self, compiled))]
    pub async fn load(
        &self,
        compiled: Box<dyn CompiledUnit>,
        output_limit: usize,
    ) -> Result<IsolationUnit, IsolationError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| IsolationError::Unavailable)?;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        self.counters.loaded.fetch_add(1, Ordering::SeqCst);
        debug!(generation, "unit loaded");

        Ok(IsolationUnit {
            generation,
            compiled: Some(compiled),
            output: OutputBuffer::new(output_limit),
            task: None,
            counters: Arc::clone(&self.counters),
            released: false,
            permit: Some(permit),
        })
    }

    /// Stop accepting loads; units already loaded are unaffected
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn stats(&self) -> DomainStats {
        let loaded = self.counters.loaded.load(Ordering::SeqCst);
        let released = self.counters.released.load(Ordering::SeqCst);
        DomainStats {
            capacity: self.capacity,
            available: self.semaphore.available_permits(),
            live: loaded.saturating_sub(released),
            loaded,
            released,
            degraded: self.counters.degraded.load(Ordering::SeqCst),
        }
    }
}

/// One loaded, runnable, disposable execution
#[derive(Debug)]
pub struct IsolationUnit {
    generation: u64,
    compiled: Option<Box<dyn CompiledUnit>>,
    output: OutputBuffer,
    task: Option<JoinHandle<Result<Completion, ExecutionFault>>>,
    counters: Arc<Counters>,
    released: bool,
    permit: Option<OwnedSemaphorePermit>,
}

impl IsolationUnit {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Output captured so far
    pub fn output(&self) -> String {
        self.output.contents()
    }

    /// Run the unit once under supervision
    ///
    /// The unit's task gets a child of `cancel`, so a caller abort, the
    /// timeout and the memory monitor all stop it through one signal. The
    /// unit must yield for that to take effect.
    #[instrument(skip(self, cancel, monitor), fields(generation = self.generation))]
    pub async fn run(
        &mut self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        monitor: &ResourceMonitor,
    ) -> Result<RunOutcome, IsolationError> {
        let compiled = self.compiled.take().ok_or(IsolationError::AlreadyRun {
            generation: self.generation,
        })?;

        let stop = cancel.child_token();
        let ctx = ExecutionContext::new(stop.clone(), self.output.clone());
        let mut task = tokio::spawn(compiled.run(ctx));

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut finished = false;
        let outcome = tokio::select! {
            biased;
            joined = &mut task => {
                finished = true;
                match joined {
                    Ok(Ok(Completion { value, continuation })) => {
                        RunOutcome::Completed { value, continuation }
                    }
                    Ok(Err(fault)) if cancel.is_cancelled() => {
                        debug!(%fault, "unit stopped after abort");
                        RunOutcome::Cancelled
                    }
                    Ok(Err(fault)) => RunOutcome::Faulted(fault),
                    Err(e) if e.is_panic() => RunOutcome::Faulted(ExecutionFault::new(
                        "ExecutionEngineException",
                        "the execution terminated unexpectedly",
                    )),
                    Err(_) => RunOutcome::Cancelled,
                }
            }
            _ = cancel.cancelled() => RunOutcome::Cancelled,
            _ = &mut deadline => RunOutcome::TimedOut(timeout.unwrap_or_default()),
            Some(usage) = monitor.supervise(&stop) => RunOutcome::MemoryExceeded {
                usage,
                limit: monitor.limit(),
            },
        };

        stop.cancel();
        if finished {
            return Ok(outcome);
        }

        task.abort();
        if tokio::time::timeout(ABORT_GRACE, &mut task).await.is_err() {
            warn!(
                generation = self.generation,
                "unit did not stop within the abort grace period"
            );
            self.task = Some(task);
        }
        debug!(?outcome, "unit stopped early");
        Ok(outcome)
    }

    /// Release the unit
    ///
    /// Returns [`IsolationError::StillRunning`] when the unit's task ignored
    /// cancellation. The unit is released either way.
    #[must_use = "a degraded release should be reported"]
    #[instrument(skip(self), fields(generation = self.generation))]
    pub fn unload(mut self) -> Result<(), IsolationError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), IsolationError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.compiled = None;

        let mut result = Ok(());
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                task.abort();
                self.counters.degraded.fetch_add(1, Ordering::SeqCst);
                warn!(generation = self.generation, "unit released with a live task");
                result = Err(IsolationError::StillRunning {
                    generation: self.generation,
                });
            }
        }

        self.counters.released.fetch_add(1, Ordering::SeqCst);
        self.permit = None;
        debug!(generation = self.generation, "unit released");
        result
    }
}

impl Drop for IsolationUnit {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                generation = self.generation,
                "IsolationUnit dropped without unload(); releasing now"
            );
            let _ = self.release();
        }
    }
}
