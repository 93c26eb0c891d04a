//! Job scheduling and graceful shutdown.
//!
//! Accepted webhooks are handed to a [`JobExecutor`]; the in-process
//! implementation runs each job on its own task, bounded by
//! `max_concurrency` permits. Over-limit submissions are rejected rather
//! than queued - the webhook sender retries, and an unbounded queue would
//! only hide overload.
//!
//! Shutdown happens in two phases. [`ShutdownState::begin_shutdown`] stops
//! new submissions; running jobs drain within the grace period. Jobs still
//! running at the deadline see [`ShutdownState::is_cancelled`] flip and
//! unwind through the pipeline's cancellation path, which repairs ticket
//! tags before the task ends.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, Semaphore, TryAcquireError};

/// A boxed job future.
pub type BoxedJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Why a submission was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The service is draining; no new work is accepted.
    #[error("dispatcher is shutting down")]
    ShuttingDown,

    /// Every worker permit is taken.
    #[error("dispatcher is at capacity")]
    AtCapacity,
}

/// Process-wide shutdown and cancellation flags, shared by the ingress,
/// the dispatcher, and running jobs.
#[derive(Clone, Default)]
pub struct ShutdownState {
    shutting_down: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

impl ShutdownState {
    /// Creates a running (not shutting down) state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether new work is refused.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Whether running jobs must unwind now.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Enters the drain phase: refuse new work, let running jobs finish.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Enters the forced phase: running jobs unwind at their next
    /// suspension point.
    pub fn cancel_running_jobs(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// The scheduling seam between ingress and pipeline.
pub trait JobExecutor: Send + Sync {
    /// Submits a job for background execution.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] when the service is draining or at
    /// capacity; the ingress answers 503 in both cases.
    fn try_dispatch(&self, job: BoxedJob) -> Result<(), DispatchError>;

    /// Waits for running jobs to finish, up to `grace`. Returns true when
    /// everything drained in time.
    fn drain(&self, grace: Duration) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

/// In-process executor: one task per job, bounded by permits.
pub struct InProcessExecutor {
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    shutdown: ShutdownState,
}

impl InProcessExecutor {
    /// Creates an executor with the given concurrency bound.
    #[must_use]
    pub fn new(max_concurrency: usize, shutdown: ShutdownState) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            active: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
            shutdown,
        }
    }

    /// Number of currently running jobs.
    #[must_use]
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    async fn drain_jobs(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.active.load(Ordering::SeqCst) == 0 {
                return true;
            }
            let notified = self.drained.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.active.load(Ordering::SeqCst) == 0;
            }
        }
    }
}

impl JobExecutor for InProcessExecutor {
    fn try_dispatch(&self, job: BoxedJob) -> Result<(), DispatchError> {
        if self.shutdown.is_shutting_down() {
            return Err(DispatchError::ShuttingDown);
        }
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Err(DispatchError::AtCapacity),
            Err(TryAcquireError::Closed) => return Err(DispatchError::ShuttingDown),
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        let active = Arc::clone(&self.active);
        let drained = Arc::clone(&self.drained);
        tokio::spawn(async move {
            job.await;
            drop(permit);
            active.fetch_sub(1, Ordering::SeqCst);
            drained.notify_waiters();
        });
        Ok(())
    }

    fn drain(&self, grace: Duration) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(self.drain_jobs(grace))
    }
}
