//! Worker pool that runs admitted tasks on dedicated OS threads.
//!
//! Each worker thread drives its own single-threaded tokio runtime, so
//! executors may be async or block without stalling the dispatcher. Jobs
//! arrive over a bounded crossbeam channel and every job produces exactly one
//! [`Completion`](crate::core::Completion) on the completion channel the pool
//! was built with.
//!
//! # Example
//!
//! ```rust,ignore
//! use deferred_work::config::WorkerPoolConfig;
//! use deferred_work::core::WorkerPool;
//!
//! let (completions_tx, completions_rx) = crossbeam_channel::unbounded();
//! let pool = WorkerPool::new(WorkerPoolConfig::new().with_worker_count(4), completions_tx)?;
//! pool.submit(job)?;
//! let completion = completions_rx.recv()?;
//! pool.shutdown();
//! ```

mod native;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::executor::TaskExecutor;
use super::record::TaskRecord;
use super::SchedulerError;

pub use native::WorkerPool;

/// Errors that can occur when using a `WorkerPool`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The job channel is full; no more jobs can be accepted right now.
    #[error("task queue is full")]
    QueueFull,
    /// The pool has been shut down.
    #[error("pool has been shut down")]
    PoolShutdown,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Internal error (worker thread spawn failure, channel closed, etc.).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<PoolError> for SchedulerError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::PoolShutdown => Self::PoolShutdown,
            PoolError::InvalidConfig(msg) => Self::InvalidConfig(msg),
            other => Self::ExecutorFailure(other.to_string()),
        }
    }
}

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Currently executing jobs.
    pub active_tasks: u64,
    /// Jobs waiting in the channel.
    pub queued_tasks: u64,
    /// Jobs that produced a completion.
    pub completed_tasks: u64,
    /// Jobs whose executor panicked, timed out or never ran.
    pub failed_tasks: u64,
    /// Jobs abandoned after their deadline and grace period.
    pub timed_out_tasks: u64,
    /// Jobs accepted by `submit`.
    pub submitted_tasks: u64,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub active_tasks: AtomicU64,
    pub queued_tasks: AtomicU64,
    pub completed_tasks: AtomicU64,
    pub failed_tasks: AtomicU64,
    pub timed_out_tasks: AtomicU64,
    pub submitted_tasks: AtomicU64,
}

impl PoolCounters {
    /// Get a snapshot of current statistics.
    pub fn snapshot(&self, worker_count: usize) -> PoolStats {
        PoolStats {
            worker_count,
            active_tasks: self.active_tasks.load(Ordering::Relaxed),
            queued_tasks: self.queued_tasks.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            timed_out_tasks: self.timed_out_tasks.load(Ordering::Relaxed),
            submitted_tasks: self.submitted_tasks.load(Ordering::Relaxed),
        }
    }

    /// Jobs queued or executing.
    pub fn in_flight(&self) -> u64 {
        self.queued_tasks.load(Ordering::Acquire) + self.active_tasks.load(Ordering::Acquire)
    }
}

/// One admitted run handed to the pool.
pub struct WorkerJob {
    /// Snapshot of the running record.
    pub record: TaskRecord,
    /// Executor for the record's kind.
    pub executor: Arc<dyn TaskExecutor>,
    /// Token shared with the dispatcher.
    pub cancel: CancellationToken,
    /// Deadline for the run.
    pub timeout: Duration,
    /// Time the executor gets to return after the deadline cancels its token.
    pub grace: Duration,
}

impl fmt::Debug for WorkerJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerJob")
            .field("task_id", &self.record.id)
            .field("identifier", &self.record.identifier())
            .field("timeout", &self.timeout)
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_display() {
        assert_eq!(PoolError::QueueFull.to_string(), "task queue is full");
        assert_eq!(
            PoolError::InvalidConfig("worker_count".into()).to_string(),
            "invalid configuration: worker_count"
        );
        assert_eq!(
            SchedulerError::from(PoolError::PoolShutdown),
            SchedulerError::PoolShutdown
        );
    }

    #[test]
    fn test_pool_counters_snapshot() {
        let counters = PoolCounters::default();
        counters.submitted_tasks.fetch_add(10, Ordering::Relaxed);
        counters.completed_tasks.fetch_add(5, Ordering::Relaxed);
        counters.queued_tasks.fetch_add(2, Ordering::Relaxed);
        counters.active_tasks.fetch_add(3, Ordering::Relaxed);

        let stats = counters.snapshot(4);
        assert_eq!(stats.worker_count, 4);
        assert_eq!(stats.submitted_tasks, 10);
        assert_eq!(stats.completed_tasks, 5);
        assert_eq!(counters.in_flight(), 5);
    }
}
