//! `WorkerPool` on OS threads.
//!
//! Workers block on the job channel, run each job to completion (or to its
//! deadline plus grace) inside their own runtime, and report back over the
//! completion channel. Dropping the job sender unblocks idle workers.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use super::{PoolCounters, PoolError, PoolStats, WorkerJob};
use crate::config::WorkerPoolConfig;
use crate::core::dispatcher::Completion;
use crate::core::executor::ExecutionResult;
use crate::core::SchedulerError;

/// How long `shutdown` waits for each worker to exit before detaching it.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Worker pool with dedicated OS threads.
///
/// The pool never touches task records: it reports a
/// [`Completion`] per job and the dispatcher applies it.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    job_tx: Mutex<Option<Sender<WorkerJob>>>,
    counters: Arc<PoolCounters>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Spawn `config.worker_count` worker threads reporting to `completions`.
    ///
    /// # Errors
    ///
    /// `PoolError::InvalidConfig` for an invalid configuration and
    /// `PoolError::Internal` when a thread cannot be spawned.
    pub fn new(config: WorkerPoolConfig, completions: Sender<Completion>) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let (job_tx, job_rx) = bounded::<WorkerJob>(config.max_queue_depth);
        let counters = Arc::new(PoolCounters::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let worker = spawn_worker(
                worker_id,
                job_rx.clone(),
                completions.clone(),
                Arc::clone(&counters),
                Arc::clone(&shutdown),
                config.thread_stack_size,
            )?;
            workers.push(worker);
        }

        info!(
            worker_count = config.worker_count,
            max_queue_depth = config.max_queue_depth,
            "worker pool started"
        );

        Ok(Self {
            config,
            job_tx: Mutex::new(Some(job_tx)),
            counters,
            shutdown,
            workers: Mutex::new(workers),
        })
    }

    /// Enqueue a job without blocking.
    ///
    /// # Errors
    ///
    /// - `PoolError::QueueFull` if the job channel is full
    /// - `PoolError::PoolShutdown` if the pool has been shut down
    pub fn submit(&self, job: WorkerJob) -> Result<(), PoolError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::PoolShutdown);
        }
        let task_id = job.record.id;

        let job_tx = self.job_tx.lock();
        let Some(job_tx) = job_tx.as_ref() else {
            return Err(PoolError::PoolShutdown);
        };

        // Counted before sending so a fast worker never decrements first.
        self.counters.queued_tasks.fetch_add(1, Ordering::AcqRel);
        match job_tx.try_send(job) {
            Ok(()) => {
                self.counters.submitted_tasks.fetch_add(1, Ordering::Relaxed);
                debug!(task_id, "job submitted to worker pool");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.counters.queued_tasks.fetch_sub(1, Ordering::AcqRel);
                warn!(task_id, "worker pool queue is full");
                Err(PoolError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.queued_tasks.fetch_sub(1, Ordering::AcqRel);
                Err(PoolError::PoolShutdown)
            }
        }
    }

    /// Jobs queued or executing.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        usize::try_from(self.counters.in_flight()).unwrap_or(usize::MAX)
    }

    /// Number of worker threads.
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.config.worker_count
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.config.worker_count)
    }

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Shut down the pool.
    ///
    /// Drops the job sender to unblock idle workers, then joins each worker
    /// for up to two seconds. Jobs still queued are reported as
    /// `PoolShutdown` completions. Workers that don't exit in time are
    /// detached.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("shutting down worker pool");
        *self.job_tx.lock() = None;

        let mut workers = self.workers.lock();
        let worker_count = workers.len();
        for (idx, worker) in workers.drain(..).enumerate() {
            let (tx, rx) = bounded(1);
            let joiner = thread::spawn(move || {
                let _ = tx.send(worker.join().is_ok());
            });

            match rx.recv_timeout(SHUTDOWN_JOIN_TIMEOUT) {
                Ok(true) => debug!(worker_id = idx, "worker joined"),
                Ok(false) => warn!(worker_id = idx, "worker panicked"),
                Err(_) => {
                    warn!(worker_id = idx, "worker did not exit within timeout, detaching");
                    continue;
                }
            }
            let _ = joiner.join();
        }

        info!(worker_count, "worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Never join in Drop; a stuck executor would hang the caller.
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            *self.job_tx.lock() = None;
            debug!("worker pool dropped without explicit shutdown, workers detached");
        }
    }
}

fn spawn_worker(
    worker_id: usize,
    job_rx: Receiver<WorkerJob>,
    completions: Sender<Completion>,
    counters: Arc<PoolCounters>,
    shutdown: Arc<AtomicBool>,
    stack_size: usize,
) -> Result<JoinHandle<()>, PoolError> {
    thread::Builder::new()
        .name(format!("deferred-worker-{worker_id}"))
        .stack_size(stack_size)
        .spawn(move || {
            debug!(worker_id, "worker thread started");

            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(worker_id, error = %e, "failed to create worker runtime");
                    return;
                }
            };

            while let Ok(job) = job_rx.recv() {
                counters.queued_tasks.fetch_sub(1, Ordering::AcqRel);
                let task_id = job.record.id;

                let result = if shutdown.load(Ordering::Acquire) {
                    debug!(worker_id, task_id, "pool shutting down, job not run");
                    Err(SchedulerError::PoolShutdown)
                } else {
                    counters.active_tasks.fetch_add(1, Ordering::AcqRel);
                    debug!(
                        worker_id,
                        task_id,
                        identifier = job.record.identifier(),
                        attempt = job.record.attempt_count,
                        "worker executing task"
                    );
                    let result = rt.block_on(run_job(job));
                    counters.active_tasks.fetch_sub(1, Ordering::AcqRel);
                    result
                };

                match &result {
                    Ok(_) => {}
                    Err(SchedulerError::ExecutorTimeout(_)) => {
                        counters.timed_out_tasks.fetch_add(1, Ordering::Relaxed);
                        counters.failed_tasks.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        counters.failed_tasks.fetch_add(1, Ordering::Relaxed);
                    }
                }
                counters.completed_tasks.fetch_add(1, Ordering::Relaxed);

                if completions.send(Completion::new(task_id, result)).is_err() {
                    debug!(worker_id, task_id, "completion receiver dropped");
                }
            }

            // Blocking closures past their grace period are left to finish on their own.
            rt.shutdown_background();
            debug!(worker_id, "worker thread exiting");
        })
        .map_err(|e| PoolError::Internal(format!("failed to spawn worker thread: {e}")))
}

/// Run one job on the current runtime, enforcing its deadline.
///
/// The executor runs as a spawned task so a panic surfaces as a `JoinError`.
/// At the deadline the token is cancelled; a result that arrives within the
/// grace period is kept, otherwise the task is aborted.
async fn run_job(job: WorkerJob) -> Result<ExecutionResult, SchedulerError> {
    let WorkerJob {
        record,
        executor,
        cancel,
        timeout,
        grace,
    } = job;
    let task_id = record.id;
    let token = cancel.clone();
    let mut handle = tokio::spawn(async move { executor.execute(record, token).await });

    if let Ok(joined) = tokio::time::timeout(timeout, &mut handle).await {
        return joined.map_err(join_failure);
    }

    cancel.cancel();
    debug!(task_id, timeout_ms = timeout.as_millis(), "deadline passed, cancelling executor");
    if let Ok(joined) = tokio::time::timeout(grace, &mut handle).await {
        return joined.map_err(join_failure);
    }

    handle.abort();
    warn!(task_id, timeout_ms = timeout.as_millis(), "executor abandoned after grace period");
    Err(SchedulerError::ExecutorTimeout(timeout))
}

fn join_failure(err: JoinError) -> SchedulerError {
    if err.is_panic() {
        let payload = err.into_panic();
        let message = panic_message(payload.as_ref());
        SchedulerError::ExecutorFailure(format!("executor panicked: {message}"))
    } else {
        SchedulerError::ExecutorFailure("executor task was cancelled".to_string())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::executor::{FnExecutor, TaskExecutor};
    use crate::core::{ExecutionPolicy, TaskRecord, TaskRequest};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct Sleepy {
        honour_cancel: bool,
    }

    #[async_trait]
    impl TaskExecutor for Sleepy {
        async fn execute(&self, _task: TaskRecord, cancel: CancellationToken) -> ExecutionResult {
            if self.honour_cancel {
                cancel.cancelled().await;
                return ExecutionResult::retry();
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
            ExecutionResult::success()
        }
    }

    fn job(id: u64, executor: Arc<dyn TaskExecutor>, timeout: Duration) -> WorkerJob {
        WorkerJob {
            record: TaskRecord::new(
                id,
                Arc::new(TaskRequest::one_shot(format!("job-{id}"))),
                ExecutionPolicy::Keep,
                0,
            ),
            executor,
            cancel: CancellationToken::new(),
            timeout,
            grace: Duration::from_millis(50),
        }
    }

    fn pool(workers: usize) -> (WorkerPool, Receiver<Completion>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let config = WorkerPoolConfig::new()
            .with_worker_count(workers)
            .with_max_queue_depth(16);
        (WorkerPool::new(config, tx).unwrap(), rx)
    }

    #[test]
    fn test_worker_pool_reports_result() {
        let (pool, rx) = pool(2);
        let executor = Arc::new(FnExecutor::new(|task: &TaskRecord, _: &CancellationToken| {
            ExecutionResult::success_with(serde_json::json!(task.id))
        }));
        pool.submit(job(7, executor, Duration::from_secs(5))).unwrap();

        let completion = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(completion.id, 7);
        assert_eq!(
            completion.result,
            Ok(ExecutionResult::success_with(serde_json::json!(7)))
        );
        pool.shutdown();
        assert_eq!(pool.stats().completed_tasks, 1);
    }

    #[test]
    fn test_worker_pool_catches_panics() {
        let (pool, rx) = pool(1);
        let executor = Arc::new(FnExecutor::new(|_: &TaskRecord, _: &CancellationToken| -> ExecutionResult {
            panic!("boom")
        }));
        pool.submit(job(1, executor, Duration::from_secs(5))).unwrap();

        let completion = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            completion.result,
            Err(SchedulerError::ExecutorFailure("executor panicked: boom".into()))
        );
        pool.shutdown();
    }

    #[test]
    fn test_worker_pool_grace_keeps_cooperative_result() {
        let (pool, rx) = pool(1);
        let executor = Arc::new(Sleepy { honour_cancel: true });
        pool.submit(job(1, executor, Duration::from_millis(20))).unwrap();

        let completion = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(completion.result, Ok(ExecutionResult::retry()));
        pool.shutdown();
    }

    #[test]
    fn test_worker_pool_times_out_stuck_executor() {
        let (pool, rx) = pool(1);
        let executor = Arc::new(Sleepy { honour_cancel: false });
        pool.submit(job(1, executor, Duration::from_millis(20))).unwrap();

        let completion = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            completion.result,
            Err(SchedulerError::ExecutorTimeout(Duration::from_millis(20)))
        );
        pool.shutdown();
        assert_eq!(pool.stats().timed_out_tasks, 1);
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let (pool, _rx) = pool(1);
        pool.shutdown();
        let executor = Arc::new(Sleepy { honour_cancel: true });
        assert_eq!(
            pool.submit(job(1, executor, Duration::from_secs(1))).unwrap_err(),
            PoolError::PoolShutdown
        );
    }
}
