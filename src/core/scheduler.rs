//! The public scheduling facade.
//!
//! A [`Scheduler`] owns the dispatcher behind one `parking_lot` mutex, the
//! worker pool, and the completion channel between them. It can be driven by
//! hand ([`Scheduler::tick`] plus [`Scheduler::wait_for_completions`]) or by
//! the background dispatch loop started with [`Scheduler::start`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::dispatcher::{Completion, Dispatcher, TickReport};
use super::environment::{EnvironmentProvider, EnvironmentSnapshot};
use super::executor::ExecutorSet;
use super::policy::ExecutionPolicy;
use super::record::{TaskId, TaskRecord, TaskState};
use super::request::TaskRequest;
use super::worker_pool::{PoolError, PoolStats, WorkerJob, WorkerPool};
use super::SchedulerError;
use crate::builders::SchedulerBuilder;
use crate::config::SchedulerConfig;
use crate::util::clock::Clock;

/// Wake-up signals for the dispatch loop. Wakes coalesce: when the channel
/// is full a tick is already on its way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchSignal {
    Wake,
    Shutdown,
}

const SIGNAL_CAPACITY: usize = 16;

/// Parts assembled by [`SchedulerBuilder`].
pub(crate) struct SchedulerParts {
    pub config: SchedulerConfig,
    pub dispatcher: Dispatcher,
    pub executors: ExecutorSet,
    pub clock: Arc<dyn Clock>,
    pub environment: Option<Arc<dyn EnvironmentProvider>>,
}

/// Background task scheduler.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use deferred_work::config::SchedulerConfig;
/// use deferred_work::core::{
///     ExecutionPolicy, ExecutionResult, FnExecutor, Scheduler, TaskRecord, TaskRequest,
/// };
/// use tokio_util::sync::CancellationToken;
///
/// let executor = Arc::new(FnExecutor::new(|_: &TaskRecord, _: &CancellationToken| {
///     ExecutionResult::success()
/// }));
/// let scheduler = Arc::new(
///     Scheduler::builder(SchedulerConfig::default())
///         .executor(executor)
///         .build()
///         .expect("valid configuration"),
/// );
/// scheduler.start().expect("dispatch loop");
/// scheduler
///     .schedule(TaskRequest::one_shot("sync-inbox"), ExecutionPolicy::Keep)
///     .expect("scheduled");
/// scheduler.shutdown();
/// ```
pub struct Scheduler {
    config: SchedulerConfig,
    dispatcher: Mutex<Dispatcher>,
    pool: WorkerPool,
    completions: Receiver<Completion>,
    signal_tx: Sender<DispatchSignal>,
    signal_rx: Receiver<DispatchSignal>,
    clock: Arc<dyn Clock>,
    environment: Option<Arc<dyn EnvironmentProvider>>,
    executors: ExecutorSet,
    dispatch_loop: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("executors", &self.executors)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Start building a scheduler from `config`.
    #[must_use]
    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(config)
    }

    pub(crate) fn from_parts(parts: SchedulerParts) -> Result<Self, SchedulerError> {
        let SchedulerParts {
            config,
            dispatcher,
            executors,
            clock,
            environment,
        } = parts;
        let (completion_tx, completions) = crossbeam_channel::unbounded();
        let pool = WorkerPool::new(config.pool.clone(), completion_tx)?;
        let (signal_tx, signal_rx) = bounded(SIGNAL_CAPACITY);

        info!(
            worker_count = config.pool.worker_count,
            tick_interval_ms = config.tick_interval_ms,
            "scheduler created"
        );

        Ok(Self {
            config,
            dispatcher: Mutex::new(dispatcher),
            pool,
            completions,
            signal_tx,
            signal_rx,
            clock,
            environment,
            executors,
            dispatch_loop: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Schedule `request` under `policy` and return a snapshot of the new
    /// record.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::TaskAlreadyExists`] under `Keep` when an active
    /// record exists, [`SchedulerError::InvalidRequest`] for malformed
    /// requests and [`SchedulerError::PoolShutdown`] after shutdown.
    pub fn schedule(
        &self,
        request: TaskRequest,
        policy: ExecutionPolicy,
    ) -> Result<TaskRecord, SchedulerError> {
        if self.is_shut_down() {
            return Err(SchedulerError::PoolShutdown);
        }
        let now = self.clock.now_ms();
        let record = self.dispatcher.lock().schedule(request, policy, now)?;
        self.wake();
        Ok(record)
    }

    /// Cancel the active records with `identifier`. False when none changed.
    pub fn cancel(&self, identifier: &str) -> bool {
        let now = self.clock.now_ms();
        let cancelled = self.dispatcher.lock().cancel(identifier, now);
        self.wake();
        cancelled
    }

    /// Cancel one record by id and return its state afterwards. A running
    /// record stays `Running` until its executor returns.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::TaskNotFound`] for an unknown id.
    pub fn cancel_by_id(&self, id: TaskId) -> Result<TaskState, SchedulerError> {
        let now = self.clock.now_ms();
        let state = self.dispatcher.lock().cancel_by_id(id, now)?;
        self.wake();
        Ok(state)
    }

    /// Cancel every active record carrying `tag`.
    pub fn cancel_by_tag(&self, tag: &str) -> usize {
        let now = self.clock.now_ms();
        let count = self.dispatcher.lock().cancel_by_tag(tag, now);
        self.wake();
        count
    }

    /// Cancel every active record. Records that stopped immediately are
    /// removed from the catalog.
    pub fn cancel_all(&self) -> usize {
        let now = self.clock.now_ms();
        let count = self.dispatcher.lock().cancel_all(now);
        self.wake();
        count
    }

    /// Snapshots of every record with `identifier`, oldest first.
    #[must_use]
    pub fn get_by_identifier(&self, identifier: &str) -> Vec<TaskRecord> {
        self.dispatcher
            .lock()
            .catalog()
            .by_identifier(identifier)
            .cloned()
            .collect()
    }

    /// Snapshot of one record.
    #[must_use]
    pub fn get_by_id(&self, id: TaskId) -> Option<TaskRecord> {
        self.dispatcher.lock().catalog().get(id).cloned()
    }

    /// Snapshots of every record, sorted by id.
    #[must_use]
    pub fn records(&self) -> Vec<TaskRecord> {
        self.dispatcher.lock().catalog().iter().cloned().collect()
    }

    /// Records waiting to run (`Pending` or `Scheduled`).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.dispatcher.lock().catalog().waiting_count()
    }

    /// Records currently `Running`.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.dispatcher.lock().catalog().count_in(TaskState::Running)
    }

    /// Records in `Completed`.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.dispatcher
            .lock()
            .catalog()
            .count_in(TaskState::Completed)
    }

    /// Replace the environment snapshot. When an environment provider is
    /// configured, the next tick overwrites it with a fresh poll.
    pub fn set_context(&self, environment: EnvironmentSnapshot) {
        self.dispatcher.lock().set_context(environment);
        self.wake();
    }

    /// Remove terminal records. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = self.clock.now_ms();
        self.dispatcher.lock().prune(now)
    }

    /// Worker pool statistics.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Apply finished runs, poll the environment, then admit what is due
    /// onto the worker pool.
    pub fn tick(&self) -> TickReport {
        let environment = self.environment.as_ref().map(|p| p.snapshot());
        let now = self.clock.now_ms();
        let mut dispatcher = self.dispatcher.lock();

        let mut completions = Vec::new();
        while let Ok(completion) = self.completions.try_recv() {
            let id = completion.id;
            if let Some(state) = dispatcher.complete(completion, now) {
                completions.push((id, state));
            }
        }
        if let Some(environment) = environment {
            dispatcher.set_context(environment);
        }

        let budget = if self.is_shut_down() {
            0
        } else {
            let busy = dispatcher
                .catalog()
                .count_in(TaskState::Running)
                .max(self.pool.in_flight());
            self.pool.worker_count().saturating_sub(busy)
        };

        let mut report = dispatcher.tick(now, budget);
        report.completions = completions;

        let admitted = std::mem::take(&mut report.admitted);
        for admission in admitted {
            let job = WorkerJob {
                record: admission.record.clone(),
                executor: self.executors.for_kind(admission.record.request.kind()),
                cancel: admission.cancel.clone(),
                timeout: admission.timeout,
                grace: self.config.cancel_grace(),
            };
            match self.pool.submit(job) {
                Ok(()) => report.admitted.push(admission),
                Err(PoolError::PoolShutdown) => {
                    debug!(task_id = admission.record.id, "pool shut down, task requeued");
                    dispatcher.revert_admission(&admission, now);
                }
                Err(err) => {
                    warn!(
                        task_id = admission.record.id,
                        error = %err,
                        "submission refused, task requeued"
                    );
                    dispatcher.revert_admission(&admission, now);
                }
            }
        }

        report
    }

    /// Block until `count` completions have been applied or `timeout`
    /// passes. Returns how many were applied.
    ///
    /// Meant for callers that drive [`tick`](Self::tick) themselves; with the
    /// dispatch loop running, the loop may apply completions first.
    pub fn wait_for_completions(&self, count: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut applied = 0;
        while applied < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Ok(completion) = self.completions.recv_timeout(remaining) else {
                break;
            };
            self.apply_completion(completion);
            applied += 1;
        }
        applied
    }

    fn apply_completion(&self, completion: Completion) {
        let now = self.clock.now_ms();
        self.dispatcher.lock().complete(completion, now);
    }

    /// Spawn the dispatch loop thread. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::PoolShutdown`] after shutdown, or an executor
    /// failure when the thread cannot be spawned.
    pub fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        if self.is_shut_down() {
            return Err(SchedulerError::PoolShutdown);
        }
        let mut dispatch_loop = self.dispatch_loop.lock();
        if dispatch_loop.is_some() {
            return Ok(());
        }

        let scheduler = Arc::downgrade(self);
        let completions = self.completions.clone();
        let signals = self.signal_rx.clone();
        let tick_interval = self.config.tick_interval();
        let handle = thread::Builder::new()
            .name("deferred-dispatch".to_string())
            .spawn(move || run_dispatch_loop(&scheduler, &completions, &signals, tick_interval))
            .map_err(|e| PoolError::Internal(format!("failed to spawn dispatch loop: {e}")))?;
        *dispatch_loop = Some(handle);
        info!(tick_interval_ms = self.config.tick_interval_ms, "dispatch loop started");
        Ok(())
    }

    /// Stop the dispatch loop, cancel running executors and shut the worker
    /// pool down. Results that arrive before the workers exit are applied.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("scheduler shutting down");

        let _ = self.signal_tx.try_send(DispatchSignal::Shutdown);
        if let Some(handle) = self.dispatch_loop.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("dispatch loop panicked");
            }
        }

        self.dispatcher.lock().cancel_running_tokens();
        self.pool.shutdown();

        let now = self.clock.now_ms();
        let mut dispatcher = self.dispatcher.lock();
        while let Ok(completion) = self.completions.try_recv() {
            dispatcher.complete(completion, now);
        }
        info!(
            remaining = dispatcher.catalog().len(),
            "scheduler shut down"
        );
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn wake(&self) {
        let _ = self.signal_tx.try_send(DispatchSignal::Wake);
    }
}

fn run_dispatch_loop(
    scheduler: &Weak<Scheduler>,
    completions: &Receiver<Completion>,
    signals: &Receiver<DispatchSignal>,
    tick_interval: Duration,
) {
    loop {
        let completion = select! {
            recv(completions) -> msg => match msg {
                Ok(completion) => Some(completion),
                Err(_) => break,
            },
            recv(signals) -> msg => match msg {
                Ok(DispatchSignal::Wake) => None,
                Ok(DispatchSignal::Shutdown) | Err(_) => break,
            },
            default(tick_interval) => None,
        };

        let Some(scheduler) = scheduler.upgrade() else {
            break;
        };
        if scheduler.is_shut_down() {
            break;
        }
        if let Some(completion) = completion {
            scheduler.apply_completion(completion);
        }
        let report = scheduler.tick();
        if !report.admitted.is_empty() || !report.completions.is_empty() {
            debug!(
                admitted = report.admitted.len(),
                completed = report.completions.len(),
                "dispatch tick"
            );
        }
    }
    debug!("dispatch loop exited");
}
