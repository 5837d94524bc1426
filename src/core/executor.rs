//! Task execution traits and results.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::record::TaskRecord;
use super::request::TaskKind;

/// How a run ended, as reported by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The work finished.
    Success,
    /// The work failed with a reason. Retried while retries remain.
    Failure(String),
    /// The work asks to be retried later.
    Retry,
}

/// What an executor returns for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// How the run ended.
    pub outcome: ExecutionOutcome,
    /// Optional output stored on the record.
    pub output: Option<serde_json::Value>,
}

impl ExecutionResult {
    /// Successful run without output.
    #[must_use]
    pub const fn success() -> Self {
        Self {
            outcome: ExecutionOutcome::Success,
            output: None,
        }
    }

    /// Successful run with output.
    #[must_use]
    pub const fn success_with(output: serde_json::Value) -> Self {
        Self {
            outcome: ExecutionOutcome::Success,
            output: Some(output),
        }
    }

    /// Failed run.
    #[must_use]
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            outcome: ExecutionOutcome::Failure(reason.into()),
            output: None,
        }
    }

    /// Ask to be retried.
    #[must_use]
    pub const fn retry() -> Self {
        Self {
            outcome: ExecutionOutcome::Retry,
            output: None,
        }
    }

    /// Attach output.
    #[must_use]
    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// Runs the business logic of a task.
///
/// The executor receives a snapshot of the record (including its request and
/// payload) and a cancellation token. Cancellation is cooperative: the token
/// is cancelled when the task is cancelled or its deadline passes, and the
/// executor is expected to return promptly once it observes it.
///
/// Executors run on dedicated worker threads, each driving its own
/// single-threaded tokio runtime, so blocking calls do not stall the
/// dispatcher. An async executor that blocks inside `execute` also blocks
/// that worker's deadline timer; blocking work belongs in
/// `tokio::task::spawn_blocking` or an [`FnExecutor`].
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use deferred_work::core::{ExecutionResult, TaskExecutor, TaskRecord};
/// use tokio_util::sync::CancellationToken;
///
/// struct Upload;
///
/// #[async_trait]
/// impl TaskExecutor for Upload {
///     async fn execute(&self, task: TaskRecord, cancel: CancellationToken) -> ExecutionResult {
///         tokio::select! {
///             () = cancel.cancelled() => ExecutionResult::retry(),
///             () = upload(task.request.payload()) => ExecutionResult::success(),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    /// Run the task once.
    async fn execute(&self, task: TaskRecord, cancel: CancellationToken) -> ExecutionResult;
}

/// Adapts a synchronous closure into a [`TaskExecutor`].
///
/// The closure runs on the runtime's blocking pool, so the worker keeps
/// driving the deadline while it runs. It should poll its token and return
/// once the token is cancelled.
pub struct FnExecutor<F> {
    f: Arc<F>,
}

impl<F> FnExecutor<F>
where
    F: Fn(&TaskRecord, &CancellationToken) -> ExecutionResult + Send + Sync + 'static,
{
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self { f: Arc::new(f) }
    }
}

impl<F> fmt::Debug for FnExecutor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnExecutor").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> TaskExecutor for FnExecutor<F>
where
    F: Fn(&TaskRecord, &CancellationToken) -> ExecutionResult + Send + Sync + 'static,
{
    async fn execute(&self, task: TaskRecord, cancel: CancellationToken) -> ExecutionResult {
        let f = Arc::clone(&self.f);
        match tokio::task::spawn_blocking(move || f(&task, &cancel)).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => ExecutionResult::retry(),
        }
    }
}

/// Executors keyed by task kind, with a fallback.
#[derive(Clone)]
pub struct ExecutorSet {
    default: Arc<dyn TaskExecutor>,
    one_shot: Option<Arc<dyn TaskExecutor>>,
    periodic: Option<Arc<dyn TaskExecutor>>,
}

impl ExecutorSet {
    /// Use `default` for every kind.
    pub fn new(default: Arc<dyn TaskExecutor>) -> Self {
        Self {
            default,
            one_shot: None,
            periodic: None,
        }
    }

    /// Use `executor` for one-shot tasks.
    #[must_use]
    pub fn with_one_shot(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.one_shot = Some(executor);
        self
    }

    /// Use `executor` for periodic tasks.
    #[must_use]
    pub fn with_periodic(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.periodic = Some(executor);
        self
    }

    /// The executor responsible for `kind`.
    #[must_use]
    pub fn for_kind(&self, kind: &TaskKind) -> Arc<dyn TaskExecutor> {
        let specific = match kind {
            TaskKind::OneShot => self.one_shot.as_ref(),
            TaskKind::Periodic(_) => self.periodic.as_ref(),
        };
        Arc::clone(specific.unwrap_or(&self.default))
    }
}

impl fmt::Debug for ExecutorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorSet")
            .field("one_shot", &self.one_shot.is_some())
            .field("periodic", &self.periodic.is_some())
            .finish_non_exhaustive()
    }
}
