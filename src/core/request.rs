//! Immutable task requests and the types they are built from.
//!
//! A [`TaskRequest`] is created once by the caller with the `with_*` builder
//! methods and then shared (via `Arc`) by every record scheduled from it.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::environment::TaskConstraints;
use super::SchedulerError;

/// Shortest interval a periodic task may repeat at.
pub const MIN_PERIODIC_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Shortest flex window for a periodic task.
pub const MIN_PERIODIC_FLEX: Duration = Duration::from_secs(5 * 60);

/// Shortest base delay accepted for retry backoff.
pub const MIN_BACKOFF_DELAY: Duration = Duration::from_secs(10);

/// Base backoff delay used when the caller does not set one.
pub const DEFAULT_BACKOFF_DELAY: Duration = Duration::from_secs(30);

/// Retry budget used when the caller does not set one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Scheduling priority. Higher priorities are admitted first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work that can wait.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Work the user is likely waiting on.
    High,
    /// Must run before anything else that is eligible.
    Critical,
}

/// How retry delays grow between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// `base * attempt`
    Linear,
    /// `base * 2^attempt`
    #[default]
    Exponential,
}

/// Repeat interval of a periodic task, with an optional flex window.
///
/// The interval is clamped to [`MIN_PERIODIC_INTERVAL`]; the flex window is
/// clamped to `[MIN_PERIODIC_FLEX, interval]`. A flex window lets the task run
/// up to `flex` before its nominal run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicInterval {
    interval: Duration,
    flex: Option<Duration>,
}

impl PeriodicInterval {
    /// Repeat every `minutes` minutes.
    ///
    /// ```
    /// use deferred_work::core::{PeriodicInterval, MIN_PERIODIC_INTERVAL};
    ///
    /// assert_eq!(PeriodicInterval::every(5).interval(), MIN_PERIODIC_INTERVAL);
    /// ```
    #[must_use]
    pub fn every(minutes: u64) -> Self {
        Self::from_duration(Duration::from_secs(minutes.saturating_mul(60)))
    }

    /// Repeat every `interval`.
    #[must_use]
    pub fn from_duration(interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_PERIODIC_INTERVAL),
            flex: None,
        }
    }

    /// Allow the task to run up to `flex` early.
    #[must_use]
    pub fn with_flex(mut self, flex: Duration) -> Self {
        self.flex = Some(flex.clamp(MIN_PERIODIC_FLEX, self.interval()));
        self
    }

    /// The effective interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval.max(MIN_PERIODIC_INTERVAL)
    }

    /// The effective flex window, if any.
    #[must_use]
    pub fn flex(&self) -> Option<Duration> {
        self.flex
            .map(|flex| flex.clamp(MIN_PERIODIC_FLEX, self.interval()))
    }
}

/// Whether a task runs once or repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Runs until it completes, fails terminally, or is cancelled.
    OneShot,
    /// Re-arms after every successful run.
    Periodic(PeriodicInterval),
}

impl TaskKind {
    /// The periodic interval, if this kind repeats.
    #[must_use]
    pub const fn periodic(&self) -> Option<&PeriodicInterval> {
        match self {
            Self::OneShot => None,
            Self::Periodic(interval) => Some(interval),
        }
    }

    /// Whether the task repeats.
    #[must_use]
    pub const fn is_periodic(&self) -> bool {
        matches!(self, Self::Periodic(_))
    }

    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::OneShot => "one_shot",
            Self::Periodic(_) => "periodic",
        }
    }
}

/// An immutable description of a unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    identifier: String,
    kind: TaskKind,
    priority: Priority,
    constraints: TaskConstraints,
    initial_delay: Duration,
    max_retries: u32,
    backoff_policy: BackoffPolicy,
    backoff_delay: Duration,
    tags: BTreeSet<String>,
    payload: serde_json::Value,
    timeout: Option<Duration>,
    max_pending_lifetime: Option<Duration>,
}

impl TaskRequest {
    fn new(identifier: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            identifier: identifier.into(),
            kind,
            priority: Priority::Normal,
            constraints: TaskConstraints::default(),
            initial_delay: Duration::ZERO,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_policy: BackoffPolicy::Exponential,
            backoff_delay: DEFAULT_BACKOFF_DELAY,
            tags: BTreeSet::new(),
            payload: serde_json::Value::Null,
            timeout: None,
            max_pending_lifetime: None,
        }
    }

    /// A task that runs once.
    #[must_use]
    pub fn one_shot(identifier: impl Into<String>) -> Self {
        Self::new(identifier, TaskKind::OneShot)
    }

    /// A task that repeats at `interval`.
    #[must_use]
    pub fn periodic(identifier: impl Into<String>, interval: PeriodicInterval) -> Self {
        Self::new(identifier, TaskKind::Periodic(interval))
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the environment constraints.
    #[must_use]
    pub fn with_constraints(mut self, constraints: TaskConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Delay the first run.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Number of retries after the first failed run.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff policy and its base delay (clamped to [`MIN_BACKOFF_DELAY`]).
    #[must_use]
    pub fn with_backoff(mut self, policy: BackoffPolicy, base: Duration) -> Self {
        self.backoff_policy = policy;
        self.backoff_delay = base.max(MIN_BACKOFF_DELAY);
        self
    }

    /// Add a tag used by `cancel_by_tag`.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Attach an opaque payload handed to the executor.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Override the kind's default execution timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override how long the task may wait without ever running before it expires.
    #[must_use]
    pub const fn with_max_pending_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_pending_lifetime = Some(lifetime);
        self
    }

    /// Caller-chosen identifier.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// One-shot or periodic.
    #[must_use]
    pub const fn kind(&self) -> &TaskKind {
        &self.kind
    }

    /// Scheduling priority.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Environment constraints.
    #[must_use]
    pub const fn constraints(&self) -> &TaskConstraints {
        &self.constraints
    }

    /// Delay before the first run.
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Retry budget.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff policy.
    #[must_use]
    pub const fn backoff_policy(&self) -> BackoffPolicy {
        self.backoff_policy
    }

    /// Backoff base delay.
    #[must_use]
    pub fn backoff_delay(&self) -> Duration {
        self.backoff_delay.max(MIN_BACKOFF_DELAY)
    }

    /// Tags.
    #[must_use]
    pub const fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Whether the request carries `tag`.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Opaque payload.
    #[must_use]
    pub const fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Execution timeout override.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Pending lifetime override.
    #[must_use]
    pub const fn max_pending_lifetime(&self) -> Option<Duration> {
        self.max_pending_lifetime
    }

    /// Reject requests that cannot be scheduled.
    ///
    /// Out-of-range intervals and backoff delays are clamped when read, so
    /// they never fail validation.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidRequest`] for an empty identifier, an
    /// empty tag, or a zero timeout or pending lifetime.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.identifier.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "identifier must not be empty".into(),
            ));
        }
        if self.tags.iter().any(|tag| tag.trim().is_empty()) {
            return Err(SchedulerError::InvalidRequest(format!(
                "task `{}` has an empty tag",
                self.identifier
            )));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(SchedulerError::InvalidRequest(format!(
                "task `{}` timeout must be greater than 0",
                self.identifier
            )));
        }
        if self.max_pending_lifetime == Some(Duration::ZERO) {
            return Err(SchedulerError::InvalidRequest(format!(
                "task `{}` pending lifetime must be greater than 0",
                self.identifier
            )));
        }
        Ok(())
    }
}
