//! Error types for scheduler operations.

use std::time::Duration;

use thiserror::Error;

use super::record::TaskId;

/// Errors produced by scheduler components.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// A non-terminal record already exists for the identifier under `keep`.
    #[error("task already exists: {0}")]
    TaskAlreadyExists(String),
    /// No record matched the identifier or id.
    #[error("task not found: {0}")]
    TaskNotFound(String),
    /// The request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The executor reported or raised an error.
    #[error("executor failure: {0}")]
    ExecutorFailure(String),
    /// The executor did not return before its deadline.
    #[error("executor timed out after {}ms", .0.as_millis())]
    ExecutorTimeout(Duration),
    /// Scheduler configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The scheduler has been shut down.
    #[error("scheduler has been shut down")]
    PoolShutdown,
}

impl SchedulerError {
    /// Build a `TaskNotFound` for a numeric record id.
    #[must_use]
    pub fn not_found_id(id: TaskId) -> Self {
        Self::TaskNotFound(format!("#{id}"))
    }

    /// Whether this error came from task execution rather than the scheduling API.
    #[must_use]
    pub const fn is_execution_error(&self) -> bool {
        matches!(self, Self::ExecutorFailure(_) | Self::ExecutorTimeout(_))
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
