//! Mutable task records and their state machine.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::policy::ExecutionPolicy;
use super::request::TaskRequest;
use crate::util::clock::duration_ms;

/// Monotonic record identifier assigned by the catalog.
pub type TaskId = u64;

/// Lifecycle state of a record.
///
/// ```text
/// Scheduled -> Running -> Completed | Failed | Cancelled
///     ^  |        |
///     |  v        +--> Scheduled (retry with backoff, or periodic re-arm)
///   Pending (due, waiting on constraints)
/// Scheduled | Pending -> Cancelled | Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Due, but its constraints are not satisfied yet.
    Pending,
    /// Waiting for its next run time.
    Scheduled,
    /// Handed to the executor.
    Running,
    /// Finished successfully (one-shot only).
    Completed,
    /// Ran out of retries.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
    /// Never ran before its pending lifetime elapsed.
    Expired,
}

impl TaskState {
    /// Terminal states never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }

    /// Pending or Scheduled.
    #[must_use]
    pub const fn is_waiting(self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// The dispatcher's view of one scheduled request.
///
/// Records handed out by the scheduler (queries, executor invocations) are
/// snapshots; changing them has no effect on the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Monotonic id.
    pub id: TaskId,
    /// The request this record was scheduled from.
    pub request: Arc<TaskRequest>,
    /// Policy the record was scheduled under.
    pub policy: ExecutionPolicy,
    /// Current state.
    pub state: TaskState,
    /// Failed runs in the current retry chain.
    pub attempt_count: u32,
    /// When the record was created (ms since epoch).
    pub scheduled_time: u64,
    /// When the record last started running.
    pub last_run_time: Option<u64>,
    /// Earliest time the record may run next.
    pub next_run_time: u64,
    /// Error from the most recent failed run.
    pub last_error: Option<String>,
    /// Output of the most recent run.
    pub output: Option<serde_json::Value>,
    /// A cancel was requested while the record was running.
    pub cancel_requested: bool,
}

impl TaskRecord {
    pub(crate) fn new(
        id: TaskId,
        request: Arc<TaskRequest>,
        policy: ExecutionPolicy,
        now_ms: u64,
    ) -> Self {
        let next_run_time = now_ms.saturating_add(duration_ms(request.initial_delay()));
        Self {
            id,
            request,
            policy,
            state: TaskState::Scheduled,
            attempt_count: 0,
            scheduled_time: now_ms,
            last_run_time: None,
            next_run_time,
            last_error: None,
            output: None,
            cancel_requested: false,
        }
    }

    /// The request identifier.
    #[must_use]
    pub fn identifier(&self) -> &str {
        self.request.identifier()
    }

    /// Not in a terminal state.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Earliest time the record may be admitted, accounting for a periodic
    /// flex window once the task has run.
    #[must_use]
    pub fn earliest_run_time(&self) -> u64 {
        let flex = self
            .request
            .kind()
            .periodic()
            .and_then(super::request::PeriodicInterval::flex)
            .filter(|_| self.last_run_time.is_some());
        flex.map_or(self.next_run_time, |flex| {
            self.next_run_time.saturating_sub(duration_ms(flex))
        })
    }

    /// Whether the record's run time has arrived.
    #[must_use]
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.earliest_run_time() <= now_ms
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::request::PeriodicInterval;

    #[test]
    fn new_record_is_scheduled_after_initial_delay() {
        let request = TaskRequest::one_shot("a").with_initial_delay(Duration::from_secs(2));
        let record = TaskRecord::new(1, Arc::new(request), ExecutionPolicy::Keep, 1_000);
        assert_eq!(record.state, TaskState::Scheduled);
        assert_eq!(record.next_run_time, 3_000);
        assert!(!record.is_due(2_999));
        assert!(record.is_due(3_000));
    }

    #[test]
    fn flex_window_opens_early_after_first_run() {
        let interval = PeriodicInterval::every(60).with_flex(Duration::from_secs(600));
        let request = TaskRequest::periodic("p", interval);
        let mut record = TaskRecord::new(1, Arc::new(request), ExecutionPolicy::Keep, 0);
        record.next_run_time = 3_600_000;
        assert_eq!(record.earliest_run_time(), 3_600_000);

        record.last_run_time = Some(0);
        assert_eq!(record.earliest_run_time(), 3_000_000);
    }

    #[test]
    fn terminal_states() {
        for state in [
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Cancelled,
            TaskState::Expired,
        ] {
            assert!(state.is_terminal());
        }
        for state in [TaskState::Pending, TaskState::Scheduled, TaskState::Running] {
            assert!(!state.is_terminal());
        }
        assert_eq!(TaskState::Running.to_string(), "running");
    }
}
