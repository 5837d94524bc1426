//! Conflict resolution when a new request reuses an identifier.

use serde::{Deserialize, Serialize};

use super::record::{TaskId, TaskRecord, TaskState};
use super::SchedulerError;

/// What to do with existing records that share the new request's identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPolicy {
    /// Cancel the existing records and schedule the new one.
    Replace,
    /// Reject the new request while an active record exists.
    #[default]
    Keep,
    /// Schedule an independent copy. Copies may run concurrently.
    Append,
}

impl ExecutionPolicy {
    /// Whether records scheduled under this policy must not run alongside
    /// another record with the same identifier.
    #[must_use]
    pub const fn is_run_exclusive(self) -> bool {
        !matches!(self, Self::Append)
    }
}

/// Outcome of resolving a policy against the existing records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Waiting records to drop from the catalog.
    pub remove: Vec<TaskId>,
    /// Running records whose executors must be asked to stop.
    pub cancel_running: Vec<TaskId>,
}

/// Decides the fate of existing records for an identifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionPolicyResolver;

impl ExecutionPolicyResolver {
    /// Resolve `policy` for `identifier` against the records sharing it.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::TaskAlreadyExists`] under `Keep` when an active
    /// record exists.
    pub fn resolve<'a>(
        policy: ExecutionPolicy,
        identifier: &str,
        existing: impl IntoIterator<Item = &'a TaskRecord>,
    ) -> Result<Resolution, SchedulerError> {
        let mut resolution = Resolution::default();
        for record in existing.into_iter().filter(|r| r.is_active()) {
            match policy {
                ExecutionPolicy::Keep => {
                    return Err(SchedulerError::TaskAlreadyExists(identifier.to_string()));
                }
                ExecutionPolicy::Replace if record.state == TaskState::Running => {
                    resolution.cancel_running.push(record.id);
                }
                ExecutionPolicy::Replace => resolution.remove.push(record.id),
                ExecutionPolicy::Append => {}
            }
        }
        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::TaskRequest;

    fn record(id: TaskId, state: TaskState) -> TaskRecord {
        let mut record = TaskRecord::new(
            id,
            Arc::new(TaskRequest::one_shot("sync")),
            ExecutionPolicy::Keep,
            0,
        );
        record.state = state;
        record
    }

    #[test]
    fn keep_rejects_active_records_only() {
        let done = [record(1, TaskState::Completed), record(2, TaskState::Failed)];
        assert!(ExecutionPolicyResolver::resolve(ExecutionPolicy::Keep, "sync", &done).is_ok());

        let active = [record(1, TaskState::Completed), record(2, TaskState::Pending)];
        assert_eq!(
            ExecutionPolicyResolver::resolve(ExecutionPolicy::Keep, "sync", &active),
            Err(SchedulerError::TaskAlreadyExists("sync".into()))
        );
    }

    #[test]
    fn replace_splits_waiting_and_running() {
        let existing = [
            record(1, TaskState::Scheduled),
            record(2, TaskState::Running),
            record(3, TaskState::Cancelled),
        ];
        let resolution =
            ExecutionPolicyResolver::resolve(ExecutionPolicy::Replace, "sync", &existing).unwrap();
        assert_eq!(resolution.remove, vec![1]);
        assert_eq!(resolution.cancel_running, vec![2]);
    }

    #[test]
    fn append_leaves_existing_records_alone() {
        let existing = [record(1, TaskState::Running), record(2, TaskState::Scheduled)];
        let resolution =
            ExecutionPolicyResolver::resolve(ExecutionPolicy::Append, "sync", &existing).unwrap();
        assert_eq!(resolution, Resolution::default());
        assert!(!ExecutionPolicy::Append.is_run_exclusive());
        assert!(ExecutionPolicy::Replace.is_run_exclusive());
    }
}
