//! The set of task records and the operations that create and cancel them.
//!
//! The catalog is owned by the dispatcher and only ever mutated under the
//! scheduler's lock. Lookups hand out references that callers clone into
//! snapshots, so reports never observe a half-applied prune.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::policy::{ExecutionPolicy, ExecutionPolicyResolver};
use super::record::{TaskId, TaskRecord, TaskState};
use super::request::TaskRequest;
use super::SchedulerError;

/// What a cancel call did to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelEffect {
    /// A waiting record moved to `Cancelled`.
    Cancelled,
    /// A running record was flagged; it becomes `Cancelled` when its executor returns.
    Requested,
}

/// Result of a successful `schedule` call.
#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    /// Snapshot of the inserted record.
    pub record: TaskRecord,
    /// Waiting records removed by `Replace`.
    pub removed: Vec<TaskRecord>,
    /// Running records flagged for cancellation by `Replace`.
    pub cancel_requested: Vec<TaskId>,
}

/// Owns every record, keyed and ordered by id.
#[derive(Debug)]
pub struct TaskCatalog {
    records: BTreeMap<TaskId, TaskRecord>,
    next_id: TaskId,
}

impl Default for TaskCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskCatalog {
    /// Create an empty catalog. Ids start at 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Validate `request`, resolve `policy` against existing records with the
    /// same identifier, and insert a new `Scheduled` record.
    ///
    /// Resolution and insertion happen in one call, so no tick can see both
    /// the replaced and the replacing record as eligible.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidRequest`] for malformed requests and
    /// [`SchedulerError::TaskAlreadyExists`] when `Keep` finds an active record.
    pub fn schedule(
        &mut self,
        request: TaskRequest,
        policy: ExecutionPolicy,
        now_ms: u64,
    ) -> Result<ScheduleOutcome, SchedulerError> {
        request.validate()?;
        let resolution = ExecutionPolicyResolver::resolve(
            policy,
            request.identifier(),
            self.by_identifier(request.identifier()),
        )?;

        let removed = resolution
            .remove
            .iter()
            .filter_map(|id| self.records.remove(id))
            .map(|mut record| {
                record.state = TaskState::Cancelled;
                record
            })
            .collect();
        for id in &resolution.cancel_running {
            self.cancel_record(*id);
        }

        let id = self.next_id;
        self.next_id += 1;
        let record = TaskRecord::new(id, Arc::new(request), policy, now_ms);
        self.records.insert(id, record.clone());

        Ok(ScheduleOutcome {
            record,
            removed,
            cancel_requested: resolution.cancel_running,
        })
    }

    /// Cancel one record. Returns `None` when nothing changed (unknown id,
    /// terminal record, or a cancel already pending).
    pub fn cancel_record(&mut self, id: TaskId) -> Option<CancelEffect> {
        let record = self.records.get_mut(&id)?;
        match record.state {
            TaskState::Running if record.cancel_requested => None,
            TaskState::Running => {
                record.cancel_requested = true;
                Some(CancelEffect::Requested)
            }
            state if state.is_waiting() => {
                record.state = TaskState::Cancelled;
                Some(CancelEffect::Cancelled)
            }
            _ => None,
        }
    }

    /// Cancel every active record with `identifier`.
    pub fn cancel_identifier(&mut self, identifier: &str) -> Vec<(TaskId, CancelEffect)> {
        let ids: Vec<TaskId> = self.by_identifier(identifier).map(|r| r.id).collect();
        self.cancel_ids(ids)
    }

    /// Cancel every active record carrying `tag`. Linear scan.
    pub fn cancel_by_tag(&mut self, tag: &str) -> Vec<(TaskId, CancelEffect)> {
        let ids: Vec<TaskId> = self
            .records
            .values()
            .filter(|r| r.request.has_tag(tag))
            .map(|r| r.id)
            .collect();
        self.cancel_ids(ids)
    }

    /// Cancel every active record and drop the ones that stopped immediately.
    /// Running records stay until their executors return.
    pub fn cancel_all(&mut self) -> Vec<(TaskId, CancelEffect)> {
        let ids: Vec<TaskId> = self.records.keys().copied().collect();
        let effects = self.cancel_ids(ids);
        for (id, effect) in &effects {
            if *effect == CancelEffect::Cancelled {
                self.records.remove(id);
            }
        }
        effects
    }

    fn cancel_ids(&mut self, ids: Vec<TaskId>) -> Vec<(TaskId, CancelEffect)> {
        ids.into_iter()
            .filter_map(|id| self.cancel_record(id).map(|effect| (id, effect)))
            .collect()
    }

    /// Remove every terminal record and return them.
    pub fn prune(&mut self) -> Vec<TaskRecord> {
        let terminal: Vec<TaskId> = self
            .records
            .values()
            .filter(|r| r.state.is_terminal())
            .map(|r| r.id)
            .collect();
        terminal
            .into_iter()
            .filter_map(|id| self.records.remove(&id))
            .collect()
    }

    /// Look up a record by id.
    #[must_use]
    pub fn get(&self, id: TaskId) -> Option<&TaskRecord> {
        self.records.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: TaskId) -> Option<&mut TaskRecord> {
        self.records.get_mut(&id)
    }

    /// Records with `identifier`, oldest first.
    pub fn by_identifier<'a>(
        &'a self,
        identifier: &'a str,
    ) -> impl Iterator<Item = &'a TaskRecord> + 'a {
        self.records
            .values()
            .filter(move |r| r.identifier() == identifier)
    }

    /// All records, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &TaskRecord> {
        self.records.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut TaskRecord> {
        self.records.values_mut()
    }

    /// Number of records in `state`.
    #[must_use]
    pub fn count_in(&self, state: TaskState) -> usize {
        self.records.values().filter(|r| r.state == state).count()
    }

    /// Number of Pending or Scheduled records.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.state.is_waiting())
            .count()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// No records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_count(catalog: &TaskCatalog, identifier: &str) -> usize {
        catalog
            .by_identifier(identifier)
            .filter(|r| r.is_active())
            .count()
    }

    #[test]
    fn ids_are_monotonic_and_next_run_honours_delay() {
        let mut catalog = TaskCatalog::new();
        let a = catalog
            .schedule(TaskRequest::one_shot("a"), ExecutionPolicy::Keep, 100)
            .unwrap();
        let b = catalog
            .schedule(
                TaskRequest::one_shot("b").with_initial_delay(std::time::Duration::from_millis(50)),
                ExecutionPolicy::Keep,
                200,
            )
            .unwrap();
        assert_eq!(a.record.id, 1);
        assert_eq!(b.record.id, 2);
        assert_eq!(a.record.next_run_time, 100);
        assert_eq!(b.record.next_run_time, 250);
        assert_eq!(b.record.state, TaskState::Scheduled);
    }

    #[test]
    fn keep_rejects_second_active_record() {
        let mut catalog = TaskCatalog::new();
        catalog
            .schedule(TaskRequest::one_shot("sync"), ExecutionPolicy::Keep, 0)
            .unwrap();
        let err = catalog
            .schedule(TaskRequest::one_shot("sync"), ExecutionPolicy::Keep, 0)
            .unwrap_err();
        assert_eq!(err, SchedulerError::TaskAlreadyExists("sync".into()));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn replace_keeps_one_active_record() {
        let mut catalog = TaskCatalog::new();
        for _ in 0..3 {
            catalog
                .schedule(TaskRequest::one_shot("sync"), ExecutionPolicy::Replace, 0)
                .unwrap();
            assert_eq!(active_count(&catalog, "sync"), 1);
        }
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.iter().next().unwrap().id, 3);
    }

    #[test]
    fn replace_flags_running_record() {
        let mut catalog = TaskCatalog::new();
        catalog
            .schedule(TaskRequest::one_shot("sync"), ExecutionPolicy::Replace, 0)
            .unwrap();
        catalog.get_mut(1).unwrap().state = TaskState::Running;

        let outcome = catalog
            .schedule(TaskRequest::one_shot("sync"), ExecutionPolicy::Replace, 0)
            .unwrap();
        assert!(outcome.removed.is_empty());
        assert_eq!(outcome.cancel_requested, vec![1]);
        assert!(catalog.get(1).unwrap().cancel_requested);
        assert_eq!(catalog.get(1).unwrap().state, TaskState::Running);
    }

    #[test]
    fn append_grows_by_one() {
        let mut catalog = TaskCatalog::new();
        for expected in 1..=4 {
            catalog
                .schedule(TaskRequest::one_shot("sync"), ExecutionPolicy::Append, 0)
                .unwrap();
            assert_eq!(active_count(&catalog, "sync"), expected);
        }
    }

    #[test]
    fn cancel_is_noop_for_terminal_records() {
        let mut catalog = TaskCatalog::new();
        catalog
            .schedule(TaskRequest::one_shot("a"), ExecutionPolicy::Keep, 0)
            .unwrap();
        assert_eq!(
            catalog.cancel_identifier("a"),
            vec![(1, CancelEffect::Cancelled)]
        );
        assert!(catalog.cancel_identifier("a").is_empty());
        assert!(catalog.cancel_identifier("missing").is_empty());
    }

    #[test]
    fn cancel_by_tag_and_cancel_all() {
        let mut catalog = TaskCatalog::new();
        catalog
            .schedule(TaskRequest::one_shot("a").with_tag("net"), ExecutionPolicy::Keep, 0)
            .unwrap();
        catalog
            .schedule(TaskRequest::one_shot("b").with_tag("net"), ExecutionPolicy::Keep, 0)
            .unwrap();
        catalog
            .schedule(TaskRequest::one_shot("c"), ExecutionPolicy::Keep, 0)
            .unwrap();
        catalog.get_mut(3).unwrap().state = TaskState::Running;

        assert_eq!(catalog.cancel_by_tag("net").len(), 2);
        assert_eq!(catalog.cancel_all(), vec![(3, CancelEffect::Requested)]);
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.prune().len(), 2);
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn prune_removes_only_terminal_records() {
        let mut catalog = TaskCatalog::new();
        for identifier in ["a", "b", "c"] {
            catalog
                .schedule(TaskRequest::one_shot(identifier), ExecutionPolicy::Keep, 0)
                .unwrap();
        }
        catalog.get_mut(1).unwrap().state = TaskState::Completed;
        catalog.get_mut(2).unwrap().state = TaskState::Expired;

        let pruned = catalog.prune();
        assert_eq!(pruned.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(catalog.waiting_count(), 1);
    }

    #[test]
    fn invalid_request_is_rejected() {
        let mut catalog = TaskCatalog::new();
        let err = catalog
            .schedule(TaskRequest::one_shot(""), ExecutionPolicy::Append, 0)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));
        assert!(catalog.is_empty());
    }
}
