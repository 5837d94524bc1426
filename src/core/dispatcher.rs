//! The control loop over the catalog.
//!
//! Each tick heals run-exclusivity conflicts, expires stale records, gates
//! due records on their constraints, orders the survivors and admits as many
//! as the worker budget allows. Executor results come back as [`Completion`]s
//! and are applied with [`Dispatcher::complete`]; nothing else writes records.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::audit::{build_audit_event, AuditAction, AuditSink};
use super::backoff::BackoffCalculator;
use super::catalog::{CancelEffect, TaskCatalog};
use super::environment::{ConstraintEvaluator, EnvironmentSnapshot};
use super::executor::{ExecutionOutcome, ExecutionResult};
use super::policy::ExecutionPolicy;
use super::queue::{Candidate, CandidateQueue};
use super::record::{TaskId, TaskRecord, TaskState};
use super::request::{TaskKind, TaskRequest};
use super::SchedulerError;
use crate::config::SchedulerConfig;
use crate::util::clock::duration_ms;

/// Dispatcher tunables derived from [`SchedulerConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherSettings {
    /// Deadline for one-shot runs without a request timeout.
    pub one_shot_timeout: Duration,
    /// Deadline for periodic runs without a request timeout.
    pub periodic_timeout: Duration,
    /// Lifetime for records without a request override. `None` disables expiry.
    pub max_pending_lifetime: Option<Duration>,
    /// Retry delay calculator.
    pub backoff: BackoffCalculator,
    /// Constraint gate.
    pub evaluator: ConstraintEvaluator,
}

impl DispatcherSettings {
    /// Derive settings from scheduler configuration.
    #[must_use]
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            one_shot_timeout: config.one_shot_timeout(),
            periodic_timeout: config.periodic_timeout(),
            max_pending_lifetime: config.max_pending_lifetime(),
            backoff: BackoffCalculator::new(config.backoff_ceiling()),
            evaluator: ConstraintEvaluator::new(config.storage_low_threshold_bytes),
        }
    }

    fn timeout_for(&self, request: &TaskRequest) -> Duration {
        request.timeout().unwrap_or(match request.kind() {
            TaskKind::OneShot => self.one_shot_timeout,
            TaskKind::Periodic(_) => self.periodic_timeout,
        })
    }

    fn lifetime_for(&self, request: &TaskRequest) -> Option<Duration> {
        request.max_pending_lifetime().or(self.max_pending_lifetime)
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// A record handed to the executor by a tick.
#[derive(Debug, Clone)]
pub struct Admission {
    /// Snapshot of the record in its `Running` state.
    pub record: TaskRecord,
    /// Token cancelled on cancel request, deadline or shutdown.
    pub cancel: CancellationToken,
    /// Deadline for the run.
    pub timeout: Duration,
    previous_run_time: Option<u64>,
}

/// An executor's answer for one admitted record.
#[derive(Debug)]
pub struct Completion {
    /// Record the run belongs to.
    pub id: TaskId,
    /// The executor's result, or why there is none (panic, timeout).
    pub result: Result<ExecutionResult, SchedulerError>,
}

impl Completion {
    /// Wrap an executor result.
    #[must_use]
    pub const fn new(id: TaskId, result: Result<ExecutionResult, SchedulerError>) -> Self {
        Self { id, result }
    }
}

/// What a tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Completions applied before the tick and the state each record ended in.
    pub completions: Vec<(TaskId, TaskState)>,
    /// Records forced to `Failed` to restore run exclusivity.
    pub healed: Vec<TaskId>,
    /// Records that expired.
    pub expired: Vec<TaskId>,
    /// Due records held back by unmet constraints.
    pub waiting_on_constraints: Vec<TaskId>,
    /// Records moved to `Running`, in admission order.
    pub admitted: Vec<Admission>,
}

impl TickReport {
    /// Ids of the admitted records, in admission order.
    #[must_use]
    pub fn admitted_ids(&self) -> Vec<TaskId> {
        self.admitted.iter().map(|a| a.record.id).collect()
    }
}

/// Owns the catalog and applies every state transition.
pub struct Dispatcher {
    catalog: TaskCatalog,
    environment: EnvironmentSnapshot,
    settings: DispatcherSettings,
    tokens: HashMap<TaskId, CancellationToken>,
    audit: Option<Box<dyn AuditSink>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("records", &self.catalog.len())
            .field("running", &self.tokens.len())
            .field("settings", &self.settings)
            .field("audit", &self.audit.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatcherSettings::default())
    }
}

impl Dispatcher {
    /// Create a dispatcher with an empty catalog and a default environment.
    #[must_use]
    pub fn new(settings: DispatcherSettings) -> Self {
        Self {
            catalog: TaskCatalog::new(),
            environment: EnvironmentSnapshot::default(),
            settings,
            tokens: HashMap::new(),
            audit: None,
        }
    }

    /// Report lifecycle transitions to `sink`.
    #[must_use]
    pub fn with_audit(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// The records.
    #[must_use]
    pub const fn catalog(&self) -> &TaskCatalog {
        &self.catalog
    }

    /// Last environment snapshot.
    #[must_use]
    pub const fn environment(&self) -> &EnvironmentSnapshot {
        &self.environment
    }

    /// Tunables in effect.
    #[must_use]
    pub const fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Replace the environment snapshot used by the next tick.
    pub fn set_context(&mut self, environment: EnvironmentSnapshot) {
        self.environment = environment;
    }

    /// Insert a record for `request` after resolving `policy`.
    ///
    /// # Errors
    ///
    /// Propagates [`TaskCatalog::schedule`] errors.
    pub fn schedule(
        &mut self,
        request: TaskRequest,
        policy: ExecutionPolicy,
        now_ms: u64,
    ) -> Result<TaskRecord, SchedulerError> {
        let outcome = self.catalog.schedule(request, policy, now_ms)?;

        for removed in &outcome.removed {
            emit(
                &mut self.audit,
                removed.id,
                removed.identifier(),
                AuditAction::Replaced,
                now_ms,
                Some(format!("replaced by #{}", outcome.record.id)),
            );
        }
        for id in &outcome.cancel_requested {
            self.signal(*id, outcome.record.identifier(), CancelEffect::Requested, now_ms);
        }

        let record = outcome.record;
        info!(
            task_id = record.id,
            identifier = record.identifier(),
            kind = record.request.kind().name(),
            policy = ?policy,
            next_run_time = record.next_run_time,
            replaced = outcome.removed.len() + outcome.cancel_requested.len(),
            "task scheduled"
        );
        emit(
            &mut self.audit,
            record.id,
            record.identifier(),
            AuditAction::Scheduled,
            now_ms,
            None,
        );
        Ok(record)
    }

    /// Cancel every active record with `identifier`. False if none changed.
    pub fn cancel(&mut self, identifier: &str, now_ms: u64) -> bool {
        let effects = self.catalog.cancel_identifier(identifier);
        for (id, effect) in &effects {
            self.signal(*id, identifier, *effect, now_ms);
        }
        !effects.is_empty()
    }

    /// Cancel one record by id and return the state it is in afterwards.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::TaskNotFound`] when no record has `id`.
    pub fn cancel_by_id(&mut self, id: TaskId, now_ms: u64) -> Result<TaskState, SchedulerError> {
        let identifier = self
            .catalog
            .get(id)
            .map(|r| r.identifier().to_owned())
            .ok_or_else(|| SchedulerError::not_found_id(id))?;
        if let Some(effect) = self.catalog.cancel_record(id) {
            self.signal(id, &identifier, effect, now_ms);
        }
        self.catalog
            .get(id)
            .map(|r| r.state)
            .ok_or_else(|| SchedulerError::not_found_id(id))
    }

    /// Cancel every active record carrying `tag`.
    pub fn cancel_by_tag(&mut self, tag: &str, now_ms: u64) -> usize {
        let effects = self.catalog.cancel_by_tag(tag);
        for (id, effect) in &effects {
            let identifier = self
                .catalog
                .get(*id)
                .map(|r| r.identifier().to_owned())
                .unwrap_or_default();
            self.signal(*id, &identifier, *effect, now_ms);
        }
        effects.len()
    }

    /// Cancel everything. Records that stopped immediately are dropped.
    pub fn cancel_all(&mut self, now_ms: u64) -> usize {
        let identifiers: HashMap<TaskId, String> = self
            .catalog
            .iter()
            .filter(|r| r.is_active())
            .map(|r| (r.id, r.identifier().to_owned()))
            .collect();
        let effects = self.catalog.cancel_all();
        for (id, effect) in &effects {
            let identifier = identifiers.get(id).map_or("", String::as_str);
            self.signal(*id, identifier, *effect, now_ms);
        }
        info!(cancelled = effects.len(), "all tasks cancelled");
        effects.len()
    }

    fn signal(&mut self, id: TaskId, identifier: &str, effect: CancelEffect, now_ms: u64) {
        match effect {
            CancelEffect::Requested => {
                if let Some(token) = self.tokens.get(&id) {
                    token.cancel();
                }
                debug!(task_id = id, identifier, "cancel requested on running task");
                emit(
                    &mut self.audit,
                    id,
                    identifier,
                    AuditAction::CancelRequested,
                    now_ms,
                    None,
                );
            }
            CancelEffect::Cancelled => {
                debug!(task_id = id, identifier, "task cancelled");
                emit(&mut self.audit, id, identifier, AuditAction::Cancelled, now_ms, None);
            }
        }
    }

    /// Remove terminal records. Returns how many were removed.
    pub fn prune(&mut self, now_ms: u64) -> usize {
        let pruned = self.catalog.prune();
        for record in &pruned {
            self.tokens.remove(&record.id);
            emit(
                &mut self.audit,
                record.id,
                record.identifier(),
                AuditAction::Pruned,
                now_ms,
                Some(record.state.to_string()),
            );
        }
        if !pruned.is_empty() {
            debug!(pruned = pruned.len(), "terminal tasks pruned");
        }
        pruned.len()
    }

    /// Run one pass: heal, expire, gate, order, then admit up to `budget`
    /// records.
    pub fn tick(&mut self, now_ms: u64, budget: usize) -> TickReport {
        let mut report = TickReport {
            healed: self.heal_running_conflicts(now_ms),
            ..TickReport::default()
        };
        debug_assert!(
            report.healed.is_empty(),
            "more than one run-exclusive record was running for one identifier"
        );
        report.expired = self.expire(now_ms);

        let evaluator = self.settings.evaluator;
        let mut queue = CandidateQueue::new();
        for record in self.catalog.iter_mut() {
            if !record.state.is_waiting() || !record.is_due(now_ms) {
                continue;
            }
            let constraints = record.request.constraints();
            if evaluator.is_satisfied(constraints, &self.environment) {
                record.state = TaskState::Scheduled;
                queue.push(Candidate::from(&*record));
            } else {
                if record.state == TaskState::Scheduled {
                    debug!(
                        task_id = record.id,
                        identifier = record.identifier(),
                        unmet = ?evaluator.unmet(constraints, &self.environment),
                        "task due but constraints unmet"
                    );
                    record.state = TaskState::Pending;
                }
                report.waiting_on_constraints.push(record.id);
            }
        }

        let mut busy: HashSet<String> = self
            .catalog
            .iter()
            .filter(|r| r.state == TaskState::Running)
            .map(|r| r.identifier().to_owned())
            .collect();

        while report.admitted.len() < budget {
            let Some(candidate) = queue.pop() else {
                break;
            };
            let Some(record) = self.catalog.get_mut(candidate.id) else {
                continue;
            };
            if record.policy.is_run_exclusive() && busy.contains(record.identifier()) {
                debug!(
                    task_id = record.id,
                    identifier = record.identifier(),
                    "task held back while another run of its identifier is active"
                );
                continue;
            }
            busy.insert(record.identifier().to_owned());

            let previous_run_time = record.last_run_time;
            record.state = TaskState::Running;
            record.last_run_time = Some(now_ms);
            let cancel = CancellationToken::new();
            let timeout = self.settings.timeout_for(&record.request);
            self.tokens.insert(record.id, cancel.clone());

            debug!(
                task_id = record.id,
                identifier = record.identifier(),
                attempt = record.attempt_count,
                priority = ?record.request.priority(),
                "task admitted"
            );
            emit(
                &mut self.audit,
                record.id,
                record.identifier(),
                AuditAction::Admitted,
                now_ms,
                None,
            );
            report.admitted.push(Admission {
                record: record.clone(),
                cancel,
                timeout,
                previous_run_time,
            });
        }

        report
    }

    /// Undo an admission the worker pool refused. The record returns to
    /// `Scheduled` and keeps its run time, so the next tick retries it.
    pub fn revert_admission(&mut self, admission: &Admission, now_ms: u64) {
        let id = admission.record.id;
        self.tokens.remove(&id);
        let Some(record) = self.catalog.get_mut(id) else {
            return;
        };
        if record.state != TaskState::Running {
            return;
        }
        record.last_run_time = admission.previous_run_time;
        record.state = if record.cancel_requested {
            TaskState::Cancelled
        } else {
            TaskState::Scheduled
        };
        let action = if record.state == TaskState::Cancelled {
            AuditAction::Cancelled
        } else {
            AuditAction::Requeued
        };
        debug!(task_id = id, identifier = record.identifier(), "admission reverted");
        emit(&mut self.audit, id, record.identifier(), action, now_ms, None);
    }

    /// Apply an executor result. Returns the record's new state, or `None`
    /// when the completion no longer applies (record pruned, healed or not
    /// running).
    pub fn complete(&mut self, completion: Completion, now_ms: u64) -> Option<TaskState> {
        let Completion { id, result } = completion;
        self.tokens.remove(&id);
        let Some(record) = self.catalog.get_mut(id) else {
            debug!(task_id = id, "completion for unknown task ignored");
            return None;
        };
        if record.state != TaskState::Running {
            debug!(task_id = id, state = %record.state, "stale completion ignored");
            return None;
        }

        let error = match result {
            Ok(ExecutionResult { outcome, output }) => {
                if output.is_some() {
                    record.output = output;
                }
                match outcome {
                    ExecutionOutcome::Success => None,
                    ExecutionOutcome::Failure(reason) => Some(reason),
                    ExecutionOutcome::Retry => Some("executor requested a retry".to_string()),
                }
            }
            Err(e) => Some(e.to_string()),
        };

        let (action, detail) = if record.cancel_requested {
            record.state = TaskState::Cancelled;
            (AuditAction::Cancelled, None)
        } else if let Some(error) = error {
            record.last_error = Some(error.clone());
            if record.attempt_count < record.request.max_retries() {
                record.attempt_count += 1;
                let delay = self.settings.backoff.calculate_delay(
                    record.request.backoff_policy(),
                    record.request.backoff_delay(),
                    record.attempt_count,
                );
                record.next_run_time = now_ms.saturating_add(duration_ms(delay));
                record.state = TaskState::Scheduled;
                info!(
                    task_id = id,
                    identifier = record.identifier(),
                    attempt = record.attempt_count,
                    delay_ms = duration_ms(delay),
                    error = %error,
                    "task will be retried"
                );
                (AuditAction::Retried, Some(error))
            } else {
                record.state = TaskState::Failed;
                warn!(
                    task_id = id,
                    identifier = record.identifier(),
                    attempt = record.attempt_count,
                    error = %error,
                    "task failed"
                );
                (AuditAction::Failed, Some(error))
            }
        } else if let Some(interval) = record.request.kind().periodic() {
            record.attempt_count = 0;
            record.last_error = None;
            record.next_run_time = now_ms.saturating_add(duration_ms(interval.interval()));
            record.state = TaskState::Scheduled;
            (AuditAction::Rearmed, None)
        } else {
            record.last_error = None;
            record.state = TaskState::Completed;
            (AuditAction::Completed, None)
        };

        info!(
            task_id = id,
            identifier = record.identifier(),
            state = %record.state,
            "task run finished"
        );
        emit(&mut self.audit, id, record.identifier(), action, now_ms, detail);
        Some(record.state)
    }

    /// Force every run-exclusive `Running` record but the oldest of each
    /// identifier to `Failed` and cancel its token.
    pub(crate) fn heal_running_conflicts(&mut self, now_ms: u64) -> Vec<TaskId> {
        let mut by_identifier: BTreeMap<&str, Vec<TaskId>> = BTreeMap::new();
        for record in self.catalog.iter() {
            if record.state == TaskState::Running && record.policy.is_run_exclusive() {
                by_identifier
                    .entry(record.identifier())
                    .or_default()
                    .push(record.id);
            }
        }
        let conflicting: Vec<TaskId> = by_identifier
            .into_values()
            .filter(|ids| ids.len() > 1)
            .flat_map(|ids| ids.into_iter().skip(1))
            .collect();

        for id in &conflicting {
            if let Some(token) = self.tokens.remove(id) {
                token.cancel();
            }
            if let Some(record) = self.catalog.get_mut(*id) {
                record.state = TaskState::Failed;
                record.last_error = Some("conflicting run for the same identifier".to_string());
                warn!(
                    task_id = record.id,
                    identifier = record.identifier(),
                    "conflicting running task forced to failed"
                );
                emit(
                    &mut self.audit,
                    record.id,
                    record.identifier(),
                    AuditAction::Healed,
                    now_ms,
                    None,
                );
            }
        }
        conflicting
    }

    fn expire(&mut self, now_ms: u64) -> Vec<TaskId> {
        let mut expired = Vec::new();
        for record in self.catalog.iter_mut() {
            if !record.state.is_waiting() || record.last_run_time.is_some() {
                continue;
            }
            let Some(lifetime) = self.settings.lifetime_for(&record.request) else {
                continue;
            };
            if now_ms.saturating_sub(record.scheduled_time) >= duration_ms(lifetime) {
                record.state = TaskState::Expired;
                info!(
                    task_id = record.id,
                    identifier = record.identifier(),
                    "task expired before it could run"
                );
                emit(
                    &mut self.audit,
                    record.id,
                    record.identifier(),
                    AuditAction::Expired,
                    now_ms,
                    None,
                );
                expired.push(record.id);
            }
        }
        expired
    }

    /// Cancel the token of every running record.
    pub fn cancel_running_tokens(&self) {
        for token in self.tokens.values() {
            token.cancel();
        }
    }
}

fn emit(
    sink: &mut Option<Box<dyn AuditSink>>,
    task_id: TaskId,
    identifier: &str,
    action: AuditAction,
    now_ms: u64,
    detail: Option<String>,
) {
    if let Some(sink) = sink.as_mut() {
        sink.record(build_audit_event(task_id, identifier, action, now_ms, detail));
    }
}
