//! Audit sink implementations.
//!
//! The dispatcher reports every lifecycle transition to an optional
//! [`AuditSink`]. [`InMemoryAuditSink`] keeps a bounded ring of events and can
//! be cloned so callers keep a handle after giving it to the scheduler.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::record::TaskId;

/// Lifecycle transition being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Record created.
    Scheduled,
    /// Waiting record dropped by a `Replace` request.
    Replaced,
    /// Handed to the executor.
    Admitted,
    /// Admission undone because the worker pool refused the job.
    Requeued,
    /// One-shot finished successfully.
    Completed,
    /// Periodic task re-armed after success.
    Rearmed,
    /// Failed run rescheduled with backoff.
    Retried,
    /// Out of retries.
    Failed,
    /// Cancel requested on a running record.
    CancelRequested,
    /// Record cancelled.
    Cancelled,
    /// Pending lifetime elapsed.
    Expired,
    /// Terminal record removed.
    Pruned,
    /// Forced to `Failed` to restore per-identifier run exclusivity.
    Healed,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Scheduled => "scheduled",
            Self::Replaced => "replaced",
            Self::Admitted => "admitted",
            Self::Requeued => "requeued",
            Self::Completed => "completed",
            Self::Rearmed => "rearmed",
            Self::Retried => "retried",
            Self::Failed => "failed",
            Self::CancelRequested => "cancel_requested",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Pruned => "pruned",
            Self::Healed => "healed",
        };
        f.write_str(name)
    }
}

/// Audit event structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Related record id.
    pub task_id: TaskId,
    /// Related task identifier.
    pub identifier: String,
    /// Transition.
    pub action: AuditAction,
    /// Timestamp milliseconds.
    pub created_at_ms: u64,
    /// Additional context.
    pub detail: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// In-memory audit sink for testing and dev.
#[derive(Debug, Clone)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events.min(1024)))),
            max_events: max_events.max(1),
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Actions recorded for one record, oldest first.
    #[must_use]
    pub fn actions_for(&self, task_id: TaskId) -> Vec<AuditAction> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.task_id == task_id)
            .map(|e| e.action)
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Helper to build an audit event with a fresh event id.
pub fn build_audit_event(
    task_id: TaskId,
    identifier: impl Into<String>,
    action: AuditAction,
    created_at_ms: u64,
    detail: Option<String>,
) -> AuditEvent {
    AuditEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        task_id,
        identifier: identifier.into(),
        action,
        created_at_ms,
        detail,
    }
}
