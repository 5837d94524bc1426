//! Priority ordering of admission candidates.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::record::{TaskId, TaskRecord};
use super::request::Priority;

/// A record that passed time, constraint and exclusivity gating this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Record id.
    pub id: TaskId,
    /// Request priority.
    pub priority: Priority,
    /// Record creation time.
    pub scheduled_time: u64,
}

impl From<&TaskRecord> for Candidate {
    fn from(record: &TaskRecord) -> Self {
        Self {
            id: record.id,
            priority: record.request.priority(),
            scheduled_time: record.scheduled_time,
        }
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then oldest, then lowest id (reversed for max-heap).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.scheduled_time.cmp(&self.scheduled_time))
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Max-heap of candidates ordered by (priority desc, scheduled time asc, id asc).
#[derive(Debug, Default)]
pub struct CandidateQueue {
    heap: BinaryHeap<Candidate>,
}

impl CandidateQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate. O(log n).
    pub fn push(&mut self, candidate: Candidate) {
        self.heap.push(candidate);
    }

    /// Remove the best candidate. O(log n).
    pub fn pop(&mut self) -> Option<Candidate> {
        self.heap.pop()
    }

    /// Number of queued candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// No candidates queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl FromIterator<Candidate> for CandidateQueue {
    fn from_iter<I: IntoIterator<Item = Candidate>>(iter: I) -> Self {
        Self {
            heap: iter.into_iter().collect(),
        }
    }
}
