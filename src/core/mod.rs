//! Core scheduling abstractions: requests, records, the catalog, the
//! dispatcher and the worker pool that runs executors.

pub mod audit;
pub mod backoff;
pub mod catalog;
pub mod dispatcher;
pub mod environment;
pub mod error;
pub mod executor;
pub mod policy;
pub mod queue;
pub mod record;
pub mod request;
pub mod scheduler;
pub mod worker_pool;

pub use audit::{build_audit_event, AuditAction, AuditEvent, AuditSink, InMemoryAuditSink};
pub use backoff::{BackoffCalculator, DEFAULT_BACKOFF_CEILING};
pub use catalog::{CancelEffect, ScheduleOutcome, TaskCatalog};
pub use dispatcher::{Admission, Completion, Dispatcher, DispatcherSettings, TickReport};
pub use environment::{
    ConstraintEvaluator, ContentTrigger, EnvironmentProvider, EnvironmentSnapshot,
    NetworkRequirement, TaskConstraints, UnmetConstraint, BATTERY_NOT_LOW_THRESHOLD,
    DEFAULT_STORAGE_LOW_THRESHOLD,
};
pub use error::{AppResult, SchedulerError};
pub use executor::{ExecutionOutcome, ExecutionResult, ExecutorSet, FnExecutor, TaskExecutor};
pub use policy::{ExecutionPolicy, ExecutionPolicyResolver, Resolution};
pub use queue::{Candidate, CandidateQueue};
pub use record::{TaskId, TaskRecord, TaskState};
pub use request::{
    BackoffPolicy, PeriodicInterval, Priority, TaskKind, TaskRequest, DEFAULT_BACKOFF_DELAY,
    DEFAULT_MAX_RETRIES, MIN_BACKOFF_DELAY, MIN_PERIODIC_FLEX, MIN_PERIODIC_INTERVAL,
};
pub use scheduler::Scheduler;
pub use worker_pool::{PoolError, PoolStats, WorkerJob, WorkerPool};
