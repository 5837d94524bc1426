//! Tests for builder modules

use std::sync::Arc;

use deferred_work::builders::SchedulerBuilder;
use deferred_work::config::SchedulerConfig;
use deferred_work::core::{ExecutionResult, FnExecutor, SchedulerError, TaskRecord};
use tokio_util::sync::CancellationToken;

#[test]
fn test_scheduler_builder_keeps_config() {
    let config = SchedulerConfig::default()
        .with_worker_count(2)
        .with_audit_capacity(16);

    let builder = SchedulerBuilder::new(config);
    assert_eq!(builder.config().pool.worker_count, 2);
    assert_eq!(builder.config().audit_capacity, 16);
}

#[test]
fn test_scheduler_builder_requires_executor() {
    let err = SchedulerBuilder::new(SchedulerConfig::default().with_worker_count(1))
        .build()
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidConfig(_)));
}

#[test]
fn test_scheduler_builder_builds() {
    let scheduler = SchedulerBuilder::new(SchedulerConfig::default().with_worker_count(1))
        .executor(Arc::new(FnExecutor::new(
            |_: &TaskRecord, _: &CancellationToken| ExecutionResult::success(),
        )))
        .build()
        .unwrap();
    assert_eq!(scheduler.pool_stats().worker_count, 1);
    assert_eq!(scheduler.pending_count(), 0);
    scheduler.shutdown();
}
