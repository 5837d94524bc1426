//! Tests for error types

use std::time::Duration;

use deferred_work::core::{PoolError, SchedulerError};

#[test]
fn test_task_already_exists_error() {
    let err = SchedulerError::TaskAlreadyExists("sync".to_string());
    assert_eq!(format!("{}", err), "task already exists: sync");
}

#[test]
fn test_not_found_by_id_error() {
    let err = SchedulerError::not_found_id(42);
    assert_eq!(format!("{}", err), "task not found: #42");
}

#[test]
fn test_timeout_error() {
    let err = SchedulerError::ExecutorTimeout(Duration::from_secs(30));
    assert_eq!(format!("{}", err), "executor timed out after 30000ms");
    assert!(err.is_execution_error());
}

#[test]
fn test_api_errors_are_not_execution_errors() {
    assert!(!SchedulerError::InvalidRequest("empty identifier".into()).is_execution_error());
    assert!(!SchedulerError::PoolShutdown.is_execution_error());
    assert!(SchedulerError::ExecutorFailure("boom".into()).is_execution_error());
}

#[test]
fn test_pool_errors_convert() {
    assert_eq!(
        SchedulerError::from(PoolError::PoolShutdown),
        SchedulerError::PoolShutdown
    );
    assert!(matches!(
        SchedulerError::from(PoolError::InvalidConfig("bad".into())),
        SchedulerError::InvalidConfig(_)
    ));
}
