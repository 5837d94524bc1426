//! Tests for configuration validation

use std::time::Duration;

use deferred_work::config::{SchedulerConfig, WorkerPoolConfig};

#[test]
fn test_pool_config_validation() {
    let valid = WorkerPoolConfig::new()
        .with_worker_count(4)
        .with_max_queue_depth(8);
    assert!(valid.validate().is_ok());
}

#[test]
fn test_pool_config_invalid_worker_count() {
    let invalid = WorkerPoolConfig::new().with_worker_count(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_invalid_queue_depth() {
    let invalid = WorkerPoolConfig::new().with_max_queue_depth(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_invalid_stack_size() {
    let invalid = WorkerPoolConfig::new().with_thread_stack_size(1024);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_scheduler_config_validation() {
    let config = SchedulerConfig::default()
        .with_worker_count(2)
        .with_tick_interval(Duration::from_millis(250))
        .with_max_pending_lifetime(None);
    assert!(config.validate().is_ok());
    assert_eq!(config.pool.max_queue_depth, 2);
    assert_eq!(config.tick_interval(), Duration::from_millis(250));
    assert_eq!(config.max_pending_lifetime(), None);
}

#[test]
fn test_scheduler_config_invalid_timeout() {
    let config = SchedulerConfig::default().with_one_shot_timeout(Duration::ZERO);
    assert!(config.validate().is_err());
}

#[test]
fn test_scheduler_config_from_json() {
    let json = r#"{
        "pool": {
            "worker_count": 3,
            "max_queue_depth": 6
        },
        "tick_interval_ms": 500,
        "periodic_timeout_ms": 45000,
        "max_pending_lifetime_secs": null
    }"#;

    let config = SchedulerConfig::from_json_str(json).unwrap();
    assert_eq!(config.pool.worker_count, 3);
    assert_eq!(config.pool.max_queue_depth, 6);
    assert_eq!(config.periodic_timeout(), Duration::from_secs(45));
    assert_eq!(config.one_shot_timeout(), Duration::from_secs(600));
    assert_eq!(config.max_pending_lifetime(), None);
}

#[test]
fn test_scheduler_config_from_json_rejects_invalid() {
    assert!(SchedulerConfig::from_json_str(r#"{ "tick_interval_ms": 0 }"#).is_err());
    assert!(SchedulerConfig::from_json_str("not json").is_err());
}
