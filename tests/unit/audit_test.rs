//! Tests for audit sink

use deferred_work::core::{build_audit_event, AuditAction, AuditSink, InMemoryAuditSink};

#[test]
fn test_in_memory_audit_sink() {
    let mut sink = InMemoryAuditSink::new(10);

    let event = build_audit_event(
        1,
        "sync",
        AuditAction::Scheduled,
        1_000,
        Some("policy=keep".to_string()),
    );

    sink.record(event.clone());
    assert_eq!(sink.events().len(), 1);

    let events = sink.events();
    assert_eq!(events[0], event);
    assert_eq!(events[0].identifier, "sync");
    assert_eq!(events[0].action, AuditAction::Scheduled);
}

#[test]
fn test_audit_sink_overflow() {
    let mut sink = InMemoryAuditSink::new(2);

    sink.record(build_audit_event(1, "a", AuditAction::Scheduled, 1, None));
    sink.record(build_audit_event(2, "b", AuditAction::Scheduled, 2, None));
    sink.record(build_audit_event(3, "c", AuditAction::Scheduled, 3, None));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].task_id, 2); // First one popped
    assert_eq!(events[1].task_id, 3);
}

#[test]
fn test_clones_share_events() {
    let sink = InMemoryAuditSink::new(8);
    let mut writer = sink.clone();

    writer.record(build_audit_event(7, "upload", AuditAction::Scheduled, 1, None));
    writer.record(build_audit_event(7, "upload", AuditAction::Admitted, 2, None));
    writer.record(build_audit_event(8, "other", AuditAction::Scheduled, 3, None));

    assert_eq!(
        sink.actions_for(7),
        vec![AuditAction::Scheduled, AuditAction::Admitted]
    );
}

#[test]
fn test_build_audit_event() {
    let a = build_audit_event(5, "sync", AuditAction::Retried, 1_234, Some("boom".to_string()));
    let b = build_audit_event(5, "sync", AuditAction::Retried, 1_234, None);

    assert_eq!(a.task_id, 5);
    assert_eq!(a.created_at_ms, 1_234);
    assert_eq!(a.detail, Some("boom".to_string()));
    assert_ne!(a.event_id, b.event_id);
    assert_eq!(AuditAction::CancelRequested.to_string(), "cancel_requested");
}
