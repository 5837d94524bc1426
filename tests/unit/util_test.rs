//! Tests for utility functions

use std::time::Duration;

use deferred_work::core::Priority;
use deferred_work::util::clock::{duration_ms, now_ms, Clock, ManualClock, SystemClock};

#[test]
fn test_priority_ordering() {
    assert!(Priority::Critical > Priority::High);
    assert!(Priority::High > Priority::Normal);
    assert!(Priority::Normal > Priority::Low);
    assert_eq!(Priority::default(), Priority::Normal);
}

#[test]
fn test_manual_clock_is_shared() {
    let clock = ManualClock::new(1_000);
    let view = clock.clone();

    clock.advance(Duration::from_millis(250));
    assert_eq!(view.now_ms(), 1_250);

    view.set(5_000);
    assert_eq!(clock.now_ms(), 5_000);
}

#[test]
fn test_system_clock_tracks_wall_time() {
    let before = now_ms();
    let observed = SystemClock.now_ms();
    assert!(observed >= before);
}

#[test]
fn test_duration_ms() {
    assert_eq!(duration_ms(Duration::from_secs(3)), 3_000);
    assert_eq!(duration_ms(Duration::MAX), u64::MAX);
}
