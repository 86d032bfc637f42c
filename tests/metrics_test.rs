//! Unit tests for metrics.rs module

use std::collections::HashSet;
use std::time::Duration;

use crowd_confirm::metrics::*;
use crowd_confirm::models::{PointReason, ReminderType};

#[test]
fn test_metric_names_are_prefixed_and_unique() {
    let names = [
        EVENTS_CREATED_TOTAL,
        CONFIRMATIONS_TOTAL,
        EVENTS_VALIDATED_TOTAL,
        EVENTS_EXPIRED_TOTAL,
        FANOUTS_TOTAL,
        DISPATCHES_TOTAL,
        DISPATCH_RECIPIENTS_TOTAL,
        REMINDERS_TOTAL,
        PROGRAM_NOTIFICATIONS_TOTAL,
        POINTS_AWARDED_TOTAL,
        WORKER_TICK_DURATION,
        WORKER_TICK_ERRORS_TOTAL,
    ];

    assert!(names.iter().all(|name| name.starts_with("crowd_confirm_")));
    assert_eq!(names.iter().collect::<HashSet<_>>().len(), names.len());
}

#[test]
fn test_recording_without_installed_recorder() {
    record_event_created();
    record_confirmation(true);
    record_confirmation(false);
    record_validated();
    record_expired(3);
    record_fanout(true);
    record_dispatch("EVENT_STARTED", 12, false);
    record_reminder(true);
    record_program_notification(ReminderType::Started);
    record_points(PointReason::StreakBonus, 35);
    record_worker_tick("reminders", Duration::from_millis(250), false);
}
