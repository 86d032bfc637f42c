//! Metrics collection
//!
//! Thin wrappers over the `metrics` facade. Without an installed recorder
//! every call is a no-op, so tests and the CLI pay nothing.

use std::time::Duration;

use metrics::{counter, histogram};

use crate::models::{PointReason, ReminderType};

pub const EVENTS_CREATED_TOTAL: &str = "crowd_confirm_events_created_total";
pub const CONFIRMATIONS_TOTAL: &str = "crowd_confirm_confirmations_total";
pub const EVENTS_VALIDATED_TOTAL: &str = "crowd_confirm_events_validated_total";
pub const EVENTS_EXPIRED_TOTAL: &str = "crowd_confirm_events_expired_total";
pub const FANOUTS_TOTAL: &str = "crowd_confirm_fanouts_total";
pub const DISPATCHES_TOTAL: &str = "crowd_confirm_dispatches_total";
pub const DISPATCH_RECIPIENTS_TOTAL: &str = "crowd_confirm_dispatch_recipients_total";
pub const REMINDERS_TOTAL: &str = "crowd_confirm_reminders_total";
pub const PROGRAM_NOTIFICATIONS_TOTAL: &str = "crowd_confirm_program_notifications_total";
pub const POINTS_AWARDED_TOTAL: &str = "crowd_confirm_points_awarded_total";
pub const WORKER_TICK_DURATION: &str = "crowd_confirm_worker_tick_duration_seconds";
pub const WORKER_TICK_ERRORS_TOTAL: &str = "crowd_confirm_worker_tick_errors_total";

pub fn record_event_created() {
    counter!(EVENTS_CREATED_TOTAL).increment(1);
}

pub fn record_confirmation(created: bool) {
    let outcome = if created { "created" } else { "duplicate" };
    counter!(CONFIRMATIONS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_validated() {
    counter!(EVENTS_VALIDATED_TOTAL).increment(1);
}

pub fn record_expired(count: usize) {
    counter!(EVENTS_EXPIRED_TOTAL).increment(count as u64);
}

/// `claimed` is false when another request already owned the fan-out
pub fn record_fanout(claimed: bool) {
    let outcome = if claimed { "claimed" } else { "lost_race" };
    counter!(FANOUTS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_dispatch(kind: &'static str, recipients: usize, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(DISPATCHES_TOTAL, "kind" => kind, "status" => status).increment(1);
    if success {
        counter!(DISPATCH_RECIPIENTS_TOTAL, "kind" => kind).increment(recipients as u64);
    }
}

pub fn record_reminder(muted: bool) {
    let outcome = if muted { "muted" } else { "sent" };
    counter!(REMINDERS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_program_notification(tier: ReminderType) {
    counter!(PROGRAM_NOTIFICATIONS_TOTAL, "tier" => tier.as_str()).increment(1);
}

pub fn record_points(reason: PointReason, points: i64) {
    counter!(POINTS_AWARDED_TOTAL, "reason" => reason.as_str()).increment(points.max(0) as u64);
}

pub fn record_worker_tick(worker: &'static str, duration: Duration, success: bool) {
    histogram!(WORKER_TICK_DURATION, "worker" => worker).record(duration.as_secs_f64());
    if !success {
        counter!(WORKER_TICK_ERRORS_TOTAL, "worker" => worker).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_event_created();
        record_confirmation(true);
        record_fanout(false);
        record_dispatch("EVENT_STARTED", 3, true);
        record_points(PointReason::FastConfirm, 5);
        record_program_notification(ReminderType::Started);
        record_worker_tick("reminders", Duration::from_millis(12), false);
    }
}
