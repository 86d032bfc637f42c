//! Reminder scheduler: nudges roster members who have not answered a PENDING event.
//!
//! Redundancy is bounded, not eliminated. Every pass re-reads the per-event
//! attempt count and the per-day count from `reminder_logs`, so overlapping
//! passes can at worst repeat one attempt slot that the unique key then
//! refuses to record twice.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, Timelike, Utc};
use rusqlite::params;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::consensus::ConsensusEngine;
use crate::db::{from_millis, to_millis, Database};
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::error::Result;
use crate::metrics;
use crate::models::{DeviceId, Event, EventId, ReminderLog};
use crate::notification::PushMessage;
use crate::repository::ProgramCatalog;
use crate::scheduler::Worker;

/// Caps and quiet window applied to event reminders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReminderPolicy {
    pub max_attempts_per_event: u32,
    pub daily_cap: u32,
    pub quiet_start_hour: u32,
    pub quiet_end_hour: u32,
    /// Minimum gap between two attempts for the same event and device
    pub attempt_spacing: Duration,
    pub offset: FixedOffset,
}

impl Default for ReminderPolicy {
    fn default() -> Self {
        Self {
            max_attempts_per_event: 2,
            daily_cap: 8,
            quiet_start_hour: 22,
            quiet_end_hour: 7,
            attempt_spacing: Duration::minutes(10),
            offset: Utc.fix(),
        }
    }
}

impl ReminderPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts_per_event: config.reminders.max_attempts_per_event,
            daily_cap: config.reminders.daily_cap,
            quiet_start_hour: config.reminders.quiet_start_hour,
            quiet_end_hour: config.reminders.quiet_end_hour,
            attempt_spacing: Duration::seconds(config.reminders.attempt_spacing_secs),
            offset: config.local_offset(),
        }
    }

    /// Whether `at` falls in the quiet window, in local time
    #[must_use]
    pub fn is_quiet(&self, at: DateTime<Utc>) -> bool {
        is_quiet_hour(at.with_timezone(&self.offset).hour(), self.quiet_start_hour, self.quiet_end_hour)
    }

    /// UTC bounds `[start, end)` of the local calendar day containing `at`
    #[must_use]
    pub fn local_day_bounds(&self, at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        local_day_bounds(at, self.offset)
    }
}

/// Quiet window check; windows with `start > end` wrap past midnight
#[must_use]
pub const fn is_quiet_hour(hour: u32, start: u32, end: u32) -> bool {
    if start == end {
        false
    } else if start > end {
        hour >= start || hour < end
    } else {
        hour >= start && hour < end
    }
}

/// UTC bounds `[start, end)` of the local day (under `offset`) containing `at`
#[must_use]
pub fn local_day_bounds(at: DateTime<Utc>, offset: FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
    let local_midnight = at.with_timezone(&offset).date_naive().and_time(NaiveTime::MIN);
    let start = (local_midnight - Duration::seconds(i64::from(offset.local_minus_utc()))).and_utc();
    (start, start + Duration::days(1))
}

/// Counters for one reminder pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReminderTickReport {
    pub expired_events: usize,
    pub resumed_fan_outs: usize,
    pub events_scanned: usize,
    pub sent: usize,
    pub muted: usize,
    pub skipped_attempt_cap: usize,
    pub skipped_daily_cap: usize,
    pub skipped_spacing: usize,
    pub failures: usize,
}

enum DeviceOutcome {
    Sent,
    Muted,
    AttemptCap,
    DailyCap,
    Spacing,
    Failed,
}

/// Periodic worker that reminds followers about PENDING events
pub struct ReminderScheduler {
    db: Database,
    engine: Arc<ConsensusEngine>,
    catalog: Arc<dyn ProgramCatalog>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    policy: ReminderPolicy,
}

impl ReminderScheduler {
    pub fn new(
        db: Database,
        engine: Arc<ConsensusEngine>,
        catalog: Arc<dyn ProgramCatalog>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
        policy: ReminderPolicy,
    ) -> Self {
        Self {
            db,
            engine,
            catalog,
            dispatcher,
            clock,
            policy,
        }
    }

    /// One full pass over PENDING events
    pub async fn run_once(&self) -> Result<ReminderTickReport> {
        let mut report = ReminderTickReport {
            expired_events: self.engine.expire_stale_events()?,
            resumed_fan_outs: self.engine.resume_unsent_fan_outs().await?,
            ..ReminderTickReport::default()
        };

        for event in self.engine.list_pending_events()? {
            report.events_scanned += 1;
            if let Err(e) = self.remind_event(&event, &mut report).await {
                report.failures += 1;
                warn!(event_id = event.id, error = %e, "reminder pass failed for event");
            }
        }

        info!(
            events = report.events_scanned,
            sent = report.sent,
            muted = report.muted,
            failures = report.failures,
            "reminder pass complete"
        );
        Ok(report)
    }

    async fn remind_event(&self, event: &Event, report: &mut ReminderTickReport) -> Result<()> {
        let answered = self.engine.confirmed_device_ids(event.id)?;
        let program_title = self
            .catalog
            .get_program(event.program_id)?
            .map_or_else(|| format!("Program {}", event.program_id), |p| p.title);

        // The initiator's report is their answer, even before they confirm it;
        // only the rest of the roster is nudged. Fan-out skips them the same way.
        let pending: Vec<DeviceId> = self
            .engine
            .event_followers(event.id)?
            .into_iter()
            .filter(|device| !answered.contains(device) && *device != event.initiator_device_id)
            .collect();

        for device_id in pending {
            let outcome = match self.remind_device(event, &program_title, &device_id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(event_id = event.id, device_id = %device_id, error = %e, "reminder failed");
                    DeviceOutcome::Failed
                }
            };
            match outcome {
                DeviceOutcome::Sent => report.sent += 1,
                DeviceOutcome::Muted => report.muted += 1,
                DeviceOutcome::AttemptCap => report.skipped_attempt_cap += 1,
                DeviceOutcome::DailyCap => report.skipped_daily_cap += 1,
                DeviceOutcome::Spacing => report.skipped_spacing += 1,
                DeviceOutcome::Failed => report.failures += 1,
            }
        }
        Ok(())
    }

    async fn remind_device(&self, event: &Event, program_title: &str, device_id: &str) -> Result<DeviceOutcome> {
        let now = self.clock.now();

        let (attempts, last_attempt) = self.attempts_for(event.id, device_id)?;
        if attempts >= self.policy.max_attempts_per_event {
            return Ok(DeviceOutcome::AttemptCap);
        }
        if let Some(last) = last_attempt {
            if now - last < self.policy.attempt_spacing {
                return Ok(DeviceOutcome::Spacing);
            }
        }

        let (day_start, day_end) = self.policy.local_day_bounds(now);
        if self.reminders_between(device_id, day_start, day_end)? >= self.policy.daily_cap {
            return Ok(DeviceOutcome::DailyCap);
        }

        let attempt = attempts + 1;
        if self.policy.is_quiet(now) {
            // The attempt is spent even though nothing is delivered.
            self.record(event.id, device_id, attempt, true, now)?;
            metrics::record_reminder(true);
            debug!(event_id = event.id, device_id, attempt, "reminder muted by quiet hours");
            return Ok(DeviceOutcome::Muted);
        }

        let message = PushMessage::EventReminder {
            event_id: event.id,
            program_id: event.program_id,
            program_title: program_title.to_string(),
            attempt,
        };
        let report = self.dispatcher.send(&[device_id.to_string()], &message).await;
        self.record(event.id, device_id, attempt, false, now)?;
        metrics::record_reminder(false);

        Ok(if report == DispatchReport::Failed {
            DeviceOutcome::Failed
        } else {
            DeviceOutcome::Sent
        })
    }

    /// Attempts recorded for an event, muted ones included
    pub fn reminder_logs(&self, event_id: EventId) -> Result<Vec<ReminderLog>> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, device_id, attempt, muted, created_at FROM reminder_logs
             WHERE event_id = ?1 ORDER BY device_id, attempt",
        )?;
        let logs = stmt
            .query_map(params![event_id], |row| {
                Ok(ReminderLog {
                    event_id: row.get(0)?,
                    device_id: row.get(1)?,
                    attempt: row.get(2)?,
                    muted: row.get(3)?,
                    created_at: from_millis(row.get(4)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    fn attempts_for(&self, event_id: EventId, device_id: &str) -> Result<(u32, Option<DateTime<Utc>>)> {
        let conn = self.db.get_connection()?;
        let (count, last): (u32, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), MAX(created_at) FROM reminder_logs WHERE event_id = ?1 AND device_id = ?2",
            params![event_id, device_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((count, last.map(from_millis)))
    }

    fn reminders_between(&self, device_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<u32> {
        let conn = self.db.get_connection()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM reminder_logs WHERE device_id = ?1 AND created_at >= ?2 AND created_at < ?3",
            params![device_id, to_millis(start), to_millis(end)],
            |row| row.get(0),
        )?)
    }

    fn record(&self, event_id: EventId, device_id: &str, attempt: u32, muted: bool, at: DateTime<Utc>) -> Result<()> {
        let conn = self.db.get_connection()?;
        conn.execute(
            "INSERT INTO reminder_logs (event_id, device_id, attempt, muted, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(event_id, device_id, attempt) DO NOTHING",
            params![event_id, device_id, attempt, muted, to_millis(at)],
        )?;
        Ok(())
    }
}

#[async_trait]
impl Worker for ReminderScheduler {
    fn name(&self) -> &'static str {
        "reminders"
    }

    async fn tick(&self) -> anyhow::Result<()> {
        self.run_once().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn quiet_window_wraps_midnight() {
        assert!(is_quiet_hour(22, 22, 7));
        assert!(is_quiet_hour(3, 22, 7));
        assert!(!is_quiet_hour(7, 22, 7));
        assert!(!is_quiet_hour(21, 22, 7));
        assert!(is_quiet_hour(13, 12, 14));
        assert!(!is_quiet_hour(0, 5, 5));
    }

    #[test]
    fn local_day_respects_offset() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        // 23:30 UTC is already the next day at +02:00.
        let at = Utc.with_ymd_and_hms(2026, 7, 1, 23, 30, 0).unwrap();
        let (start, end) = local_day_bounds(at, offset);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 7, 1, 22, 0, 0).unwrap());
        assert_eq!(end - start, Duration::days(1));
    }

    #[test]
    fn policy_quiet_uses_offset() {
        let policy = ReminderPolicy {
            offset: FixedOffset::west_opt(5 * 3600).unwrap(),
            ..ReminderPolicy::default()
        };
        // 04:00 UTC is 23:00 at -05:00.
        assert!(policy.is_quiet(Utc.with_ymd_and_hms(2026, 7, 1, 4, 0, 0).unwrap()));
        assert!(!policy.is_quiet(Utc.with_ymd_and_hms(2026, 7, 1, 15, 0, 0).unwrap()));
    }
}
