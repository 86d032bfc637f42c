//! Evening nudge for devices whose streak lapses tomorrow.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Timelike, Utc};
use rusqlite::params;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::db::{claim_from_insert, to_millis, Claim, Database};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::models::DeviceId;
use crate::notification::PushMessage;
use crate::reminders::is_quiet_hour;
use crate::scheduler::Worker;

/// When the nudge may go out, in local time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyReminderPolicy {
    pub hour: u32,
    pub quiet_start_hour: u32,
    pub quiet_end_hour: u32,
    pub offset: FixedOffset,
}

impl DailyReminderPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            hour: config.daily_reminder.hour,
            quiet_start_hour: config.reminders.quiet_start_hour,
            quiet_end_hour: config.reminders.quiet_end_hour,
            offset: config.local_offset(),
        }
    }

    /// Local day to remind for, or `None` when `at` is too early or quiet
    #[must_use]
    pub fn reminder_day(&self, at: DateTime<Utc>) -> Option<NaiveDate> {
        let local = at.with_timezone(&self.offset);
        if local.hour() < self.hour || is_quiet_hour(local.hour(), self.quiet_start_hour, self.quiet_end_hour) {
            return None;
        }
        Some(local.date_naive())
    }
}

/// Counters for one daily-reminder pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailyTickReport {
    pub candidates: usize,
    pub sent: usize,
    pub already_reminded: usize,
    pub failures: usize,
}

/// Worker that reminds streak holders who have not been active today
pub struct DailyReminder {
    db: Database,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    policy: DailyReminderPolicy,
}

impl DailyReminder {
    pub fn new(db: Database, dispatcher: Dispatcher, clock: Arc<dyn Clock>, policy: DailyReminderPolicy) -> Self {
        Self {
            db,
            dispatcher,
            clock,
            policy,
        }
    }

    pub async fn run_once(&self) -> Result<DailyTickReport> {
        let now = self.clock.now();
        let mut report = DailyTickReport::default();

        let Some(today) = self.policy.reminder_day(now) else {
            return Ok(report);
        };
        let Some(yesterday) = today.pred_opt() else {
            return Ok(report);
        };

        for (device_id, streak_length) in self.streaks_at_risk(yesterday)? {
            report.candidates += 1;
            match self.claim(&device_id, today, now) {
                Ok(Claim::Claimed) => {}
                Ok(Claim::AlreadyClaimed) => {
                    report.already_reminded += 1;
                    continue;
                }
                Err(e) => {
                    report.failures += 1;
                    warn!(device_id = %device_id, error = %e, "daily reminder claim failed");
                    continue;
                }
            }

            let sent = self
                .dispatcher
                .send(&[device_id.clone()], &PushMessage::DailyReminder { streak_length })
                .await;
            if sent.is_sent() {
                report.sent += 1;
            } else {
                report.failures += 1;
            }
            debug!(device_id = %device_id, streak_length, "daily reminder dispatched");
        }

        if report.sent > 0 {
            info!(sent = report.sent, day = %today, "daily reminders sent");
        }
        Ok(report)
    }

    fn streaks_at_risk(&self, yesterday: NaiveDate) -> Result<Vec<(DeviceId, u32)>> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT device_id, streak_length FROM point_balances
             WHERE streak_length > 0 AND last_active = ?1
             ORDER BY device_id",
        )?;
        let rows = stmt
            .query_map(params![yesterday], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn claim(&self, device_id: &str, day: NaiveDate, now: DateTime<Utc>) -> Result<Claim> {
        let conn = self.db.get_connection()?;
        claim_from_insert(conn.execute(
            "INSERT INTO daily_reminder_logs (device_id, day, created_at) VALUES (?1, ?2, ?3)",
            params![device_id, day, to_millis(now)],
        ))
    }
}

#[async_trait]
impl Worker for DailyReminder {
    fn name(&self) -> &'static str {
        "daily_reminder"
    }

    async fn tick(&self) -> anyhow::Result<()> {
        self.run_once().await?;
        Ok(())
    }
}
