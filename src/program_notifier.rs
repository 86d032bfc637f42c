//! Program-start notifier.
//!
//! Four lookahead tiers around each program's `starts_at`. Windows are two
//! minutes wide so any tick inside them catches the program; the unique
//! `(program_id, reminder_type)` row decides which tick actually sends.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::db::{claim_from_insert, to_millis, Claim, Database};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::metrics;
use crate::models::{DeviceId, Program, ReminderType, Sensitivity, PROGRAM_TARGET};
use crate::notification::PushMessage;
use crate::repository::map_program;
use crate::scheduler::Worker;

/// Inclusive `[start, end]` range of `starts_at` values a tier picks up at `now`
#[must_use]
pub fn tier_window(tier: ReminderType, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    match tier {
        ReminderType::Started => (now - Duration::seconds(60), now),
        _ => {
            let nominal = now + Duration::minutes(tier.minutes_before());
            (nominal - Duration::minutes(1), nominal + Duration::minutes(1))
        }
    }
}

/// Counters for one notifier pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramTickReport {
    pub programs_matched: usize,
    pub claimed: usize,
    pub already_claimed: usize,
    pub no_eligible_devices: usize,
    pub devices_notified: usize,
    pub failures: usize,
}

/// Periodic worker sending "starts soon" and "started" pushes
pub struct ProgramNotifier {
    db: Database,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
}

impl ProgramNotifier {
    pub fn new(db: Database, dispatcher: Dispatcher, clock: Arc<dyn Clock>) -> Self {
        Self { db, dispatcher, clock }
    }

    /// One pass over all four tiers
    pub async fn run_once(&self) -> Result<ProgramTickReport> {
        let now = self.clock.now();
        let mut report = ProgramTickReport::default();

        for tier in ReminderType::ALL {
            let (start, end) = tier_window(tier, now);
            for program in self.followed_programs_between(start, end)? {
                report.programs_matched += 1;
                if let Err(e) = self.notify(&program, tier, now, &mut report).await {
                    report.failures += 1;
                    warn!(program_id = program.id, tier = %tier, error = %e, "program notification failed");
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                devices = report.devices_notified,
                "program notifications sent"
            );
        }
        Ok(report)
    }

    async fn notify(
        &self,
        program: &Program,
        tier: ReminderType,
        now: DateTime<Utc>,
        report: &mut ProgramTickReport,
    ) -> Result<()> {
        let devices = self.eligible_devices(program.id, tier)?;
        if devices.is_empty() {
            report.no_eligible_devices += 1;
            return Ok(());
        }

        if self.claim(program.id, tier, now)? == Claim::AlreadyClaimed {
            debug!(program_id = program.id, tier = %tier, "tier already claimed");
            report.already_claimed += 1;
            return Ok(());
        }
        report.claimed += 1;

        let message = match tier {
            ReminderType::Started => PushMessage::ProgramStarted {
                program_id: program.id,
                program_title: program.title.clone(),
            },
            _ => PushMessage::ProgramStartSoon {
                program_id: program.id,
                program_title: program.title.clone(),
                minutes: tier.minutes_before(),
            },
        };

        let sent = self.dispatcher.send(&devices, &message).await;
        metrics::record_program_notification(tier);
        if sent.is_sent() {
            report.devices_notified += devices.len();
        } else {
            report.failures += 1;
        }
        Ok(())
    }

    fn followed_programs_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Program>> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT p.id, p.channel_id, p.title, p.starts_at, p.ends_at FROM programs p
             WHERE p.starts_at >= ?1 AND p.starts_at <= ?2
               AND EXISTS (SELECT 1 FROM followed_items f WHERE f.target_type = ?3 AND f.target_id = p.id)
             ORDER BY p.starts_at, p.id",
        )?;
        let programs = stmt
            .query_map(params![to_millis(start), to_millis(end), PROGRAM_TARGET], map_program)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(programs)
    }

    /// Followers whose sensitivity includes `tier`; unset settings read as HIGH
    fn eligible_devices(&self, program_id: i64, tier: ReminderType) -> Result<Vec<DeviceId>> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT f.device_id, COALESCE(s.notification_sensitivity, ?1)
             FROM followed_items f
             LEFT JOIN device_settings s ON s.device_id = f.device_id
             WHERE f.target_type = ?2 AND f.target_id = ?3
             ORDER BY f.device_id",
        )?;
        let rows = stmt
            .query_map(params![Sensitivity::default(), PROGRAM_TARGET, program_id], |row| {
                Ok((row.get::<_, DeviceId>(0)?, row.get::<_, Sensitivity>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter(|(_, sensitivity)| sensitivity.receives(tier))
            .map(|(device_id, _)| device_id)
            .collect())
    }

    fn claim(&self, program_id: i64, tier: ReminderType, now: DateTime<Utc>) -> Result<Claim> {
        let conn = self.db.get_connection()?;
        claim_from_insert(conn.execute(
            "INSERT INTO program_notification_logs (program_id, reminder_type, created_at) VALUES (?1, ?2, ?3)",
            params![program_id, tier, to_millis(now)],
        ))
    }
}

#[async_trait]
impl Worker for ProgramNotifier {
    fn name(&self) -> &'static str {
        "program_notifier"
    }

    async fn tick(&self) -> anyhow::Result<()> {
        self.run_once().await?;
        Ok(())
    }
}
