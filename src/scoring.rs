//! Points and daily streaks.
//!
//! Every award appends to `point_entries` and bumps `point_balances` in the
//! same transaction, so the balance is always the sum of the ledger.

use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::clock::Clock;
use crate::db::{from_millis, to_millis, Database};
use crate::error::Result;
use crate::metrics;
use crate::models::{Confirmation, EventId, PointBalance, PointEntry, PointReason};

/// Confirmations at or under this delay, without a reminder, count as fast
pub const FAST_CONFIRM_WINDOW_SECS: i64 = 60;

/// Streak length thresholds and their one-time bonuses
pub const STREAK_BONUSES: [(u32, i64); 4] = [(3, 10), (7, 20), (14, 35), (30, 60)];

/// Fixed point values per reason; bonuses come from [`STREAK_BONUSES`]
#[must_use]
pub const fn points_for(reason: PointReason) -> i64 {
    match reason {
        PointReason::FastConfirm => 5,
        PointReason::ReminderConfirm => 3,
        PointReason::DoubleConfirm => 2,
        PointReason::DailyStreak => 1,
        PointReason::StreakBonus => 0,
    }
}

/// Pick the single reason a confirmation is rewarded for
#[must_use]
pub const fn classify(delay_seconds: i64, reminder_used: bool) -> PointReason {
    if !reminder_used && delay_seconds <= FAST_CONFIRM_WINDOW_SECS {
        PointReason::FastConfirm
    } else if reminder_used {
        PointReason::ReminderConfirm
    } else {
        PointReason::DoubleConfirm
    }
}

/// Streak state after one day of activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreakUpdate {
    pub length: u32,
    /// True when `length` exceeds the stored length
    pub increased: bool,
    /// Bonus for the highest threshold crossed by this update
    pub bonus: Option<i64>,
}

/// Advance a streak given the last active date and today's date
#[must_use]
pub fn advance_streak(previous: u32, last_active: Option<NaiveDate>, today: NaiveDate) -> StreakUpdate {
    let length = match last_active {
        Some(day) if day == today => previous,
        Some(day) if today.pred_opt() == Some(day) => previous + 1,
        _ => 1,
    };
    let increased = length > previous;
    let bonus = if increased {
        STREAK_BONUSES
            .iter()
            .filter(|(threshold, _)| previous < *threshold && *threshold <= length)
            .max_by_key(|(threshold, _)| *threshold)
            .map(|(_, bonus)| *bonus)
    } else {
        None
    };
    StreakUpdate {
        length,
        increased,
        bonus,
    }
}

/// Result of scoring one confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreOutcome {
    /// Ledger rows written, in order
    pub awards: Vec<(PointReason, i64)>,
    pub balance: PointBalance,
}

impl ScoreOutcome {
    /// Sum of all awards
    #[must_use]
    pub fn total(&self) -> i64 {
        self.awards.iter().map(|(_, points)| points).sum()
    }
}

/// Converts confirmations into points and streak state
pub struct ScoringEngine {
    db: Database,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
}

impl ScoringEngine {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            offset: Utc.fix(),
        }
    }

    /// Use a non-UTC calendar for "today"
    #[must_use]
    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    /// Award points for a freshly created confirmation and advance the streak
    pub fn award_confirmation(&self, confirmation: &Confirmation) -> Result<ScoreOutcome> {
        let outcome = self.db.transaction(|tx| self.award_in(tx, confirmation))?;
        self.record_award(confirmation, &outcome);
        Ok(outcome)
    }

    /// Write the ledger rows and balance for `confirmation` on a connection
    /// that is already inside a transaction.
    ///
    /// Callers that commit the confirmation and its award together use this,
    /// then call [`record_award`](Self::record_award) after the commit.
    pub fn award_in(&self, conn: &Connection, confirmation: &Confirmation) -> Result<ScoreOutcome> {
        let now = self.clock.now();
        let today = now.with_timezone(&self.offset).date_naive();
        let device_id = confirmation.device_id.as_str();

        let current = load_balance(conn, device_id)?.unwrap_or_else(|| PointBalance {
            device_id: device_id.to_string(),
            ..PointBalance::default()
        });

        let reason = classify(confirmation.delay_seconds, confirmation.reminder_used);
        let mut awards = vec![(reason, points_for(reason))];

        let streak = advance_streak(current.streak_length, current.last_active, today);
        if streak.increased {
            awards.push((PointReason::DailyStreak, points_for(PointReason::DailyStreak)));
            if let Some(bonus) = streak.bonus {
                awards.push((PointReason::StreakBonus, bonus));
            }
        }

        for (reason, points) in &awards {
            insert_entry(conn, device_id, *points, *reason, Some(confirmation.event_id), now)?;
        }

        let earned: i64 = awards.iter().map(|(_, points)| points).sum();
        conn.execute(
            "INSERT INTO point_balances (device_id, total_points, streak_length, last_active)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(device_id) DO UPDATE SET
                total_points = point_balances.total_points + excluded.total_points,
                streak_length = excluded.streak_length,
                last_active = excluded.last_active",
            params![device_id, earned, streak.length, today],
        )?;

        let balance = load_balance(conn, device_id)?.unwrap_or(current);
        Ok(ScoreOutcome { awards, balance })
    }

    /// Metrics and log line for a committed award
    pub fn record_award(&self, confirmation: &Confirmation, outcome: &ScoreOutcome) {
        for (reason, points) in &outcome.awards {
            metrics::record_points(*reason, *points);
        }
        debug!(
            device_id = %confirmation.device_id,
            event_id = confirmation.event_id,
            earned = outcome.total(),
            streak = outcome.balance.streak_length,
            "confirmation scored"
        );
    }

    /// Current balance, zeroed if the device never scored
    pub fn balance(&self, device_id: &str) -> Result<PointBalance> {
        let conn = self.db.get_connection()?;
        Ok(load_balance(&conn, device_id)?.unwrap_or_else(|| PointBalance {
            device_id: device_id.to_string(),
            ..PointBalance::default()
        }))
    }

    /// Ledger rows for a device, oldest first
    pub fn entries(&self, device_id: &str) -> Result<Vec<PointEntry>> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, device_id, points, reason, event_id, created_at
             FROM point_entries WHERE device_id = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![device_id], |row| {
                Ok(PointEntry {
                    id: row.get(0)?,
                    device_id: row.get(1)?,
                    points: row.get(2)?,
                    reason: row.get(3)?,
                    event_id: row.get(4)?,
                    created_at: from_millis(row.get(5)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn load_balance(conn: &Connection, device_id: &str) -> Result<Option<PointBalance>> {
    Ok(conn
        .query_row(
            "SELECT device_id, total_points, streak_length, last_active FROM point_balances WHERE device_id = ?1",
            params![device_id],
            |row| {
                Ok(PointBalance {
                    device_id: row.get(0)?,
                    total_points: row.get(1)?,
                    streak_length: row.get(2)?,
                    last_active: row.get(3)?,
                })
            },
        )
        .optional()?)
}

fn insert_entry(
    conn: &Connection,
    device_id: &str,
    points: i64,
    reason: PointReason,
    event_id: Option<EventId>,
    at: chrono::DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO point_entries (device_id, points, reason, event_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![device_id, points, reason, event_id, to_millis(at)],
    )?;
    Ok(())
}
