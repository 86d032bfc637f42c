//! Event lifecycle: creation, corroboration, validation and the one-time fan-out.
//!
//! Every cross-request invariant is enforced in the store rather than in
//! process memory:
//!
//! - one confirmation per (event, device) via a unique key,
//! - `PENDING -> VALIDATED` via `UPDATE ... WHERE status = 'PENDING'`,
//! - the fan-out via `UPDATE ... WHERE initial_push_sent_at IS NULL`.
//!
//! Whichever transaction's conditional update reports one affected row owns
//! the side effect; everyone else sees zero rows and backs off.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::db::{from_millis, to_millis, Claim, Database};
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::error::{ConflictKind, CoreError, Result};
use crate::metrics;
use crate::models::{
    Choice, Confirmation, CreatedEvent, DeviceId, Event, EventId, EventStatus, NewEventOptions, ProgramId,
};
use crate::notification::PushMessage;
use crate::repository::{insert_follow, FollowerRegistry, ProgramCatalog};

const EVENT_COLUMNS: &str = "id, program_id, initiator_device_id, status, initiated_at, expires_at, \
                             follower_count_limit, validated_at, initial_push_sent_at";

const CONFIRMATION_COLUMNS: &str = "id, event_id, device_id, choice, delay_seconds, reminder_used, created_at";

/// How the corroboration threshold is chosen when an event is created
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdPolicy {
    /// Same threshold for every event
    Fixed(u32),
    /// `ceil(roster * ratio)` clamped to `[min, max]`
    Scaled { ratio: f64, min: u32, max: u32 },
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self::Fixed(3)
    }
}

impl ThresholdPolicy {
    /// Threshold for an event whose roster has `roster_size` devices; never zero
    #[must_use]
    pub fn limit_for(&self, roster_size: usize) -> u32 {
        match *self {
            Self::Fixed(limit) => limit.max(1),
            Self::Scaled { ratio, min, max } => {
                let scaled = (roster_size as f64 * ratio).ceil() as u32;
                scaled.clamp(min.max(1), max.max(min).max(1))
            }
        }
    }
}

/// Result of a confirm call
#[derive(Debug, Clone)]
pub struct ConfirmOutcome {
    /// The device's confirmation, new or pre-existing
    pub confirmation: Confirmation,
    /// False when the device had already confirmed
    pub created: bool,
    /// True only for the request whose conditional update moved the event to VALIDATED
    pub validated: bool,
    /// Event state after the confirm committed
    pub event: Event,
}

/// Result of a fan-out attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanOutOutcome {
    /// This caller claimed the fan-out and handed it to the dispatcher
    Dispatched { recipients: usize, report: DispatchReport },
    /// Another transaction already claimed it
    AlreadyClaimed,
}

enum ConfirmStep<T> {
    Done(ConfirmOutcome, Option<T>),
    Expired,
}

/// Owns the event/confirmation lifecycle
pub struct ConsensusEngine {
    db: Database,
    catalog: Arc<dyn ProgramCatalog>,
    followers: Arc<dyn FollowerRegistry>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    policy: ThresholdPolicy,
    default_expiry: Duration,
}

impl ConsensusEngine {
    pub fn new(
        db: Database,
        catalog: Arc<dyn ProgramCatalog>,
        followers: Arc<dyn FollowerRegistry>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            catalog,
            followers,
            dispatcher,
            clock,
            policy: ThresholdPolicy::default(),
            default_expiry: Duration::hours(1),
        }
    }

    /// Override the threshold policy
    #[must_use]
    pub fn with_policy(mut self, policy: ThresholdPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the expiry used for programs with no end time
    #[must_use]
    pub fn with_default_expiry(mut self, expiry: Duration) -> Self {
        self.default_expiry = expiry;
        self
    }

    /// Open a new PENDING event for a program.
    ///
    /// The roster is the program's followers plus, unless skipped, the
    /// initiator (who also gets a follow record if they had none). Nothing is
    /// dispatched here.
    pub fn create_event(&self, device_id: &str, program_id: ProgramId, opts: &NewEventOptions) -> Result<CreatedEvent> {
        let program = self
            .catalog
            .get_program(program_id)?
            .ok_or_else(|| CoreError::NotFound(format!("program {program_id}")))?;

        let now = self.clock.now();
        let expires_at = opts
            .expires_at
            .or(program.ends_at)
            .unwrap_or_else(|| now + self.default_expiry);

        let mut roster: BTreeSet<DeviceId> = self.followers.list_follower_device_ids(program_id)?.into_iter().collect();
        if !opts.skip_initiator_follow {
            roster.insert(device_id.to_string());
        }
        let followers: Vec<DeviceId> = roster.into_iter().collect();
        let limit = self.policy.limit_for(followers.len());

        let event = self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO events (program_id, initiator_device_id, status, initiated_at, expires_at, follower_count_limit)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    program_id,
                    device_id,
                    EventStatus::Pending,
                    to_millis(now),
                    to_millis(expires_at),
                    limit,
                ],
            )?;
            let event_id = tx.last_insert_rowid();

            let mut stmt =
                tx.prepare("INSERT INTO event_followers (event_id, device_id) VALUES (?1, ?2) ON CONFLICT DO NOTHING")?;
            for follower in &followers {
                stmt.execute(params![event_id, follower])?;
            }

            if !opts.skip_initiator_follow {
                insert_follow(tx, device_id, program_id, now)?;
            }

            load_event(tx, event_id)?.ok_or_else(|| CoreError::NotFound(format!("event {event_id}")))
        })?;

        metrics::record_event_created();
        info!(
            event_id = event.id,
            program_id,
            initiator = device_id,
            followers = followers.len(),
            threshold = limit,
            "event created"
        );

        Ok(CreatedEvent { event, followers })
    }

    /// Record a device's answer to an event.
    ///
    /// Re-confirming returns the original row with `created == false`. When
    /// this confirmation pushes corroborations to the threshold, exactly one
    /// concurrent caller gets `validated == true`.
    pub fn confirm_event(
        &self,
        event_id: EventId,
        device_id: &str,
        choice: Choice,
        reminder_used: bool,
    ) -> Result<ConfirmOutcome> {
        self.confirm_event_with(event_id, device_id, choice, reminder_used, |_, _| Ok(()))
            .map(|(outcome, _)| outcome)
    }

    /// Like [`confirm_event`](Self::confirm_event), running `on_created` inside
    /// the same transaction when a new confirmation row is written.
    ///
    /// An error from `on_created` rolls the confirmation back, so a retried
    /// request inserts it again and reruns the hook.
    pub fn confirm_event_with<T, F>(
        &self,
        event_id: EventId,
        device_id: &str,
        choice: Choice,
        reminder_used: bool,
        on_created: F,
    ) -> Result<(ConfirmOutcome, Option<T>)>
    where
        F: FnOnce(&Connection, &Confirmation) -> Result<T>,
    {
        let now = self.clock.now();

        let step = self.db.transaction(|tx| {
            let event = load_event(tx, event_id)?.ok_or_else(|| CoreError::NotFound(format!("event {event_id}")))?;

            if event.status.is_inactive() {
                return Err(CoreError::Conflict(ConflictKind::Inactive));
            }

            if event.expires_at <= now {
                // A validated event stays validated; only PENDING may expire.
                let expired = tx.execute(
                    "UPDATE events SET status = ?1 WHERE id = ?2 AND status = ?3",
                    params![EventStatus::Expired, event_id, EventStatus::Pending],
                )?;
                if expired > 0 {
                    metrics::record_expired(expired);
                }
                return Ok(ConfirmStep::Expired);
            }

            let delay_seconds = elapsed_seconds(event.initiated_at, now);
            let inserted = tx.execute(
                "INSERT INTO event_confirmations (event_id, device_id, choice, delay_seconds, reminder_used, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(event_id, device_id) DO NOTHING",
                params![event_id, device_id, choice, delay_seconds, reminder_used, to_millis(now)],
            )?;

            let confirmation = find_confirmation(tx, event_id, device_id)?
                .ok_or_else(|| CoreError::NotFound(format!("confirmation for event {event_id}")))?;

            if inserted == 0 {
                return Ok(ConfirmStep::Done(
                    ConfirmOutcome {
                        confirmation,
                        created: false,
                        validated: false,
                        event,
                    },
                    None,
                ));
            }

            let conn: &Connection = tx;
            let extra = on_created(conn, &confirmation)?;

            let corroborations = count_corroborations(tx, event_id)?;
            let mut validated = false;
            if corroborations >= i64::from(event.follower_count_limit) && event.status == EventStatus::Pending {
                validated = tx.execute(
                    "UPDATE events SET status = ?1, validated_at = ?2 WHERE id = ?3 AND status = ?4",
                    params![EventStatus::Validated, to_millis(now), event_id, EventStatus::Pending],
                )? == 1;
            }

            let event = load_event(tx, event_id)?.ok_or_else(|| CoreError::NotFound(format!("event {event_id}")))?;
            Ok(ConfirmStep::Done(
                ConfirmOutcome {
                    confirmation,
                    created: true,
                    validated,
                    event,
                },
                Some(extra),
            ))
        })?;

        match step {
            ConfirmStep::Expired => {
                debug!(event_id, device_id, "confirmation rejected, event expired");
                Err(CoreError::Conflict(ConflictKind::Expired))
            }
            ConfirmStep::Done(outcome, extra) => {
                metrics::record_confirmation(outcome.created);
                if outcome.validated {
                    metrics::record_validated();
                    info!(event_id, confirmer = device_id, "event validated");
                }
                Ok((outcome, extra))
            }
        }
    }

    /// Claim the fan-out for a validated event and dispatch it once.
    ///
    /// Recipients are the program's current followers minus devices that
    /// already confirmed and minus the initiator.
    pub async fn fan_out(&self, event_id: EventId) -> Result<FanOutOutcome> {
        let event = self.get_event(event_id)?;
        let recipients = self.get_followers_pending_notification(event_id, event.program_id)?;
        let program_title = self
            .catalog
            .get_program(event.program_id)?
            .map_or_else(|| format!("Program {}", event.program_id), |p| p.title);

        if self.claim_initial_push(event_id)? == Claim::AlreadyClaimed {
            debug!(event_id, "fan-out already claimed");
            metrics::record_fanout(false);
            return Ok(FanOutOutcome::AlreadyClaimed);
        }
        metrics::record_fanout(true);

        let message = PushMessage::EventStarted {
            event_id,
            program_id: event.program_id,
            program_title,
        };
        let report = self.dispatcher.send(&recipients, &message).await;
        info!(event_id, recipients = recipients.len(), ?report, "fan-out dispatched");

        Ok(FanOutOutcome::Dispatched {
            recipients: recipients.len(),
            report,
        })
    }

    /// Set `initial_push_sent_at` if it is still null and the event is validated
    pub fn claim_initial_push(&self, event_id: EventId) -> Result<Claim> {
        let now = self.clock.now();
        let conn = self.db.get_connection()?;
        let updated = conn.execute(
            "UPDATE events SET initial_push_sent_at = ?1
             WHERE id = ?2 AND initial_push_sent_at IS NULL AND validated_at IS NOT NULL",
            params![to_millis(now), event_id],
        )?;
        Ok(if updated == 1 { Claim::Claimed } else { Claim::AlreadyClaimed })
    }

    /// Re-drive fan-outs for validated events whose claim was never taken
    pub async fn resume_unsent_fan_outs(&self) -> Result<usize> {
        let ids: Vec<EventId> = {
            let conn = self.db.get_connection()?;
            let mut stmt = conn.prepare(
                "SELECT id FROM events
                 WHERE status = ?1 AND validated_at IS NOT NULL AND initial_push_sent_at IS NULL
                 ORDER BY id",
            )?;
            let ids = stmt
                .query_map(params![EventStatus::Validated], |row| row.get(0))?
                .collect::<std::result::Result<Vec<EventId>, _>>()?;
            ids
        };

        let mut dispatched = 0;
        for event_id in ids {
            match self.fan_out(event_id).await {
                Ok(FanOutOutcome::Dispatched { .. }) => dispatched += 1,
                Ok(FanOutOutcome::AlreadyClaimed) => {}
                Err(e) => warn!(event_id, error = %e, "resumed fan-out failed"),
            }
        }
        Ok(dispatched)
    }

    /// Cancel a PENDING event; only its initiator may do so
    pub fn cancel_event(&self, event_id: EventId, device_id: &str) -> Result<Event> {
        self.db.transaction(|tx| {
            let event = load_event(tx, event_id)?.ok_or_else(|| CoreError::NotFound(format!("event {event_id}")))?;
            if event.initiator_device_id != device_id {
                return Err(CoreError::Validation("only the initiator can cancel an event".to_string()));
            }
            let cancelled = tx.execute(
                "UPDATE events SET status = ?1 WHERE id = ?2 AND status = ?3",
                params![EventStatus::Cancelled, event_id, EventStatus::Pending],
            )?;
            if cancelled == 0 {
                return Err(CoreError::Conflict(ConflictKind::Inactive));
            }
            load_event(tx, event_id)?.ok_or_else(|| CoreError::NotFound(format!("event {event_id}")))
        })
    }

    /// Flip every PENDING event past its expiry to EXPIRED
    pub fn expire_stale_events(&self) -> Result<usize> {
        let now = self.clock.now();
        let conn = self.db.get_connection()?;
        let expired = conn.execute(
            "UPDATE events SET status = ?1 WHERE status = ?2 AND expires_at <= ?3",
            params![EventStatus::Expired, EventStatus::Pending, to_millis(now)],
        )?;
        if expired > 0 {
            metrics::record_expired(expired);
            info!(expired, "stale events expired");
        }
        Ok(expired)
    }

    /// Load an event
    pub fn get_event(&self, event_id: EventId) -> Result<Event> {
        let conn = self.db.get_connection()?;
        load_event(&conn, event_id)?.ok_or_else(|| CoreError::NotFound(format!("event {event_id}")))
    }

    /// Unexpired PENDING or VALIDATED events the device follows or is on the roster of
    pub fn list_active_events(&self, device_id: &str) -> Result<Vec<Event>> {
        let now = self.clock.now();
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events e
             WHERE e.status IN (?1, ?2) AND e.expires_at > ?3
               AND (EXISTS (SELECT 1 FROM event_followers f WHERE f.event_id = e.id AND f.device_id = ?4)
                    OR EXISTS (SELECT 1 FROM followed_items fi
                               WHERE fi.target_type = 'PROGRAM' AND fi.target_id = e.program_id AND fi.device_id = ?4))
             ORDER BY e.initiated_at DESC, e.id DESC"
        ))?;
        let events = stmt
            .query_map(
                params![EventStatus::Pending, EventStatus::Validated, to_millis(now), device_id],
                map_event,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// PENDING events that have not yet expired
    pub fn list_pending_events(&self) -> Result<Vec<Event>> {
        let now = self.clock.now();
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE status = ?1 AND expires_at > ?2 ORDER BY id"
        ))?;
        let events = stmt
            .query_map(params![EventStatus::Pending, to_millis(now)], map_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Number of corroborating confirmations
    pub fn get_confirmations_count(&self, event_id: EventId) -> Result<i64> {
        let conn = self.db.get_connection()?;
        count_corroborations(&conn, event_id)
    }

    /// All confirmations for an event, oldest first
    pub fn list_confirmations(&self, event_id: EventId) -> Result<Vec<Confirmation>> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONFIRMATION_COLUMNS} FROM event_confirmations WHERE event_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![event_id], map_confirmation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Devices that already answered the event, in any way
    pub fn confirmed_device_ids(&self, event_id: EventId) -> Result<BTreeSet<DeviceId>> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare("SELECT device_id FROM event_confirmations WHERE event_id = ?1")?;
        let ids = stmt
            .query_map(params![event_id], |row| row.get(0))?
            .collect::<std::result::Result<BTreeSet<DeviceId>, _>>()?;
        Ok(ids)
    }

    /// Roster attached at creation
    pub fn event_followers(&self, event_id: EventId) -> Result<Vec<DeviceId>> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare("SELECT device_id FROM event_followers WHERE event_id = ?1 ORDER BY device_id")?;
        let ids = stmt
            .query_map(params![event_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<DeviceId>, _>>()?;
        Ok(ids)
    }

    /// Current program followers who have neither answered nor initiated the event
    pub fn get_followers_pending_notification(&self, event_id: EventId, program_id: ProgramId) -> Result<Vec<DeviceId>> {
        let event = self.get_event(event_id)?;
        let answered = self.confirmed_device_ids(event_id)?;
        let pending = self
            .followers
            .list_follower_device_ids(program_id)?
            .into_iter()
            .filter(|device| !answered.contains(device) && *device != event.initiator_device_id)
            .collect::<BTreeSet<_>>();
        Ok(pending.into_iter().collect())
    }
}

fn load_event(conn: &Connection, event_id: EventId) -> Result<Option<Event>> {
    Ok(conn
        .query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
            params![event_id],
            map_event,
        )
        .optional()?)
}

fn find_confirmation(conn: &Connection, event_id: EventId, device_id: &str) -> Result<Option<Confirmation>> {
    Ok(conn
        .query_row(
            &format!("SELECT {CONFIRMATION_COLUMNS} FROM event_confirmations WHERE event_id = ?1 AND device_id = ?2"),
            params![event_id, device_id],
            map_confirmation,
        )
        .optional()?)
}

fn count_corroborations(conn: &Connection, event_id: EventId) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM event_confirmations WHERE event_id = ?1 AND choice = ?2",
        params![event_id, Choice::Corroborate],
        |row| row.get(0),
    )?)
}

fn map_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        program_id: row.get(1)?,
        initiator_device_id: row.get(2)?,
        status: row.get(3)?,
        initiated_at: from_millis(row.get(4)?),
        expires_at: from_millis(row.get(5)?),
        follower_count_limit: row.get(6)?,
        validated_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
        initial_push_sent_at: row.get::<_, Option<i64>>(8)?.map(from_millis),
    })
}

fn map_confirmation(row: &Row<'_>) -> rusqlite::Result<Confirmation> {
    Ok(Confirmation {
        id: row.get(0)?,
        event_id: row.get(1)?,
        device_id: row.get(2)?,
        choice: row.get(3)?,
        delay_seconds: row.get(4)?,
        reminder_used: row.get(5)?,
        created_at: from_millis(row.get(6)?),
    })
}

/// Seconds elapsed between two instants, floored at zero
#[must_use]
pub fn elapsed_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_seconds().max(0)
}
