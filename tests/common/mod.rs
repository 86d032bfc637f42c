//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Offset, TimeZone, Utc};
use tempfile::TempDir;

use crowd_confirm::clock::{Clock, ManualClock};
use crowd_confirm::consensus::{ConsensusEngine, ThresholdPolicy};
use crowd_confirm::daily_reminder::{DailyReminder, DailyReminderPolicy};
use crowd_confirm::db::Database;
use crowd_confirm::dispatcher::{DispatchError, Dispatcher, PushGateway};
use crowd_confirm::models::{DeviceId, Program, ProgramId};
use crowd_confirm::notification::Notification;
use crowd_confirm::program_notifier::ProgramNotifier;
use crowd_confirm::reminders::{ReminderPolicy, ReminderScheduler};
use crowd_confirm::scoring::ScoringEngine;
use crowd_confirm::service::EventService;

/// Gateway that remembers every push it was asked to deliver
#[derive(Default)]
pub struct RecordingGateway {
    sent: Mutex<Vec<(Vec<DeviceId>, Notification)>>,
    fail: Mutex<bool>,
}

impl RecordingGateway {
    pub fn sent(&self) -> Vec<(Vec<DeviceId>, Notification)> {
        self.sent.lock().unwrap().clone()
    }

    /// Pushes whose `data.type` equals `kind`
    pub fn of_kind(&self, kind: &str) -> Vec<(Vec<DeviceId>, Notification)> {
        self.sent()
            .into_iter()
            .filter(|(_, n)| n.data["type"] == kind)
            .collect()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl PushGateway for RecordingGateway {
    async fn send(&self, device_ids: &[DeviceId], notification: &Notification) -> Result<(), DispatchError> {
        self.sent
            .lock()
            .unwrap()
            .push((device_ids.to_vec(), notification.clone()));
        if *self.fail.lock().unwrap() {
            return Err(DispatchError::Gateway("unavailable".to_string()));
        }
        Ok(())
    }
}

/// A wired-up core on a fresh database with a manual clock
pub struct Harness {
    pub db: Database,
    pub clock: ManualClock,
    pub gateway: Arc<RecordingGateway>,
    pub dispatcher: Dispatcher,
    pub engine: Arc<ConsensusEngine>,
    pub scoring: Arc<ScoringEngine>,
    pub service: EventService,
    _dir: Option<TempDir>,
}

/// 2026-06-10 18:00 UTC, outside the default quiet window
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 10, 18, 0, 0).unwrap()
}

impl Harness {
    pub fn new() -> Self {
        Self::build(Database::open_in_memory().unwrap(), None, ThresholdPolicy::Fixed(3))
    }

    pub fn with_policy(policy: ThresholdPolicy) -> Self {
        Self::build(Database::open_in_memory().unwrap(), None, policy)
    }

    /// File-backed database so several pooled connections can race
    pub fn on_disk() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("core.db"), 8, std::time::Duration::from_secs(10)).unwrap();
        Self::build(db, Some(dir), ThresholdPolicy::Fixed(3))
    }

    fn build(db: Database, dir: Option<TempDir>, policy: ThresholdPolicy) -> Self {
        let clock = ManualClock::new(start_time());
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let gateway = Arc::new(RecordingGateway::default());
        let dispatcher = Dispatcher::new(gateway.clone());
        let engine = Arc::new(
            ConsensusEngine::new(
                db.clone(),
                Arc::new(db.clone()),
                Arc::new(db.clone()),
                dispatcher.clone(),
                Arc::clone(&shared_clock),
            )
            .with_policy(policy),
        );
        let scoring = Arc::new(ScoringEngine::new(db.clone(), shared_clock));
        let service = EventService::new(Arc::clone(&engine), Arc::clone(&scoring));

        Self {
            db,
            clock,
            gateway,
            dispatcher,
            engine,
            scoring,
            service,
            _dir: dir,
        }
    }

    /// Program with no end time, starting in an hour
    pub fn add_program(&self, id: ProgramId, title: &str) -> Program {
        self.add_program_at(id, title, self.clock.now() + Duration::hours(1))
    }

    pub fn add_program_at(&self, id: ProgramId, title: &str, starts_at: DateTime<Utc>) -> Program {
        let program = Program {
            id,
            channel_id: 1,
            title: title.to_string(),
            starts_at,
            ends_at: None,
        };
        self.db.upsert_program(&program).unwrap();
        program
    }

    pub fn follow(&self, program_id: ProgramId, devices: &[&str]) {
        for device in devices {
            self.db.follow_program(device, program_id, self.clock.now()).unwrap();
        }
    }

    /// Rename a table so statements against it fail until renamed back
    pub fn rename_table(&self, from: &str, to: &str) {
        let conn = self.db.get_connection().unwrap();
        conn.execute_batch(&format!("ALTER TABLE {from} RENAME TO {to}")).unwrap();
    }

    pub fn reminders(&self, policy: ReminderPolicy) -> ReminderScheduler {
        ReminderScheduler::new(
            self.db.clone(),
            Arc::clone(&self.engine),
            Arc::new(self.db.clone()),
            self.dispatcher.clone(),
            Arc::new(self.clock.clone()),
            policy,
        )
    }

    pub fn program_notifier(&self) -> ProgramNotifier {
        ProgramNotifier::new(self.db.clone(), self.dispatcher.clone(), Arc::new(self.clock.clone()))
    }

    pub fn daily_reminder(&self) -> DailyReminder {
        DailyReminder::new(
            self.db.clone(),
            self.dispatcher.clone(),
            Arc::new(self.clock.clone()),
            DailyReminderPolicy {
                hour: 19,
                quiet_start_hour: 22,
                quiet_end_hour: 7,
                offset: Utc.fix(),
            },
        )
    }
}
