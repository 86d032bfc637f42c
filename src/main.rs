use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use crowd_confirm::clock::{Clock, SystemClock};
use crowd_confirm::config::AppConfig;
use crowd_confirm::consensus::ConsensusEngine;
use crowd_confirm::daily_reminder::{DailyReminder, DailyReminderPolicy};
use crowd_confirm::db::Database;
use crowd_confirm::dispatcher::{Dispatcher, LogGateway};
use crowd_confirm::logging::init_logging;
use crowd_confirm::models::{Choice, NewEventOptions, Program, Sensitivity};
use crowd_confirm::program_notifier::ProgramNotifier;
use crowd_confirm::reminders::{ReminderPolicy, ReminderScheduler};
use crowd_confirm::scheduler::{spawn_worker, WorkerHandle};
use crowd_confirm::scoring::ScoringEngine;
use crowd_confirm::service::EventService;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/default + config/local)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all background workers until Ctrl-C
    Run,
    /// Insert or update a catalog program
    AddProgram {
        #[arg(long)]
        id: i64,

        #[arg(long, default_value = "1")]
        channel: i64,

        #[arg(long)]
        title: String,

        /// Start time (RFC 3339)
        #[arg(long)]
        starts_at: DateTime<Utc>,

        /// End time (RFC 3339)
        #[arg(long)]
        ends_at: Option<DateTime<Utc>>,
    },
    /// Follow a program from a device
    Follow {
        #[arg(short, long)]
        device: String,

        #[arg(short, long)]
        program: i64,

        /// Program-start notification tier
        #[arg(long, value_enum)]
        sensitivity: Option<SensitivityArg>,
    },
    /// Report that a program moment has started
    CreateEvent {
        #[arg(short, long)]
        device: String,

        #[arg(short, long)]
        program: i64,

        /// Leave the initiator off the roster
        #[arg(long)]
        skip_follow: bool,
    },
    /// Answer an event
    Confirm {
        #[arg(short, long)]
        event: i64,

        #[arg(short, long)]
        device: String,

        /// Record a denial instead of a corroboration
        #[arg(long)]
        deny: bool,

        /// The device arrived through a reminder
        #[arg(long)]
        reminder: bool,
    },
    /// Print an event and its confirmations
    ShowEvent {
        #[arg(short, long)]
        event: i64,
    },
    /// Run a single pass of one worker
    Tick {
        #[arg(value_enum)]
        worker: WorkerKind,
    },
    /// Print a device's points and streak
    Balance {
        #[arg(short, long)]
        device: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SensitivityArg {
    High,
    Medium,
    Low,
}

impl From<SensitivityArg> for Sensitivity {
    fn from(arg: SensitivityArg) -> Self {
        match arg {
            SensitivityArg::High => Self::High,
            SensitivityArg::Medium => Self::Medium,
            SensitivityArg::Low => Self::Low,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum WorkerKind {
    Reminders,
    ProgramNotifier,
    DailyReminder,
}

/// Everything the commands need, wired from configuration
struct App {
    config: AppConfig,
    db: Database,
    clock: Arc<dyn Clock>,
    engine: Arc<ConsensusEngine>,
    service: EventService,
    dispatcher: Dispatcher,
}

impl App {
    fn build(config: AppConfig) -> Result<Self> {
        let db = Database::open(
            std::path::Path::new(&config.database.path),
            config.database.max_connections,
            Duration::from_millis(config.database.busy_timeout_ms),
        )
        .context("Failed to open database")?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let dispatcher = Dispatcher::new(Arc::new(LogGateway));
        let engine = Arc::new(
            ConsensusEngine::new(
                db.clone(),
                Arc::new(db.clone()),
                Arc::new(db.clone()),
                dispatcher.clone(),
                Arc::clone(&clock),
            )
            .with_policy(config.threshold_policy())
            .with_default_expiry(chrono::Duration::minutes(config.consensus.default_expiry_minutes)),
        );
        let scoring = Arc::new(ScoringEngine::new(db.clone(), Arc::clone(&clock)).with_offset(config.local_offset()));
        let service = EventService::new(Arc::clone(&engine), scoring);

        Ok(Self {
            config,
            db,
            clock,
            engine,
            service,
            dispatcher,
        })
    }

    fn reminders(&self) -> ReminderScheduler {
        ReminderScheduler::new(
            self.db.clone(),
            Arc::clone(&self.engine),
            Arc::new(self.db.clone()),
            self.dispatcher.clone(),
            Arc::clone(&self.clock),
            ReminderPolicy::from_config(&self.config),
        )
    }

    fn program_notifier(&self) -> ProgramNotifier {
        ProgramNotifier::new(self.db.clone(), self.dispatcher.clone(), Arc::clone(&self.clock))
    }

    fn daily_reminder(&self) -> DailyReminder {
        DailyReminder::new(
            self.db.clone(),
            self.dispatcher.clone(),
            Arc::clone(&self.clock),
            DailyReminderPolicy::from_config(&self.config),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };

    // Initialize logging; the guard flushes the file writer on exit
    let _guard = init_logging(
        Some(&config.get_log_level()),
        config.logging.file_path.as_deref().map(std::path::Path::new),
        config.logging.format == "json",
    )?;

    let app = App::build(config)?;

    match cli.command {
        Commands::Run => run_workers(&app).await?,
        Commands::AddProgram {
            id,
            channel,
            title,
            starts_at,
            ends_at,
        } => {
            let program = Program {
                id,
                channel_id: channel,
                title,
                starts_at,
                ends_at,
            };
            app.db.upsert_program(&program)?;
            info!(program_id = id, title = %program.title, "program saved");
        },
        Commands::Follow {
            device,
            program,
            sensitivity,
        } => {
            let created = app.db.follow_program(&device, program, app.clock.now())?;
            if let Some(sensitivity) = sensitivity {
                app.db.set_notification_sensitivity(&device, sensitivity.into())?;
            }
            info!(device_id = %device, program_id = program, created, "follow recorded");
        },
        Commands::CreateEvent {
            device,
            program,
            skip_follow,
        } => {
            let opts = NewEventOptions {
                skip_initiator_follow: skip_follow,
                ..NewEventOptions::default()
            };
            let created = app.service.create_event(&device, program, &opts)?;
            info!(
                event_id = created.event.id,
                followers = created.followers.len(),
                threshold = created.event.follower_count_limit,
                expires_at = %created.event.expires_at,
                "event created"
            );
        },
        Commands::Confirm {
            event,
            device,
            deny,
            reminder,
        } => {
            let choice = if deny { Choice::Deny } else { Choice::Corroborate };
            let report = app.service.confirm_event(event, &device, choice, reminder).await?;
            info!(
                event_id = event,
                created = report.created,
                validated = report.validated,
                status = %report.event.status,
                points = report.score.as_ref().map_or(0, |s| s.total()),
                fan_out = ?report.fan_out,
                "confirmation recorded"
            );
        },
        Commands::ShowEvent { event } => {
            let found = app.service.get_event(event)?;
            let confirmations = app.engine.list_confirmations(event)?;
            info!(event = %serde_json::to_string(&found)?, "event");
            for confirmation in confirmations {
                info!(
                    device_id = %confirmation.device_id,
                    choice = %confirmation.choice,
                    delay_seconds = confirmation.delay_seconds,
                    reminder_used = confirmation.reminder_used,
                    "confirmation"
                );
            }
        },
        Commands::Tick { worker } => match worker {
            WorkerKind::Reminders => {
                let report = app.reminders().run_once().await?;
                info!(?report, "reminder pass");
            },
            WorkerKind::ProgramNotifier => {
                let report = app.program_notifier().run_once().await?;
                info!(?report, "program notifier pass");
            },
            WorkerKind::DailyReminder => {
                let report = app.daily_reminder().run_once().await?;
                info!(?report, "daily reminder pass");
            },
        },
        Commands::Balance { device } => {
            let balance = app.service.scoring().balance(&device)?;
            info!(
                device_id = %device,
                total_points = balance.total_points,
                streak_length = balance.streak_length,
                last_active = ?balance.last_active,
                "balance"
            );
        },
    }

    Ok(())
}

/// Spawn every worker and stop them all on Ctrl-C
async fn run_workers(app: &App) -> Result<()> {
    info!("Starting crowd-confirm workers");

    let mut handles: Vec<WorkerHandle> = vec![
        spawn_worker(
            Arc::new(app.reminders()),
            Duration::from_secs(app.config.reminders.interval_secs),
        ),
        spawn_worker(
            Arc::new(app.program_notifier()),
            Duration::from_secs(app.config.program_notifier.interval_secs),
        ),
    ];
    if app.config.daily_reminder.enabled {
        handles.push(spawn_worker(
            Arc::new(app.daily_reminder()),
            Duration::from_secs(app.config.daily_reminder.interval_secs),
        ));
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C, shutting down");
    }
    info!("Shutdown requested");

    for handle in handles {
        handle.stop().await;
    }
    Ok(())
}
