//! Crowd Confirm - Crowd-verified broadcast events
//!
//! Viewers report that a broadcast moment has started; once enough followers
//! corroborate it, the event is validated and every remaining follower gets
//! exactly one push.
//!
//! # Features
//!
//! - Threshold-based event validation with store-level compare-and-set
//! - Idempotent one-time fan-out
//! - Capped, quiet-hour aware reminders for pending events
//! - Program-start notifications in sensitivity tiers
//! - Points, daily streaks and streak bonuses

/// Injectable wall clock
pub mod clock;
/// Configuration management
pub mod config;
/// Event lifecycle and validation
pub mod consensus;
/// Streak-at-risk reminders
pub mod daily_reminder;
/// Database operations and connection pooling
pub mod db;
/// Push delivery seam
pub mod dispatcher;
/// Error types
pub mod error;
/// Logging setup and utilities
pub mod logging;
/// Metrics collection
pub mod metrics;
/// Data models and structures
pub mod models;
/// Push payloads
pub mod notification;
/// Program-start notifications
pub mod program_notifier;
/// Pending-event reminders
pub mod reminders;
/// Catalog and follower registry
pub mod repository;
/// Periodic worker driver
pub mod scheduler;
/// Points and streaks
pub mod scoring;
/// Request-level entry point
pub mod service;
/// Input validation and sanitization
pub mod validation;

// Re-export key components for easier access
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use consensus::{ConsensusEngine, ThresholdPolicy};
pub use db::Database;
pub use dispatcher::{Dispatcher, PushGateway};
pub use error::{ConflictKind, CoreError, Result};
pub use models::{Choice, Event, EventStatus, Program, Sensitivity};
pub use service::EventService;
