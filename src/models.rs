//! Data models for events, confirmations, reminders and points
//!
//! Row types mirror the tables created by the migrations in `migrations/`.
//! Enum columns are stored as upper-case text; the `sql_text_enum!` macro
//! wires each enum into rusqlite's `ToSql`/`FromSql`.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a registered device
pub type DeviceId = String;
/// Primary key of a program in the catalog
pub type ProgramId = i64;
/// Primary key of an event
pub type EventId = i64;

/// Follow target type for programs in `followed_items`
pub const PROGRAM_TARGET: &str = "PROGRAM";

macro_rules! sql_text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stored text representation
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

/// Catalog entry for a broadcast program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub id: ProgramId,
    pub channel_id: i64,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    /// Programs without a scheduled end are allowed
    pub ends_at: Option<DateTime<Utc>>,
}

/// Lifecycle state of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Validated,
    Expired,
    Cancelled,
}

sql_text_enum!(EventStatus {
    Pending => "PENDING",
    Validated => "VALIDATED",
    Expired => "EXPIRED",
    Cancelled => "CANCELLED",
});

impl EventStatus {
    /// Cancelled and expired events accept nothing further
    #[must_use]
    pub const fn is_inactive(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }
}

/// A crowd-verification case tied to one program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub program_id: ProgramId,
    pub initiator_device_id: DeviceId,
    pub status: EventStatus,
    pub initiated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Corroborations needed to validate, fixed at creation
    pub follower_count_limit: u32,
    pub validated_at: Option<DateTime<Utc>>,
    pub initial_push_sent_at: Option<DateTime<Utc>>,
}

/// Options accepted by event creation
#[derive(Debug, Clone, Default)]
pub struct NewEventOptions {
    /// Do not add the initiator to the roster or create a follow for them
    pub skip_initiator_follow: bool,
    /// Explicit expiry, overriding the program end
    pub expires_at: Option<DateTime<Utc>>,
}

/// Result of event creation
#[derive(Debug, Clone)]
pub struct CreatedEvent {
    pub event: Event,
    /// Roster attached to the event at creation time
    pub followers: Vec<DeviceId>,
}

/// A device's answer to an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Choice {
    Corroborate,
    Deny,
}

sql_text_enum!(Choice {
    Corroborate => "CORROBORATE",
    Deny => "DENY",
});

/// One device's confirmation row; at most one per (event, device)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub id: i64,
    pub event_id: EventId,
    pub device_id: DeviceId,
    pub choice: Choice,
    /// Seconds between event initiation and this confirmation
    pub delay_seconds: i64,
    pub reminder_used: bool,
    pub created_at: DateTime<Utc>,
}

/// Reminder already sent (or muted) for an event and device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderLog {
    pub event_id: EventId,
    pub device_id: DeviceId,
    pub attempt: u32,
    pub muted: bool,
    pub created_at: DateTime<Utc>,
}

/// Fixed offsets of the program-start reminders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReminderType {
    #[serde(rename = "15MIN")]
    FifteenMinutes,
    #[serde(rename = "10MIN")]
    TenMinutes,
    #[serde(rename = "5MIN")]
    FiveMinutes,
    #[serde(rename = "STARTED")]
    Started,
}

sql_text_enum!(ReminderType {
    FifteenMinutes => "15MIN",
    TenMinutes => "10MIN",
    FiveMinutes => "5MIN",
    Started => "STARTED",
});

impl ReminderType {
    /// All tiers, earliest first
    pub const ALL: [Self; 4] = [Self::FifteenMinutes, Self::TenMinutes, Self::FiveMinutes, Self::Started];

    /// Nominal minutes before air time; zero for the start tier
    #[must_use]
    pub const fn minutes_before(&self) -> i64 {
        match self {
            Self::FifteenMinutes => 15,
            Self::TenMinutes => 10,
            Self::FiveMinutes => 5,
            Self::Started => 0,
        }
    }
}

/// Per-device setting controlling how many program-start tiers it receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sensitivity {
    #[default]
    High,
    Medium,
    Low,
}

sql_text_enum!(Sensitivity {
    High => "HIGH",
    Medium => "MEDIUM",
    Low => "LOW",
});

impl Sensitivity {
    /// Tiers are nested: LOW ⊂ MEDIUM ⊂ HIGH
    #[must_use]
    pub const fn receives(&self, tier: ReminderType) -> bool {
        match (self, tier) {
            (Self::High, _) => true,
            (Self::Medium, ReminderType::FifteenMinutes) => false,
            (Self::Medium, _) => true,
            (Self::Low, ReminderType::FiveMinutes | ReminderType::Started) => true,
            (Self::Low, _) => false,
        }
    }
}

/// Why points were awarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PointReason {
    FastConfirm,
    ReminderConfirm,
    DoubleConfirm,
    DailyStreak,
    StreakBonus,
}

sql_text_enum!(PointReason {
    FastConfirm => "FAST_CONFIRM",
    ReminderConfirm => "REMINDER_CONFIRM",
    DoubleConfirm => "DOUBLE_CONFIRM",
    DailyStreak => "DAILY_STREAK",
    StreakBonus => "STREAK_BONUS",
});

/// Materialized projection of a device's ledger
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PointBalance {
    pub device_id: DeviceId,
    pub total_points: i64,
    pub streak_length: u32,
    /// Local calendar date of the last scored activity
    pub last_active: Option<NaiveDate>,
}

/// Append-only ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointEntry {
    pub id: i64,
    pub device_id: DeviceId,
    pub points: i64,
    pub reason: PointReason,
    pub event_id: Option<EventId>,
    pub created_at: DateTime<Utc>,
}
