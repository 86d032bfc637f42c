//! Push payloads.
//!
//! Every push the core emits is one of a closed set of message kinds, each
//! with a fixed field set. The gateway only ever sees the rendered
//! [`Notification`] (title, body, data).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{EventId, ProgramId};

/// Message kinds the core can dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PushMessage {
    /// An event validated; sent once to the remaining followers
    EventStarted {
        event_id: EventId,
        program_id: ProgramId,
        program_title: String,
    },
    /// Nudge to a follower who has not confirmed an active event
    EventReminder {
        event_id: EventId,
        program_id: ProgramId,
        program_title: String,
        attempt: u32,
    },
    /// A followed program starts in `minutes`
    ProgramStartSoon {
        program_id: ProgramId,
        program_title: String,
        minutes: i64,
    },
    /// A followed program just started
    ProgramStarted {
        program_id: ProgramId,
        program_title: String,
    },
    /// Streak at risk
    DailyReminder { streak_length: u32 },
}

/// Rendered push handed to the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub data: Value,
}

impl PushMessage {
    /// Stable kind name, matching the serialized `type` tag
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::EventStarted { .. } => "EVENT_STARTED",
            Self::EventReminder { .. } => "EVENT_REMINDER",
            Self::ProgramStartSoon { .. } => "PROGRAM_START_SOON",
            Self::ProgramStarted { .. } => "PROGRAM_STARTED",
            Self::DailyReminder { .. } => "DAILY_REMINDER",
        }
    }

    /// Short headline
    #[must_use]
    pub fn title(&self) -> String {
        match self {
            Self::EventStarted { program_title, .. } | Self::ProgramStarted { program_title, .. } => {
                format!("{program_title} is on")
            }
            Self::EventReminder { program_title, .. } => format!("Is {program_title} back?"),
            Self::ProgramStartSoon { program_title, .. } => format!("{program_title} starts soon"),
            Self::DailyReminder { .. } => "Keep your streak alive".to_string(),
        }
    }

    /// Body text
    #[must_use]
    pub fn body(&self) -> String {
        match self {
            Self::EventStarted { .. } => "Viewers confirmed the show has resumed.".to_string(),
            Self::EventReminder { .. } => "Other viewers say the show is back. Can you confirm?".to_string(),
            Self::ProgramStartSoon { minutes, .. } => format!("Starting in {minutes} minutes."),
            Self::ProgramStarted { .. } => "It's starting now.".to_string(),
            Self::DailyReminder { streak_length } => {
                format!("Confirm an event today to extend your {streak_length}-day streak.")
            }
        }
    }

    /// Render into the gateway shape; `data` is the tagged JSON of the message
    pub fn render(&self) -> serde_json::Result<Notification> {
        Ok(Notification {
            title: self.title(),
            body: self.body(),
            data: serde_json::to_value(self)?,
        })
    }
}
