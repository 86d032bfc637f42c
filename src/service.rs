use std::sync::Arc;

use tracing::warn;

use crate::consensus::{ConsensusEngine, FanOutOutcome};
use crate::error::Result;
use crate::models::{Choice, Confirmation, CreatedEvent, Event, EventId, NewEventOptions, ProgramId};
use crate::scoring::{ScoreOutcome, ScoringEngine};
use crate::validation::InputValidator;

/// Everything one confirm request did
#[derive(Debug, Clone)]
pub struct ConfirmReport {
    pub confirmation: Confirmation,
    /// False for a repeated confirm from the same device
    pub created: bool,
    /// True when this request moved the event to VALIDATED
    pub validated: bool,
    /// Points awarded; `None` for repeats
    pub score: Option<ScoreOutcome>,
    /// Present only when this request performed the validation and the
    /// fan-out ran without a store error
    pub fan_out: Option<FanOutOutcome>,
    pub event: Event,
}

/// Request-level entry point used by the HTTP boundary and the CLI
#[derive(Clone)]
pub struct EventService {
    engine: Arc<ConsensusEngine>,
    scoring: Arc<ScoringEngine>,
}

impl EventService {
    pub fn new(engine: Arc<ConsensusEngine>, scoring: Arc<ScoringEngine>) -> Self {
        Self { engine, scoring }
    }

    pub fn engine(&self) -> &ConsensusEngine {
        &self.engine
    }

    pub fn scoring(&self) -> &ScoringEngine {
        &self.scoring
    }

    /// Report an event for a program
    pub fn create_event(&self, device_id: &str, program_id: ProgramId, opts: &NewEventOptions) -> Result<CreatedEvent> {
        InputValidator::validate_device_id(device_id)?;
        InputValidator::validate_id("program_id", program_id)?;
        self.engine.create_event(device_id, program_id, opts)
    }

    /// Confirm an event, score it, and fan out if this request validated it.
    ///
    /// The confirmation and its points commit in one transaction; a scoring
    /// failure rolls both back and surfaces as an error the caller can retry.
    ///
    /// The fan-out trigger is the `validated` flag from the engine, which only
    /// the transaction that won the `PENDING -> VALIDATED` update receives. Two
    /// requests that both read VALIDATED afterwards therefore cannot both fan
    /// out, and the push claim inside `fan_out` covers retries on top of that.
    /// A fan-out that fails before claiming is left for the reminder pass to
    /// resume; the confirm itself has already committed and still succeeds.
    pub async fn confirm_event(
        &self,
        event_id: EventId,
        device_id: &str,
        choice: Choice,
        reminder_used: bool,
    ) -> Result<ConfirmReport> {
        InputValidator::validate_device_id(device_id)?;
        InputValidator::validate_id("event_id", event_id)?;

        let (outcome, score) =
            self.engine
                .confirm_event_with(event_id, device_id, choice, reminder_used, |conn, confirmation| {
                    self.scoring.award_in(conn, confirmation)
                })?;
        if let Some(score) = &score {
            self.scoring.record_award(&outcome.confirmation, score);
        }

        let fan_out = if outcome.validated {
            match self.engine.fan_out(event_id).await {
                Ok(fan_out) => Some(fan_out),
                Err(e) => {
                    warn!(event_id, error = %e, "fan-out failed, left for the reminder pass");
                    None
                }
            }
        } else {
            None
        };

        Ok(ConfirmReport {
            confirmation: outcome.confirmation,
            created: outcome.created,
            validated: outcome.validated,
            score,
            fan_out,
            event: outcome.event,
        })
    }

    /// Initiator withdraws a PENDING event
    pub fn cancel_event(&self, event_id: EventId, device_id: &str) -> Result<Event> {
        InputValidator::validate_device_id(device_id)?;
        self.engine.cancel_event(event_id, device_id)
    }

    pub fn get_event(&self, event_id: EventId) -> Result<Event> {
        self.engine.get_event(event_id)
    }

    pub fn list_active_events(&self, device_id: &str) -> Result<Vec<Event>> {
        InputValidator::validate_device_id(device_id)?;
        self.engine.list_active_events(device_id)
    }

    pub fn get_confirmations_count(&self, event_id: EventId) -> Result<i64> {
        self.engine.get_confirmations_count(event_id)
    }
}
