//! Error types for the crowd-confirm library.
//!
//! `NotFound` and `Conflict` are the outcomes callers are expected to map onto
//! their transport (404 / 409). Everything else is infrastructure failure.

use std::fmt;

use thiserror::Error;

/// Why an event refused a confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// The event was cancelled or already expired.
    Inactive,
    /// The event's `expires_at` passed before this confirmation arrived.
    Expired,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => f.write_str("inactive"),
            Self::Expired => f.write_str("expired"),
        }
    }
}

/// Errors that can occur in the crowd-confirm core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Referenced event or program does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Event cannot accept the operation in its current state
    #[error("Conflict: event is {0}")]
    Conflict(ConflictKind),

    /// Malformed input rejected before reaching the store
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Connection pool errors
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CoreError {
    /// HTTP-style status code for the boundary layer.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Validation(_) => 422,
            _ => 500,
        }
    }

    /// True for the `Conflict` variant with the given kind.
    #[must_use]
    pub fn is_conflict(&self, kind: ConflictKind) -> bool {
        matches!(self, Self::Conflict(k) if *k == kind)
    }
}

/// Convenience type alias for Result with `CoreError`
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(CoreError::NotFound("event 1".into()).status_code(), 404);
        assert_eq!(CoreError::Conflict(ConflictKind::Expired).status_code(), 409);
        assert_eq!(CoreError::Validation("empty".into()).status_code(), 422);
        assert_eq!(CoreError::InvalidConfig("x".into()).status_code(), 500);
    }

    #[test]
    fn conflict_message_names_kind() {
        let err = CoreError::Conflict(ConflictKind::Inactive);
        assert_eq!(err.to_string(), "Conflict: event is inactive");
        assert!(err.is_conflict(ConflictKind::Inactive));
        assert!(!err.is_conflict(ConflictKind::Expired));
    }
}
