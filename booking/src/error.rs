//! Error types for the booking engine.
//!
//! Every public operation returns [`BookingError`]. Notification delivery
//! failures never surface here; they stay inside the delivery worker.

use crate::directory::DependencyError;
use crate::types::{BookingId, BookingStatus, SlotId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A single invalid input field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Field name as the caller supplied it
    pub field: String,
    /// What is wrong with it
    pub message: String,
}

impl FieldError {
    /// Creates a new `FieldError`
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Entities standing in the way of a calendar change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDetail {
    /// No available slot covers the requested window
    pub uncovered: bool,
    /// Slots that block (declared unavailable, or the slot being edited)
    pub slot_ids: Vec<SlotId>,
    /// Active bookings that overlap
    pub booking_ids: Vec<BookingId>,
}

impl From<crate::conflict::ConflictFindings> for ConflictDetail {
    fn from(findings: crate::conflict::ConflictFindings) -> Self {
        Self {
            uncovered: findings.uncovered,
            slot_ids: findings.blocking_slots,
            booking_ids: findings.overlapping_bookings,
        }
    }
}

/// Coarse classification callers branch on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input
    Validation,
    /// Calendar overlap
    Conflict,
    /// Actor not allowed
    Authorization,
    /// Illegal lifecycle move or lost race
    State,
    /// Policy rule such as the cancellation cutoff
    BusinessRule,
    /// Missing entity
    NotFound,
    /// Collaborator or storage failure
    Dependency,
}

/// Errors returned by calendar, orchestrator and message thread operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BookingError {
    /// One or more input fields are invalid.
    #[error("validation failed: {}", join(.0))]
    Validation(Vec<FieldError>),

    /// The requested window cannot be granted.
    #[error("calendar conflict (uncovered: {}, slots: {}, bookings: {})",
        .0.uncovered, .0.slot_ids.len(), .0.booking_ids.len())]
    Conflict(ConflictDetail),

    /// The actor may not perform this action.
    #[error("user {actor} is not allowed to {action}")]
    Unauthorized {
        /// Who tried
        actor: UserId,
        /// What they tried
        action: &'static str,
    },

    /// The lifecycle table has no such move from the current status.
    #[error("cannot {attempted} a booking that is {from}")]
    InvalidTransition {
        /// Current status
        from: BookingStatus,
        /// Transition name
        attempted: &'static str,
    },

    /// Another writer changed the booking first.
    #[error("booking {booking_id} was modified concurrently")]
    ConcurrentModification {
        /// Contested booking
        booking_id: BookingId,
    },

    /// Too close to the event to cancel.
    #[error("cancellation requires more than {cutoff_hours}h notice")]
    CancellationWindowClosed {
        /// Configured minimum notice
        cutoff_hours: i64,
    },

    /// A referenced entity does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind
        entity: &'static str,
        /// Identifier as text
        id: String,
    },

    /// A collaborator failed.
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(String),
}

fn join(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl BookingError {
    /// Shorthand for a single-field validation failure
    #[must_use]
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(vec![FieldError::new(field, message)])
    }

    /// Shorthand for a missing entity
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Classify the error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Unauthorized { .. } => ErrorKind::Authorization,
            Self::InvalidTransition { .. } | Self::ConcurrentModification { .. } => {
                ErrorKind::State
            },
            Self::CancellationWindowClosed { .. } => ErrorKind::BusinessRule,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Dependency(_) | Self::Storage(_) => ErrorKind::Dependency,
        }
    }

    /// Field-level details, empty for non-validation errors
    #[must_use]
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            Self::Validation(errors) => errors,
            _ => &[],
        }
    }
}

impl From<sqlx::Error> for BookingError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, BookingError>;
