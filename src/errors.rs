//! Typed error hierarchy for the phase queue.
//!
//! Three top-level enums cover the three layers:
//! - `QueueError`: store failures returned to callers
//! - `CoordinatorError`: per-item reconciliation failures, logged and isolated
//! - `DeliveryError`: broadcast or notification failures after a committed transition

use std::time::Duration;

use thiserror::Error;

use crate::queue::models::PhaseStatus;

/// Errors from the phase queue store.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid enqueue request: {0}")]
    Validation(String),

    #[error("Phase {queue_id} cannot move from {from} to {to}")]
    InvalidTransition {
        queue_id: String,
        from: PhaseStatus,
        to: PhaseStatus,
    },

    #[error("Phase {queue_id} not found")]
    NotFound { queue_id: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl QueueError {
    pub fn invalid_transition(queue_id: &str, from: PhaseStatus, to: PhaseStatus) -> Self {
        Self::InvalidTransition {
            queue_id: queue_id.to_string(),
            from,
            to,
        }
    }

    pub fn not_found(queue_id: &str) -> Self {
        Self::NotFound {
            queue_id: queue_id.to_string(),
        }
    }
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.into())
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Errors from reconciling a single running phase.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Status provider did not answer for external ref {external_ref} within {timeout:?}")]
    ProviderUnavailable {
        external_ref: i64,
        timeout: Duration,
    },

    #[error("Status provider error: {0}")]
    Provider(#[source] anyhow::Error),

    #[error("Running phase {queue_id} has no external reference")]
    MissingExternalRef { queue_id: String },

    #[error(transparent)]
    Store(#[from] QueueError),
}

/// Side-effect delivery failures. Never roll back a state transition.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Broadcast failed: {0}")]
    Broadcast(String),
}
