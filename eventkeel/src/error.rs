//! Typed failures shared by every component.
//!
//! Components return these instead of panicking across their boundaries.
//! Callers decide what to do with a failure through [`Error::is_retryable`]
//! and the identifiers carried by each variant.

use std::time::Duration;

use crate::Version;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The stream moved on since the caller read it.
    /// The caller must reload the aggregate and rerun its business logic.
    #[error("Concurrency conflict on aggregate {aggregate_id}: expected version {expected}, found {actual:?}")]
    ConcurrencyConflict {
        aggregate_id: String,
        expected: Version,
        actual: Option<Version>,
    },

    /// Malformed input. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A transient technical failure (network, storage, broker).
    #[error("Infrastructure failure: {message}")]
    Infrastructure {
        message: String,
        retryable: bool,
        attempts: Option<u32>,
    },

    /// The breaker rejected the call without attempting it.
    #[error("Circuit breaker '{name}' is open, retry after {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    #[error("Failed to acquire lock on '{resource_id}' after {attempts} attempts")]
    LockAcquisition { resource_id: String, attempts: u32 },

    /// Saga step `step` failed; prior steps have been compensated.
    #[error("Saga step {step} failed: {message}")]
    SagaStep { step: usize, message: String },

    #[error("Aggregate {0} was not found")]
    NotFound(String),

    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState { expected: String, actual: String },
}

impl Error {
    /// A retryable infrastructure failure.
    pub fn infrastructure(message: impl Into<String>) -> Self {
        Error::Infrastructure {
            message: message.into(),
            retryable: true,
            attempts: None,
        }
    }

    /// An infrastructure failure that must not be retried.
    pub fn fatal(message: impl Into<String>) -> Self {
        Error::Infrastructure {
            message: message.into(),
            retryable: false,
            attempts: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Whether an automatic retry may succeed.
    ///
    /// Concurrency conflicts are not retryable here: only a reload of the
    /// aggregate followed by the whole business operation can resolve them.
    /// An open circuit only recovers after its own reset timeout.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Infrastructure { retryable, .. } => *retryable,
            Error::LockAcquisition { .. } => true,
            Error::ConcurrencyConflict { .. }
            | Error::Validation(_)
            | Error::CircuitOpen { .. }
            | Error::SagaStep { .. }
            | Error::NotFound(_)
            | Error::InvalidState { .. } => false,
        }
    }

    /// Short machine-friendly name of the failure kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConcurrencyConflict { .. } => "concurrency_conflict",
            Error::Validation(_) => "validation",
            Error::Infrastructure { .. } => "infrastructure",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::LockAcquisition { .. } => "lock_acquisition",
            Error::SagaStep { .. } => "saga_step",
            Error::NotFound(_) => "not_found",
            Error::InvalidState { .. } => "invalid_state",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Validation(format!("Serialization error: {e}"))
    }
}

/// Turns a caught panic payload into a readable message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "operation panicked".to_string()
    }
}
