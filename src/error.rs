//! Error types for the scoring pipeline
//!
//! Errors are classified by how the resilience layer treats them:
//! - Retryable: transient downstream failures
//! - Surfaced immediately: admission rejections, open breakers, permanent failures
//! - Terminal: retries exhausted (carries the last underlying cause)

use thiserror::Error;

/// Error types for scoring, scheduling and request handling
#[derive(Debug, Error)]
pub enum PulseError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded for client {client_id}")]
    AdmissionRejected { client_id: String },

    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<PulseError>,
    },

    // Retryable
    #[error("Transient downstream error: {0}")]
    TransientDownstream(String),

    // Non-retryable
    #[error("Permanent downstream error: {0}")]
    PermanentDownstream(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PulseError {
    /// Returns true if this error is a candidate for retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, PulseError::TransientDownstream(_))
    }

    /// Stable label used in outcome counters
    pub fn outcome_label(&self) -> &'static str {
        match self {
            PulseError::NotFound(_) => "not_found",
            PulseError::AdmissionRejected { .. } => "admission_rejected",
            PulseError::CircuitOpen(_) => "circuit_open",
            PulseError::RetryExhausted { .. } => "retry_exhausted",
            PulseError::TransientDownstream(_) => "transient_downstream",
            PulseError::PermanentDownstream(_) => "permanent_downstream",
            PulseError::Configuration(_) => "configuration",
            PulseError::Serialization(_) => "serialization",
        }
    }

    /// The innermost cause, looking through `RetryExhausted` wrappers
    pub fn root_cause(&self) -> &PulseError {
        match self {
            PulseError::RetryExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for PulseError {
    fn from(err: serde_json::Error) -> Self {
        PulseError::Serialization(err.to_string())
    }
}

/// Serializable error representation for callers and push subscribers
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    pub kind: &'static str,
    pub can_retry: bool,
}

impl From<&PulseError> for ErrorPayload {
    fn from(err: &PulseError) -> Self {
        ErrorPayload {
            message: err.to_string(),
            kind: err.outcome_label(),
            can_retry: err.is_retryable(),
        }
    }
}
