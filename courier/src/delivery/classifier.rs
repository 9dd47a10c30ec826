//! Delivery error taxonomy and classification.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the retry engine should treat a failure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ErrorClass {
    /// Retry with backoff.
    Transient,
    /// Never retry.
    Permanent,
    /// Retry once, then treat as permanent.
    Unknown,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Unknown => "unknown",
        }
    }
}

/// A failed delivery attempt, as reported by a destination adapter or the engine.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("delivery attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("rate limited by destination")]
    RateLimited { retry_after: Option<Duration> },

    #[error("destination responded with HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("destination rejected credentials: {0}")]
    Unauthorized(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("circuit breaker open for destination {destination}")]
    CircuitOpen { destination: String },

    #[error("delivery interrupted by shutdown")]
    Interrupted,

    #[error("{0}")]
    Other(String),
}

impl DeliveryError {
    /// Suggested minimum wait before the next attempt, if the destination sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DeliveryError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Message fragments that mark an otherwise unstructured error as transient.
const TRANSIENT_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "broken pipe",
    "temporarily unavailable",
    "try again",
];

/// Classify a delivery failure.
pub fn classify(error: &DeliveryError) -> ErrorClass {
    match error {
        DeliveryError::Timeout(_)
        | DeliveryError::Connection(_)
        | DeliveryError::RateLimited { .. }
        | DeliveryError::CircuitOpen { .. }
        | DeliveryError::Interrupted => ErrorClass::Transient,
        DeliveryError::Unauthorized(_) | DeliveryError::InvalidPayload(_) => ErrorClass::Permanent,
        DeliveryError::Http { status, .. } => classify_status(*status),
        DeliveryError::Other(message) => classify_message(message),
    }
}

/// Classify an HTTP status code returned by a destination.
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        408 | 429 => ErrorClass::Transient,
        500..=599 => ErrorClass::Transient,
        400..=499 => ErrorClass::Permanent,
        _ => ErrorClass::Unknown,
    }
}

fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Unknown
    }
}
