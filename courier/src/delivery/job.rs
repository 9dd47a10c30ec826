//! Delivery job model.
//!
//! A job is one unit of delivery work: one alert payload routed to exactly one
//! destination. The engine owns a job from submission until it reaches a
//! terminal state; the payload itself is shared and never mutated.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::classifier::ErrorClass;
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Newtype for job identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| Error::validation(format!("invalid job id '{s}': {e}")))
    }
}

// ---------------------------------------------------------------------------
// Alert payload
// ---------------------------------------------------------------------------

/// Alert severity as assigned by the upstream classifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Info,
}

/// Alert lifecycle status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum AlertStatus {
    Firing,
    Resolved,
}

/// A formatted alert ready for delivery.
///
/// Only `severity` and `status` are interpreted (for priority assignment);
/// `body` is opaque to the engine and handed to the destination adapter as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub severity: Severity,
    pub status: AlertStatus,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl AlertPayload {
    pub fn new(severity: Severity, status: AlertStatus, body: serde_json::Value) -> Self {
        Self {
            severity,
            status,
            body,
        }
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Delivery priority. Each priority maps to one dispatcher lane.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Lanes in the order workers must inspect them.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    /// Derive the priority of an alert.
    ///
    /// critical + firing is high, anything resolved or informational is low,
    /// everything else is medium.
    pub fn for_alert(severity: Severity, status: AlertStatus) -> Self {
        match (severity, status) {
            (_, AlertStatus::Resolved) | (Severity::Info, _) => Priority::Low,
            (Severity::Critical, AlertStatus::Firing) => Priority::High,
            _ => Priority::Medium,
        }
    }

    /// Lane index, 0 being the most urgent.
    pub fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    /// Waiting in a lane.
    Queued,
    /// A worker is attempting delivery.
    Processing,
    /// Last attempt failed; waiting out the backoff delay.
    Retrying,
    /// Delivered. Terminal.
    Succeeded,
    /// Gave up and the dead-letter write failed too. Terminal.
    Failed,
    /// Gave up and persisted to the dead-letter store. Terminal.
    DeadLettered,
}

impl JobState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Processing)
                | (Queued, DeadLettered)    // drained at shutdown
                | (Queued, Failed)
                | (Processing, Succeeded)
                | (Processing, Retrying)
                | (Processing, Failed)
                | (Processing, DeadLettered)
                | (Retrying, Processing)
                | (Retrying, Failed)        // interrupted during backoff
                | (Retrying, DeadLettered)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::DeadLettered
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Retrying => "retrying",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::DeadLettered => "dead_lettered",
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of delivery work tracked by the engine.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// Caller-owned payload, shared read-only.
    pub payload: Arc<AlertPayload>,
    /// Destination name (registry key).
    pub destination: String,
    /// Assigned once at construction, never changed.
    pub priority: Priority,
    state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Number of retries performed (attempts minus one).
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_error_class: Option<ErrorClass>,
    /// Dead-letter entry this job replays, if any.
    pub replay_of: Option<String>,
}

impl Job {
    /// Create a queued job. Priority is derived from the payload.
    pub fn new(payload: impl Into<Arc<AlertPayload>>, destination: impl Into<String>) -> Self {
        let payload = payload.into();
        let now = Utc::now();
        Self {
            id: JobId::new(),
            priority: Priority::for_alert(payload.severity, payload.status),
            payload,
            destination: destination.into(),
            state: JobState::Queued,
            submitted_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            retry_count: 0,
            last_error: None,
            last_error_class: None,
            replay_of: None,
        }
    }

    /// Mark this job as a replay of a dead-letter entry.
    pub fn replaying(mut self, dead_letter_id: impl Into<String>) -> Self {
        self.replay_of = Some(dead_letter_id.into());
        self
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Move to `to`, stamping timestamps. Rejects transitions the lifecycle forbids.
    pub fn transition(&mut self, to: JobState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        if to == JobState::Processing && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        self.state = to;
        self.updated_at = now;
        Ok(())
    }

    /// Record the most recent delivery failure.
    pub fn record_error(&mut self, error: impl Into<String>, class: ErrorClass) {
        self.last_error = Some(error.into());
        self.last_error_class = Some(class);
        self.updated_at = Utc::now();
    }

    /// Time between submission and the first attempt, if started.
    pub fn queue_wait(&self) -> Option<chrono::Duration> {
        self.started_at.map(|s| s - self.submitted_at)
    }

    /// Time between submission and completion, if terminal.
    pub fn total_duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|c| c - self.submitted_at)
    }
}
