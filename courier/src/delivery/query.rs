//! Filter and pagination types for the status and dead-letter query surfaces.

use serde::{Deserialize, Serialize};

use super::classifier::ErrorClass;
use super::job::{JobState, Priority};

/// Pagination parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Number of items to skip.
    #[serde(default)]
    pub offset: u32,
    /// Number of items to return (default: 50, max: 500).
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

const MAX_LIMIT: u32 = 500;

impl Page {
    pub fn new(offset: u32, limit: u32) -> Self {
        Self { offset, limit }
    }

    /// Limit clamped to `[1, MAX_LIMIT]`.
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_LIMIT)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: default_limit(),
        }
    }
}

/// Filter criteria for listing tracked jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub destination: Option<String>,
    pub priority: Option<Priority>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Filter criteria for listing dead-letter entries.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub destination: Option<String>,
    pub error_class: Option<ErrorClass>,
    /// `Some(true)` only replayed entries, `Some(false)` only pending ones.
    pub replayed: Option<bool>,
}

impl DeadLetterFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_error_class(mut self, class: ErrorClass) -> Self {
        self.error_class = Some(class);
        self
    }

    pub fn with_replayed(mut self, replayed: bool) -> Self {
        self.replayed = Some(replayed);
        self
    }
}
