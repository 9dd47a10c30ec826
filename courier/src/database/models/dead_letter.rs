//! Dead-letter database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Dead-letter database model.
/// Stores delivery jobs that exhausted their retries or failed permanently.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct DeadLetterDbModel {
    /// Identifier of the failed job.
    pub id: String,
    pub destination: String,
    /// high, medium or low
    pub priority: String,
    /// JSON blob of the alert payload
    pub payload: String,
    pub error_message: String,
    /// transient, permanent or unknown
    pub error_class: String,
    pub retry_count: i64,
    /// Unix epoch milliseconds of the original submission
    pub submitted_at: i64,
    /// Unix epoch milliseconds of the final failure
    pub failed_at: i64,
    /// Unix epoch milliseconds after which the sweep deletes the entry
    pub expires_at: i64,
    /// Dead letter this job was itself replaying, if any
    pub replay_of: Option<String>,
    pub replayed_at: Option<i64>,
    pub replay_job_id: Option<String>,
    pub replay_result: Option<String>,
}

impl DeadLetterDbModel {
    pub fn is_replayed(&self) -> bool {
        self.replayed_at.is_some()
    }
}
