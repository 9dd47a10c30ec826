//! Dead-letter store.
//!
//! Jobs that exhaust their retries, fail permanently, or are interrupted by
//! shutdown are persisted here as immutable snapshots. An entry is only ever
//! marked by a replay; the expiry sweep is the only thing that deletes it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::classifier::ErrorClass;
use super::job::{AlertPayload, Job, JobId, Priority};
use super::query::{DeadLetterFilter, Page};
use crate::database::models::DeadLetterDbModel;
use crate::database::repositories::DeadLetterRepository;
use crate::database::time::{datetime_to_ms, expiry_after, ms_to_datetime, now_ms};
use crate::metrics::MetricsCollector;
use crate::{Error, Result};

/// Dead-letter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// How long entries are kept, in seconds.
    pub retention_secs: u64,
    /// How often expired entries are swept, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            retention_secs: 7 * 24 * 3600,
            sweep_interval_secs: 3600,
        }
    }
}

impl DeadLetterConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Replay marker of a dead-letter entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayMarker {
    pub replayed_at: DateTime<Utc>,
    /// Fresh job created by the replay.
    pub job_id: String,
    /// Latest known outcome of that job.
    pub result: Option<String>,
}

/// Snapshot of a job at the moment it was given up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Identifier of the failed job.
    pub id: String,
    pub destination: String,
    pub priority: Priority,
    pub payload: AlertPayload,
    pub error: String,
    pub error_class: ErrorClass,
    pub retry_count: u32,
    pub submitted_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Entry the failed job was itself replaying, if any.
    pub replay_of: Option<String>,
    pub replay: Option<ReplayMarker>,
}

impl DeadLetterEntry {
    /// Build an entry from a job that is being given up on.
    pub fn from_job(job: &Job, retention: Duration) -> Self {
        let failed_at = Utc::now();
        Self {
            id: job.id.to_string(),
            destination: job.destination.clone(),
            priority: job.priority,
            payload: job.payload.as_ref().clone(),
            error: job
                .last_error
                .clone()
                .unwrap_or_else(|| "unknown failure".to_string()),
            error_class: job.last_error_class.unwrap_or(ErrorClass::Unknown),
            retry_count: job.retry_count,
            submitted_at: job.submitted_at,
            failed_at,
            expires_at: expiry_after(failed_at, retention),
            replay_of: job.replay_of.clone(),
            replay: None,
        }
    }

    pub fn is_replayed(&self) -> bool {
        self.replay.is_some()
    }

    /// Fresh job rebuilt from the snapshot, retry count zero.
    pub fn to_replay_job(&self) -> Job {
        Job::new(self.payload.clone(), self.destination.clone()).replaying(self.id.clone())
    }

    pub fn to_db_model(&self) -> Result<DeadLetterDbModel> {
        Ok(DeadLetterDbModel {
            id: self.id.clone(),
            destination: self.destination.clone(),
            priority: self.priority.as_str().to_string(),
            payload: serde_json::to_string(&self.payload)?,
            error_message: self.error.clone(),
            error_class: self.error_class.as_str().to_string(),
            retry_count: i64::from(self.retry_count),
            submitted_at: datetime_to_ms(self.submitted_at),
            failed_at: datetime_to_ms(self.failed_at),
            expires_at: datetime_to_ms(self.expires_at),
            replay_of: self.replay_of.clone(),
            replayed_at: self.replay.as_ref().map(|r| datetime_to_ms(r.replayed_at)),
            replay_job_id: self.replay.as_ref().map(|r| r.job_id.clone()),
            replay_result: self.replay.as_ref().and_then(|r| r.result.clone()),
        })
    }
}

impl TryFrom<DeadLetterDbModel> for DeadLetterEntry {
    type Error = Error;

    fn try_from(model: DeadLetterDbModel) -> Result<Self> {
        let priority = model
            .priority
            .parse::<Priority>()
            .map_err(|_| Error::Database(format!("invalid priority '{}'", model.priority)))?;
        let error_class = model
            .error_class
            .parse::<ErrorClass>()
            .map_err(|_| Error::Database(format!("invalid error class '{}'", model.error_class)))?;

        let replay = match (model.replayed_at, model.replay_job_id) {
            (Some(at), Some(job_id)) => Some(ReplayMarker {
                replayed_at: ms_to_datetime(at),
                job_id,
                result: model.replay_result,
            }),
            _ => None,
        };

        Ok(Self {
            payload: serde_json::from_str(&model.payload)?,
            id: model.id,
            destination: model.destination,
            priority,
            error: model.error_message,
            error_class,
            retry_count: u32::try_from(model.retry_count).unwrap_or(0),
            submitted_at: ms_to_datetime(model.submitted_at),
            failed_at: ms_to_datetime(model.failed_at),
            expires_at: ms_to_datetime(model.expires_at),
            replay_of: model.replay_of,
            replay,
        })
    }
}

/// Persistent dead-letter store.
pub struct DeadLetterStore {
    repo: Arc<dyn DeadLetterRepository>,
    retention: Duration,
    metrics: Arc<MetricsCollector>,
}

impl DeadLetterStore {
    pub fn new(
        repo: Arc<dyn DeadLetterRepository>,
        config: &DeadLetterConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            repo,
            retention: config.retention(),
            metrics,
        }
    }

    /// Persist a job that is being given up on. Keyed by job id.
    pub async fn write(&self, job: &Job) -> Result<DeadLetterEntry> {
        let entry = DeadLetterEntry::from_job(job, self.retention);
        self.repo.upsert(&entry.to_db_model()?).await?;

        self.metrics.record_dead_letter_write(&job.destination);
        self.refresh_size().await;

        info!(
            job_id = %job.id,
            destination = %job.destination,
            error_class = %entry.error_class,
            retry_count = entry.retry_count,
            "Job moved to dead letter store"
        );
        Ok(entry)
    }

    pub async fn get(&self, id: &str) -> Result<DeadLetterEntry> {
        self.repo.get(id).await?.try_into()
    }

    pub async fn list(&self, filter: &DeadLetterFilter, page: Page) -> Result<Vec<DeadLetterEntry>> {
        self.repo
            .list(filter, page)
            .await?
            .into_iter()
            .map(DeadLetterEntry::try_from)
            .collect()
    }

    pub async fn count(&self) -> Result<u64> {
        self.repo.count().await
    }

    /// Atomically mark `id` as replayed by `job_id`.
    pub async fn claim_replay(&self, id: &str, job_id: JobId) -> Result<()> {
        if self.repo.claim_replay(id, &job_id.to_string(), now_ms()).await? {
            Ok(())
        } else {
            Err(Error::AlreadyReplayed { id: id.to_string() })
        }
    }

    pub async fn record_replay_result(&self, id: &str, result: &str) -> Result<()> {
        self.repo.record_replay_result(id, result).await
    }

    /// Undo a claim whose replay job was rejected at submission.
    pub async fn release_replay(&self, id: &str, job_id: JobId) -> Result<()> {
        self.repo.release_replay(id, &job_id.to_string()).await
    }

    /// Delete expired entries. Returns how many were removed.
    pub async fn sweep(&self) -> Result<u64> {
        let removed = self.repo.delete_expired(now_ms()).await?;
        if removed > 0 {
            info!(removed, "Swept expired dead letters");
        } else {
            debug!("No expired dead letters to sweep");
        }
        self.refresh_size().await;
        Ok(removed)
    }

    async fn refresh_size(&self) {
        if let Ok(count) = self.repo.count().await {
            self.metrics.set_dead_letter_size(count);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::database::repositories::REPLAY_QUEUED;
    use crate::delivery::job::{AlertStatus, JobState, Severity};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;

    /// In-memory repository used by unit tests across the delivery module.
    #[derive(Default)]
    pub(crate) struct MemoryDeadLetterRepository {
        pub rows: Mutex<HashMap<String, DeadLetterDbModel>>,
        pub fail_writes: std::sync::atomic::AtomicBool,
        /// The next upsert never completes.
        pub stall_next_write: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl DeadLetterRepository for MemoryDeadLetterRepository {
        async fn upsert(&self, entry: &DeadLetterDbModel) -> Result<()> {
            if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::Database("disk I/O error".into()));
            }
            if self
                .stall_next_write
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                std::future::pending::<()>().await;
            }
            self.rows.lock().insert(entry.id.clone(), entry.clone());
            Ok(())
        }

        async fn get(&self, id: &str) -> Result<DeadLetterDbModel> {
            self.rows
                .lock()
                .get(id)
                .cloned()
                .ok_or_else(|| Error::not_found("DeadLetter", id))
        }

        async fn list(&self, filter: &DeadLetterFilter, page: Page) -> Result<Vec<DeadLetterDbModel>> {
            let mut rows: Vec<DeadLetterDbModel> = self
                .rows
                .lock()
                .values()
                .filter(|r| filter.destination.as_ref().is_none_or(|d| &r.destination == d))
                .filter(|r| filter.error_class.is_none_or(|c| r.error_class == c.as_str()))
                .filter(|r| filter.replayed.is_none_or(|want| r.is_replayed() == want))
                .cloned()
                .collect();
            rows.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then(a.id.cmp(&b.id)));
            Ok(rows
                .into_iter()
                .skip(page.offset as usize)
                .take(page.effective_limit() as usize)
                .collect())
        }

        async fn count(&self) -> Result<u64> {
            Ok(self.rows.lock().len() as u64)
        }

        async fn claim_replay(&self, id: &str, replay_job_id: &str, now_ms: i64) -> Result<bool> {
            let mut rows = self.rows.lock();
            let row = rows
                .get_mut(id)
                .ok_or_else(|| Error::not_found("DeadLetter", id))?;
            if row.replayed_at.is_some() {
                return Ok(false);
            }
            row.replayed_at = Some(now_ms);
            row.replay_job_id = Some(replay_job_id.to_string());
            row.replay_result = Some(REPLAY_QUEUED.to_string());
            Ok(true)
        }

        async fn record_replay_result(&self, id: &str, result: &str) -> Result<()> {
            if let Some(row) = self.rows.lock().get_mut(id) {
                row.replay_result = Some(result.to_string());
            }
            Ok(())
        }

        async fn release_replay(&self, id: &str, replay_job_id: &str) -> Result<()> {
            if let Some(row) = self.rows.lock().get_mut(id)
                && row.replay_job_id.as_deref() == Some(replay_job_id)
            {
                row.replayed_at = None;
                row.replay_job_id = None;
                row.replay_result = None;
            }
            Ok(())
        }

        async fn delete_expired(&self, now_ms: i64) -> Result<u64> {
            let mut rows = self.rows.lock();
            let before = rows.len();
            rows.retain(|_, r| r.expires_at > now_ms);
            Ok((before - rows.len()) as u64)
        }
    }

    fn failed_job() -> Job {
        let mut job = Job::new(
            AlertPayload::new(Severity::Critical, AlertStatus::Firing, json!({"host": "db-1"})),
            "pagerduty",
        );
        job.transition(JobState::Processing).unwrap();
        job.retry_count = 2;
        job.record_error("HTTP 401", ErrorClass::Permanent);
        job
    }

    fn store(repo: Arc<MemoryDeadLetterRepository>, retention_secs: u64) -> DeadLetterStore {
        DeadLetterStore::new(
            repo,
            &DeadLetterConfig {
                retention_secs,
                sweep_interval_secs: 60,
            },
            Arc::new(MetricsCollector::new()),
        )
    }

    #[tokio::test]
    async fn test_write_and_get_roundtrip() {
        let repo = Arc::new(MemoryDeadLetterRepository::default());
        let store = store(repo, 3600);
        let job = failed_job();

        store.write(&job).await.unwrap();
        let entry = store.get(&job.id.to_string()).await.unwrap();

        assert_eq!(entry.destination, "pagerduty");
        assert_eq!(entry.priority, Priority::High);
        assert_eq!(entry.error_class, ErrorClass::Permanent);
        assert_eq!(entry.retry_count, 2);
        assert_eq!(entry.payload, *job.payload);
        assert!(entry.expires_at > entry.failed_at);
        assert!(!entry.is_replayed());
    }

    #[tokio::test]
    async fn test_write_is_keyed_by_job_id() {
        let repo = Arc::new(MemoryDeadLetterRepository::default());
        let store = store(repo, 3600);
        let job = failed_job();

        store.write(&job).await.unwrap();
        store.write(&job).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_claim_replay_only_once() {
        let repo = Arc::new(MemoryDeadLetterRepository::default());
        let store = store(repo, 3600);
        let job = failed_job();
        let entry = store.write(&job).await.unwrap();

        let replay = entry.to_replay_job();
        assert_eq!(replay.retry_count, 0);
        assert_eq!(replay.replay_of.as_deref(), Some(entry.id.as_str()));

        store.claim_replay(&entry.id, replay.id).await.unwrap();
        let claimed = store.get(&entry.id).await.unwrap();
        assert_eq!(
            claimed.replay.as_ref().and_then(|r| r.result.as_deref()),
            Some(REPLAY_QUEUED)
        );
        let err = store.claim_replay(&entry.id, JobId::new()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyReplayed { .. }));

        store.release_replay(&entry.id, replay.id).await.unwrap();
        store.claim_replay(&entry.id, JobId::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let repo = Arc::new(MemoryDeadLetterRepository::default());
        let store = store(repo, 0);
        store.write(&failed_job()).await.unwrap();
        store.write(&failed_job()).await.unwrap();

        assert_eq!(store.sweep().await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
