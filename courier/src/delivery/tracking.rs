//! Job tracking store.
//!
//! A bounded, time-limited projection of job state for the status query
//! surface. Entries are evicted least-recently-used first once the store is
//! full, and expire a fixed time after their last update. Nothing in the
//! delivery path reads from this store.

use std::num::NonZeroUsize;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::classifier::ErrorClass;
use super::job::{Job, JobId, JobState, Priority};
use super::query::{JobFilter, Page};

/// Tracking store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Maximum number of tracked jobs.
    pub max_entries: usize,
    /// Time-to-live after the last update, in seconds.
    pub ttl_secs: u64,
    /// How often expired entries are swept, in seconds.
    pub evict_interval_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl_secs: 3600,
            evict_interval_secs: 60,
        }
    }
}

impl TrackingConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn evict_interval(&self) -> Duration {
        Duration::from_secs(self.evict_interval_secs.max(1))
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusSnapshot {
    pub id: JobId,
    pub destination: String,
    pub priority: Priority,
    pub state: JobState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub replay_of: Option<String>,
}

impl From<&Job> for JobStatusSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            destination: job.destination.clone(),
            priority: job.priority,
            state: job.state(),
            retry_count: job.retry_count,
            last_error: job.last_error.clone(),
            error_class: job.last_error_class,
            submitted_at: job.submitted_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            updated_at: job.updated_at,
            replay_of: job.replay_of.clone(),
        }
    }
}

struct TrackedEntry {
    snapshot: JobStatusSnapshot,
    expires_at: Instant,
}

impl TrackedEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// LRU + TTL store of job snapshots.
pub struct JobTracker {
    entries: Mutex<LruCache<JobId, TrackedEntry>>,
    ttl: Duration,
}

impl JobTracker {
    pub fn new(config: &TrackingConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: config.ttl(),
        }
    }

    /// Register a newly submitted job.
    pub fn store(&self, job: &Job) {
        self.put(job);
    }

    /// Record a state change. Re-inserts the job if it had been evicted.
    pub fn update(&self, job: &Job) {
        self.put(job);
    }

    fn put(&self, job: &Job) {
        let entry = TrackedEntry {
            snapshot: JobStatusSnapshot::from(job),
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.lock().put(job.id, entry);
    }

    /// Look up a job. Expired entries are removed and reported as absent.
    pub fn get(&self, id: &JobId) -> Option<JobStatusSnapshot> {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        let expired = match entries.get(id) {
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => return Some(entry.snapshot.clone()),
            None => return None,
        };
        if expired {
            entries.pop(id);
        }
        None
    }

    /// List live snapshots matching `filter`, most recently submitted first.
    pub fn list(&self, filter: &JobFilter, page: Page) -> Vec<JobStatusSnapshot> {
        let now = Instant::now();
        let mut matched: Vec<JobStatusSnapshot> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(_, entry)| !entry.is_expired(now))
                .map(|(_, entry)| &entry.snapshot)
                .filter(|s| filter.state.is_none_or(|state| s.state == state))
                .filter(|s| filter.priority.is_none_or(|p| s.priority == p))
                .filter(|s| {
                    filter
                        .destination
                        .as_deref()
                        .is_none_or(|d| s.destination == d)
                })
                .cloned()
                .collect()
        };

        matched.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        matched
            .into_iter()
            .skip(page.offset as usize)
            .take(page.effective_limit() as usize)
            .collect()
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired: Vec<JobId> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            entries.pop(id);
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "Evicted expired job snapshots");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::job::{AlertPayload, AlertStatus, Severity};
    use serde_json::json;

    fn job(severity: Severity, destination: &str) -> Job {
        Job::new(
            AlertPayload::new(severity, AlertStatus::Firing, json!({})),
            destination,
        )
    }

    fn tracker(max_entries: usize, ttl_secs: u64) -> JobTracker {
        JobTracker::new(&TrackingConfig {
            max_entries,
            ttl_secs,
            evict_interval_secs: 1,
        })
    }

    #[test]
    fn test_store_and_get() {
        let tracker = tracker(10, 60);
        let job = job(Severity::Critical, "pagerduty");
        tracker.store(&job);

        let snapshot = tracker.get(&job.id).unwrap();
        assert_eq!(snapshot.state, JobState::Queued);
        assert_eq!(snapshot.priority, Priority::High);
        assert!(tracker.get(&JobId::new()).is_none());
    }

    #[test]
    fn test_update_reflects_state() {
        let tracker = tracker(10, 60);
        let mut job = job(Severity::Warning, "slack");
        tracker.store(&job);

        job.transition(JobState::Processing).unwrap();
        job.record_error("HTTP 503", ErrorClass::Transient);
        tracker.update(&job);

        let snapshot = tracker.get(&job.id).unwrap();
        assert_eq!(snapshot.state, JobState::Processing);
        assert_eq!(snapshot.error_class, Some(ErrorClass::Transient));
    }

    #[test]
    fn test_lru_eviction_bounds_size() {
        let tracker = tracker(2, 60);
        let first = job(Severity::Info, "a");
        let second = job(Severity::Info, "b");
        let third = job(Severity::Info, "c");

        tracker.store(&first);
        tracker.store(&second);
        // Touch first so second is least recently used.
        assert!(tracker.get(&first.id).is_some());
        tracker.store(&third);

        assert_eq!(tracker.len(), 2);
        assert!(tracker.get(&first.id).is_some());
        assert!(tracker.get(&second.id).is_none());
        assert!(tracker.get(&third.id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_and_refresh() {
        let tracker = tracker(10, 10);
        let mut stale = job(Severity::Info, "a");
        let fresh = job(Severity::Info, "b");
        tracker.store(&stale);
        tracker.store(&fresh);

        tokio::time::advance(Duration::from_secs(6)).await;
        tracker.update(&fresh);
        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(tracker.get(&fresh.id).is_some());
        assert!(tracker.get(&stale.id).is_none());

        stale.transition(JobState::Processing).unwrap();
        tracker.update(&stale);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(tracker.evict_expired(), 2);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_list_orders_by_submission_and_filters() {
        let tracker = tracker(10, 60);
        let mut jobs = Vec::new();
        for (i, dest) in ["slack", "pagerduty", "slack"].iter().enumerate() {
            let mut j = job(Severity::Warning, dest);
            j.submitted_at = Utc::now() + chrono::Duration::seconds(i as i64);
            tracker.store(&j);
            jobs.push(j);
        }

        let all = tracker.list(&JobFilter::new(), Page::default());
        let ids: Vec<JobId> = all.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![jobs[2].id, jobs[1].id, jobs[0].id]);

        let slack = tracker.list(&JobFilter::new().with_destination("slack"), Page::default());
        assert_eq!(slack.len(), 2);
        assert_eq!(slack[0].id, jobs[2].id);

        let paged = tracker.list(&JobFilter::new(), Page::new(1, 1));
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].id, jobs[1].id);

        let none = tracker.list(
            &JobFilter::new().with_state(JobState::Succeeded),
            Page::default(),
        );
        assert!(none.is_empty());
    }

    #[test]
    fn test_list_filters_by_priority() {
        let tracker = tracker(10, 60);
        let critical = job(Severity::Critical, "pagerduty");
        tracker.store(&critical);
        tracker.store(&job(Severity::Info, "slack"));
        tracker.store(&job(Severity::Warning, "slack"));

        let high = tracker.list(&JobFilter::new().with_priority(Priority::High), Page::default());
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].id, critical.id);

        let low_slack = tracker.list(
            &JobFilter::new()
                .with_priority(Priority::Low)
                .with_destination("slack"),
            Page::default(),
        );
        assert_eq!(low_slack.len(), 1);
        assert_eq!(low_slack[0].priority, Priority::Low);
    }
}
