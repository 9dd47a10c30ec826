//! Metrics collector implementation.
//!
//! Collects and stores metrics for the delivery engine. Every counter is an
//! atomic behind a `DashMap` keyed by its label values, so recording never
//! takes a lock shared with unrelated destinations.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::delivery::{ErrorClass, JobState, Priority};

/// Upper bounds (in milliseconds) of the duration histogram buckets.
pub const DURATION_BUCKETS_MS: &[u64] = &[
    5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000, 300_000,
];

/// Fixed-bucket duration histogram.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: DURATION_BUCKETS_MS.iter().map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let ms = duration.as_millis().min(u64::MAX as u128) as u64;
        if let Some(idx) = DURATION_BUCKETS_MS.iter().position(|bound| ms <= *bound) {
            self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let mut cumulative = 0u64;
        let buckets = DURATION_BUCKETS_MS
            .iter()
            .zip(&self.buckets)
            .map(|(bound, count)| {
                cumulative += count.load(Ordering::Relaxed);
                (*bound, cumulative)
            })
            .collect();

        HistogramSnapshot {
            buckets,
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
        }
    }
}

/// Histogram state with cumulative bucket counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    /// `(upper bound in ms, observations <= bound)`.
    pub buckets: Vec<(u64, u64)>,
    pub count: u64,
    pub sum_ms: u64,
}

type LabelPair = (String, String);

/// Metrics collector for the delivery engine.
#[derive(Debug)]
pub struct MetricsCollector {
    // Submission metrics
    submissions: DashMap<LabelPair, AtomicU64>,

    // Processing metrics
    jobs_processed: DashMap<LabelPair, AtomicU64>,
    retry_attempts: DashMap<LabelPair, AtomicU64>,
    job_duration: Histogram,
    queue_wait: Histogram,

    // Circuit breaker metrics
    breaker_trips: DashMap<String, AtomicU64>,
    breaker_recoveries: DashMap<String, AtomicU64>,

    // Dead letter metrics
    dead_letter_writes: DashMap<String, AtomicU64>,
    dead_letter_replays: DashMap<String, AtomicU64>,
    dead_letter_size: AtomicU64,

    // Gauges
    active_workers: AtomicU64,
    idle_workers: AtomicU64,
    lane_depth: DashMap<String, AtomicU64>,
}

fn bump<K>(map: &DashMap<K, AtomicU64>, key: K)
where
    K: std::hash::Hash + Eq,
{
    map.entry(key)
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

fn collect_single(map: &DashMap<String, AtomicU64>) -> BTreeMap<String, u64> {
    map.iter()
        .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
        .collect()
}

fn collect_pairs(map: &DashMap<LabelPair, AtomicU64>) -> Vec<(String, String, u64)> {
    let mut values: Vec<(String, String, u64)> = map
        .iter()
        .map(|e| {
            let (a, b) = e.key().clone();
            (a, b, e.value().load(Ordering::Relaxed))
        })
        .collect();
    values.sort();
    values
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            submissions: DashMap::new(),
            jobs_processed: DashMap::new(),
            retry_attempts: DashMap::new(),
            job_duration: Histogram::new(),
            queue_wait: Histogram::new(),
            breaker_trips: DashMap::new(),
            breaker_recoveries: DashMap::new(),
            dead_letter_writes: DashMap::new(),
            dead_letter_replays: DashMap::new(),
            dead_letter_size: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
            idle_workers: AtomicU64::new(0),
            lane_depth: DashMap::new(),
        }
    }

    // ========== Submission Metrics ==========

    pub fn record_submission(&self, priority: Priority, accepted: bool) {
        let outcome = if accepted { "accepted" } else { "rejected" };
        bump(
            &self.submissions,
            (priority.as_str().to_string(), outcome.to_string()),
        );
    }

    pub fn set_lane_depth(&self, priority: Priority, depth: usize) {
        self.lane_depth
            .entry(priority.as_str().to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(depth as u64, Ordering::Relaxed);
    }

    // ========== Processing Metrics ==========

    /// Record a job reaching a terminal state.
    pub fn record_job_processed(&self, destination: &str, state: JobState, duration: Option<Duration>) {
        bump(
            &self.jobs_processed,
            (destination.to_string(), state.as_str().to_string()),
        );
        if let Some(duration) = duration {
            self.job_duration.observe(duration);
        }
    }

    pub fn record_queue_wait(&self, wait: Duration) {
        self.queue_wait.observe(wait);
    }

    /// Record a failed attempt that is followed by another attempt.
    pub fn record_retry(&self, destination: &str, class: ErrorClass) {
        bump(
            &self.retry_attempts,
            (destination.to_string(), class.as_str().to_string()),
        );
    }

    pub fn set_worker_counts(&self, active: usize, idle: usize) {
        self.active_workers.store(active as u64, Ordering::Relaxed);
        self.idle_workers.store(idle as u64, Ordering::Relaxed);
    }

    pub fn active_workers(&self) -> u64 {
        self.active_workers.load(Ordering::Relaxed)
    }

    // ========== Circuit Breaker Metrics ==========

    pub fn record_breaker_trip(&self, destination: &str) {
        bump(&self.breaker_trips, destination.to_string());
    }

    pub fn record_breaker_recovery(&self, destination: &str) {
        bump(&self.breaker_recoveries, destination.to_string());
    }

    // ========== Dead Letter Metrics ==========

    pub fn record_dead_letter_write(&self, destination: &str) {
        bump(&self.dead_letter_writes, destination.to_string());
    }

    pub fn record_dead_letter_replay(&self, accepted: bool) {
        let outcome = if accepted { "accepted" } else { "rejected" };
        bump(&self.dead_letter_replays, outcome.to_string());
    }

    pub fn set_dead_letter_size(&self, size: u64) {
        self.dead_letter_size.store(size, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submissions: collect_pairs(&self.submissions),
            jobs_processed: collect_pairs(&self.jobs_processed),
            retry_attempts: collect_pairs(&self.retry_attempts),
            job_duration: self.job_duration.snapshot(),
            queue_wait: self.queue_wait.snapshot(),
            breaker_trips: collect_single(&self.breaker_trips),
            breaker_recoveries: collect_single(&self.breaker_recoveries),
            dead_letter_writes: collect_single(&self.dead_letter_writes),
            dead_letter_replays: collect_single(&self.dead_letter_replays),
            dead_letter_size: self.dead_letter_size.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            idle_workers: self.idle_workers.load(Ordering::Relaxed),
            lane_depth: collect_single(&self.lane_depth),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// `(priority, outcome, count)`.
    pub submissions: Vec<(String, String, u64)>,
    /// `(destination, terminal state, count)`.
    pub jobs_processed: Vec<(String, String, u64)>,
    /// `(destination, classification, count)`.
    pub retry_attempts: Vec<(String, String, u64)>,
    pub job_duration: HistogramSnapshot,
    pub queue_wait: HistogramSnapshot,

    pub breaker_trips: BTreeMap<String, u64>,
    pub breaker_recoveries: BTreeMap<String, u64>,

    pub dead_letter_writes: BTreeMap<String, u64>,
    pub dead_letter_replays: BTreeMap<String, u64>,
    pub dead_letter_size: u64,

    pub active_workers: u64,
    pub idle_workers: u64,
    pub lane_depth: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    /// Sum of a labelled pair counter matching both labels.
    fn pair_value(values: &[(String, String, u64)], a: &str, b: &str) -> u64 {
        values
            .iter()
            .filter(|(x, y, _)| x == a && y == b)
            .map(|(_, _, v)| *v)
            .sum()
    }

    pub fn submissions_for(&self, priority: Priority, accepted: bool) -> u64 {
        let outcome = if accepted { "accepted" } else { "rejected" };
        Self::pair_value(&self.submissions, priority.as_str(), outcome)
    }

    pub fn processed_for(&self, destination: &str, state: JobState) -> u64 {
        Self::pair_value(&self.jobs_processed, destination, state.as_str())
    }

    pub fn retries_for(&self, destination: &str, class: ErrorClass) -> u64 {
        Self::pair_value(&self.retry_attempts, destination, class.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new();
        let snapshot = collector.snapshot();
        assert!(snapshot.submissions.is_empty());
        assert_eq!(snapshot.job_duration.count, 0);
        assert_eq!(snapshot.job_duration.buckets.len(), DURATION_BUCKETS_MS.len());
    }

    #[test]
    fn test_submission_metrics() {
        let collector = MetricsCollector::new();
        collector.record_submission(Priority::High, true);
        collector.record_submission(Priority::High, true);
        collector.record_submission(Priority::Low, false);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.submissions_for(Priority::High, true), 2);
        assert_eq!(snapshot.submissions_for(Priority::Low, false), 1);
        assert_eq!(snapshot.submissions_for(Priority::Medium, true), 0);
    }

    #[test]
    fn test_processing_metrics() {
        let collector = MetricsCollector::new();
        collector.record_job_processed("slack", JobState::Succeeded, Some(Duration::from_millis(40)));
        collector.record_job_processed("slack", JobState::DeadLettered, None);
        collector.record_retry("slack", ErrorClass::Transient);
        collector.record_retry("slack", ErrorClass::Transient);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.processed_for("slack", JobState::Succeeded), 1);
        assert_eq!(snapshot.processed_for("slack", JobState::DeadLettered), 1);
        assert_eq!(snapshot.retries_for("slack", ErrorClass::Transient), 2);
        assert_eq!(snapshot.job_duration.count, 1);
        assert_eq!(snapshot.job_duration.sum_ms, 40);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let collector = MetricsCollector::new();
        collector.record_queue_wait(Duration::from_millis(3));
        collector.record_queue_wait(Duration::from_millis(80));
        collector.record_queue_wait(Duration::from_secs(2));

        let hist = collector.snapshot().queue_wait;
        let at = |bound: u64| hist.buckets.iter().find(|(b, _)| *b == bound).unwrap().1;
        assert_eq!(at(5), 1);
        assert_eq!(at(100), 2);
        assert_eq!(at(2_500), 3);
        assert_eq!(hist.count, 3);
    }

    #[test]
    fn test_gauges() {
        let collector = MetricsCollector::new();
        collector.set_worker_counts(3, 1);
        collector.set_lane_depth(Priority::Medium, 7);
        collector.set_dead_letter_size(12);
        collector.record_breaker_trip("pagerduty");
        collector.record_dead_letter_write("pagerduty");

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.active_workers, 3);
        assert_eq!(snapshot.idle_workers, 1);
        assert_eq!(snapshot.lane_depth.get("medium"), Some(&7));
        assert_eq!(snapshot.dead_letter_size, 12);
        assert_eq!(snapshot.breaker_trips.get("pagerduty"), Some(&1));
        assert_eq!(snapshot.dead_letter_writes.get("pagerduty"), Some(&1));
    }
}
