//! Priority dispatcher.
//!
//! Three capacity-bounded FIFO lanes, one per priority. Submission never
//! blocks: a job either lands in its lane or is rejected with
//! [`Error::LaneFull`]. Workers always drain the most urgent non-empty lane.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::job::{Job, Priority};
use super::tracking::JobTracker;
use crate::metrics::MetricsCollector;
use crate::{Error, Result};

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub high_capacity: usize,
    pub medium_capacity: usize,
    pub low_capacity: usize,
    /// Longest an idle worker waits before re-checking the lanes, in milliseconds.
    pub idle_wait_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            high_capacity: 1000,
            medium_capacity: 5000,
            low_capacity: 10_000,
            idle_wait_ms: 100,
        }
    }
}

impl DispatcherConfig {
    pub fn capacity(&self, priority: Priority) -> usize {
        match priority {
            Priority::High => self.high_capacity,
            Priority::Medium => self.medium_capacity,
            Priority::Low => self.low_capacity,
        }
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}

/// Depth and capacity of one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneStats {
    pub priority: Priority,
    pub depth: usize,
    pub capacity: usize,
}

struct Lane {
    queue: Mutex<VecDeque<Job>>,
    capacity: usize,
}

/// Priority-ordered job dispatcher.
pub struct PriorityDispatcher {
    lanes: [Lane; 3],
    notify: Notify,
    idle_wait: Duration,
    closed: AtomicBool,
    tracker: Arc<JobTracker>,
    metrics: Arc<MetricsCollector>,
}

impl PriorityDispatcher {
    pub fn new(
        config: &DispatcherConfig,
        tracker: Arc<JobTracker>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let lane = |priority| Lane {
            queue: Mutex::new(VecDeque::new()),
            capacity: config.capacity(priority),
        };
        Self {
            lanes: [lane(Priority::High), lane(Priority::Medium), lane(Priority::Low)],
            notify: Notify::new(),
            idle_wait: config.idle_wait(),
            closed: AtomicBool::new(false),
            tracker,
            metrics,
        }
    }

    /// Enqueue a job in its priority lane.
    ///
    /// The job is visible to the tracking store before this returns.
    pub fn submit(&self, job: Job) -> Result<()> {
        let priority = job.priority;
        if self.closed.load(Ordering::Acquire) {
            self.metrics.record_submission(priority, false);
            return Err(Error::ShuttingDown);
        }

        let lane = &self.lanes[priority.index()];
        let depth = {
            let mut queue = lane.queue.lock();
            if queue.len() >= lane.capacity {
                drop(queue);
                self.metrics.record_submission(priority, false);
                debug!(job_id = %job.id, %priority, capacity = lane.capacity, "Lane full, rejecting job");
                return Err(Error::LaneFull {
                    priority,
                    capacity: lane.capacity,
                });
            }
            self.tracker.store(&job);
            queue.push_back(job);
            queue.len()
        };

        self.metrics.record_submission(priority, true);
        self.metrics.set_lane_depth(priority, depth);
        self.notify.notify_one();
        Ok(())
    }

    /// Take the next job, highest priority first.
    pub fn try_next(&self) -> Option<Job> {
        for priority in Priority::ALL {
            let mut queue = self.lanes[priority.index()].queue.lock();
            if let Some(job) = queue.pop_front() {
                let depth = queue.len();
                drop(queue);
                self.metrics.set_lane_depth(priority, depth);
                return Some(job);
            }
        }
        None
    }

    /// Wait for the next job. Returns `None` once `stop` is cancelled.
    ///
    /// Wake-ups may be missed under contention, so waiting is bounded by the
    /// idle-wait interval and the lanes are always re-checked.
    pub async fn next(&self, stop: &CancellationToken) -> Option<Job> {
        loop {
            if stop.is_cancelled() {
                return None;
            }
            if let Some(job) = self.try_next() {
                return Some(job);
            }

            tokio::select! {
                _ = stop.cancelled() => return None,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.idle_wait) => {}
            }
        }
    }

    /// Reject all further submissions.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Remove every queued job, highest priority first.
    pub fn drain(&self) -> Vec<Job> {
        let mut drained = Vec::new();
        for priority in Priority::ALL {
            drained.extend(self.lanes[priority.index()].queue.lock().drain(..));
            self.metrics.set_lane_depth(priority, 0);
        }
        drained
    }

    pub fn depth(&self, priority: Priority) -> usize {
        self.lanes[priority.index()].queue.lock().len()
    }

    pub fn stats(&self) -> Vec<LaneStats> {
        Priority::ALL
            .iter()
            .map(|&priority| LaneStats {
                priority,
                depth: self.depth(priority),
                capacity: self.lanes[priority.index()].capacity,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::job::{AlertPayload, AlertStatus, JobState, Severity};
    use crate::delivery::tracking::TrackingConfig;
    use serde_json::json;

    fn dispatcher(capacity: usize) -> PriorityDispatcher {
        PriorityDispatcher::new(
            &DispatcherConfig {
                high_capacity: capacity,
                medium_capacity: capacity,
                low_capacity: capacity,
                idle_wait_ms: 100,
            },
            Arc::new(JobTracker::new(&TrackingConfig::default())),
            Arc::new(MetricsCollector::new()),
        )
    }

    fn job(severity: Severity, status: AlertStatus) -> Job {
        Job::new(AlertPayload::new(severity, status, json!({})), "ops")
    }

    fn high() -> Job {
        job(Severity::Critical, AlertStatus::Firing)
    }

    fn medium() -> Job {
        job(Severity::Warning, AlertStatus::Firing)
    }

    fn low() -> Job {
        job(Severity::Info, AlertStatus::Firing)
    }

    #[test]
    fn test_high_lane_served_first() {
        let d = dispatcher(10);
        let l = low();
        let m = medium();
        let h = high();
        let (l_id, m_id, h_id) = (l.id, m.id, h.id);

        d.submit(l).unwrap();
        d.submit(m).unwrap();
        d.submit(h).unwrap();

        assert_eq!(d.try_next().unwrap().id, h_id);
        assert_eq!(d.try_next().unwrap().id, m_id);
        assert_eq!(d.try_next().unwrap().id, l_id);
        assert!(d.try_next().is_none());
    }

    #[test]
    fn test_fifo_within_lane() {
        let d = dispatcher(10);
        let jobs: Vec<Job> = (0..5).map(|_| medium()).collect();
        let ids: Vec<_> = jobs.iter().map(|j| j.id).collect();
        for j in jobs {
            d.submit(j).unwrap();
        }

        let taken: Vec<_> = std::iter::from_fn(|| d.try_next()).map(|j| j.id).collect();
        assert_eq!(taken, ids);
    }

    #[test]
    fn test_full_lane_rejects_without_enqueue() {
        let d = dispatcher(2);
        d.submit(low()).unwrap();
        d.submit(low()).unwrap();

        let rejected = low();
        let rejected_id = rejected.id;
        let err = d.submit(rejected).unwrap_err();

        assert!(matches!(
            err,
            Error::LaneFull {
                priority: Priority::Low,
                capacity: 2
            }
        ));
        assert_eq!(d.depth(Priority::Low), 2);
        assert!(d.tracker.get(&rejected_id).is_none());

        // Other lanes are unaffected.
        d.submit(high()).unwrap();
        let snapshot = d.metrics.snapshot();
        assert_eq!(snapshot.submissions_for(Priority::Low, true), 2);
        assert_eq!(snapshot.submissions_for(Priority::Low, false), 1);
    }

    #[test]
    fn test_submit_registers_with_tracker() {
        let d = dispatcher(2);
        let j = medium();
        let id = j.id;
        d.submit(j).unwrap();

        let snapshot = d.tracker.get(&id).unwrap();
        assert_eq!(snapshot.state, JobState::Queued);
    }

    #[test]
    fn test_closed_dispatcher_rejects() {
        let d = dispatcher(2);
        assert!(!d.is_closed());
        d.close();
        assert!(d.is_closed());
        assert!(matches!(d.submit(high()).unwrap_err(), Error::ShuttingDown));
    }

    #[test]
    fn test_drain_and_stats() {
        let d = dispatcher(4);
        d.submit(high()).unwrap();
        d.submit(low()).unwrap();
        d.submit(low()).unwrap();

        let stats = d.stats();
        assert_eq!(stats[0].depth, 1);
        assert_eq!(stats[2].depth, 2);
        assert_eq!(stats[2].capacity, 4);

        let drained = d.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].priority, Priority::High);
        assert!(d.stats().iter().all(|s| s.depth == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_wakes_on_submit() {
        let d = Arc::new(dispatcher(4));
        let stop = CancellationToken::new();

        let waiter = {
            let d = d.clone();
            let stop = stop.clone();
            tokio::spawn(async move { d.next(&stop).await })
        };

        tokio::time::sleep(Duration::from_millis(250)).await;
        let j = high();
        let id = j.id;
        d.submit(j).unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.id, id);
    }

    #[tokio::test]
    async fn test_next_returns_none_when_stopped() {
        let d = dispatcher(4);
        let stop = CancellationToken::new();
        stop.cancel();
        assert!(d.next(&stop).await.is_none());
    }
}
