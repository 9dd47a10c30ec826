//! Periodic housekeeping.
//!
//! Runs the dead-letter expiry sweep and the tracking-store TTL eviction on
//! their own intervals until cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::dead_letter::DeadLetterStore;
use super::tracking::JobTracker;

/// Maintenance scheduler for the delivery engine.
pub struct MaintenanceScheduler {
    dead_letters: Arc<DeadLetterStore>,
    tracker: Arc<JobTracker>,
    sweep_interval: Duration,
    evict_interval: Duration,
}

impl MaintenanceScheduler {
    pub fn new(
        dead_letters: Arc<DeadLetterStore>,
        tracker: Arc<JobTracker>,
        sweep_interval: Duration,
        evict_interval: Duration,
    ) -> Self {
        Self {
            dead_letters,
            tracker,
            sweep_interval,
            evict_interval,
        }
    }

    /// Start the scheduler. The task ends when `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop(cancel).await;
        })
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        let mut evict = tokio::time::interval(self.evict_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        evict.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Both intervals fire immediately; skip that first tick.
        sweep.tick().await;
        evict.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Maintenance scheduler stopped");
                    break;
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.dead_letters.sweep().await {
                        tracing::error!(error = %e, "Dead letter sweep failed");
                    }
                }
                _ = evict.tick() => {
                    self.tracker.evict_expired();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::dead_letter::DeadLetterConfig;
    use crate::delivery::dead_letter::tests::MemoryDeadLetterRepository;
    use crate::delivery::job::{AlertPayload, AlertStatus, Job, Severity};
    use crate::delivery::tracking::TrackingConfig;
    use crate::metrics::MetricsCollector;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_evicts_and_stops() {
        let tracker = Arc::new(JobTracker::new(&TrackingConfig {
            max_entries: 10,
            ttl_secs: 5,
            evict_interval_secs: 1,
        }));
        let store = Arc::new(DeadLetterStore::new(
            Arc::new(MemoryDeadLetterRepository::default()),
            &DeadLetterConfig::default(),
            Arc::new(MetricsCollector::new()),
        ));
        tracker.store(&Job::new(
            AlertPayload::new(Severity::Info, AlertStatus::Resolved, json!({})),
            "chat",
        ));

        let scheduler = Arc::new(MaintenanceScheduler::new(
            store,
            tracker.clone(),
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));
        let cancel = CancellationToken::new();
        let handle = scheduler.start(cancel.clone());

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(tracker.len(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
