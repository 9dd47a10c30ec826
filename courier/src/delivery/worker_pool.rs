//! Worker pool for delivery jobs.
//!
//! A fixed set of long-lived tasks, started and stopped together. Each worker
//! takes the most urgent job from the dispatcher, runs it through the retry
//! engine and records the terminal outcome. Shutdown is two-phase: first stop
//! acquiring and let in-flight work finish within the grace period, then
//! interrupt whatever is left and dead-letter it.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::classifier::{DeliveryError, ErrorClass};
use super::dead_letter::DeadLetterStore;
use super::dispatcher::PriorityDispatcher;
use super::job::{Job, JobId, JobState};
use super::retry::{RetryEngine, RetryOutcome};
use super::tracking::JobTracker;
use crate::metrics::MetricsCollector;

/// How long interrupted workers get to record their jobs before being aborted.
const INTERRUPT_DRAIN_WINDOW: Duration = Duration::from_secs(5);

/// Configuration for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Timeout of a single delivery attempt, in milliseconds.
    pub attempt_timeout_ms: u64,
    /// Grace period for in-flight jobs at shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            attempt_timeout_ms: 30_000,
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl WorkerPoolConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// What happened during shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// All in-flight jobs finished within the grace period.
    pub clean: bool,
    /// In-flight jobs dead-lettered as interrupted.
    pub interrupted: usize,
    /// Queued jobs that never started and were dead-lettered.
    pub drained: usize,
}

/// State shared by all workers.
struct WorkerShared {
    dispatcher: Arc<PriorityDispatcher>,
    engine: Arc<RetryEngine>,
    dead_letters: Arc<DeadLetterStore>,
    tracker: Arc<JobTracker>,
    metrics: Arc<MetricsCollector>,
    workers: usize,
    active: AtomicUsize,
    interrupted: AtomicUsize,
    /// Copies of in-flight jobs, for dead-lettering aborted workers.
    in_flight: DashMap<JobId, Job>,
}

impl WorkerShared {
    fn publish_worker_counts(&self) {
        let active = self.active.load(Ordering::SeqCst);
        self.metrics
            .set_worker_counts(active, self.workers.saturating_sub(active));
    }

    async fn process(&self, mut job: Job, interrupt: &CancellationToken) {
        if let Err(e) = job.transition(JobState::Processing) {
            error!(job_id = %job.id, error = %e, "Job taken from lane in unexpected state");
            return;
        }
        if let Some(wait) = job.queue_wait().and_then(|w| w.to_std().ok()) {
            self.metrics.record_queue_wait(wait);
        }
        self.tracker.update(&job);
        self.in_flight.insert(job.id, job.clone());

        let outcome = match self.engine.execute(&mut job, interrupt).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Retry engine failed");
                job.record_error(format!("worker fault: {e}"), ErrorClass::Permanent);
                RetryOutcome::Exhausted
            }
        };

        match outcome {
            RetryOutcome::Delivered => {
                info!(
                    job_id = %job.id,
                    destination = %job.destination,
                    retries = job.retry_count,
                    "Job delivered"
                );
                self.finish(job, JobState::Succeeded).await;
            }
            RetryOutcome::Exhausted => self.dead_letter(job).await,
            RetryOutcome::Interrupted => {
                self.dead_letter(job).await;
                // Counted once recorded; an abort before this leaves the job to the straggler pass.
                self.interrupted.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Persist a failed job, falling back to `Failed` if the store is unavailable.
    async fn dead_letter(&self, mut job: Job) {
        match self.dead_letters.write(&job).await {
            Ok(_) => self.finish(job, JobState::DeadLettered).await,
            Err(e) => {
                let delivery_error = job.last_error.clone().unwrap_or_default();
                error!(
                    job_id = %job.id,
                    destination = %job.destination,
                    delivery_error = %delivery_error,
                    error = %e,
                    "Failed to write dead letter; job is lost"
                );
                let class = job.last_error_class.unwrap_or(ErrorClass::Unknown);
                job.record_error(
                    format!("{delivery_error}; dead-letter write failed: {e}"),
                    class,
                );
                self.finish(job, JobState::Failed).await;
            }
        }
    }

    async fn finish(&self, mut job: Job, state: JobState) {
        if let Err(e) = job.transition(state) {
            error!(job_id = %job.id, error = %e, "Invalid terminal transition");
            return;
        }
        self.metrics.record_job_processed(
            &job.destination,
            state,
            job.total_duration().and_then(|d| d.to_std().ok()),
        );

        if let Some(entry_id) = &job.replay_of
            && let Err(e) = self
                .dead_letters
                .record_replay_result(entry_id, state.as_str())
                .await
        {
            warn!(dead_letter_id = %entry_id, error = %e, "Failed to record replay result");
        }

        // Last, so a terminal state in the tracker implies everything above is done.
        self.tracker.update(&job);
    }

    /// Dead-letter a job whose worker panicked or was aborted.
    async fn abandon(&self, mut job: Job, reason: String, class: ErrorClass) {
        if let Some(snapshot) = self.tracker.get(&job.id) {
            job.retry_count = snapshot.retry_count;
        }
        job.record_error(reason, class);
        self.dead_letter(job).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A pool of delivery workers.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    shared: Arc<WorkerShared>,
    /// Stops job acquisition.
    stop: CancellationToken,
    /// Interrupts in-flight attempts and backoffs.
    interrupt: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        dispatcher: Arc<PriorityDispatcher>,
        engine: Arc<RetryEngine>,
        dead_letters: Arc<DeadLetterStore>,
        tracker: Arc<JobTracker>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let shared = Arc::new(WorkerShared {
            dispatcher,
            engine,
            dead_letters,
            tracker,
            metrics,
            workers: config.workers,
            active: AtomicUsize::new(0),
            interrupted: AtomicUsize::new(0),
            in_flight: DashMap::new(),
        });
        Self {
            config,
            shared,
            stop: CancellationToken::new(),
            interrupt: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn the workers.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("Worker pool already stopped; not starting");
            return;
        };
        if !join_set.is_empty() {
            warn!("Worker pool already started");
            return;
        }

        info!(workers = self.config.workers, "Starting delivery worker pool");
        self.shared.publish_worker_counts();

        for worker_id in 0..self.config.workers {
            let shared = self.shared.clone();
            let stop = self.stop.clone();
            let interrupt = self.interrupt.clone();

            join_set.spawn(async move {
                debug!(worker_id, "Delivery worker started");

                while let Some(job) = shared.dispatcher.next(&stop).await {
                    shared.active.fetch_add(1, Ordering::SeqCst);
                    shared.publish_worker_counts();

                    let job_id = job.id;
                    let fallback = job.clone();
                    let result = AssertUnwindSafe(shared.process(job, &interrupt))
                        .catch_unwind()
                        .await;

                    if let Err(panic) = result {
                        let message = panic_message(panic.as_ref());
                        error!(worker_id, job_id = %job_id, panic = %message, "Worker panicked while processing job");
                        let job = shared
                            .in_flight
                            .get(&job_id)
                            .map(|j| j.clone())
                            .unwrap_or(fallback);
                        shared
                            .abandon(job, format!("worker fault: {message}"), ErrorClass::Permanent)
                            .await;
                    }

                    shared.in_flight.remove(&job_id);
                    shared.active.fetch_sub(1, Ordering::SeqCst);
                    shared.publish_worker_counts();
                }

                debug!(worker_id, "Delivery worker stopped");
            });
        }
    }

    /// Stop the pool. See the module docs for the two phases.
    pub async fn shutdown(&self) -> ShutdownReport {
        let grace = self.config.shutdown_timeout();
        info!(grace_ms = grace.as_millis() as u64, "Stopping delivery worker pool");

        self.shared.dispatcher.close();
        self.stop.cancel();

        let join_set = self.tasks.lock().take();
        let mut report = ShutdownReport {
            clean: true,
            ..Default::default()
        };

        if let Some(mut join_set) = join_set {
            let finished = tokio::time::timeout(grace, async {
                while join_set.join_next().await.is_some() {}
            })
            .await
            .is_ok();

            if !finished {
                report.clean = false;
                warn!(
                    in_flight = self.shared.in_flight.len(),
                    "Grace period elapsed; interrupting in-flight deliveries"
                );
                self.interrupt.cancel();

                let drained = tokio::time::timeout(INTERRUPT_DRAIN_WINDOW, async {
                    while join_set.join_next().await.is_some() {}
                })
                .await
                .is_ok();

                if !drained {
                    warn!("Aborting unresponsive delivery workers");
                    join_set.abort_all();
                    while join_set.join_next().await.is_some() {}
                }
            }
        }

        // Jobs left behind by aborted workers.
        let stragglers: Vec<Job> = self
            .shared
            .in_flight
            .iter()
            .map(|e| e.value().clone())
            .collect();
        self.shared.in_flight.clear();
        for job in stragglers {
            self.shared.interrupted.fetch_add(1, Ordering::SeqCst);
            self.shared
                .abandon(job, DeliveryError::Interrupted.to_string(), ErrorClass::Transient)
                .await;
        }
        report.interrupted = self.shared.interrupted.load(Ordering::SeqCst);

        // Jobs that never started.
        for mut job in self.shared.dispatcher.drain() {
            job.record_error(DeliveryError::Interrupted.to_string(), ErrorClass::Transient);
            self.shared.dead_letter(job).await;
            report.drained += 1;
        }

        self.shared.active.store(0, Ordering::SeqCst);
        self.shared.metrics.set_worker_counts(0, 0);

        info!(
            clean = report.clean,
            interrupted = report.interrupted,
            drained = report.drained,
            "Delivery worker pool stopped"
        );
        report
    }

    /// Workers currently processing a job.
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Workers waiting for a job.
    pub fn idle_count(&self) -> usize {
        if self.is_running() {
            self.config.workers.saturating_sub(self.active_count())
        } else {
            0
        }
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.attempt_timeout(), Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(boxed.as_ref()), "kaboom");

        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
