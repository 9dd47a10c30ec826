//! Delivery service facade.
//!
//! Owns every delivery component and manages their lifecycle. This is the
//! single entry point for ingestion, status queries and administration.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::circuit_breaker::{CircuitBreakerInfo, CircuitBreakerManager};
use super::dead_letter::{DeadLetterEntry, DeadLetterStore};
use super::destination::DestinationRegistry;
use super::dispatcher::{LaneStats, PriorityDispatcher};
use super::job::{AlertPayload, Job, JobId};
use super::maintenance::MaintenanceScheduler;
use super::query::{DeadLetterFilter, JobFilter, Page};
use super::retry::RetryEngine;
use super::tracking::{JobStatusSnapshot, JobTracker};
use super::worker_pool::{ShutdownReport, WorkerPool};
use crate::config::EngineConfig;
use crate::database::repositories::DeadLetterRepository;
use crate::metrics::{MetricsCollector, MetricsSnapshot, PrometheusExporter};
use crate::{Error, Result};

/// Queue and worker statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub lanes: Vec<LaneStats>,
    pub active_workers: usize,
    pub idle_workers: usize,
    pub dead_letters: u64,
}

/// The delivery engine.
pub struct DeliveryService {
    registry: Arc<DestinationRegistry>,
    dispatcher: Arc<PriorityDispatcher>,
    breakers: Arc<CircuitBreakerManager>,
    tracker: Arc<JobTracker>,
    dead_letters: Arc<DeadLetterStore>,
    pool: WorkerPool,
    maintenance: Arc<MaintenanceScheduler>,
    metrics: Arc<MetricsCollector>,
    exporter: PrometheusExporter,
    cancellation_token: CancellationToken,
    maintenance_task: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryService {
    /// Wire up the engine. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: &EngineConfig,
        registry: DestinationRegistry,
        repo: Arc<dyn DeadLetterRepository>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(registry);
        let metrics = Arc::new(MetricsCollector::new());
        let tracker = Arc::new(JobTracker::new(&config.tracking));

        let breakers = Arc::new(CircuitBreakerManager::new(config.circuit_breaker.clone()));
        for name in registry.names() {
            breakers.register(name);
        }

        let dispatcher = Arc::new(PriorityDispatcher::new(
            &config.dispatcher,
            tracker.clone(),
            metrics.clone(),
        ));
        let dead_letters = Arc::new(DeadLetterStore::new(
            repo,
            &config.dead_letter,
            metrics.clone(),
        ));
        let engine = Arc::new(RetryEngine::new(
            config.retry.clone(),
            config.workers.attempt_timeout(),
            registry.clone(),
            breakers.clone(),
            tracker.clone(),
            metrics.clone(),
        ));
        let pool = WorkerPool::new(
            config.workers.clone(),
            dispatcher.clone(),
            engine,
            dead_letters.clone(),
            tracker.clone(),
            metrics.clone(),
        );
        let maintenance = Arc::new(MaintenanceScheduler::new(
            dead_letters.clone(),
            tracker.clone(),
            config.dead_letter.sweep_interval(),
            config.tracking.evict_interval(),
        ));

        Ok(Self {
            registry,
            dispatcher,
            breakers,
            tracker,
            dead_letters,
            pool,
            maintenance,
            exporter: PrometheusExporter::new(metrics.clone()),
            metrics,
            cancellation_token: CancellationToken::new(),
            maintenance_task: Mutex::new(None),
        })
    }

    /// Start the workers and the maintenance scheduler.
    pub fn start(&self) {
        info!(destinations = self.registry.len(), "Starting delivery service");
        self.pool.start();

        let mut task = self.maintenance_task.lock();
        if task.is_none() && !self.cancellation_token.is_cancelled() {
            *task = Some(
                self.maintenance
                    .clone()
                    .start(self.cancellation_token.child_token()),
            );
        }
    }

    /// Accept an alert for delivery to `destination`.
    pub fn submit(&self, payload: AlertPayload, destination: &str) -> Result<JobId> {
        if !self.registry.contains(destination) {
            return Err(Error::not_found("Destination", destination));
        }

        let job = Job::new(payload, destination);
        let job_id = job.id;
        let priority = job.priority;
        self.dispatcher.submit(job)?;

        debug!(job_id = %job_id, destination, %priority, "Job submitted");
        Ok(job_id)
    }

    pub fn get_job(&self, id: &JobId) -> Result<JobStatusSnapshot> {
        self.tracker
            .get(id)
            .ok_or_else(|| Error::not_found("Job", id.to_string()))
    }

    pub fn list_jobs(&self, filter: &JobFilter, page: Page) -> Vec<JobStatusSnapshot> {
        self.tracker.list(filter, page)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            lanes: self.dispatcher.stats(),
            active_workers: self.pool.active_count(),
            idle_workers: self.pool.idle_count(),
            dead_letters: self.dead_letters.count().await?,
        })
    }

    pub async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
        page: Page,
    ) -> Result<Vec<DeadLetterEntry>> {
        self.dead_letters.list(filter, page).await
    }

    pub async fn get_dead_letter(&self, id: &str) -> Result<DeadLetterEntry> {
        self.dead_letters.get(id).await
    }

    /// Re-submit a dead-lettered job as a fresh job with zero retries.
    ///
    /// Each entry can be replayed once. The replay job goes through the
    /// dispatcher like any other submission and may itself be rejected.
    pub async fn replay_dead_letter(&self, id: &str) -> Result<JobId> {
        let entry = self.dead_letters.get(id).await?;
        if entry.is_replayed() {
            self.metrics.record_dead_letter_replay(false);
            return Err(Error::AlreadyReplayed { id: id.to_string() });
        }
        if !self.registry.contains(&entry.destination) {
            self.metrics.record_dead_letter_replay(false);
            return Err(Error::not_found("Destination", entry.destination));
        }

        let job = entry.to_replay_job();
        let job_id = job.id;

        if let Err(e) = self.dead_letters.claim_replay(id, job_id).await {
            self.metrics.record_dead_letter_replay(false);
            return Err(e);
        }

        if let Err(e) = self.dispatcher.submit(job) {
            if let Err(release) = self.dead_letters.release_replay(id, job_id).await {
                warn!(dead_letter_id = %id, error = %release, "Failed to release replay claim");
            }
            self.metrics.record_dead_letter_replay(false);
            return Err(e);
        }

        self.metrics.record_dead_letter_replay(true);
        info!(dead_letter_id = %id, job_id = %job_id, destination = %entry.destination, "Dead letter replayed");
        Ok(job_id)
    }

    /// Remove expired dead letters now. Returns how many were removed.
    pub async fn sweep_dead_letters(&self) -> Result<u64> {
        self.dead_letters.sweep().await
    }

    pub fn list_circuit_breakers(&self) -> Vec<CircuitBreakerInfo> {
        self.breakers.list()
    }

    pub fn reset_circuit_breaker(&self, destination: &str) -> Result<()> {
        self.breakers.reset(destination)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Metrics in the Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        self.exporter.export()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Stop accepting work, finish or interrupt in-flight jobs, and stop
    /// background tasks.
    pub async fn shutdown(&self) -> ShutdownReport {
        info!("Shutting down delivery service");
        self.cancellation_token.cancel();

        let report = self.pool.shutdown().await;

        let task = self.maintenance_task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Maintenance task ended abnormally");
        }

        info!("Delivery service shut down");
        report
    }
}
