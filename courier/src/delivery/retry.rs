//! Retry engine.
//!
//! Drives a single job through repeated delivery attempts:
//! `processing -> (retrying -> processing)*` until it is delivered or given up
//! on. Every attempt, the first included, is gated by the destination's
//! circuit breaker and bounded by the per-attempt timeout.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::circuit_breaker::{CircuitBreakerManager, CircuitTransition};
use super::classifier::{DeliveryError, ErrorClass, classify};
use super::destination::DestinationRegistry;
use super::job::{Job, JobState};
use super::tracking::JobTracker;
use crate::Result;
use crate::metrics::MetricsCollector;

/// Retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on the backoff delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive retries.
    pub multiplier: f64,
    /// Symmetric jitter as a fraction of the delay (0.1 = +/-10%).
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry `retry` (1-based), capped, without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay before retry `retry`, with jitter and an optional `Retry-After` hint.
    ///
    /// The hint can only raise the delay. The result never exceeds the cap.
    pub fn delay_for_retry(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let base = self.base_delay(retry);

        let delay = if self.jitter_ratio > 0.0 {
            let spread = self.jitter_ratio * (2.0 * rand::random::<f64>() - 1.0);
            base.mul_f64((1.0 + spread).max(0.0))
        } else {
            base
        };

        let delay = match retry_after {
            Some(hint) => delay.max(hint),
            None => delay,
        };
        delay.min(self.max_delay())
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// How a job left the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Delivered,
    /// Permanent failure, or retries used up. Error recorded on the job.
    Exhausted,
    /// Stopped by the shutdown interrupt.
    Interrupted,
}

/// Executes delivery attempts for jobs.
pub struct RetryEngine {
    config: RetryConfig,
    attempt_timeout: Duration,
    registry: Arc<DestinationRegistry>,
    breakers: Arc<CircuitBreakerManager>,
    tracker: Arc<JobTracker>,
    metrics: Arc<MetricsCollector>,
}

impl RetryEngine {
    pub fn new(
        config: RetryConfig,
        attempt_timeout: Duration,
        registry: Arc<DestinationRegistry>,
        breakers: Arc<CircuitBreakerManager>,
        tracker: Arc<JobTracker>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config,
            attempt_timeout,
            registry,
            breakers,
            tracker,
            metrics,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run attempts until the job is delivered, given up on, or interrupted.
    ///
    /// The job must be in `Processing`; it is left in `Processing` for the
    /// caller to move into a terminal state.
    pub async fn execute(&self, job: &mut Job, interrupt: &CancellationToken) -> Result<RetryOutcome> {
        let mut unknown_retried = false;

        loop {
            let attempt = job.retry_count + 1;
            debug!(job_id = %job.id, destination = %job.destination, attempt, "Attempting delivery");

            let error = match self.attempt(job, interrupt).await {
                Ok(()) => return Ok(RetryOutcome::Delivered),
                Err(error) => error,
            };

            if matches!(error, DeliveryError::Interrupted) {
                job.record_error(error.to_string(), classify(&error));
                return Ok(RetryOutcome::Interrupted);
            }

            let class = match classify(&error) {
                ErrorClass::Unknown if unknown_retried => ErrorClass::Permanent,
                ErrorClass::Unknown => {
                    unknown_retried = true;
                    ErrorClass::Unknown
                }
                class => class,
            };
            job.record_error(error.to_string(), class);

            if class == ErrorClass::Permanent {
                warn!(
                    job_id = %job.id,
                    destination = %job.destination,
                    error = %error,
                    "Permanent delivery failure, not retrying"
                );
                return Ok(RetryOutcome::Exhausted);
            }

            if job.retry_count >= self.config.max_retries {
                warn!(
                    job_id = %job.id,
                    destination = %job.destination,
                    retries = job.retry_count,
                    error = %error,
                    "Delivery retries exhausted"
                );
                return Ok(RetryOutcome::Exhausted);
            }

            let delay = self
                .config
                .delay_for_retry(job.retry_count + 1, error.retry_after());

            job.transition(JobState::Retrying)?;
            self.tracker.update(job);
            self.metrics.record_retry(&job.destination, class);

            warn!(
                job_id = %job.id,
                destination = %job.destination,
                attempt,
                error_class = %class,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Delivery failed, scheduling retry"
            );

            tokio::select! {
                _ = interrupt.cancelled() => {
                    job.record_error(DeliveryError::Interrupted.to_string(), ErrorClass::Transient);
                    return Ok(RetryOutcome::Interrupted);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            job.retry_count += 1;
            job.transition(JobState::Processing)?;
            self.tracker.update(job);
        }
    }

    /// One gated, timed delivery attempt.
    async fn attempt(
        &self,
        job: &Job,
        interrupt: &CancellationToken,
    ) -> std::result::Result<(), DeliveryError> {
        let Some(registered) = self.registry.get(&job.destination) else {
            return Err(DeliveryError::InvalidPayload(format!(
                "destination '{}' is not registered",
                job.destination
            )));
        };

        let breaker = self.breakers.get(&job.destination);
        if !breaker.try_acquire() {
            debug!(job_id = %job.id, destination = %job.destination, "Circuit breaker denied attempt");
            return Err(DeliveryError::CircuitOpen {
                destination: job.destination.clone(),
            });
        }

        let publish = AssertUnwindSafe(
            registered
                .publisher
                .publish(&job.payload, &registered.destination),
        )
        .catch_unwind();

        let result = tokio::select! {
            biased;
            _ = interrupt.cancelled() => Err(DeliveryError::Interrupted),
            outcome = tokio::time::timeout(self.attempt_timeout, publish) => match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => {
                    breaker.abandon_trial();
                    std::panic::resume_unwind(panic);
                }
                Err(_) => Err(DeliveryError::Timeout(self.attempt_timeout)),
            },
        };

        let transition = match &result {
            Ok(()) => breaker.record_success(),
            Err(DeliveryError::Interrupted) => {
                breaker.abandon_trial();
                None
            }
            Err(_) => breaker.record_failure(),
        };

        match transition {
            Some(CircuitTransition::Tripped | CircuitTransition::Reopened) => {
                self.metrics.record_breaker_trip(&job.destination)
            }
            Some(CircuitTransition::Recovered) => {
                self.metrics.record_breaker_recovery(&job.destination)
            }
            None => {}
        }

        result
    }
}
