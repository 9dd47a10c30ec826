//! Per-destination circuit breakers.
//!
//! Each destination owns one [`CircuitBreaker`]; all of its state sits behind
//! a single mutex so reads and writes for one destination are serialized, while
//! different destinations never contend with each other.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Configuration shared by every breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
    /// How long an open breaker rejects deliveries, in milliseconds.
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// State of a circuit breaker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing; deliveries rejected without a network call.
    Open,
    /// Cooldown elapsed; one trial delivery at a time.
    HalfOpen,
}

/// A state change caused by recording an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    /// Closed breaker reached the failure threshold.
    Tripped,
    /// Half-open trial failed.
    Reopened,
    /// Half-open breaker reached the success threshold.
    Recovered,
}

/// Point-in-time view of one breaker, for administration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerInfo {
    pub destination: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_transition_at: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    trial_in_flight: bool,
    opened_at: Option<Instant>,
    last_transition_at: DateTime<Utc>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            trial_in_flight: false,
            opened_at: None,
            last_transition_at: Utc::now(),
        }
    }

    fn set_state(&mut self, state: CircuitState) {
        self.state = state;
        self.last_transition_at = Utc::now();
    }

    fn open(&mut self) {
        self.set_state(CircuitState::Open);
        self.opened_at = Some(Instant::now());
        self.consecutive_successes = 0;
        self.trial_in_flight = false;
    }
}

/// Circuit breaker guarding a single destination.
#[derive(Debug)]
pub struct CircuitBreaker {
    destination: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new closed circuit breaker.
    pub fn new(destination: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            destination: destination.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Whether an attempt would be granted right now, without claiming it.
    pub fn is_available(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !inner.trial_in_flight,
        }
    }

    /// Ask permission for one delivery attempt.
    ///
    /// A half-open breaker grants a single trial until its outcome is recorded.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful delivery.
    pub fn record_success(&self) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.set_state(CircuitState::Closed);
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                    info!(destination = %self.destination, "Circuit breaker closed after successful recovery");
                    Some(CircuitTransition::Recovered)
                } else {
                    debug!(
                        destination = %self.destination,
                        successes = inner.consecutive_successes,
                        "Circuit breaker half-open trial succeeded"
                    );
                    None
                }
            }
            // Attempt started before the breaker tripped.
            CircuitState::Open => None,
        }
    }

    /// Record a failed delivery.
    pub fn record_failure(&self) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.open();
                    warn!(
                        destination = %self.destination,
                        failures = inner.consecutive_failures,
                        "Circuit breaker opened after consecutive failures"
                    );
                    Some(CircuitTransition::Tripped)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                inner.open();
                warn!(destination = %self.destination, "Circuit breaker reopened after failed trial");
                Some(CircuitTransition::Reopened)
            }
            CircuitState::Open => None,
        }
    }

    /// Give back a half-open trial whose outcome will never be known.
    pub fn abandon_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.set_state(CircuitState::Closed);
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.trial_in_flight = false;
        inner.opened_at = None;
        info!(destination = %self.destination, "Circuit breaker manually reset to closed");
    }

    pub fn info(&self) -> CircuitBreakerInfo {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        CircuitBreakerInfo {
            destination: self.destination.clone(),
            state: inner.state,
            failure_count: inner.consecutive_failures,
            success_count: inner.consecutive_successes,
            last_transition_at: inner.last_transition_at,
        }
    }

    /// Open -> half-open once the cooldown has elapsed.
    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.cooldown()
        {
            inner.set_state(CircuitState::HalfOpen);
            inner.consecutive_successes = 0;
            inner.trial_in_flight = false;
            debug!(destination = %self.destination, "Circuit breaker transitioned to half-open state");
        }
    }
}

/// Arena of circuit breakers keyed by destination name.
#[derive(Debug)]
pub struct CircuitBreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Create the breaker for a destination if it does not exist yet.
    pub fn register(&self, destination: &str) {
        self.get(destination);
    }

    /// Get or create the breaker for a destination.
    pub fn get(&self, destination: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(destination) {
            return breaker.clone();
        }

        self.breakers
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(destination, self.config.clone())))
            .clone()
    }

    /// Whether a delivery to `destination` may proceed now.
    ///
    /// Read-only: a half-open trial is claimed only by [`CircuitBreaker::try_acquire`].
    pub fn allow(&self, destination: &str) -> bool {
        self.get(destination).is_available()
    }

    pub fn record_success(&self, destination: &str) -> Option<CircuitTransition> {
        self.get(destination).record_success()
    }

    pub fn record_failure(&self, destination: &str) -> Option<CircuitTransition> {
        self.get(destination).record_failure()
    }

    /// Force a destination's breaker back to closed.
    pub fn reset(&self, destination: &str) -> Result<()> {
        let breaker = self
            .breakers
            .get(destination)
            .map(|b| b.clone())
            .ok_or_else(|| Error::not_found("CircuitBreaker", destination))?;
        breaker.reset();
        Ok(())
    }

    /// All breakers, sorted by destination.
    pub fn list(&self) -> Vec<CircuitBreakerInfo> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        let mut infos: Vec<CircuitBreakerInfo> = breakers.iter().map(|b| b.info()).collect();
        infos.sort_by(|a, b| a.destination.cmp(&b.destination));
        infos
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
