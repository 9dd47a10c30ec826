//! Engine configuration.
//!
//! Configuration is layered: built-in defaults, then an optional JSON file
//! named by `COURIER_CONFIG`, then individual environment overrides
//! (`COURIER_*` and `DATABASE_URL`). A `.env` file is honoured when present.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::delivery::{
    CircuitBreakerConfig, DeadLetterConfig, Destination, DispatcherConfig, RetryConfig,
    TrackingConfig, WorkerPoolConfig,
};
use crate::{Error, Result};

/// Environment variable naming the JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "COURIER_CONFIG";

/// Default SQLite database URL.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:courier.db?mode=rwc";

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter directive; `RUST_LOG` takes precedence when set.
    pub filter: Option<String>,
    /// Directory for daily-rolling log files. Console only when unset.
    pub log_dir: Option<PathBuf>,
    /// Emit console logs as JSON.
    pub json: bool,
    /// Days of log files to keep.
    pub retention_days: u32,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: None,
            log_dir: None,
            json: false,
            retention_days: 7,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_url: String,
    pub dispatcher: DispatcherConfig,
    pub workers: WorkerPoolConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub dead_letter: DeadLetterConfig,
    pub tracking: TrackingConfig,
    pub logging: LoggingSettings,
    pub destinations: Vec<Destination>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            dispatcher: DispatcherConfig::default(),
            workers: WorkerPoolConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            tracking: TrackingConfig::default(),
            logging: LoggingSettings::default(),
            destinations: Vec::new(),
        }
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("invalid value for {key}: '{value}'")))
}

impl EngineConfig {
    /// Load from the process environment: defaults, file, then overrides.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file. Missing sections take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Apply environment-style overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        macro_rules! override_field {
            ($key:literal, $field:expr) => {
                if let Some(value) = lookup($key) {
                    $field = parse_env($key, &value)?;
                }
            };
        }

        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = url;
        }

        override_field!("COURIER_WORKERS", self.workers.workers);
        override_field!("COURIER_ATTEMPT_TIMEOUT_MS", self.workers.attempt_timeout_ms);
        override_field!("COURIER_SHUTDOWN_TIMEOUT_MS", self.workers.shutdown_timeout_ms);

        override_field!("COURIER_HIGH_CAPACITY", self.dispatcher.high_capacity);
        override_field!("COURIER_MEDIUM_CAPACITY", self.dispatcher.medium_capacity);
        override_field!("COURIER_LOW_CAPACITY", self.dispatcher.low_capacity);
        override_field!("COURIER_IDLE_WAIT_MS", self.dispatcher.idle_wait_ms);

        override_field!("COURIER_MAX_RETRIES", self.retry.max_retries);
        override_field!("COURIER_INITIAL_DELAY_MS", self.retry.initial_delay_ms);
        override_field!("COURIER_MAX_DELAY_MS", self.retry.max_delay_ms);
        override_field!("COURIER_BACKOFF_MULTIPLIER", self.retry.multiplier);
        override_field!("COURIER_JITTER_RATIO", self.retry.jitter_ratio);

        override_field!(
            "COURIER_BREAKER_FAILURE_THRESHOLD",
            self.circuit_breaker.failure_threshold
        );
        override_field!(
            "COURIER_BREAKER_SUCCESS_THRESHOLD",
            self.circuit_breaker.success_threshold
        );
        override_field!("COURIER_BREAKER_COOLDOWN_MS", self.circuit_breaker.cooldown_ms);

        override_field!("COURIER_DLQ_RETENTION_SECS", self.dead_letter.retention_secs);
        override_field!("COURIER_DLQ_SWEEP_INTERVAL_SECS", self.dead_letter.sweep_interval_secs);

        override_field!("COURIER_TRACKING_MAX_ENTRIES", self.tracking.max_entries);
        override_field!("COURIER_TRACKING_TTL_SECS", self.tracking.ttl_secs);

        if let Some(filter) = lookup("COURIER_LOG_FILTER") {
            self.logging.filter = Some(filter);
        }
        if let Some(dir) = lookup("COURIER_LOG_DIR") {
            self.logging.log_dir = Some(PathBuf::from(dir));
        }
        override_field!("COURIER_LOG_JSON", self.logging.json);

        Ok(())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.workers.attempt_timeout_ms == 0 {
            return Err(Error::config("attempt timeout must be positive"));
        }
        if self.dispatcher.high_capacity == 0
            || self.dispatcher.medium_capacity == 0
            || self.dispatcher.low_capacity == 0
        {
            return Err(Error::config("lane capacities must be at least 1"));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(Error::config("backoff multiplier must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(Error::config("jitter ratio must be within [0, 1]"));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(Error::config("initial delay must not exceed max delay"));
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0
        {
            return Err(Error::config("circuit breaker thresholds must be at least 1"));
        }
        if self.tracking.max_entries == 0 {
            return Err(Error::config("tracking store must hold at least one entry"));
        }

        let mut seen = HashSet::new();
        for destination in &self.destinations {
            if destination.name.trim().is_empty() {
                return Err(Error::config("destination name must not be empty"));
            }
            if !seen.insert(destination.name.as_str()) {
                return Err(Error::config(format!(
                    "duplicate destination '{}'",
                    destination.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.dispatcher.idle_wait_ms, 100);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.success_threshold, 2);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::default();
        config
            .apply_overrides(lookup(&[
                ("DATABASE_URL", "sqlite::memory:"),
                ("COURIER_WORKERS", "8"),
                ("COURIER_MAX_RETRIES", "5"),
                ("COURIER_JITTER_RATIO", "0.2"),
                ("COURIER_LOG_DIR", "/var/log/courier"),
            ]))
            .unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.workers.workers, 8);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.jitter_ratio, 0.2);
        assert_eq!(config.logging.log_dir, Some(PathBuf::from("/var/log/courier")));
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(lookup(&[("COURIER_WORKERS", "many")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_validation_rules() {
        let mut config = EngineConfig::default();
        config.workers.workers = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry.jitter_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.dispatcher.low_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.destinations = vec![
            Destination::new("slack", "https://a.example.com"),
            Destination::new("slack", "https://b.example.com"),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_with_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "retry": {{"max_retries": 6}},
                "destinations": [
                    {{"name": "pagerduty", "kind": "incident_management",
                      "endpoint": "https://events.example.com/v2/enqueue",
                      "credentials_env": "PAGERDUTY_TOKEN"}}
                ]
            }}"#
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.retry.max_retries, 6);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert_eq!(config.destinations.len(), 1);
        assert_eq!(
            config.destinations[0].credentials_env.as_deref(),
            Some("PAGERDUTY_TOKEN")
        );
        assert_eq!(config.workers.workers, 4);
    }
}
