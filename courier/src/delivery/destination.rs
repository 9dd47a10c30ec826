//! Destinations and the publisher capability.
//!
//! A destination is a named external system plus the configuration needed to
//! reach it. Publishers are the adapters that actually talk to the outside
//! world; the engine only ever looks at the [`DeliveryError`] they return.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::classifier::DeliveryError;
use super::job::AlertPayload;
use crate::{Error, Result};

/// Kind of external system behind a destination.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DestinationKind {
    IncidentManagement,
    Chat,
    #[default]
    Webhook,
}

/// Delivery configuration for one destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    /// Unique name; jobs refer to destinations by this name.
    pub name: String,
    #[serde(default)]
    pub kind: DestinationKind,
    /// Endpoint URL.
    pub endpoint: String,
    /// HTTP method (default: POST).
    #[serde(default = "default_method")]
    pub method: String,
    /// Extra request headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Name of the environment variable holding the bearer credential.
    #[serde(default)]
    pub credentials_env: Option<String>,
    /// Per-destination request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout() -> u64 {
    10
}

impl Destination {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::default(),
            endpoint: endpoint.into(),
            method: default_method(),
            headers: Vec::new(),
            credentials_env: None,
            timeout_secs: default_timeout(),
        }
    }

    pub fn with_kind(mut self, kind: DestinationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_credentials_env(mut self, var: impl Into<String>) -> Self {
        self.credentials_env = Some(var.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Resolve the credential from the environment, if one is configured.
    pub fn resolve_credential(&self) -> Option<String> {
        self.credentials_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
    }
}

/// Capability required from every destination adapter.
///
/// Cancellation is by dropping the returned future; implementations must not
/// detach work that outlives it.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        payload: &AlertPayload,
        destination: &Destination,
    ) -> std::result::Result<(), DeliveryError>;
}

/// A destination bound to its publisher.
#[derive(Clone)]
pub struct RegisteredDestination {
    pub destination: Arc<Destination>,
    pub publisher: Arc<dyn Publisher>,
}

/// Immutable set of destinations, loaded once per process.
#[derive(Clone, Default)]
pub struct DestinationRegistry {
    entries: HashMap<String, RegisteredDestination>,
}

impl DestinationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a destination. Names must be unique.
    pub fn register(
        &mut self,
        destination: Destination,
        publisher: Arc<dyn Publisher>,
    ) -> Result<()> {
        if destination.name.trim().is_empty() {
            return Err(Error::validation("destination name must not be empty"));
        }
        if self.entries.contains_key(&destination.name) {
            return Err(Error::validation(format!(
                "duplicate destination '{}'",
                destination.name
            )));
        }

        self.entries.insert(
            destination.name.clone(),
            RegisteredDestination {
                destination: Arc::new(destination),
                publisher,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredDestination> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
