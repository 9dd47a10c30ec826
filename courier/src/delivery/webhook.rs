//! Generic HTTP destination adapter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use super::classifier::DeliveryError;
use super::destination::{Destination, Publisher};
use super::job::AlertPayload;

/// Upper bound on how much of an error body is kept.
const MAX_ERROR_BODY: usize = 512;

/// Publishes alerts as JSON over HTTP.
pub struct WebhookPublisher {
    client: Client,
}

impl WebhookPublisher {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(concat!("courier/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    fn build_headers(destination: &Destination) -> Result<HeaderMap, DeliveryError> {
        let mut headers = HeaderMap::new();

        for (name, value) in &destination.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                value.parse::<HeaderValue>(),
            ) {
                headers.insert(name, value);
            } else {
                warn!(destination = %destination.name, header = %name, "Skipping invalid header");
            }
        }

        if let Some(var) = &destination.credentials_env {
            let token = destination.resolve_credential().ok_or_else(|| {
                DeliveryError::Unauthorized(format!("credential variable {var} is not set"))
            })?;
            let value = format!("Bearer {token}")
                .parse::<HeaderValue>()
                .map_err(|_| DeliveryError::Unauthorized("credential is not a valid header".into()))?;
            headers.insert(AUTHORIZATION, value);
        }

        Ok(headers)
    }

    fn map_transport_error(error: reqwest::Error, timeout: Duration) -> DeliveryError {
        if error.is_timeout() {
            DeliveryError::Timeout(timeout)
        } else if error.is_connect() || error.is_request() {
            DeliveryError::Connection(error.to_string())
        } else if error.is_builder() {
            DeliveryError::InvalidPayload(error.to_string())
        } else {
            DeliveryError::Other(error.to_string())
        }
    }
}

impl Default for WebhookPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a `Retry-After` header given in seconds.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Map a non-success response to a delivery error.
pub(crate) fn status_error(status: StatusCode, headers: &HeaderMap, body: String) -> DeliveryError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => DeliveryError::RateLimited {
            retry_after: parse_retry_after(headers),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DeliveryError::Unauthorized(format!("HTTP {}", status.as_u16()))
        }
        _ => {
            let mut body = body;
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            DeliveryError::Http {
                status: status.as_u16(),
                body,
            }
        }
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(
        &self,
        payload: &AlertPayload,
        destination: &Destination,
    ) -> Result<(), DeliveryError> {
        let headers = Self::build_headers(destination)?;
        let timeout = destination.timeout();

        let request = match destination.method.to_uppercase().as_str() {
            "PUT" => self.client.put(&destination.endpoint),
            _ => self.client.post(&destination.endpoint),
        };

        let response = request
            .headers(headers)
            .timeout(timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| Self::map_transport_error(e, timeout))?;

        let status = response.status();
        if status.is_success() {
            debug!(destination = %destination.name, status = status.as_u16(), "Webhook delivered");
            return Ok(());
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &headers, body))
    }
}
