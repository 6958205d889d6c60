//! HTTP access to the Steam store API: a thin transport seam plus a
//! retrying client that owns pacing and backoff.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::{FetchSettings, Pacing, RetryPolicy};

/// Failure of a single HTTP attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http status {status}")]
    Status {
        status: StatusCode,
        retry_after: Option<Duration>,
    },
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Status { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS)
    }

    /// Malformed bodies are not worth retrying; everything else is.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Decode(_))
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// A request that still failed after the retry budget (or could not be decoded).
#[derive(Debug, Error)]
#[error("{label}: failed after {attempts} attempt(s): {cause}")]
pub struct FetchError {
    pub label: String,
    pub attempts: u32,
    #[source]
    pub cause: TransportError,
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        self.cause.is_rate_limited()
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self.cause, TransportError::Decode(_))
    }
}

/// Performs one GET and decodes the JSON body. No retries, no sleeping.
#[async_trait]
pub trait StoreTransport: Send + Sync {
    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value, TransportError>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("steam-region-prices/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to construct Steam HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StoreTransport for ReqwestTransport {
    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value, TransportError> {
        let mut req = self.client.get(url).header(ACCEPT, "application/json");
        if !query.is_empty() {
            req = req.query(query);
        }
        let resp = req.send().await.map_err(classify_reqwest_error)?;
        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(TransportError::Status {
                status,
                retry_after,
            });
        }
        let text = resp.text().await.map_err(classify_reqwest_error)?;
        serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(err.to_string())
    }
}

/// One logical store request; `label` is used only for logs and errors.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub url: String,
    pub query: Vec<(&'static str, String)>,
    pub label: String,
}

impl StoreRequest {
    /// appdetails filtered to `price_overview` for one country.
    pub fn price_overview(store_api: &str, app_id: u64, country: &str, language: &str) -> Self {
        Self {
            url: store_api.to_string(),
            query: vec![
                ("appids", app_id.to_string()),
                ("cc", country.to_string()),
                ("l", language.to_string()),
                ("filters", "price_overview".to_string()),
            ],
            label: format!("app {app_id} in region {country}"),
        }
    }

    /// Unfiltered appdetails, used to classify an app.
    pub fn app_details(store_api: &str, app_id: u64, country: &str, language: &str) -> Self {
        Self {
            url: store_api.to_string(),
            query: vec![
                ("appids", app_id.to_string()),
                ("cc", country.to_string()),
                ("l", language.to_string()),
            ],
            label: format!("details for app {app_id}"),
        }
    }

    pub fn app_list(app_list_api: &str) -> Self {
        Self {
            url: app_list_api.to_string(),
            query: Vec::new(),
            label: "app list".to_string(),
        }
    }
}

/// Issues store requests with pre-request pacing and bounded retry/backoff.
///
/// 429 responses back off exponentially (honoring `Retry-After` when it asks
/// for longer); other transient failures back off linearly.
#[derive(Clone)]
pub struct RetryingClient {
    transport: Arc<dyn StoreTransport>,
    policy: RetryPolicy,
    pacing: Pacing,
}

impl RetryingClient {
    pub fn new(transport: Arc<dyn StoreTransport>, policy: RetryPolicy, pacing: Pacing) -> Self {
        Self {
            transport,
            policy,
            pacing,
        }
    }

    /// Client for price requests, paced by `request_pacing`.
    pub fn for_prices(transport: Arc<dyn StoreTransport>, settings: &FetchSettings) -> Self {
        Self::new(transport, settings.retry, settings.request_pacing)
    }

    /// Client for detail lookups, paced by `detail_pacing`.
    pub fn for_details(transport: Arc<dyn StoreTransport>, settings: &FetchSettings) -> Self {
        Self::new(transport, settings.retry, settings.detail_pacing)
    }

    /// Jittered wait before retry number `attempt` after `cause`.
    pub fn retry_delay(&self, cause: &TransportError, attempt: u32) -> Duration {
        if cause.is_rate_limited() {
            let computed = self.policy.jitter(self.policy.rate_limit_delay(attempt));
            match cause.retry_after() {
                Some(server) if server > computed => server.min(self.policy.retry_after_cap()),
                _ => computed,
            }
        } else {
            self.policy.jitter(self.policy.transient_delay(attempt))
        }
    }

    pub async fn fetch(&self, req: &StoreRequest) -> Result<Value, FetchError> {
        let query: Vec<(&str, &str)> = req.query.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let paced = self.pacing.pause().await;
            debug!(
                request = %req.label,
                attempt,
                paced_ms = paced.as_millis() as u64,
                "steam: sending request"
            );
            let cause = match self.transport.get_json(&req.url, &query).await {
                Ok(body) => return Ok(body),
                Err(cause) => cause,
            };
            if !cause.is_retryable() {
                debug!(request = %req.label, error = %cause, "steam: undecodable response");
                return Err(FetchError {
                    label: req.label.clone(),
                    attempts: attempt,
                    cause,
                });
            }
            if attempt >= max_attempts {
                error!(
                    request = %req.label,
                    attempts = attempt,
                    error = %cause,
                    "steam: giving up after retries"
                );
                return Err(FetchError {
                    label: req.label.clone(),
                    attempts: attempt,
                    cause,
                });
            }
            let delay = self.retry_delay(&cause, attempt);
            if cause.is_rate_limited() {
                warn!(
                    request = %req.label,
                    attempt,
                    max_attempts,
                    delay_secs = delay.as_secs_f64(),
                    "steam: rate limited (429); backing off"
                );
            } else {
                warn!(
                    request = %req.label,
                    attempt,
                    max_attempts,
                    delay_secs = delay.as_secs_f64(),
                    error = %cause,
                    "steam: request failed; retrying"
                );
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}
