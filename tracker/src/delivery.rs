//! HTTP delivery of tracked intervals to the CodeTrackr collector.
//!
//! Each flushed interval becomes a single `POST {api_base}/api/extension/track`
//! carrying an [`ActivityPayload`] and the user's API key in the `x-api-key`
//! header. Delivery is one-shot: retrying is the aggregator's business, which
//! folds failed intervals back into its buffer for the next flush.
//!
//! Failures are classified into [`DeliveryError`] variants so callers can
//! decide whether an interval is worth carrying forward.
//!
//! # Example
//!
//! ```no_run
//! use codetrackr::delivery::{Deliver, DeliveryClient, DeliveryConfig};
//! use codetrackr::credentials::ApiKey;
//! use codetrackr::session::{Activity, Session, SessionConfig};
//! use chrono::Utc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = DeliveryClient::new(DeliveryConfig::new(
//!         "https://codetrackr.example.com",
//!         Some(ApiKey::new("0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef")),
//!         None,
//!     ))
//!     .unwrap();
//!
//!     let mut session = Session::new(SessionConfig::default(), Utc::now());
//!     session.start(Utc::now());
//!     session.record_activity(Utc::now(), Activity::in_file("/work/app/src/main.rs"));
//!
//!     if let Some(interval) = session.flush_if_needed(Utc::now(), true) {
//!         let receipt = client.deliver(&interval).await.unwrap();
//!         println!("collector answered {}", receipt.status);
//!     }
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::credentials::ApiKey;
use crate::session::FlushInterval;
use crate::types::ActivityPayload;

/// Path of the tracking endpoint relative to the API base.
pub const TRACK_PATH: &str = "/api/extension/track";

/// Name of the header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// HTTP request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Why a delivery attempt failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// No API key is configured; nothing was sent.
    #[error("no API key configured")]
    MissingCredential,

    /// The collector rejected the API key (401). The interval is dropped.
    #[error("invalid API key")]
    Unauthorized,

    /// The collector rejected the payload (400). The interval is dropped.
    #[error("rejected by collector: {message}")]
    BadRequest { message: String },

    /// The collector could not be reached (connect failure or timeout).
    #[error("cannot reach collector: {message}")]
    Unreachable { message: String },

    /// Any other failure.
    #[error("delivery failed: {message}")]
    Unknown {
        status: Option<u16>,
        message: String,
    },
}

impl DeliveryError {
    /// Returns true if the interval should be folded back into the buffer
    /// and sent again with a later flush.
    ///
    /// Only transport and unclassified failures qualify. A rejected payload
    /// would be rejected again, and a missing or rejected key cannot change
    /// while the tracker runs.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Unknown { .. })
    }

    /// Short, stable label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::Unauthorized => "unauthorized",
            Self::BadRequest { .. } => "bad_request",
            Self::Unreachable { .. } => "unreachable",
            Self::Unknown { .. } => "unknown",
        }
    }
}

/// What the collector answered to a successful delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub status: u16,

    /// Parsed response body, if it was JSON.
    pub body: Option<serde_json::Value>,
}

/// Anything able to deliver a flushed interval.
///
/// The tracker is generic over this so that the HTTP client can be replaced
/// in tests.
pub trait Deliver: Send + Sync + 'static {
    /// Delivers one interval.
    fn deliver(
        &self,
        interval: &FlushInterval,
    ) -> impl Future<Output = Result<Receipt, DeliveryError>> + Send;
}

/// Configuration for the delivery client.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Collector base URL without trailing slash.
    pub api_base: String,

    /// API key; `None` makes every delivery fail with
    /// [`DeliveryError::MissingCredential`].
    pub api_key: Option<ApiKey>,

    /// Project name override for payloads.
    pub project_name: Option<String>,
}

impl DeliveryConfig {
    /// Creates a delivery configuration.
    #[must_use]
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<ApiKey>,
        project_name: Option<String>,
    ) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            project_name,
        }
    }
}

/// HTTP client for the tracking endpoint.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    config: DeliveryConfig,
    client: Client,
}

impl DeliveryClient {
    /// Creates a new delivery client.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built (for
    /// example when no TLS backend is available).
    pub fn new(config: DeliveryConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(Self { config, client })
    }

    /// Returns the client configuration.
    #[must_use]
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Builds the wire payload for an interval.
    #[must_use]
    pub fn payload(&self, interval: &FlushInterval) -> ActivityPayload {
        ActivityPayload::from_interval(interval, self.config.project_name.as_deref())
    }

    fn headers(&self, api_key: &ApiKey) -> Result<HeaderMap, DeliveryError> {
        let mut key = HeaderValue::from_str(api_key.expose()).map_err(|_| {
            warn!("API key contains characters not allowed in an HTTP header");
            DeliveryError::Unauthorized
        })?;
        key.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(API_KEY_HEADER, key);
        Ok(headers)
    }
}

impl Deliver for DeliveryClient {
    async fn deliver(&self, interval: &FlushInterval) -> Result<Receipt, DeliveryError> {
        let Some(api_key) = self.config.api_key.as_ref() else {
            warn!(interval_id = %interval.id, "No API key configured, skipping delivery");
            return Err(DeliveryError::MissingCredential);
        };

        let url = format!("{}{}", self.config.api_base, TRACK_PATH);
        let payload = self.payload(interval);
        let headers = self.headers(api_key)?;

        debug!(
            url = %url,
            interval_id = %interval.id,
            duration_secs = payload.duration,
            file = %payload.file_name,
            "Delivering interval"
        );

        let result = self
            .client
            .post(&url)
            .headers(headers)
            .json(&payload)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_timeout() || e.is_connect() => {
                warn!(error = %e, "Collector unreachable");
                return Err(DeliveryError::Unreachable {
                    message: e.to_string(),
                });
            }
            Err(e) => {
                warn!(error = %e, "Delivery request failed");
                return Err(DeliveryError::Unknown {
                    status: e.status().map(|s| s.as_u16()),
                    message: e.to_string(),
                });
            }
        };

        let status = response.status();
        if status.is_success() {
            let body = response
                .text()
                .await
                .ok()
                .and_then(|text| serde_json::from_str(&text).ok());
            info!(
                interval_id = %interval.id,
                duration_secs = payload.duration,
                lines_added = payload.lines_added,
                lines_removed = payload.lines_removed,
                "Activity tracked"
            );
            return Ok(Receipt {
                status: status.as_u16(),
                body,
            });
        }

        let message = error_message(status, response).await;
        warn!(status = status.as_u16(), message = %message, "Collector rejected delivery");

        Err(match status {
            StatusCode::UNAUTHORIZED => DeliveryError::Unauthorized,
            StatusCode::BAD_REQUEST => DeliveryError::BadRequest { message },
            _ => DeliveryError::Unknown {
                status: Some(status.as_u16()),
                message,
            },
        })
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Extracts a human-readable message from an error response.
///
/// Prefers the JSON `message` field, then the raw body, then the status
/// reason phrase.
async fn error_message(status: StatusCode, response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();

    if let Ok(body) = serde_json::from_str::<ErrorBody>(&text) {
        return body.message;
    }

    let text = text.trim();
    if !text.is_empty() {
        return text.to_string();
    }

    status
        .canonical_reason()
        .unwrap_or("unexpected status")
        .to_string()
}
