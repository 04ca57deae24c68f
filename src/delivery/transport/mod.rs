//! Outbound transports
//!
//! A transport moves rendered chunks to a destination. Two production
//! implementations exist: the [`BrokerTransport`] hands each chunk to an
//! external request broker, the [`MediumTransport`] posts directly to the
//! platform. [`RecordingTransport`] keeps everything in memory for dry runs
//! and tests.

pub mod broker;
pub mod medium;
pub mod recording;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Destination;

pub use broker::BrokerTransport;
pub use medium::{MediumTransport, ShardAssignment};
pub use recording::RecordingTransport;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur while sending
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The platform or broker asked us to slow down
    #[error("Rate limited{}", retry_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// The platform rejected the payload as malformed
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Unexpected response status
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Request never produced a response
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Invalid transport configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TransportError {
    /// Check if a later attempt may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Http(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::InvalidPayload(_) | Self::InvalidConfig(_) => false,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

fn retry_suffix(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {}ms)", d.as_millis()))
        .unwrap_or_default()
}

/// Correlation metadata attached to every outbound job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub item_id: String,
    pub source_url: String,
    pub destination_channel: String,
    pub subscription_id: String,
    pub guild_id: String,
}

/// One rendered item on its way to one destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundJob {
    pub destination: Destination,
    /// Message bodies, each within the platform size limit
    pub chunks: Vec<String>,
    pub metadata: JobMetadata,
}

/// Moves rendered payloads to destinations
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get the transport name
    fn name(&self) -> &str;

    /// Deliver every chunk of `job` in order
    async fn send(&self, job: &OutboundJob) -> TransportResult<()>;

    /// Best-effort plain-text notice (outage alerts, rejected payloads)
    async fn send_notice(&self, destination: &Destination, text: &str) -> TransportResult<()>;

    /// Whether this process is responsible for `destination`
    fn owns(&self, _destination: &Destination) -> bool {
        true
    }
}

/// Platform endpoint that creates a message in `channel`
pub(crate) fn channel_messages_url(api_base: &str, channel: &str) -> String {
    format!("{}/channels/{}/messages", api_base.trim_end_matches('/'), channel)
}

/// Target URL for a destination: its webhook if set, else the channel endpoint
pub(crate) fn target_url(api_base: &str, destination: &Destination) -> String {
    match &destination.webhook_url {
        Some(url) => url.clone(),
        None => channel_messages_url(api_base, &destination.channel),
    }
}

/// Map a non-success platform response to an error
pub(crate) async fn error_from_response(response: reqwest::Response) -> TransportError {
    let status = response.status().as_u16();
    let header_retry = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok());
    let body = response.text().await.unwrap_or_default();

    match status {
        429 => {
            let body_retry = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("retry_after").and_then(|r| r.as_f64()));
            let retry_after = body_retry
                .or(header_retry)
                .filter(|s| s.is_finite() && *s >= 0.0)
                .map(Duration::from_secs_f64);
            TransportError::RateLimited { retry_after }
        }
        400 => TransportError::InvalidPayload(body),
        _ => TransportError::Status { status, body },
    }
}
