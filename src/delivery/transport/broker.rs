//! Request broker transport
//!
//! Horizontally scaled deployments do not talk to the platform directly.
//! Each chunk becomes one job on an external request broker, which owns the
//! platform-wide rate limits and retries.
//!
//! # Request Format
//!
//! ```json
//! {
//!   "url": "https://api.example.com/v10/channels/123/messages",
//!   "options": { "method": "POST", "body": { "content": "..." } },
//!   "meta": {
//!     "item_id": "...",
//!     "source_url": "...",
//!     "destination_channel": "123",
//!     "subscription_id": "...",
//!     "guild_id": "..."
//!   }
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::{
    error_from_response, target_url, JobMetadata, OutboundJob, Transport, TransportError,
    TransportResult,
};
use crate::models::Destination;

#[derive(Debug, Serialize)]
struct RequestOptions<'a> {
    method: &'static str,
    body: MessageBody<'a>,
}

#[derive(Debug, Serialize)]
struct MessageBody<'a> {
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct BrokerRequest<'a> {
    url: String,
    options: RequestOptions<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<&'a JobMetadata>,
}

/// Enqueues outbound requests on an external broker
pub struct BrokerTransport {
    client: Client,
    enqueue_url: String,
    api_base: String,
}

impl BrokerTransport {
    /// Create a broker transport
    pub fn new(
        broker_url: impl Into<String>,
        api_base: impl Into<String>,
        timeout: Duration,
    ) -> TransportResult<Self> {
        let broker_url = broker_url.into();
        if !broker_url.starts_with("http://") && !broker_url.starts_with("https://") {
            return Err(TransportError::InvalidConfig(
                "Broker URL must start with http:// or https://".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::InvalidConfig(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            enqueue_url: format!("{}/enqueue", broker_url.trim_end_matches('/')),
            api_base: api_base.into(),
        })
    }

    async fn enqueue(&self, request: &BrokerRequest<'_>) -> TransportResult<()> {
        let response = self
            .client
            .post(&self.enqueue_url)
            .json(request)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(error_from_response(response).await)
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    fn name(&self) -> &str {
        "broker"
    }

    async fn send(&self, job: &OutboundJob) -> TransportResult<()> {
        let url = target_url(&self.api_base, &job.destination);
        for chunk in &job.chunks {
            let request = BrokerRequest {
                url: url.clone(),
                options: RequestOptions {
                    method: "POST",
                    body: MessageBody { content: chunk },
                },
                meta: Some(&job.metadata),
            };
            self.enqueue(&request).await?;
        }
        tracing::debug!(
            destination = %job.destination.channel,
            item_id = %job.metadata.item_id,
            chunks = job.chunks.len(),
            "Enqueued on broker"
        );
        Ok(())
    }

    async fn send_notice(&self, destination: &Destination, text: &str) -> TransportResult<()> {
        let request = BrokerRequest {
            url: super::channel_messages_url(&self.api_base, &destination.channel),
            options: RequestOptions {
                method: "POST",
                body: MessageBody { content: text },
            },
            meta: None,
        };
        self.enqueue(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_http_broker() {
        let result = BrokerTransport::new("broker:9000", "https://api", Duration::from_secs(5));
        assert!(matches!(result, Err(TransportError::InvalidConfig(_))));
    }

    #[test]
    fn test_request_serialization() {
        let meta = JobMetadata {
            item_id: "i1".to_string(),
            source_url: "https://x/feed".to_string(),
            destination_channel: "c1".to_string(),
            subscription_id: "s1".to_string(),
            guild_id: "g1".to_string(),
        };
        let request = BrokerRequest {
            url: "https://api/channels/c1/messages".to_string(),
            options: RequestOptions {
                method: "POST",
                body: MessageBody { content: "hello" },
            },
            meta: Some(&meta),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["options"]["method"], "POST");
        assert_eq!(json["options"]["body"]["content"], "hello");
        assert_eq!(json["meta"]["subscription_id"], "s1");
    }
}
