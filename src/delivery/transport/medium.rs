//! In-process delivery to channel and webhook media
//!
//! Posts directly to the platform over HTTP. A destination is only handled
//! when its guild falls on one of the shards assigned to this process.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{error_from_response, target_url, OutboundJob, Transport, TransportError, TransportResult};
use crate::models::Destination;

// ============================================================================
// Shard assignment
// ============================================================================

/// Shards this process is responsible for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    /// Owned shard ids, empty means every shard
    pub shard_ids: Vec<u32>,
    pub shard_count: u32,
}

impl ShardAssignment {
    pub fn new(shard_ids: Vec<u32>, shard_count: u32) -> Self {
        Self {
            shard_ids,
            shard_count,
        }
    }

    /// Shard of a guild: `(guild_id >> 22) % shard_count`
    pub fn shard_of(&self, guild_id: &str) -> Option<u32> {
        if self.shard_count == 0 {
            return Some(0);
        }
        let id: u64 = guild_id.parse().ok()?;
        Some(((id >> 22) % u64::from(self.shard_count)) as u32)
    }

    /// Whether a guild belongs to this process
    pub fn owns_guild(&self, guild_id: &str) -> bool {
        if self.shard_ids.is_empty() || self.shard_count <= 1 {
            return true;
        }
        self.shard_of(guild_id)
            .is_some_and(|shard| self.shard_ids.contains(&shard))
    }

    /// Shard used to scope seen-sets
    pub fn primary_shard(&self) -> u32 {
        self.shard_ids.iter().copied().min().unwrap_or(0)
    }
}

// ============================================================================
// Medium transport
// ============================================================================

#[derive(Debug, Serialize)]
struct MessageBody<'a> {
    content: &'a str,
}

/// Direct platform transport
pub struct MediumTransport {
    client: Client,
    api_base: String,
    token: Option<String>,
    shards: ShardAssignment,
}

impl MediumTransport {
    /// Create a medium transport
    pub fn new(
        api_base: impl Into<String>,
        token: Option<String>,
        shards: ShardAssignment,
        timeout: Duration,
    ) -> TransportResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::InvalidConfig(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: api_base.into(),
            token,
            shards,
        })
    }

    async fn post(&self, destination: &Destination, content: &str) -> TransportResult<()> {
        let url = target_url(&self.api_base, destination);
        let mut request = self.client.post(&url).json(&MessageBody { content });

        // Webhook URLs carry their own credentials
        if destination.webhook_url.is_none() {
            if let Some(token) = &self.token {
                request = request.header(reqwest::header::AUTHORIZATION, format!("Bot {token}"));
            }
        }

        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(error_from_response(response).await)
    }
}

#[async_trait]
impl Transport for MediumTransport {
    fn name(&self) -> &str {
        "medium"
    }

    async fn send(&self, job: &OutboundJob) -> TransportResult<()> {
        for chunk in &job.chunks {
            self.post(&job.destination, chunk).await?;
        }
        tracing::debug!(
            destination = %job.destination.channel,
            item_id = %job.metadata.item_id,
            webhook = job.destination.webhook_url.is_some(),
            "Delivered"
        );
        Ok(())
    }

    async fn send_notice(&self, destination: &Destination, text: &str) -> TransportResult<()> {
        let plain = Destination {
            webhook_url: None,
            ..destination.clone()
        };
        self.post(&plain, text).await
    }

    fn owns(&self, destination: &Destination) -> bool {
        self.shards.owns_guild(&destination.guild_id)
    }
}
