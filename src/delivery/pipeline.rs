//! Fan-out of new items to every subscription of their source URL
//!
//! For each `(item, subscription)` pair the pipeline renders the payload,
//! records filter blocks, and hands passing payloads to the transport. In
//! brokered mode an idle destination with budget left is sent to directly;
//! everything else goes through the destination's ordered queue.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::audit::AuditRecorder;
use super::queue::{handle_send_error, DestinationQueues};
use super::ratelimit::DestinationLimiter;
use super::render::ArticleRenderer;
use super::transport::{JobMetadata, OutboundJob, Transport, TransportError};
use super::DeliveryError;
use crate::metrics;
use crate::models::{NewArticle, Subscription};
use crate::storage::SharedStore;

// ============================================================================
// Mode and outcomes
// ============================================================================

/// How outbound payloads leave this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Hand jobs to an external request broker
    Brokered,
    /// Post to the platform directly, for owned destinations only
    #[default]
    InProcess,
    /// Record jobs in memory without sending
    DryRun,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Brokered => "brokered",
            Self::InProcess => "in_process",
            Self::DryRun => "dry_run",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "brokered" | "broker" => Ok(Self::Brokered),
            "in_process" | "inprocess" => Ok(Self::InProcess),
            "dry_run" | "dryrun" => Ok(Self::DryRun),
            other => Err(format!("unknown delivery mode: {other}")),
        }
    }
}

/// What happened to one `(item, subscription)` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handed to the transport immediately
    Sent,
    /// Waiting in the destination's queue
    Queued,
    /// Filters rejected the item
    Blocked,
    /// Another process owns the destination
    NotOwned,
    /// Rendering or sending failed; an audit row was written
    Failed(String),
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Queued => "queued",
            Self::Blocked => "blocked",
            Self::NotOwned => "not_owned",
            Self::Failed(_) => "failed",
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Pipeline counters (thread-safe)
#[derive(Debug, Default)]
pub struct DeliveryStats {
    pub attempts: AtomicU64,
    pub sent: AtomicU64,
    pub queued: AtomicU64,
    pub blocked: AtomicU64,
    pub not_owned: AtomicU64,
    pub failed: AtomicU64,
}

impl DeliveryStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, outcome: &DeliveryOutcome) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            DeliveryOutcome::Sent => &self.sent,
            DeliveryOutcome::Queued => &self.queued,
            DeliveryOutcome::Blocked => &self.blocked,
            DeliveryOutcome::NotOwned => &self.not_owned,
            DeliveryOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            not_owned: self.not_owned.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStatsSnapshot {
    pub attempts: u64,
    pub sent: u64,
    pub queued: u64,
    pub blocked: u64,
    pub not_owned: u64,
    pub failed: u64,
}

// ============================================================================
// Pipeline
// ============================================================================

/// Renders, filters and routes new items
pub struct DeliveryPipeline {
    mode: DeliveryMode,
    renderer: Arc<dyn ArticleRenderer>,
    transport: Arc<dyn Transport>,
    limiter: Arc<DestinationLimiter>,
    queues: DestinationQueues,
    audit: AuditRecorder,
    stats: Arc<DeliveryStats>,
}

impl DeliveryPipeline {
    pub fn new(
        mode: DeliveryMode,
        renderer: Arc<dyn ArticleRenderer>,
        transport: Arc<dyn Transport>,
        limiter: Arc<DestinationLimiter>,
        store: SharedStore,
    ) -> Self {
        let audit = AuditRecorder::new(store);
        let queues = DestinationQueues::new(Arc::clone(&limiter), Arc::clone(&transport), audit.clone());
        Self {
            mode,
            renderer,
            transport,
            limiter,
            queues,
            audit,
            stats: DeliveryStats::new(),
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.stats.snapshot()
    }

    /// Jobs waiting in destination queues
    pub fn pending(&self) -> usize {
        self.queues.total_pending()
    }

    /// Fan `article` out to each of its subscriptions, in order
    pub async fn deliver(&self, article: &NewArticle) -> Vec<DeliveryOutcome> {
        let mut outcomes = Vec::with_capacity(article.subscriptions.len());
        for subscription in &article.subscriptions {
            outcomes.push(self.deliver_one(article, subscription).await);
        }
        outcomes
    }

    /// Deliver one item to one subscription; never fails
    pub async fn deliver_one(&self, article: &NewArticle, subscription: &Subscription) -> DeliveryOutcome {
        let outcome = match self.prepare(article, subscription).await {
            Ok(Some(job)) => self.route(job).await,
            Ok(None) => DeliveryOutcome::Blocked,
            Err(outcome) => outcome,
        };
        self.finish(article, subscription, outcome)
    }

    /// Deliver one item synchronously through the transport
    ///
    /// Unlike [`deliver_one`](Self::deliver_one), rate limits are returned to
    /// the caller instead of queueing the job, so the caller can retry.
    pub async fn deliver_sync(
        &self,
        article: &NewArticle,
        subscription: &Subscription,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let job = match self.prepare(article, subscription).await {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(self.finish(article, subscription, DeliveryOutcome::Blocked)),
            Err(outcome) => return Ok(self.finish(article, subscription, outcome)),
        };

        if self.mode != DeliveryMode::Brokered && !self.transport.owns(&job.destination) {
            return Ok(self.finish(article, subscription, DeliveryOutcome::NotOwned));
        }

        // Queued jobs for this destination go first
        if self.queues.pending(&job.destination.channel) > 0
            || self.limiter.check(&job.destination).is_err()
        {
            return Err(TransportError::RateLimited { retry_after: None }.into());
        }

        let outcome = match self.transport.send(&job).await {
            Ok(()) => DeliveryOutcome::Sent,
            Err(e) if e.is_rate_limit() => return Err(e.into()),
            Err(e) => {
                handle_send_error(&self.transport, &self.audit, &job, &e).await;
                DeliveryOutcome::Failed(e.to_string())
            }
        };
        Ok(self.finish(article, subscription, outcome))
    }

    /// Consume new articles until the sender side closes
    pub fn spawn_dispatcher(self: &Arc<Self>, mut rx: mpsc::Receiver<NewArticle>) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(article) = rx.recv().await {
                pipeline.deliver(&article).await;
            }
            tracing::debug!("Delivery dispatcher stopped");
        })
    }

    /// Wait for every queued job to be handled
    pub async fn drain(&self) {
        self.queues.drain().await;
    }

    /// Drop queued jobs on shutdown
    pub fn abort(&self) {
        self.queues.abort();
    }

    /// Forget rate limit state of idle destinations
    pub fn housekeeping(&self) {
        self.limiter.retain_recent();
    }

    /// Render and filter; `Ok(None)` means blocked by filters
    async fn prepare(
        &self,
        article: &NewArticle,
        subscription: &Subscription,
    ) -> Result<Option<OutboundJob>, DeliveryOutcome> {
        let metadata = JobMetadata {
            item_id: article.item.id.clone(),
            source_url: article.source_url.clone(),
            destination_channel: subscription.channel.clone(),
            subscription_id: subscription.id.clone(),
            guild_id: subscription.guild_id.clone(),
        };

        let rendered = match self.renderer.render(&article.item, subscription) {
            Ok(rendered) => rendered,
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(
                    subscription_id = %subscription.id,
                    item_id = %article.item.id,
                    error = %reason,
                    "Failed to render article"
                );
                self.audit.record_failure(&metadata, &reason).await;
                return Err(DeliveryOutcome::Failed(reason));
            }
        };

        if !rendered.passed {
            self.audit
                .record_filter_block(&article.source_url, &article.item, subscription)
                .await;
            return Ok(None);
        }

        if rendered.chunks.is_empty() {
            let reason = "Rendered payload is empty".to_string();
            self.audit.record_failure(&metadata, &reason).await;
            return Err(DeliveryOutcome::Failed(reason));
        }

        Ok(Some(OutboundJob {
            destination: subscription.destination(),
            chunks: rendered.chunks,
            metadata,
        }))
    }

    async fn route(&self, job: OutboundJob) -> DeliveryOutcome {
        match self.mode {
            DeliveryMode::Brokered => self.route_brokered(job).await,
            DeliveryMode::InProcess | DeliveryMode::DryRun => {
                if !self.transport.owns(&job.destination) {
                    return DeliveryOutcome::NotOwned;
                }
                self.enqueue(job)
            }
        }
    }

    async fn route_brokered(&self, job: OutboundJob) -> DeliveryOutcome {
        // A direct send may not overtake jobs already queued for the destination
        let idle = self.queues.pending(&job.destination.channel) == 0;
        if !idle || self.limiter.check(&job.destination).is_err() {
            return self.enqueue(job);
        }

        match self.transport.send(&job).await {
            Ok(()) => DeliveryOutcome::Sent,
            Err(e) if e.is_rate_limit() => {
                tracing::debug!(
                    destination = %job.destination.channel,
                    "Broker rate limited, queueing job"
                );
                self.enqueue(job)
            }
            Err(e) => {
                handle_send_error(&self.transport, &self.audit, &job, &e).await;
                DeliveryOutcome::Failed(e.to_string())
            }
        }
    }

    fn enqueue(&self, job: OutboundJob) -> DeliveryOutcome {
        let metadata = job.metadata.clone();
        match self.queues.enqueue(job) {
            Ok(()) => DeliveryOutcome::Queued,
            Err(e) => {
                tracing::error!(
                    destination = %metadata.destination_channel,
                    item_id = %metadata.item_id,
                    error = %e,
                    "Failed to enqueue job"
                );
                DeliveryOutcome::Failed(e.to_string())
            }
        }
    }

    fn finish(
        &self,
        article: &NewArticle,
        subscription: &Subscription,
        outcome: DeliveryOutcome,
    ) -> DeliveryOutcome {
        self.stats.record(&outcome);
        // Queued jobs are counted by their queue once they leave it
        if outcome != DeliveryOutcome::Queued {
            metrics::record_delivery(outcome.as_str());
        }
        tracing::debug!(
            schedule = %article.schedule,
            url = %article.source_url,
            item_id = %article.item.id,
            subscription_id = %subscription.id,
            destination = %subscription.channel,
            outcome = outcome.as_str(),
            "Delivery attempt"
        );
        outcome
    }
}
