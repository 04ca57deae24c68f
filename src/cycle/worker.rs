//! Batch worker and its message protocol
//!
//! A worker receives one [`WorkerJob`], fetches every URL of the batch and
//! reports back over a bounded channel. It shares no mutable state with the
//! orchestrator: cached validators arrive in the job and updated ones leave
//! as [`WorkerStatus::Headers`] messages.
//!
//! Per URL the worker sends zero or more `Headers` / `PendingArticle`
//! messages followed by exactly one terminal `Success` or `Failed`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::batching::{Batch, UrlSubscriptions};
use crate::fetch::{CachedHeaders, FeedFetcher, FetchOutcome};
use crate::identity::{DetectOptions, ItemTracker};
use crate::models::{NewArticle, Subscription};
use crate::storage::{SeenKey, SharedStore};
use crate::utils::host_of;

/// Subscriptions and URLs that get verbose tracing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugTargets {
    #[serde(default)]
    pub subscription_ids: HashSet<String>,
    #[serde(default)]
    pub urls: HashSet<String>,
}

impl DebugTargets {
    pub fn is_empty(&self) -> bool {
        self.subscription_ids.is_empty() && self.urls.is_empty()
    }

    /// Whether `url` or one of its subscriptions is traced
    pub fn matches(&self, url: &str, subscriptions: &UrlSubscriptions) -> bool {
        self.urls.contains(url)
            || subscriptions
                .keys()
                .any(|id| self.subscription_ids.contains(id))
    }
}

/// Settings copied into every job
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Shard the seen-sets are scoped to
    pub shard: u32,
    pub detect: DetectOptions,
    /// URLs fetched concurrently inside one batch
    pub url_concurrency: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            shard: 0,
            detect: DetectOptions::default(),
            url_concurrency: 10,
        }
    }
}

/// Orchestrator to worker
#[derive(Debug, Clone)]
pub struct WorkerJob {
    pub settings: WorkerSettings,
    pub batch: Batch,
    pub debug: DebugTargets,
    pub cached_headers: HashMap<String, CachedHeaders>,
    pub run: u64,
    pub schedule: String,
    pub group: usize,
    pub batch_index: usize,
}

/// Payload of a worker message
#[derive(Debug, Clone)]
pub enum WorkerStatus {
    /// New conditional-fetch validators for the URL
    Headers(CachedHeaders),
    /// A new item awaiting fan-out
    PendingArticle(Box<NewArticle>),
    /// The URL was processed
    Success,
    /// The URL failed with a reason
    Failed(String),
}

impl WorkerStatus {
    /// Whether this message completes its URL
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Headers(_) => "headers",
            Self::PendingArticle(_) => "pendingArticle",
            Self::Success => "success",
            Self::Failed(_) => "failed",
        }
    }
}

/// Worker to orchestrator
#[derive(Debug, Clone)]
pub struct WorkerMessage {
    pub url: String,
    pub status: WorkerStatus,
}

impl WorkerMessage {
    fn new(url: &str, status: WorkerStatus) -> Self {
        Self {
            url: url.to_string(),
            status,
        }
    }
}

/// Fetches a batch and reports per URL
#[derive(Clone)]
pub struct Worker {
    fetcher: Arc<dyn FeedFetcher>,
    store: SharedStore,
}

impl Worker {
    pub fn new(fetcher: Arc<dyn FeedFetcher>, store: SharedStore) -> Self {
        Self { fetcher, store }
    }

    /// Run `job` on a fresh task
    pub fn spawn(&self, job: WorkerJob, tx: mpsc::Sender<WorkerMessage>) -> JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move { worker.run(job, tx).await })
    }

    /// Process every URL of the batch
    pub async fn run(&self, job: WorkerJob, tx: mpsc::Sender<WorkerMessage>) {
        let tracker = ItemTracker::new(self.store.clone(), job.settings.detect.clone());
        let concurrency = job.settings.url_concurrency.max(1);

        tracing::debug!(
            schedule = %job.schedule,
            run = job.run,
            group = job.group,
            batch = job.batch_index,
            urls = job.batch.len(),
            "Worker started"
        );

        stream::iter(job.batch.iter())
            .for_each_concurrent(concurrency, |(url, subscriptions)| {
                let tracker = &tracker;
                let tx = tx.clone();
                let job = &job;
                async move {
                    self.process_url(job, tracker, url, subscriptions, &tx).await;
                }
            })
            .await;

        tracing::debug!(
            schedule = %job.schedule,
            run = job.run,
            group = job.group,
            batch = job.batch_index,
            "Worker finished"
        );
    }

    async fn process_url(
        &self,
        job: &WorkerJob,
        tracker: &ItemTracker,
        url: &str,
        subscriptions: &UrlSubscriptions,
        tx: &mpsc::Sender<WorkerMessage>,
    ) {
        let traced = job.debug.matches(url, subscriptions);
        if traced {
            tracing::info!(
                schedule = %job.schedule,
                run = job.run,
                url,
                host = host_of(url).unwrap_or_default(),
                subscriptions = subscriptions.len(),
                "Debug target: fetching"
            );
        }

        let outcome = self
            .fetcher
            .fetch(url, job.cached_headers.get(url))
            .await;

        let (items, headers) = match outcome {
            Ok(FetchOutcome::NotModified) => {
                if traced {
                    tracing::info!(url, "Debug target: not modified");
                }
                let _ = tx.send(WorkerMessage::new(url, WorkerStatus::Success)).await;
                return;
            }
            Ok(FetchOutcome::Fetched { items, headers }) => (items, headers),
            Err(e) => {
                if traced {
                    tracing::info!(url, error = %e, "Debug target: fetch failed");
                }
                let _ = tx
                    .send(WorkerMessage::new(url, WorkerStatus::Failed(e.to_string())))
                    .await;
                return;
            }
        };

        let subs: Vec<Subscription> = subscriptions.values().cloned().collect();
        let key = SeenKey::new(url, job.schedule.as_str(), job.settings.shard);
        let detection = match tracker.detect(&key, items, &subs).await {
            Ok(detection) => detection,
            Err(e) => {
                tracing::error!(url, schedule = %job.schedule, error = %e, "Seen-set lookup failed");
                let _ = tx
                    .send(WorkerMessage::new(
                        url,
                        WorkerStatus::Failed(format!("Storage error: {e}")),
                    ))
                    .await;
                return;
            }
        };

        if traced {
            tracing::info!(
                url,
                scheme = %detection.scheme,
                new_articles = detection.articles.len(),
                seeded = detection.seeded,
                "Debug target: items resolved"
            );
        }

        for article in detection.articles {
            let message = WorkerMessage::new(url, WorkerStatus::PendingArticle(Box::new(article)));
            if tx.send(message).await.is_err() {
                return;
            }
        }

        // Validators are only cached once the items behind them were recorded
        if !headers.is_empty()
            && tx
                .send(WorkerMessage::new(url, WorkerStatus::Headers(headers)))
                .await
                .is_err()
        {
            return;
        }
        let _ = tx.send(WorkerMessage::new(url, WorkerStatus::Success)).await;
    }
}
