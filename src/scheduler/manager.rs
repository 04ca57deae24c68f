//! Owner of every schedule trigger
//!
//! Builds one [`CycleOrchestrator`] and one [`ScheduleTrigger`] per validated
//! schedule, starts and stops them together, and serves manual refreshes of
//! single URLs outside the cycles.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::error::{SchedulerError, SchedulerResult};
use super::resolver::resolve;
use super::schedule::ScheduleSet;
use super::trigger::{ScheduleTrigger, TriggerEvent};
use crate::cycle::{CycleOrchestrator, CycleReport, CycleSettings, WorkerSettings};
use crate::error::{Error, Result};
use crate::failure::FailureTracker;
use crate::fetch::{FeedFetcher, FetchOutcome};
use crate::identity::ItemTracker;
use crate::models::{NewArticle, Subscription};
use crate::storage::{SeenKey, SharedStore};

const EVENT_CAPACITY: usize = 256;

/// Outcome of a manual refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub url: String,
    /// Schedules whose seen-sets were consulted
    pub schedules: Vec<String>,
    pub new_articles: usize,
    /// Whether a fail record was cleared
    pub reset: bool,
}

/// Runs all schedules of the process
pub struct ScheduleManager {
    schedules: Arc<ScheduleSet>,
    triggers: Vec<Arc<ScheduleTrigger>>,
    events: broadcast::Sender<TriggerEvent>,
    store: SharedStore,
    fetcher: Arc<dyn FeedFetcher>,
    failures: FailureTracker,
    worker: WorkerSettings,
    articles: mpsc::Sender<NewArticle>,
}

impl ScheduleManager {
    pub fn new(
        schedules: Arc<ScheduleSet>,
        store: SharedStore,
        fetcher: Arc<dyn FeedFetcher>,
        failures: FailureTracker,
        settings: CycleSettings,
        articles: mpsc::Sender<NewArticle>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let triggers = schedules
            .all()
            .into_iter()
            .map(|schedule| {
                let orchestrator = Arc::new(CycleOrchestrator::new(
                    schedule.name.clone(),
                    Arc::clone(&schedules),
                    store.clone(),
                    Arc::clone(&fetcher),
                    failures.clone(),
                    settings.clone(),
                    articles.clone(),
                ));
                Arc::new(ScheduleTrigger::new(schedule, orchestrator, events.clone()))
            })
            .collect();

        Self {
            schedules,
            triggers,
            events,
            store,
            fetcher,
            failures,
            worker: settings.worker,
            articles,
        }
    }

    pub fn schedules(&self) -> &ScheduleSet {
        &self.schedules
    }

    pub fn triggers(&self) -> &[Arc<ScheduleTrigger>] {
        &self.triggers
    }

    pub fn trigger(&self, name: &str) -> Option<&Arc<ScheduleTrigger>> {
        self.triggers.iter().find(|t| t.schedule().name == name)
    }

    /// Subscribe to cycle events of every schedule
    pub fn subscribe(&self) -> broadcast::Receiver<TriggerEvent> {
        self.events.subscribe()
    }

    /// Run one cycle of `name` right now
    pub async fn run_once(&self, name: &str) -> SchedulerResult<CycleReport> {
        self.trigger(name)
            .ok_or_else(|| SchedulerError::unknown(name))?
            .run_now()
            .await
    }

    /// Start every trigger; they stop when `stop` turns true
    pub fn start(&self, stop: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        tracing::info!(schedules = self.triggers.len(), "Starting schedule triggers");
        self.triggers
            .iter()
            .map(|trigger| trigger.spawn(stop.clone()))
            .collect()
    }

    /// Force-stop every running cycle
    pub fn abort_all(&self) {
        for trigger in &self.triggers {
            trigger.abort();
        }
    }

    /// Fetch `url` once outside the cycles
    ///
    /// New items are forwarded for delivery like cycle items. A successful
    /// fetch clears the URL's fail record, so a URL excluded after an outage
    /// rejoins the cycles.
    pub async fn refresh_url(&self, url: &str) -> Result<RefreshReport> {
        let subscriptions: Vec<Subscription> = self
            .store
            .subscriptions_by_url(url)
            .await?
            .into_iter()
            .filter(|s| !s.is_disabled())
            .collect();
        if subscriptions.is_empty() {
            return Err(Error::NoSubscribers { url: url.to_string() });
        }

        let items = match self.fetcher.fetch(url, None).await? {
            FetchOutcome::Fetched { items, .. } => items,
            FetchOutcome::NotModified => Vec::new(),
        };

        let mut by_schedule: BTreeMap<String, Vec<Subscription>> = BTreeMap::new();
        for sub in subscriptions {
            by_schedule
                .entry(resolve(&sub, &self.schedules).to_string())
                .or_default()
                .push(sub);
        }

        let tracker = ItemTracker::new(self.store.clone(), self.worker.detect.clone());
        let mut new_articles = 0;
        for (schedule, subs) in &by_schedule {
            let key = SeenKey::new(url, schedule.as_str(), self.worker.shard);
            let detection = tracker.detect(&key, items.clone(), subs).await?;
            for article in detection.articles {
                new_articles += 1;
                if self.articles.send(article).await.is_err() {
                    return Err(Error::DeliveryChannelClosed);
                }
            }
        }

        let reset = self.failures.reset(url).await;
        tracing::info!(url, new_articles, reset, "Manual refresh finished");

        Ok(RefreshReport {
            url: url.to_string(),
            schedules: by_schedule.into_keys().collect(),
            new_articles,
            reset,
        })
    }
}
