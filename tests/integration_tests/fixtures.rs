//! Test fixtures for integration tests
//!
//! Provides a scripted fetcher and helpers that wire a cycle orchestrator to
//! in-memory collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use feedwire::cycle::{CycleOrchestrator, CycleSettings};
use feedwire::delivery::transport::RecordingTransport;
use feedwire::failure::FailureTracker;
use feedwire::fetch::{CachedHeaders, FeedFetcher, FetchError, FetchOutcome, FetchResult};
use feedwire::models::{NewArticle, RawItem, Subscription};
use feedwire::scheduler::ScheduleSet;
use feedwire::storage::{MemoryStore, SharedStore};

pub const ARTICLE_CHANNEL_CAPACITY: usize = 1024;

/// Fetcher whose responses are set per URL by the test
#[derive(Default)]
pub struct ScriptedFetcher {
    items: Mutex<HashMap<String, Vec<RawItem>>>,
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_items(&self, url: &str, items: Vec<RawItem>) {
        self.items.lock().unwrap().insert(url.to_string(), items);
    }

    pub fn set_failing(&self, url: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(url.to_string());
        } else {
            set.remove(url);
        }
    }

    /// Requests for `url` never complete
    pub fn set_hanging(&self, url: &str) {
        self.hanging.lock().unwrap().insert(url.to_string());
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl FeedFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str, _cached: Option<&CachedHeaders>) -> FetchResult<FetchOutcome> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;

        let hanging = self.hanging.lock().unwrap().contains(url);
        if hanging {
            std::future::pending::<()>().await;
        }
        if self.failing.lock().unwrap().contains(url) {
            return Err(FetchError::Status(503));
        }
        let items = self
            .items
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_default();
        Ok(FetchOutcome::Fetched {
            items,
            headers: CachedHeaders::default(),
        })
    }
}

pub fn item(guid: &str) -> RawItem {
    RawItem {
        guid: Some(guid.to_string()),
        link: Some(format!("https://example.com/{guid}")),
        title: Some(format!("Title {guid}")),
        ..Default::default()
    }
}

pub fn subscription(id: &str, url: &str, channel: &str) -> Subscription {
    Subscription::new(id, url, channel, "guild-1")
}

/// Orchestrator of the default schedule over in-memory collaborators
pub struct CycleHarness {
    pub store: Arc<MemoryStore>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub transport: Arc<RecordingTransport>,
    pub failures: FailureTracker,
    pub orchestrator: Arc<CycleOrchestrator>,
    pub articles: mpsc::Receiver<NewArticle>,
    pub schedules: Arc<ScheduleSet>,
}

impl CycleHarness {
    pub fn new(subscriptions: Vec<Subscription>, settings: CycleSettings, hours_until_fail: f64) -> Self {
        let store = Arc::new(MemoryStore::with_subscriptions(subscriptions));
        let shared: SharedStore = store.clone();
        let fetcher = ScriptedFetcher::new();
        let transport = Arc::new(RecordingTransport::new());
        let failures = FailureTracker::new(shared.clone(), transport.clone(), hours_until_fail);
        let schedules = Arc::new(ScheduleSet::default_only(10.0).unwrap());
        let (tx, rx) = mpsc::channel(ARTICLE_CHANNEL_CAPACITY);
        let orchestrator = Arc::new(CycleOrchestrator::new(
            "default",
            Arc::clone(&schedules),
            shared,
            fetcher.clone(),
            failures.clone(),
            settings,
            tx,
        ));

        Self {
            store,
            fetcher,
            transport,
            failures,
            orchestrator,
            articles: rx,
            schedules,
        }
    }

    /// Articles forwarded so far
    pub fn take_articles(&mut self) -> Vec<NewArticle> {
        let mut articles = Vec::new();
        while let Ok(article) = self.articles.try_recv() {
            articles.push(article);
        }
        articles
    }
}

pub fn settings(batch_size: usize, parallel_batches: usize) -> CycleSettings {
    CycleSettings {
        batch_size,
        parallel_batches,
        ..Default::default()
    }
}

pub fn settings_with_timeout(timeout: Duration) -> CycleSettings {
    CycleSettings {
        batch_timeout: Some(timeout),
        ..Default::default()
    }
}
