//! Cycle orchestration for one schedule
//!
//! ```text
//!  IDLE ─▶ COLLECTING ─▶ BATCHING ─▶ DISPATCHING ─▶ RUNNING ─▶ COMPLETING ─▶ IDLE
//!            │              │             │             │
//!     load subs +     group by URL,   one task per   count terminal
//!     fail records    batch, group    batch group    replies per batch
//! ```
//!
//! Batch groups run concurrently. Inside a group, batches run one after
//! another, each on a freshly spawned worker task that reports back over a
//! bounded channel. A batch ends when every URL replied, when its worker's
//! channel closes (the worker ended or crashed), or when the optional batch
//! timeout expires. URLs that never replied stay in the [`HangTracker`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

use super::batching::{filter_eligible, group_by_url, make_batches, make_groups, Batch, BatchGroup};
use super::stats::{record_cycle_stats, CycleMeasurement};
use super::tracker::{HangTracker, HungUrl};
use super::worker::{DebugTargets, Worker, WorkerJob, WorkerMessage, WorkerSettings, WorkerStatus};
use crate::failure::FailureTracker;
use crate::fetch::{CachedHeaders, FeedFetcher};
use crate::metrics;
use crate::models::{FailRecord, NewArticle, Subscription};
use crate::scheduler::resolver::resolve;
use crate::scheduler::schedule::ScheduleSet;
use crate::storage::{SharedStore, StorageError, StorageResult};
use crate::utils::retry::{with_retry_if, RetryConfig};

/// Buffered worker messages per batch
const WORKER_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Settings and state
// ============================================================================

/// Cycle knobs taken from configuration
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub batch_size: usize,
    pub parallel_batches: usize,
    /// Upper bound on one batch, `None` to wait for replies indefinitely
    pub batch_timeout: Option<Duration>,
    pub worker: WorkerSettings,
    pub debug: DebugTargets,
    pub load_retry: RetryConfig,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            parallel_batches: 4,
            batch_timeout: None,
            worker: WorkerSettings::default(),
            debug: DebugTargets::default(),
            load_retry: RetryConfig::default(),
        }
    }
}

/// Orchestrator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    #[default]
    Idle,
    Collecting,
    Batching,
    Dispatching,
    Running,
    Completing,
}

impl CyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Collecting => "collecting",
            Self::Batching => "batching",
            Self::Dispatching => "dispatching",
            Self::Running => "running",
            Self::Completing => "completing",
        }
    }
}

/// Published state of the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CycleState {
    pub phase: CyclePhase,
    /// Run number of the current or last cycle
    pub run: u64,
}

/// Summary of one finished cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub schedule: String,
    pub run: u64,
    pub subscription_count: u64,
    pub url_count: u64,
    pub fail_count: u64,
    pub batch_count: usize,
    pub group_count: usize,
    pub new_articles: u64,
    pub hung: Vec<HungUrl>,
    pub elapsed: Duration,
}

/// Cycle-wide reply tallies
#[derive(Debug, Default)]
struct Tally {
    urls: AtomicU64,
    fails: AtomicU64,
    articles: AtomicU64,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Runs the cycles of one schedule
pub struct CycleOrchestrator {
    schedule: String,
    schedules: Arc<ScheduleSet>,
    store: SharedStore,
    worker: Worker,
    failures: FailureTracker,
    settings: CycleSettings,
    articles: mpsc::Sender<NewArticle>,
    headers: Mutex<HashMap<String, CachedHeaders>>,
    /// URLs with a fail record at the start of the cycle
    failing: Mutex<HashSet<String>>,
    hang: Arc<HangTracker>,
    workers: Mutex<HashMap<(usize, usize), AbortHandle>>,
    state: watch::Sender<CycleState>,
}

impl CycleOrchestrator {
    pub fn new(
        schedule: impl Into<String>,
        schedules: Arc<ScheduleSet>,
        store: SharedStore,
        fetcher: Arc<dyn FeedFetcher>,
        failures: FailureTracker,
        settings: CycleSettings,
        articles: mpsc::Sender<NewArticle>,
    ) -> Self {
        let (state, _) = watch::channel(CycleState::default());
        Self {
            schedule: schedule.into(),
            schedules,
            worker: Worker::new(fetcher, store.clone()),
            store,
            failures,
            settings,
            articles,
            headers: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            hang: Arc::new(HangTracker::new()),
            workers: Mutex::new(HashMap::new()),
            state,
        }
    }

    pub fn schedule(&self) -> &str {
        &self.schedule
    }

    /// Subscribe to phase changes
    pub fn subscribe(&self) -> watch::Receiver<CycleState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> CycleState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state().phase != CyclePhase::Idle
    }

    /// URLs of the current or last cycle that never replied
    pub fn hung_urls(&self) -> Vec<HungUrl> {
        self.hang.hung_urls()
    }

    /// Cached validators of one URL
    pub fn cached_headers(&self, url: &str) -> Option<CachedHeaders> {
        self.headers.lock().ok().and_then(|h| h.get(url).cloned())
    }

    /// Abort every running worker task
    pub fn abort_workers(&self) {
        if let Ok(mut workers) = self.workers.lock() {
            for (_, handle) in workers.drain() {
                handle.abort();
            }
        }
    }

    fn set_phase(&self, phase: CyclePhase, run: u64) {
        self.state.send_replace(CycleState { phase, run });
    }

    /// Run one full cycle
    ///
    /// Only the initial loads can fail; everything after them is logged and
    /// tallied instead.
    pub async fn run_cycle(&self, run: u64) -> StorageResult<CycleReport> {
        let started = Instant::now();
        let schedule = self.schedule.clone();

        self.set_phase(CyclePhase::Collecting, run);
        self.hang.clear();
        let (subscriptions, fail_records) = match self.load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.set_phase(CyclePhase::Idle, run);
                return Err(e);
            }
        };

        if let Ok(mut failing) = self.failing.lock() {
            *failing = fail_records.keys().cloned().collect();
        }

        self.set_phase(CyclePhase::Batching, run);
        let mine: Vec<_> = subscriptions
            .into_iter()
            .filter(|sub| resolve(sub, &self.schedules) == schedule)
            .collect();
        let eligibility = filter_eligible(mine, &fail_records, |r| self.failures.is_excluded(r));
        let subscription_count = eligibility.eligible.len() as u64;

        if !self.settings.debug.is_empty() {
            for sub in &eligibility.eligible {
                if self.settings.debug.subscription_ids.contains(&sub.id) {
                    tracing::info!(schedule = %schedule, run, subscription_id = %sub.id, url = %sub.url, "Debug target: eligible");
                }
            }
        }

        let grouped = group_by_url(eligibility.eligible);
        let url_total = grouped.len();
        if url_total == 0 {
            tracing::debug!(schedule = %schedule, run, "No eligible URLs, cycle skipped");
            self.set_phase(CyclePhase::Idle, run);
            return Ok(CycleReport {
                schedule,
                run,
                subscription_count,
                url_count: 0,
                fail_count: 0,
                batch_count: 0,
                group_count: 0,
                new_articles: 0,
                hung: Vec::new(),
                elapsed: started.elapsed(),
            });
        }
        let batches = make_batches(grouped, self.settings.batch_size);
        let batch_count = batches.len();
        let groups = make_groups(batches, self.settings.parallel_batches);
        let group_count = groups.len();

        tracing::info!(
            schedule = %schedule,
            run,
            subscriptions = subscription_count,
            disabled = eligibility.disabled,
            excluded = eligibility.excluded,
            urls = url_total,
            batches = batch_count,
            groups = group_count,
            "Cycle started"
        );

        self.set_phase(CyclePhase::Dispatching, run);
        let tally = Tally::default();
        let group_runs = groups
            .into_iter()
            .enumerate()
            .map(|(index, group)| self.run_group(run, index, group, &tally));

        self.set_phase(CyclePhase::Running, run);
        join_all(group_runs).await;

        self.set_phase(CyclePhase::Completing, run);
        let elapsed = started.elapsed();
        let url_count = tally.urls.load(Ordering::Relaxed);
        let fail_count = tally.fails.load(Ordering::Relaxed);
        let hung = self.hang.hung_urls();

        record_cycle_stats(
            &self.store,
            &schedule,
            CycleMeasurement {
                subscription_count,
                elapsed_seconds: elapsed.as_secs_f64(),
                fail_count,
                url_count,
            },
        )
        .await;
        metrics::record_cycle(&schedule, elapsed.as_secs_f64(), url_count, fail_count);
        metrics::set_hung_urls(&schedule, hung.len());

        let report = CycleReport {
            schedule: schedule.clone(),
            run,
            subscription_count,
            url_count,
            fail_count,
            batch_count,
            group_count,
            new_articles: tally.articles.load(Ordering::Relaxed),
            hung,
            elapsed,
        };

        tracing::info!(
            schedule = %schedule,
            run,
            urls = report.url_count,
            failed = report.fail_count,
            new_articles = report.new_articles,
            hung = report.hung.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Cycle finished"
        );

        self.set_phase(CyclePhase::Idle, run);
        Ok(report)
    }

    async fn load(&self) -> StorageResult<(Vec<Subscription>, HashMap<String, FailRecord>)> {
        let retry = &self.settings.load_retry;
        let subscriptions = with_retry_if(
            retry,
            || self.store.subscriptions(),
            StorageError::is_recoverable,
        )
        .await?;
        let fail_records = with_retry_if(
            retry,
            || self.store.fail_records(),
            StorageError::is_recoverable,
        )
        .await?;
        Ok((subscriptions, fail_records))
    }

    /// Run the batches of one group strictly in order
    async fn run_group(&self, run: u64, group: usize, batches: BatchGroup, tally: &Tally) {
        for (index, batch) in batches.into_iter().enumerate() {
            self.run_batch(run, group, index, batch, tally).await;
        }
    }

    async fn run_batch(&self, run: u64, group: usize, index: usize, batch: Batch, tally: &Tally) {
        let expected = batch.len();
        self.hang.start_batch(group, index, batch.keys().cloned());

        let cached_headers = self.cached_headers_for(&batch);
        let job = WorkerJob {
            settings: self.settings.worker.clone(),
            batch,
            debug: self.settings.debug.clone(),
            cached_headers,
            run,
            schedule: self.schedule.clone(),
            group,
            batch_index: index,
        };

        let (tx, mut rx) = mpsc::channel::<WorkerMessage>(WORKER_CHANNEL_CAPACITY);
        let handle = self.worker.spawn(job, tx);
        if let Ok(mut workers) = self.workers.lock() {
            workers.insert((group, index), handle.abort_handle());
        }

        let deadline = self
            .settings
            .batch_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let mut completed = 0;

        while completed < expected {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        tracing::warn!(
                            schedule = %self.schedule,
                            run,
                            group,
                            batch = index,
                            outstanding = self.hang.outstanding(group, index),
                            "Batch timed out, aborting worker"
                        );
                        handle.abort();
                        break;
                    }
                },
                None => rx.recv().await,
            };

            let Some(message) = next else {
                break;
            };
            if self.handle_message(run, group, index, message, tally).await {
                completed += 1;
            }
        }

        if let Ok(mut workers) = self.workers.lock() {
            workers.remove(&(group, index));
        }
        match handle.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                tracing::error!(
                    schedule = %self.schedule,
                    run,
                    group,
                    batch = index,
                    error = %e,
                    "Worker crashed"
                );
            }
        }

        if completed < expected {
            tracing::warn!(
                schedule = %self.schedule,
                run,
                group,
                batch = index,
                completed,
                expected,
                "Batch ended with outstanding URLs"
            );
        }
    }

    /// Apply one worker message; returns true when it completed its URL
    async fn handle_message(
        &self,
        run: u64,
        group: usize,
        batch: usize,
        message: WorkerMessage,
        tally: &Tally,
    ) -> bool {
        let WorkerMessage { url, status } = message;
        match status {
            WorkerStatus::Headers(headers) => {
                if let Ok(mut cache) = self.headers.lock() {
                    cache.insert(url, headers);
                }
                false
            }
            WorkerStatus::PendingArticle(article) => {
                tally.articles.fetch_add(1, Ordering::Relaxed);
                if self.articles.send(*article).await.is_err() {
                    tracing::error!(schedule = %self.schedule, url = %url, "Delivery channel closed, article dropped");
                }
                false
            }
            WorkerStatus::Success => {
                if !self.hang.complete(group, batch, &url) {
                    return false;
                }
                tally.urls.fetch_add(1, Ordering::Relaxed);
                metrics::record_url_result(&self.schedule, true);
                let was_failing = self
                    .failing
                    .lock()
                    .map(|mut failing| failing.remove(&url))
                    .unwrap_or(true);
                if was_failing {
                    self.failures.reset(&url).await;
                }
                true
            }
            WorkerStatus::Failed(reason) => {
                if !self.hang.complete(group, batch, &url) {
                    return false;
                }
                tally.urls.fetch_add(1, Ordering::Relaxed);
                tally.fails.fetch_add(1, Ordering::Relaxed);
                metrics::record_url_result(&self.schedule, false);
                tracing::debug!(schedule = %self.schedule, run, url = %url, reason = %reason, "URL failed");
                self.failures.record(&url, &reason).await;
                true
            }
        }
    }

    fn cached_headers_for(&self, batch: &Batch) -> HashMap<String, CachedHeaders> {
        let Ok(cache) = self.headers.lock() else {
            return HashMap::new();
        };
        batch
            .keys()
            .filter_map(|url| cache.get(url).map(|h| (url.clone(), h.clone())))
            .collect()
    }
}
