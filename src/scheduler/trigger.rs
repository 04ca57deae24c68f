//! Interval triggers, one per schedule
//!
//! Each trigger ticks every `refresh_rate_minutes`. A tick starts a cycle on
//! its own task unless the previous cycle of the same schedule is still
//! running, in which case the tick is skipped and the hung URLs of that cycle
//! are logged.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::error::{SchedulerError, SchedulerResult};
use super::schedule::Schedule;
use crate::cycle::{CycleOrchestrator, CycleReport, HungUrl};
use crate::storage::StorageResult;

// ============================================================================
// Trigger Events
// ============================================================================

/// Events emitted by triggers
#[derive(Debug, Clone)]
pub enum TriggerEvent {
    CycleStarted {
        schedule: String,
        run: u64,
        triggered_at: DateTime<Utc>,
    },

    CycleFinished {
        report: CycleReport,
    },

    /// The previous cycle was still running
    CycleSkipped {
        schedule: String,
        run: u64,
        hung: Vec<HungUrl>,
    },

    /// The cycle could not load its inputs
    CycleFailed {
        schedule: String,
        run: u64,
        error: String,
    },
}

// ============================================================================
// Schedule Trigger
// ============================================================================

/// Periodic driver of one schedule's cycles
pub struct ScheduleTrigger {
    schedule: Schedule,
    orchestrator: Arc<CycleOrchestrator>,
    events: broadcast::Sender<TriggerEvent>,
    run: AtomicU64,
    busy: Arc<AtomicBool>,
    current: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduleTrigger {
    pub fn new(
        schedule: Schedule,
        orchestrator: Arc<CycleOrchestrator>,
        events: broadcast::Sender<TriggerEvent>,
    ) -> Self {
        Self {
            schedule,
            orchestrator,
            events,
            run: AtomicU64::new(0),
            busy: Arc::new(AtomicBool::new(false)),
            current: Mutex::new(None),
        }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn orchestrator(&self) -> &Arc<CycleOrchestrator> {
        &self.orchestrator
    }

    /// Number of the last started run
    pub fn last_run(&self) -> u64 {
        self.run.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Run one cycle inline, refusing if one is already running
    pub async fn run_now(&self) -> SchedulerResult<CycleReport> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::CycleInProgress {
                name: self.schedule.name.clone(),
                run: self.last_run(),
            });
        }
        let run = self.run.fetch_add(1, Ordering::SeqCst) + 1;
        let result = execute(&self.orchestrator, &self.events, &self.schedule.name, run).await;
        self.busy.store(false, Ordering::SeqCst);
        result.map_err(|e| SchedulerError::CycleFailed {
            name: self.schedule.name.clone(),
            run,
            reason: e.to_string(),
        })
    }

    /// Handle one tick: start a cycle in the background or skip
    pub fn tick(&self) -> bool {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let hung = self.orchestrator.hung_urls();
            tracing::warn!(
                schedule = %self.schedule.name,
                run = self.last_run(),
                hung = hung.len(),
                hung_urls = ?hung.iter().map(|h| h.url.as_str()).collect::<Vec<_>>(),
                "Previous cycle still running, skipping tick"
            );
            let _ = self.events.send(TriggerEvent::CycleSkipped {
                schedule: self.schedule.name.clone(),
                run: self.last_run(),
                hung,
            });
            return false;
        }

        let run = self.run.fetch_add(1, Ordering::SeqCst) + 1;
        let orchestrator = Arc::clone(&self.orchestrator);
        let events = self.events.clone();
        let busy = Arc::clone(&self.busy);
        let name = self.schedule.name.clone();
        let handle = tokio::spawn(async move {
            let _ = execute(&orchestrator, &events, &name, run).await;
            busy.store(false, Ordering::SeqCst);
        });
        if let Ok(mut current) = self.current.lock() {
            *current = Some(handle);
        }
        true
    }

    /// Tick until `stop` turns true, then abort the running cycle
    pub fn spawn(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let trigger = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(trigger.schedule.period());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(
                schedule = %trigger.schedule.name,
                refresh_rate_minutes = trigger.schedule.refresh_rate_minutes,
                "Schedule trigger started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        trigger.tick();
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            trigger.abort();
            tracing::info!(schedule = %trigger.schedule.name, "Schedule trigger stopped");
        })
    }

    /// Force-stop the running cycle and its workers
    pub fn abort(&self) {
        self.orchestrator.abort_workers();
        if let Ok(mut current) = self.current.lock() {
            if let Some(handle) = current.take() {
                handle.abort();
            }
        }
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Run one cycle and publish its events
async fn execute(
    orchestrator: &CycleOrchestrator,
    events: &broadcast::Sender<TriggerEvent>,
    schedule: &str,
    run: u64,
) -> StorageResult<CycleReport> {
    let _ = events.send(TriggerEvent::CycleStarted {
        schedule: schedule.to_string(),
        run,
        triggered_at: Utc::now(),
    });

    match orchestrator.run_cycle(run).await {
        Ok(report) => {
            let _ = events.send(TriggerEvent::CycleFinished {
                report: report.clone(),
            });
            Ok(report)
        }
        Err(e) => {
            tracing::error!(schedule, run, error = %e, "Cycle failed to load its inputs");
            let _ = events.send(TriggerEvent::CycleFailed {
                schedule: schedule.to_string(),
                run,
                error: e.to_string(),
            });
            Err(e)
        }
    }
}
