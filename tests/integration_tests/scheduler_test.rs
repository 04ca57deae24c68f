//! Schedule runtime integration tests

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};

use feedwire::delivery::transport::RecordingTransport;
use feedwire::failure::FailureTracker;
use feedwire::scheduler::{
    FastTier, Schedule, ScheduleManager, ScheduleSet, ScheduleTrigger, SchedulerError, TriggerEvent,
};
use feedwire::storage::{MemoryStore, SharedStore};

use super::fixtures::{settings, subscription, CycleHarness, ScriptedFetcher};

const SLOW: &str = "https://feeds.example.com/slow.xml";

fn trigger_for(harness: &CycleHarness) -> (Arc<ScheduleTrigger>, broadcast::Receiver<TriggerEvent>) {
    let (events, rx) = broadcast::channel(32);
    let trigger = Arc::new(ScheduleTrigger::new(
        harness.schedules.default_schedule().clone(),
        Arc::clone(&harness.orchestrator),
        events,
    ));
    (trigger, rx)
}

#[tokio::test]
async fn test_tick_is_skipped_while_previous_cycle_runs() {
    let harness = CycleHarness::new(vec![subscription("s1", SLOW, "A")], settings(10, 1), 24.0);
    harness.fetcher.set_hanging(SLOW);
    let (trigger, mut events) = trigger_for(&harness);

    assert!(trigger.tick());
    assert!(trigger.is_busy());
    assert!(!trigger.tick());

    // Wait until the worker registered its outstanding URL
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!trigger.tick());

    let mut started = 0;
    let mut skipped = 0;
    let mut hung_reported = false;
    while let Ok(event) = events.try_recv() {
        match event {
            TriggerEvent::CycleStarted { run, .. } => {
                assert_eq!(run, 1);
                started += 1;
            }
            TriggerEvent::CycleSkipped { hung, .. } => {
                skipped += 1;
                hung_reported |= hung.iter().any(|h| h.url == SLOW);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(started, 1);
    assert_eq!(skipped, 2);
    assert!(hung_reported);

    let err = trigger.run_now().await.unwrap_err();
    assert!(matches!(err, SchedulerError::CycleInProgress { .. }));

    trigger.abort();
    assert!(!trigger.is_busy());
}

#[tokio::test]
async fn test_run_now_reports_and_publishes() {
    let harness = CycleHarness::new(
        vec![subscription("s1", "https://feeds.example.com/a", "A")],
        settings(10, 1),
        24.0,
    );
    let (trigger, mut events) = trigger_for(&harness);

    let report = trigger.run_now().await.unwrap();
    assert_eq!(report.run, 1);
    assert_eq!(report.url_count, 1);
    assert_eq!(trigger.last_run(), 1);

    assert!(matches!(events.recv().await.unwrap(), TriggerEvent::CycleStarted { .. }));
    match events.recv().await.unwrap() {
        TriggerEvent::CycleFinished { report } => assert_eq!(report.schedule, "default"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_spawned_trigger_stops_on_signal() {
    let harness = CycleHarness::new(
        vec![subscription("s1", "https://feeds.example.com/a", "A")],
        settings(10, 1),
        24.0,
    );
    let (trigger, mut events) = trigger_for(&harness);
    let (stop_tx, stop_rx) = watch::channel(false);

    let handle = trigger.spawn(stop_rx);
    // The first interval tick fires immediately
    let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, TriggerEvent::CycleStarted { run: 1, .. }));

    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_manager_builds_one_trigger_per_schedule() {
    let custom = Schedule::new("youtube", 30.0).with_keywords(["youtube.com"]);
    let tier = FastTier::new(2.0).with_guilds(["guild-vip"]);
    let schedules = Arc::new(ScheduleSet::new(10.0, vec![custom], Some(tier)).unwrap());

    let subs = vec![
        subscription("plain", "https://feeds.example.com/a", "A"),
        subscription("yt", "https://www.youtube.com/feeds/videos.xml?channel_id=1", "A"),
        feedwire::models::Subscription::new("vip", "https://feeds.example.com/b", "B", "guild-vip"),
    ];
    let store: SharedStore = Arc::new(MemoryStore::with_subscriptions(subs));
    let fetcher = ScriptedFetcher::new();
    let transport = Arc::new(RecordingTransport::new());
    let failures = FailureTracker::new(store.clone(), transport, 24.0);
    let (tx, _rx) = mpsc::channel(16);
    let manager = ScheduleManager::new(schedules, store, fetcher.clone(), failures, settings(10, 1), tx);

    assert_eq!(manager.triggers().len(), 3);
    assert!(manager.trigger("youtube").is_some());

    let yt = manager.run_once("youtube").await.unwrap();
    assert_eq!(yt.subscription_count, 1);
    let vip = manager.run_once("supporter").await.unwrap();
    assert_eq!(vip.subscription_count, 1);
    let default = manager.run_once("default").await.unwrap();
    assert_eq!(default.subscription_count, 1);

    assert_eq!(fetcher.calls("https://feeds.example.com/a"), 1);
    assert_eq!(fetcher.calls("https://feeds.example.com/b"), 1);

    let err = manager.run_once("nope").await.unwrap_err();
    assert!(matches!(err, SchedulerError::UnknownSchedule { .. }));
}
