//! Failure backoff integration tests
//!
//! A URL failing past the cutoff alerts its destinations exactly once and
//! drops out of cycles until it is refreshed or reset.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;

use feedwire::fetch::FeedFetcher;
use feedwire::scheduler::ScheduleManager;
use feedwire::storage::{SharedStore, Store};

use super::fixtures::{item, settings, subscription, CycleHarness};

const Y: &str = "https://feeds.example.com/y.xml";
const OK: &str = "https://feeds.example.com/ok.xml";

async fn backdate(store: &dyn Store, url: &str, hours: i64) {
    let mut record = store.fail_record(url).await.unwrap().unwrap();
    record.first_failed_at = Utc::now() - ChronoDuration::hours(hours);
    store.upsert_fail_record(&record).await.unwrap();
}

#[tokio::test]
async fn test_failing_url_alerts_once_and_is_excluded() {
    let subs = vec![
        subscription("s1", Y, "A"),
        subscription("s2", Y, "B"),
        subscription("s3", OK, "A"),
    ];
    let harness = CycleHarness::new(subs, settings(10, 2), 24.0);
    harness.fetcher.set_failing(Y, true);

    let first = harness.orchestrator.run_cycle(1).await.unwrap();
    assert_eq!(first.fail_count, 1);
    assert!(harness.transport.notices().is_empty());

    // The outage now spans more than the cutoff
    backdate(harness.store.as_ref(), Y, 30).await;

    for run in 2..=10 {
        harness.orchestrator.run_cycle(run).await.unwrap();
    }

    // One alert per subscribed destination, sent on the cycle after the cutoff
    let notices = harness.transport.notices();
    assert_eq!(notices.len(), 2);
    let channels: Vec<_> = notices.iter().map(|(d, _)| d.channel.as_str()).collect();
    assert!(channels.contains(&"A"));
    assert!(channels.contains(&"B"));
    assert!(notices[0].1.contains(Y));

    assert_eq!(harness.fetcher.calls(Y), 2);
    assert_eq!(harness.fetcher.calls(OK), 10);
    let record = harness.store.fail_record(Y).await.unwrap().unwrap();
    assert!(record.alerted);

    // A manual reset brings the URL back
    assert!(harness.failures.reset(Y).await);
    harness.fetcher.set_failing(Y, false);
    harness.orchestrator.run_cycle(11).await.unwrap();
    assert_eq!(harness.fetcher.calls(Y), 3);
    assert!(harness.store.fail_record(Y).await.unwrap().is_none());
}

#[tokio::test]
async fn test_zero_hours_until_fail_never_excludes() {
    let subs = vec![subscription("s1", Y, "A")];
    let harness = CycleHarness::new(subs, settings(10, 1), 0.0);
    harness.fetcher.set_failing(Y, true);

    harness.orchestrator.run_cycle(1).await.unwrap();
    backdate(harness.store.as_ref(), Y, 24 * 365).await;
    for run in 2..=5 {
        harness.orchestrator.run_cycle(run).await.unwrap();
    }

    assert_eq!(harness.fetcher.calls(Y), 5);
    assert!(harness.transport.notices().is_empty());
    let record = harness.store.fail_record(Y).await.unwrap().unwrap();
    assert!(!record.alerted);
}

#[tokio::test]
async fn test_success_clears_fail_record() {
    let subs = vec![subscription("s1", Y, "A")];
    let harness = CycleHarness::new(subs, settings(10, 1), 24.0);
    harness.fetcher.set_failing(Y, true);
    harness.orchestrator.run_cycle(1).await.unwrap();
    assert!(harness.store.fail_record(Y).await.unwrap().is_some());

    harness.fetcher.set_failing(Y, false);
    harness.orchestrator.run_cycle(2).await.unwrap();
    assert!(harness.store.fail_record(Y).await.unwrap().is_none());
}

#[tokio::test]
async fn test_manual_refresh_readmits_excluded_url() {
    let subs = vec![subscription("s1", Y, "A"), subscription("s2", Y, "B")];
    let harness = CycleHarness::new(subs, settings(10, 1), 24.0);
    harness.fetcher.set_failing(Y, true);
    harness.orchestrator.run_cycle(1).await.unwrap();
    backdate(harness.store.as_ref(), Y, 48).await;
    harness.orchestrator.run_cycle(2).await.unwrap();
    assert!(harness.store.fail_record(Y).await.unwrap().unwrap().alerted);

    let store: SharedStore = harness.store.clone();
    let fetcher: Arc<dyn FeedFetcher> = harness.fetcher.clone();
    let (tx, mut rx) = mpsc::channel(16);
    let manager = ScheduleManager::new(
        Arc::clone(&harness.schedules),
        store,
        fetcher,
        harness.failures.clone(),
        settings(10, 1),
        tx,
    );

    harness.fetcher.set_failing(Y, false);
    harness.fetcher.set_items(Y, vec![item("a"), item("b")]);
    let report = manager.refresh_url(Y).await.unwrap();

    assert!(report.reset);
    assert_eq!(report.schedules, vec!["default".to_string()]);
    // The scope was seeded by the refresh itself
    assert_eq!(report.new_articles, 0);
    assert!(rx.try_recv().is_err());
    assert!(harness.store.fail_record(Y).await.unwrap().is_none());

    let calls_before = harness.fetcher.calls(Y);
    harness.orchestrator.run_cycle(3).await.unwrap();
    assert_eq!(harness.fetcher.calls(Y), calls_before + 1);
}

#[tokio::test]
async fn test_refresh_of_unknown_url_fails() {
    let harness = CycleHarness::new(vec![subscription("s1", Y, "A")], settings(10, 1), 24.0);
    let store: SharedStore = harness.store.clone();
    let (tx, _rx) = mpsc::channel(1);
    let manager = ScheduleManager::new(
        Arc::clone(&harness.schedules),
        store,
        harness.fetcher.clone(),
        harness.failures.clone(),
        settings(10, 1),
        tx,
    );

    let err = manager
        .refresh_url("https://feeds.example.com/nobody")
        .await
        .unwrap_err();
    assert!(matches!(err, feedwire::error::Error::NoSubscribers { .. }));
}
