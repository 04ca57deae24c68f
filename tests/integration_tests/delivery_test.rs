//! Delivery pipeline integration tests
//!
//! Destinations over budget queue their jobs instead of dropping them, and
//! every destination receives its jobs in arrival order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use feedwire::delivery::transport::{RecordingTransport, TransportError};
use feedwire::delivery::{DeliveryMode, DeliveryOutcome, DeliveryPipeline, DestinationLimiter, TemplateRenderer};
use feedwire::models::{FetchedItem, NewArticle, Subscription};
use feedwire::storage::{MemoryStore, Store};

use super::fixtures::{item, subscription};

const FEED: &str = "https://feeds.example.com/z.xml";

fn article(id: &str, subscriptions: Vec<Subscription>) -> NewArticle {
    NewArticle {
        source_url: FEED.to_string(),
        schedule: "default".to_string(),
        item: FetchedItem {
            id: id.to_string(),
            raw: item(id),
        },
        subscriptions,
    }
}

fn pipeline(
    mode: DeliveryMode,
    per_minute: u32,
) -> (Arc<DeliveryPipeline>, Arc<RecordingTransport>, Arc<MemoryStore>) {
    let transport = Arc::new(RecordingTransport::new());
    let store = Arc::new(MemoryStore::new());
    let pipeline = Arc::new(DeliveryPipeline::new(
        mode,
        Arc::new(TemplateRenderer::new(2000)),
        transport.clone(),
        Arc::new(DestinationLimiter::new(per_minute, per_minute, HashSet::new())),
        store.clone(),
    ));
    (pipeline, transport, store)
}

fn ids(transport: &RecordingTransport, channel: &str) -> Vec<String> {
    transport
        .jobs_for(channel)
        .into_iter()
        .map(|j| j.metadata.item_id)
        .collect()
}

#[tokio::test]
async fn test_over_budget_destination_queues_in_order() {
    // 60 per minute: the burst is spent after 60 sends, then one per second
    let (pipeline, transport, _) = pipeline(DeliveryMode::Brokered, 60);
    let sub = subscription("s1", FEED, "Z");

    let mut outcomes = Vec::new();
    for i in 0..62 {
        let article = article(&format!("item-{i:02}"), vec![sub.clone()]);
        outcomes.extend(pipeline.deliver(&article).await);
    }

    assert!(outcomes[..60].iter().all(|o| *o == DeliveryOutcome::Sent));
    assert_eq!(outcomes[60], DeliveryOutcome::Queued);
    assert_eq!(outcomes[61], DeliveryOutcome::Queued);
    assert_eq!(pipeline.pending(), 2);

    pipeline.drain().await;

    let expected: Vec<_> = (0..62).map(|i| format!("item-{i:02}")).collect();
    assert_eq!(ids(&transport, "Z"), expected);
    assert_eq!(pipeline.pending(), 0);
}

#[tokio::test]
async fn test_in_process_mode_keeps_per_destination_order() {
    let (pipeline, transport, _) = pipeline(DeliveryMode::InProcess, 6000);
    let subs = vec![subscription("s1", FEED, "A"), subscription("s2", FEED, "B")];

    for i in 0..25 {
        let outcomes = pipeline.deliver(&article(&format!("item-{i:02}"), subs.clone())).await;
        assert_eq!(outcomes, vec![DeliveryOutcome::Queued, DeliveryOutcome::Queued]);
    }
    pipeline.drain().await;

    let expected: Vec<_> = (0..25).map(|i| format!("item-{i:02}")).collect();
    assert_eq!(ids(&transport, "A"), expected);
    assert_eq!(ids(&transport, "B"), expected);
}

#[tokio::test]
async fn test_platform_rate_limit_is_not_a_drop() {
    let (pipeline, transport, store) = pipeline(DeliveryMode::Brokered, 6000);
    transport.fail_next(
        "Z",
        TransportError::RateLimited {
            retry_after: Some(Duration::from_millis(20)),
        },
    );
    let sub = subscription("s1", FEED, "Z");

    let first = pipeline.deliver(&article("first", vec![sub.clone()])).await;
    let second = pipeline.deliver(&article("second", vec![sub])).await;
    assert_eq!(first, vec![DeliveryOutcome::Queued]);
    assert_eq!(second, vec![DeliveryOutcome::Queued]);

    pipeline.drain().await;
    assert_eq!(ids(&transport, "Z"), vec!["first", "second"]);
    assert!(store.delivery_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_foreign_destinations_are_skipped() {
    let transport = Arc::new(RecordingTransport::new().with_foreign_guilds(["guild-2"]));
    let store = Arc::new(MemoryStore::new());
    let pipeline = DeliveryPipeline::new(
        DeliveryMode::InProcess,
        Arc::new(TemplateRenderer::new(2000)),
        transport.clone(),
        Arc::new(DestinationLimiter::new(600, 600, HashSet::new())),
        store,
    );
    let subs = vec![
        subscription("mine", FEED, "A"),
        Subscription::new("theirs", FEED, "B", "guild-2"),
    ];

    let outcomes = pipeline.deliver(&article("x", subs)).await;
    pipeline.drain().await;

    assert_eq!(outcomes, vec![DeliveryOutcome::Queued, DeliveryOutcome::NotOwned]);
    assert!(transport.jobs_for("B").is_empty());
    assert_eq!(pipeline.stats().not_owned, 1);
}

#[tokio::test]
async fn test_dispatcher_consumes_until_channel_closes() {
    let (pipeline, transport, _) = pipeline(DeliveryMode::DryRun, 6000);
    let (tx, rx) = mpsc::channel(8);
    let dispatcher = pipeline.spawn_dispatcher(rx);

    let sub = subscription("s1", FEED, "A");
    for i in 0..3 {
        tx.send(article(&format!("n{i}"), vec![sub.clone()])).await.unwrap();
    }
    drop(tx);
    dispatcher.await.unwrap();
    pipeline.drain().await;

    assert_eq!(ids(&transport, "A"), vec!["n0", "n1", "n2"]);
}
