//! Property tests for item identity and new-item detection

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;

use feedwire::identity::{choose_scheme, resolve_ids, DetectOptions, IdScheme, ItemTracker};
use feedwire::models::{RawItem, Subscription};
use feedwire::storage::{MemoryStore, SeenKey};

fn raw_item() -> impl Strategy<Value = RawItem> {
    (
        prop::option::of("[a-c]{1,2}"),
        prop::option::of("https://x/[a-d]{1,2}"),
        prop::option::of("[A-Z][a-z]{0,4}"),
    )
        .prop_map(|(guid, link, title)| RawItem {
            guid,
            link,
            title,
            ..Default::default()
        })
}

proptest! {
    #[test]
    fn resolved_ids_are_deterministic(items in prop::collection::vec(raw_item(), 0..12)) {
        let (scheme_a, first) = resolve_ids(items.clone());
        let (scheme_b, second) = resolve_ids(items.clone());
        prop_assert_eq!(scheme_a, scheme_b);
        prop_assert_eq!(first, second);
        prop_assert_eq!(choose_scheme(&items), scheme_a);
    }

    #[test]
    fn chosen_scheme_gives_unique_ids(items in prop::collection::vec(raw_item(), 1..12)) {
        let (scheme, resolved) = resolve_ids(items);
        if scheme != IdScheme::ContentHash {
            let ids: HashSet<_> = resolved.iter().map(|i| i.id.clone()).collect();
            prop_assert_eq!(ids.len(), resolved.len());
        }
    }

    #[test]
    fn detection_is_idempotent(items in prop::collection::vec(raw_item(), 0..10)) {
        let emitted = tokio_test::block_on(async {
            let store = Arc::new(MemoryStore::new());
            let tracker = ItemTracker::new(
                store,
                DetectOptions {
                    send_on_first_fetch: true,
                    max_item_age: None,
                },
            );
            let key = SeenKey::new("https://x/feed", "default", 0);
            let subs = vec![Subscription::new("s1", "https://x/feed", "c1", "g1")];

            let first = tracker.detect(&key, items.clone(), &subs).await.unwrap();
            let second = tracker.detect(&key, items, &subs).await.unwrap();
            (first.articles.len(), second.articles.len())
        });

        // Nothing is new the second time around
        prop_assert_eq!(emitted.1, 0);
    }
}
