//! Article identity and new-item detection
//!
//! Feed items carry heterogeneous identifiers. For each fetch one scheme is
//! chosen for the whole item list, the first of guid, link, title+pubdate
//! and content hash that is present and unique for every item. The
//! resolved ids are then checked against the persisted seen-set of the
//! `(url, schedule, shard)` scope.
//!
//! ```text
//! raw items ──► choose_scheme ──► resolve_ids ──► ItemTracker::detect
//!                                                     │
//!                           seen-set (Store) ◄────────┤
//!                                                     ▼
//!                                              Vec<NewArticle>
//! ```

use std::collections::{HashMap, HashSet};

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{FetchedItem, NewArticle, RawItem, Subscription};
use crate::storage::{SeenKey, SharedStore, StorageResult};

// ============================================================================
// Identity schemes
// ============================================================================

/// How item ids were derived for one fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdScheme {
    Guid,
    Link,
    TitlePubdate,
    ContentHash,
}

impl IdScheme {
    /// Candidates in priority order
    pub const PRIORITY: [IdScheme; 4] = [
        IdScheme::Guid,
        IdScheme::Link,
        IdScheme::TitlePubdate,
        IdScheme::ContentHash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Guid => "guid",
            Self::Link => "link",
            Self::TitlePubdate => "title_pubdate",
            Self::ContentHash => "content_hash",
        }
    }

    /// Id of `item` under this scheme, if the item has the needed fields
    pub fn id_of(&self, item: &RawItem) -> Option<String> {
        let non_empty = |v: &Option<String>| v.as_deref().filter(|s| !s.trim().is_empty()).map(String::from);
        match self {
            Self::Guid => non_empty(&item.guid),
            Self::Link => non_empty(&item.link),
            Self::TitlePubdate => {
                let title = non_empty(&item.title)?;
                let published = item.published?;
                Some(format!("{}|{}", title, published.to_rfc3339()))
            }
            Self::ContentHash => Some(item.content_hash()),
        }
    }
}

impl std::fmt::Display for IdScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the first scheme giving every item a present, unique id
///
/// Falls back to the content hash when no candidate qualifies.
pub fn choose_scheme(items: &[RawItem]) -> IdScheme {
    IdScheme::PRIORITY
        .into_iter()
        .find(|scheme| {
            let mut seen = HashSet::with_capacity(items.len());
            items
                .iter()
                .all(|item| scheme.id_of(item).is_some_and(|id| seen.insert(id)))
        })
        .unwrap_or(IdScheme::ContentHash)
}

/// Resolve ids for a whole fetch
pub fn resolve_ids(items: Vec<RawItem>) -> (IdScheme, Vec<FetchedItem>) {
    let scheme = choose_scheme(&items);
    let resolved = items
        .into_iter()
        .map(|raw| {
            let id = scheme.id_of(&raw).unwrap_or_else(|| raw.content_hash());
            FetchedItem { id, raw }
        })
        .collect();
    (scheme, resolved)
}

/// Seen-set key of a comparison field value
pub fn comparison_key(field: &str, value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    format!("{field}:{digest:x}")
}

/// Order items oldest first
///
/// Feed documents list newest first, so undated lists are reversed.
fn oldest_first(mut items: Vec<FetchedItem>) -> Vec<FetchedItem> {
    if items.iter().all(|i| i.raw.published.is_some()) {
        items.sort_by_key(|i| i.raw.published);
    } else {
        items.reverse();
    }
    items
}

// ============================================================================
// New-item detection
// ============================================================================

/// Detection knobs
#[derive(Debug, Clone, Default)]
pub struct DetectOptions {
    /// Emit items on the very first fetch of a scope instead of only seeding
    pub send_on_first_fetch: bool,

    /// Items published earlier than this are marked seen but never emitted
    pub max_item_age: Option<ChronoDuration>,
}

/// Outcome of one detection pass
#[derive(Debug, Clone)]
pub struct Detection {
    pub scheme: IdScheme,
    pub articles: Vec<NewArticle>,
    /// Whether this pass initialised the scope
    pub seeded: bool,
}

/// Compares fetched items against a persisted seen-set
#[derive(Clone)]
pub struct ItemTracker {
    store: SharedStore,
    options: DetectOptions,
}

impl ItemTracker {
    pub fn new(store: SharedStore, options: DetectOptions) -> Self {
        Self { store, options }
    }

    /// Find items in `raw` that the scope has not seen
    ///
    /// Every id and comparison value is recorded as seen. An item already
    /// seen by id is still emitted to the subscriptions for which one of
    /// their comparison fields carries a value never seen before.
    pub async fn detect(
        &self,
        key: &SeenKey,
        raw: Vec<RawItem>,
        subscriptions: &[Subscription],
    ) -> StorageResult<Detection> {
        let (scheme, items) = resolve_ids(raw);
        let items = oldest_first(items);

        let existing = self.store.seen(key).await?;
        let seeded = existing.is_none();
        let seen = existing.unwrap_or_default();

        let cutoff = self.options.max_item_age.map(|age| Utc::now() - age);
        let emit_allowed = !seeded || self.options.send_on_first_fetch;

        let comparison_fields: HashSet<&str> = subscriptions
            .iter()
            .flat_map(|s| s.comparisons.iter().map(String::as_str))
            .collect();

        let mut new_keys: Vec<String> = Vec::new();
        let mut pending: HashSet<String> = HashSet::new();
        let mut articles = Vec::new();

        for item in items {
            let is_new = !seen.contains(&item.id) && !pending.contains(&item.id);

            // Comparison values of this item that were never seen
            let mut fresh_values: HashMap<&str, bool> = HashMap::new();
            for &field in &comparison_fields {
                if let Some(value) = item.raw.field(field) {
                    let ck = comparison_key(field, &value);
                    let fresh = !seen.contains(&ck) && !pending.contains(&ck);
                    fresh_values.insert(field, fresh);
                    if fresh {
                        pending.insert(ck.clone());
                        new_keys.push(ck);
                    }
                }
            }

            if is_new {
                pending.insert(item.id.clone());
                new_keys.push(item.id.clone());
            }

            let too_old = match (cutoff, item.raw.published) {
                (Some(cutoff), Some(published)) => published < cutoff,
                _ => false,
            };
            if !emit_allowed || too_old {
                continue;
            }

            let recipients: Vec<Subscription> = if is_new {
                subscriptions.to_vec()
            } else {
                subscriptions
                    .iter()
                    .filter(|s| {
                        s.comparisons
                            .iter()
                            .any(|f| fresh_values.get(f.as_str()).copied().unwrap_or(false))
                    })
                    .cloned()
                    .collect()
            };

            if !recipients.is_empty() {
                articles.push(NewArticle {
                    source_url: key.url.clone(),
                    schedule: key.schedule.clone(),
                    item,
                    subscriptions: recipients,
                });
            }
        }

        if seeded || !new_keys.is_empty() {
            self.store.insert_seen(key, &new_keys).await?;
        }

        if seeded {
            tracing::debug!(
                url = %key.url,
                schedule = %key.schedule,
                ids = new_keys.len(),
                "Seen-set initialised"
            );
        }

        Ok(Detection {
            scheme,
            articles,
            seeded,
        })
    }
}
