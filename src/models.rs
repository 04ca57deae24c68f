// Core data structures for feedwire

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

// ============================================================================
// Subscription
// ============================================================================

/// Webhook override for a subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Per-field include/exclude patterns for a subscription
///
/// Keys are item field names (`title`, `description`, `author`, `link` or any
/// extra field), values are case-insensitive regular expressions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRules {
    #[serde(default)]
    pub include: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub exclude: BTreeMap<String, Vec<String>>,
}

impl FilterRules {
    /// Whether no rule is configured at all
    pub fn is_empty(&self) -> bool {
        self.include.values().all(Vec::is_empty) && self.exclude.values().all(Vec::is_empty)
    }
}

/// A destination's binding to a source URL ("feed")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub url: String,
    pub channel: String,
    pub guild_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<Webhook>,
    #[serde(default)]
    pub filters: FilterRules,
    /// Extra item fields whose unseen values re-trigger delivery
    #[serde(default)]
    pub comparisons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Reason the subscription was disabled, if it was
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<String>,
}

impl Subscription {
    /// Create a plain channel subscription
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        channel: impl Into<String>,
        guild_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            channel: channel.into(),
            guild_id: guild_id.into(),
            webhook: None,
            filters: FilterRules::default(),
            comparisons: Vec::new(),
            template: None,
            disabled: None,
        }
    }

    /// Route deliveries through a webhook instead of the channel
    pub fn with_webhook(mut self, webhook: Webhook) -> Self {
        self.webhook = Some(webhook);
        self
    }

    /// Set the filter rules
    pub fn with_filters(mut self, filters: FilterRules) -> Self {
        self.filters = filters;
        self
    }

    /// Set the comparison fields
    pub fn with_comparisons(mut self, comparisons: Vec<String>) -> Self {
        self.comparisons = comparisons;
        self
    }

    /// Mark as disabled with a reason
    pub fn disabled_because(mut self, reason: impl Into<String>) -> Self {
        self.disabled = Some(reason.into());
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.is_some()
    }

    /// Delivery target for this subscription
    pub fn destination(&self) -> Destination {
        Destination {
            channel: self.channel.clone(),
            guild_id: self.guild_id.clone(),
            webhook_url: self.webhook.as_ref().map(|w| w.url.clone()),
        }
    }
}

/// Concrete delivery target of a subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub channel: String,
    pub guild_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl Destination {
    pub fn channel(channel: impl Into<String>, guild_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            guild_id: guild_id.into(),
            webhook_url: None,
        }
    }
}

// ============================================================================
// Items
// ============================================================================

/// Item as produced by the feed fetch collaborator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    /// Any other scalar field the parser exposed
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl RawItem {
    /// Look up a field by name, standard fields first
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "guid" => self.guid.clone(),
            "link" => self.link.clone(),
            "title" => self.title.clone(),
            "description" => self.description.clone(),
            "author" => self.author.clone(),
            "pubdate" | "published" => self.published.map(|d| d.to_rfc3339()),
            other => self.extra.get(other).cloned(),
        }
    }

    /// SHA256 over every field in a stable order
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for value in [
            &self.guid,
            &self.link,
            &self.title,
            &self.description,
            &self.author,
        ] {
            hasher.update(value.as_deref().unwrap_or("").as_bytes());
            hasher.update([0u8]);
        }
        if let Some(published) = self.published {
            hasher.update(published.to_rfc3339().as_bytes());
        }
        hasher.update([0u8]);
        for (key, value) in &self.extra {
            hasher.update(key.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Item with its resolved dedup identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedItem {
    pub id: String,
    pub raw: RawItem,
}

/// A new item awaiting fan-out to the subscriptions of its source URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewArticle {
    pub source_url: String,
    pub schedule: String,
    pub item: FetchedItem,
    /// Subscriptions the item should be fanned out to
    pub subscriptions: Vec<Subscription>,
}

// ============================================================================
// Audit and statistics
// ============================================================================

/// Audit row for a non-successful delivery outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: String,
    pub item_id: String,
    pub source_url: String,
    pub destination_channel: String,
    pub delivered: bool,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Comment used when filters blocked an item
    pub const FILTER_BLOCK_COMMENT: &'static str = "blocked by filters";

    /// Create an undelivered record
    pub fn undelivered(
        item_id: impl Into<String>,
        source_url: impl Into<String>,
        destination_channel: impl Into<String>,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            item_id: item_id.into(),
            source_url: source_url.into(),
            destination_channel: destination_channel.into(),
            delivered: false,
            comment: comment.into(),
            created_at: Utc::now(),
        }
    }

    /// Whether this record was written because of a filter block
    pub fn is_filter_block(&self) -> bool {
        self.comment == Self::FILTER_BLOCK_COMMENT
    }
}

/// Per-URL failure bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailRecord {
    pub url: String,
    pub reason: String,
    pub first_failed_at: DateTime<Utc>,
    /// Set once the outage alert went out, cleared only by deleting the record
    pub alerted: bool,
}

impl FailRecord {
    pub fn new(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reason: reason.into(),
            first_failed_at: Utc::now(),
            alerted: false,
        }
    }
}

/// Per-schedule statistics of the most recent cycles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleStats {
    pub schedule_name: String,
    pub subscription_count: u64,
    pub cycle_time_seconds: f64,
    pub cycle_fail_count: u64,
    pub cycle_url_count: u64,
    pub last_updated: DateTime<Utc>,
}

impl CycleStats {
    /// Fold a fresh measurement into the previous row
    ///
    /// Time and failure counts use a 2-point moving average, counts and the
    /// timestamp are replaced.
    pub fn merge(previous: Option<&CycleStats>, current: CycleStats) -> CycleStats {
        match previous {
            None => current,
            Some(prev) => CycleStats {
                cycle_time_seconds: (current.cycle_time_seconds + prev.cycle_time_seconds) / 2.0,
                cycle_fail_count: ((current.cycle_fail_count + prev.cycle_fail_count) as f64 / 2.0)
                    .round() as u64,
                ..current
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(time: f64, fails: u64, urls: u64) -> CycleStats {
        CycleStats {
            schedule_name: "default".to_string(),
            subscription_count: 10,
            cycle_time_seconds: time,
            cycle_fail_count: fails,
            cycle_url_count: urls,
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn test_cycle_stats_first_row_is_raw() {
        let merged = CycleStats::merge(None, stats(12.0, 3, 40));
        assert_eq!(merged.cycle_time_seconds, 12.0);
        assert_eq!(merged.cycle_fail_count, 3);
    }

    #[test]
    fn test_cycle_stats_moving_average() {
        let prev = stats(10.0, 2, 40);
        let merged = CycleStats::merge(Some(&prev), stats(20.0, 5, 55));
        assert_eq!(merged.cycle_time_seconds, 15.0);
        // (5 + 2) / 2 = 3.5 rounds half away from zero
        assert_eq!(merged.cycle_fail_count, 4);
        assert_eq!(merged.cycle_url_count, 55);
    }

    #[test]
    fn test_raw_item_field_lookup() {
        let mut item = RawItem {
            title: Some("Hello".to_string()),
            ..Default::default()
        };
        item.extra.insert("category".to_string(), "news".to_string());

        assert_eq!(item.field("title").as_deref(), Some("Hello"));
        assert_eq!(item.field("category").as_deref(), Some("news"));
        assert_eq!(item.field("guid"), None);
    }

    #[test]
    fn test_content_hash_is_stable_and_distinguishing() {
        let a = RawItem {
            title: Some("a".to_string()),
            ..Default::default()
        };
        let b = RawItem {
            description: Some("a".to_string()),
            ..Default::default()
        };
        assert_eq!(a.content_hash(), a.clone().content_hash());
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_subscription_destination_prefers_webhook() {
        let sub = Subscription::new("s1", "https://x/feed", "c1", "g1").with_webhook(Webhook {
            id: "w1".to_string(),
            url: "https://hooks.example.com/w1".to_string(),
            name: None,
        });
        let dest = sub.destination();
        assert_eq!(dest.channel, "c1");
        assert_eq!(dest.webhook_url.as_deref(), Some("https://hooks.example.com/w1"));
    }

    #[test]
    fn test_delivery_record_filter_block() {
        let record =
            DeliveryRecord::undelivered("i1", "https://x", "c1", DeliveryRecord::FILTER_BLOCK_COMMENT);
        assert!(!record.delivered);
        assert!(record.is_filter_block());
    }
}
