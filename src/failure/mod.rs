//! Per-URL failure backoff and outage alerts
//!
//! One [`FailRecord`] exists per failing source URL, no matter how many
//! subscriptions share it. Once a URL has been failing for longer than the
//! configured cutoff, every subscribing destination gets exactly one notice
//! and the URL drops out of cycles until a fetch succeeds again or the
//! record is reset by hand.
//!
//! Persistence errors are logged and swallowed; they never abort a cycle.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use crate::delivery::transport::Transport;
use crate::metrics;
use crate::models::{Destination, FailRecord};
use crate::storage::SharedStore;

/// What a `record` call changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FailureUpdate {
    /// A new record was created
    pub first_failure: bool,
    /// The outage alert went out during this call
    pub alerted: bool,
}

/// Failure bookkeeping for source URLs
#[derive(Clone)]
pub struct FailureTracker {
    store: SharedStore,
    transport: Arc<dyn Transport>,
    cutoff: Option<ChronoDuration>,
}

impl FailureTracker {
    /// Create a tracker; a cutoff of 0 hours disables exclusion entirely
    pub fn new(store: SharedStore, transport: Arc<dyn Transport>, hours_until_fail: f64) -> Self {
        let cutoff = (hours_until_fail.is_finite() && hours_until_fail > 0.0)
            .then(|| ChronoDuration::milliseconds((hours_until_fail * 3_600_000.0) as i64));
        Self {
            store,
            transport,
            cutoff,
        }
    }

    /// Configured cutoff, `None` when disabled
    pub fn cutoff(&self) -> Option<ChronoDuration> {
        self.cutoff
    }

    /// Whether the record has been failing for at least the cutoff
    pub fn has_failed(&self, record: &FailRecord) -> bool {
        match self.cutoff {
            Some(cutoff) => Utc::now() - record.first_failed_at >= cutoff,
            None => false,
        }
    }

    /// Whether the URL should be skipped by cycles
    pub fn is_excluded(&self, record: &FailRecord) -> bool {
        self.has_failed(record) && record.alerted
    }

    /// Register a failed fetch of `url`
    pub async fn record(&self, url: &str, reason: &str) -> FailureUpdate {
        let mut update = FailureUpdate::default();

        let existing = match self.store.fail_record(url).await {
            Ok(existing) => existing,
            Err(e) => {
                tracing::error!(url, error = %e, "Failed to load fail record");
                return update;
            }
        };

        let mut record = match existing {
            Some(mut record) => {
                record.reason = reason.to_string();
                record
            }
            None => {
                update.first_failure = true;
                FailRecord::new(url, reason)
            }
        };

        if self.has_failed(&record) && !record.alerted {
            self.alert(&record).await;
            record.alerted = true;
            update.alerted = true;
        }

        if let Err(e) = self.store.upsert_fail_record(&record).await {
            tracing::error!(url, error = %e, "Failed to persist fail record");
        }

        tracing::debug!(url, reason, first = update.first_failure, "Recorded fetch failure");
        update
    }

    /// Clear the failure state of `url`, returning whether there was any
    pub async fn reset(&self, url: &str) -> bool {
        match self.store.delete_fail_record(url).await {
            Ok(existed) => {
                if existed {
                    tracing::info!(url, "Fail record reset");
                }
                existed
            }
            Err(e) => {
                tracing::error!(url, error = %e, "Failed to delete fail record");
                false
            }
        }
    }

    /// Notify every destination currently subscribed to the record's URL
    async fn alert(&self, record: &FailRecord) {
        let subscriptions = match self.store.subscriptions_by_url(&record.url).await {
            Ok(subs) => subs,
            Err(e) => {
                tracing::error!(url = %record.url, error = %e, "Failed to load subscribers for alert");
                return;
            }
        };

        let text = alert_text(record);
        let mut notified: HashSet<Destination> = HashSet::new();
        for subscription in subscriptions {
            let destination = Destination::channel(&subscription.channel, &subscription.guild_id);
            if !self.transport.owns(&destination) || !notified.insert(destination.clone()) {
                continue;
            }
            if let Err(e) = self.transport.send_notice(&destination, &text).await {
                tracing::warn!(
                    url = %record.url,
                    destination = %destination.channel,
                    error = %e,
                    "Failed to send outage alert"
                );
            }
        }

        metrics::record_outage_alert();
        tracing::warn!(
            url = %record.url,
            destinations = notified.len(),
            since = %record.first_failed_at,
            "Source URL exceeded failure cutoff, alert sent"
        );
    }
}

fn alert_text(record: &FailRecord) -> String {
    format!(
        "Feed <{}> has failed continuously since {} (last reason: {}) and will no longer be checked. \
         It resumes once a manual refresh succeeds.",
        record.url,
        record.first_failed_at.format("%Y-%m-%d %H:%M UTC"),
        record.reason
    )
}
