//! Audit rows for undelivered items
//!
//! Only non-successful outcomes are recorded. Write failures are logged and
//! never propagate.

use crate::delivery::transport::JobMetadata;
use crate::metrics;
use crate::models::{DeliveryRecord, FetchedItem, Subscription};
use crate::storage::SharedStore;

/// Appends [`DeliveryRecord`]s to the store
#[derive(Clone)]
pub struct AuditRecorder {
    store: SharedStore,
}

impl AuditRecorder {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// An item was blocked by a subscription's filters
    pub async fn record_filter_block(
        &self,
        source_url: &str,
        item: &FetchedItem,
        subscription: &Subscription,
    ) {
        let record = DeliveryRecord::undelivered(
            &item.id,
            source_url,
            &subscription.channel,
            DeliveryRecord::FILTER_BLOCK_COMMENT,
        );
        self.append(record).await;
    }

    /// An item could not be delivered
    pub async fn record_failure(&self, metadata: &JobMetadata, comment: &str) {
        let record = DeliveryRecord::undelivered(
            &metadata.item_id,
            &metadata.source_url,
            &metadata.destination_channel,
            comment,
        );
        self.append(record).await;
    }

    async fn append(&self, record: DeliveryRecord) {
        if let Err(e) = self.store.append_delivery_record(&record).await {
            metrics::record_persistence_error("delivery_record");
            tracing::error!(
                item_id = %record.item_id,
                destination = %record.destination_channel,
                error = %e,
                "Failed to write delivery record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawItem;
    use crate::storage::{MemoryStore, Store};
    use std::sync::Arc;

    fn item() -> FetchedItem {
        FetchedItem {
            id: "i1".to_string(),
            raw: RawItem::default(),
        }
    }

    #[tokio::test]
    async fn test_filter_block_record() {
        let store = Arc::new(MemoryStore::new());
        let audit = AuditRecorder::new(store.clone());
        let sub = Subscription::new("s1", "https://x", "c1", "g1");

        audit.record_filter_block("https://x", &item(), &sub).await;

        let records = store.delivery_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_filter_block());
        assert_eq!(records[0].destination_channel, "c1");
        assert!(!records[0].delivered);
    }

    #[tokio::test]
    async fn test_write_failure_is_swallowed() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_writes(true);
        let audit = AuditRecorder::new(store.clone());
        let meta = JobMetadata {
            item_id: "i1".to_string(),
            source_url: "https://x".to_string(),
            destination_channel: "c1".to_string(),
            subscription_id: "s1".to_string(),
            guild_id: "g1".to_string(),
        };

        audit.record_failure(&meta, "HTTP 500").await;
        assert!(store.delivery_records().await.unwrap().is_empty());
    }
}
