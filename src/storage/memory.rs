//! In-memory store
//!
//! Useful for testing and dry runs. Writes can be made to fail on demand to
//! exercise the "persistence failures are swallowed" paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{SeenKey, StorageError, StorageResult, Store};
use crate::models::{CycleStats, DeliveryRecord, FailRecord, Subscription};

// ============================================================================
// Shared state
// ============================================================================

/// Plain collections shared by the memory and file backends
#[derive(Debug, Default, Clone)]
pub(crate) struct MemoryState {
    pub subscriptions: Vec<Subscription>,
    pub fail_records: HashMap<String, FailRecord>,
    pub delivery_records: Vec<DeliveryRecord>,
    pub cycle_stats: HashMap<String, CycleStats>,
    pub seen: HashMap<SeenKey, HashSet<String>>,
}

/// Serialisable form of one seen-set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SeenDocument {
    #[serde(flatten)]
    pub key: SeenKey,
    pub ids: Vec<String>,
}

impl MemoryState {
    pub fn save_subscription(&mut self, subscription: &Subscription) {
        match self
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription.id)
        {
            Some(existing) => *existing = subscription.clone(),
            None => self.subscriptions.push(subscription.clone()),
        }
    }

    pub fn insert_seen(&mut self, key: &SeenKey, ids: &[String]) {
        self.seen
            .entry(key.clone())
            .or_default()
            .extend(ids.iter().cloned());
    }

    pub fn seen_documents(&self) -> Vec<SeenDocument> {
        let mut docs: Vec<SeenDocument> = self
            .seen
            .iter()
            .map(|(key, ids)| {
                let mut ids: Vec<String> = ids.iter().cloned().collect();
                ids.sort();
                SeenDocument {
                    key: key.clone(),
                    ids,
                }
            })
            .collect();
        docs.sort_by(|a, b| {
            (&a.key.url, &a.key.schedule, a.key.shard).cmp(&(&b.key.url, &b.key.schedule, b.key.shard))
        });
        docs
    }

    pub fn load_seen_documents(&mut self, docs: Vec<SeenDocument>) {
        self.seen = docs
            .into_iter()
            .map(|doc| (doc.key, doc.ids.into_iter().collect()))
            .collect();
    }
}

// ============================================================================
// MemoryStore
// ============================================================================

/// In-memory implementation of [`Store`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store preloaded with subscriptions
    pub fn with_subscriptions(subscriptions: Vec<Subscription>) -> Self {
        let store = Self::new();
        if let Ok(mut state) = store.state.write() {
            for sub in &subscriptions {
                state.save_subscription(sub);
            }
        }
        store
    }

    /// Make every subsequent write fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn read(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| StorageError::LockPoisoned("memory store"))
    }

    fn write(&self) -> StorageResult<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "memory store is rejecting writes".to_string(),
            ));
        }
        self.state
            .write()
            .map_err(|_| StorageError::LockPoisoned("memory store"))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn subscriptions(&self) -> StorageResult<Vec<Subscription>> {
        Ok(self.read()?.subscriptions.clone())
    }

    async fn save_subscription(&self, subscription: &Subscription) -> StorageResult<()> {
        self.write()?.save_subscription(subscription);
        Ok(())
    }

    async fn fail_record(&self, url: &str) -> StorageResult<Option<FailRecord>> {
        Ok(self.read()?.fail_records.get(url).cloned())
    }

    async fn fail_records(&self) -> StorageResult<HashMap<String, FailRecord>> {
        Ok(self.read()?.fail_records.clone())
    }

    async fn upsert_fail_record(&self, record: &FailRecord) -> StorageResult<()> {
        self.write()?
            .fail_records
            .insert(record.url.clone(), record.clone());
        Ok(())
    }

    async fn delete_fail_record(&self, url: &str) -> StorageResult<bool> {
        Ok(self.write()?.fail_records.remove(url).is_some())
    }

    async fn append_delivery_record(&self, record: &DeliveryRecord) -> StorageResult<()> {
        self.write()?.delivery_records.push(record.clone());
        Ok(())
    }

    async fn delivery_records(&self) -> StorageResult<Vec<DeliveryRecord>> {
        Ok(self.read()?.delivery_records.clone())
    }

    async fn cycle_stats(&self, schedule: &str) -> StorageResult<Option<CycleStats>> {
        Ok(self.read()?.cycle_stats.get(schedule).cloned())
    }

    async fn all_cycle_stats(&self) -> StorageResult<Vec<CycleStats>> {
        let mut all: Vec<_> = self.read()?.cycle_stats.values().cloned().collect();
        all.sort_by(|a, b| a.schedule_name.cmp(&b.schedule_name));
        Ok(all)
    }

    async fn upsert_cycle_stats(&self, stats: &CycleStats) -> StorageResult<()> {
        self.write()?
            .cycle_stats
            .insert(stats.schedule_name.clone(), stats.clone());
        Ok(())
    }

    async fn seen(&self, key: &SeenKey) -> StorageResult<Option<HashSet<String>>> {
        Ok(self.read()?.seen.get(key).cloned())
    }

    async fn insert_seen(&self, key: &SeenKey, ids: &[String]) -> StorageResult<()> {
        self.write()?.insert_seen(key, ids);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejected_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);

        let record = FailRecord::new("https://x", "timeout");
        let err = store.upsert_fail_record(&record).await.unwrap_err();
        assert!(err.is_recoverable());

        // Reads keep working
        assert!(store.fail_records().await.unwrap().is_empty());

        store.set_fail_writes(false);
        store.upsert_fail_record(&record).await.unwrap();
        assert_eq!(store.fail_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_with_subscriptions() {
        let store = MemoryStore::with_subscriptions(vec![
            Subscription::new("s1", "https://a", "c1", "g1"),
            Subscription::new("s2", "https://a", "c2", "g1"),
        ]);
        assert_eq!(store.subscriptions_by_url("https://a").await.unwrap().len(), 2);
    }

    #[test]
    fn test_seen_documents_roundtrip_state() {
        let mut state = MemoryState::default();
        let key = SeenKey::new("https://a", "default", 1);
        state.insert_seen(&key, &["b".to_string(), "a".to_string()]);

        let docs = state.seen_documents();
        assert_eq!(docs[0].ids, vec!["a", "b"]);

        let mut restored = MemoryState::default();
        restored.load_seen_documents(docs);
        assert_eq!(restored.seen[&key].len(), 2);
    }
}
