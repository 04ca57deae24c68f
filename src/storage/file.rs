//! Flat-file store
//!
//! One pretty-printed JSON document per collection under a data directory.
//! The whole state is loaded at open and each mutation rewrites the affected
//! document through a temp file + rename.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use super::memory::{MemoryState, SeenDocument};
use super::{SeenKey, StorageResult, Store};
use crate::models::{CycleStats, DeliveryRecord, FailRecord, Subscription};

const SUBSCRIPTIONS: &str = "subscriptions.json";
const FAIL_RECORDS: &str = "fail_records.json";
const DELIVERY_RECORDS: &str = "delivery_records.json";
const CYCLE_STATS: &str = "cycle_stats.json";
const SEEN: &str = "seen.json";

/// JSON-document implementation of [`Store`]
pub struct FileStore {
    dir: PathBuf,
    state: Mutex<MemoryState>,
}

impl FileStore {
    /// Open (or create) a data directory
    pub fn open(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut state = MemoryState {
            subscriptions: read_document(&dir, SUBSCRIPTIONS)?,
            delivery_records: read_document(&dir, DELIVERY_RECORDS)?,
            ..Default::default()
        };
        let fail_records: Vec<FailRecord> = read_document(&dir, FAIL_RECORDS)?;
        state.fail_records = fail_records
            .into_iter()
            .map(|r| (r.url.clone(), r))
            .collect();
        let stats: Vec<CycleStats> = read_document(&dir, CYCLE_STATS)?;
        state.cycle_stats = stats
            .into_iter()
            .map(|s| (s.schedule_name.clone(), s))
            .collect();
        state.load_seen_documents(read_document(&dir, SEEN)?);

        tracing::info!(dir = %dir.display(), "File store initialized");
        Ok(Self {
            dir,
            state: Mutex::new(state),
        })
    }

    async fn persist<T: Serialize>(&self, name: &str, value: &T) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(value)?;
        let target = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }
}

fn read_document<T: DeserializeOwned + Default>(dir: &Path, name: &str) -> StorageResult<T> {
    let path = dir.join(name);
    if !path.exists() {
        return Ok(T::default());
    }
    let content = std::fs::read(&path)?;
    if content.is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(&content)?)
}

fn sorted_fail_records(state: &MemoryState) -> Vec<FailRecord> {
    let mut records: Vec<_> = state.fail_records.values().cloned().collect();
    records.sort_by(|a, b| a.url.cmp(&b.url));
    records
}

fn sorted_stats(state: &MemoryState) -> Vec<CycleStats> {
    let mut stats: Vec<_> = state.cycle_stats.values().cloned().collect();
    stats.sort_by(|a, b| a.schedule_name.cmp(&b.schedule_name));
    stats
}

#[async_trait]
impl Store for FileStore {
    async fn subscriptions(&self) -> StorageResult<Vec<Subscription>> {
        Ok(self.state.lock().await.subscriptions.clone())
    }

    async fn save_subscription(&self, subscription: &Subscription) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.save_subscription(subscription);
        self.persist(SUBSCRIPTIONS, &state.subscriptions).await
    }

    async fn fail_record(&self, url: &str) -> StorageResult<Option<FailRecord>> {
        Ok(self.state.lock().await.fail_records.get(url).cloned())
    }

    async fn fail_records(&self) -> StorageResult<HashMap<String, FailRecord>> {
        Ok(self.state.lock().await.fail_records.clone())
    }

    async fn upsert_fail_record(&self, record: &FailRecord) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.fail_records.insert(record.url.clone(), record.clone());
        self.persist(FAIL_RECORDS, &sorted_fail_records(&state)).await
    }

    async fn delete_fail_record(&self, url: &str) -> StorageResult<bool> {
        let mut state = self.state.lock().await;
        let existed = state.fail_records.remove(url).is_some();
        if existed {
            self.persist(FAIL_RECORDS, &sorted_fail_records(&state)).await?;
        }
        Ok(existed)
    }

    async fn append_delivery_record(&self, record: &DeliveryRecord) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.delivery_records.push(record.clone());
        self.persist(DELIVERY_RECORDS, &state.delivery_records).await
    }

    async fn delivery_records(&self) -> StorageResult<Vec<DeliveryRecord>> {
        Ok(self.state.lock().await.delivery_records.clone())
    }

    async fn cycle_stats(&self, schedule: &str) -> StorageResult<Option<CycleStats>> {
        Ok(self.state.lock().await.cycle_stats.get(schedule).cloned())
    }

    async fn all_cycle_stats(&self) -> StorageResult<Vec<CycleStats>> {
        Ok(sorted_stats(&*self.state.lock().await))
    }

    async fn upsert_cycle_stats(&self, stats: &CycleStats) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state
            .cycle_stats
            .insert(stats.schedule_name.clone(), stats.clone());
        self.persist(CYCLE_STATS, &sorted_stats(&state)).await
    }

    async fn seen(&self, key: &SeenKey) -> StorageResult<Option<HashSet<String>>> {
        Ok(self.state.lock().await.seen.get(key).cloned())
    }

    async fn insert_seen(&self, key: &SeenKey, ids: &[String]) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.insert_seen(key, ids);
        let docs: Vec<SeenDocument> = state.seen_documents();
        self.persist(SEEN, &docs).await
    }
}
