//! Persistence for subscriptions, failure records, audit rows, cycle
//! statistics and seen-sets
//!
//! The core only talks to the [`Store`] trait. A backend is picked once at
//! startup from `storage.backend`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Cycle orchestrator / failure tracker / delivery audit   │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │ Arc<dyn Store>
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//! ┌─────────────────┐ ┌─────────────────┐ ┌─────────────────┐
//! │   SqliteStore   │ │    FileStore    │ │   MemoryStore   │
//! │  (WAL, rusqlite)│ │ (JSON documents)│ │ (tests, dry run)│
//! └─────────────────┘ └─────────────────┘ └─────────────────┘
//! ```

pub mod file;
pub mod memory;
pub mod sqlite;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{StorageBackend, StorageConfig};
use crate::models::{CycleStats, DeliveryRecord, FailRecord, Subscription};

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

// ============================================================================
// Errors
// ============================================================================

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("Write rejected: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Check if a later attempt may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Sqlite(_) | Self::Unavailable(_))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ============================================================================
// Seen-set key
// ============================================================================

/// Scope of a persisted seen-set
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeenKey {
    pub url: String,
    pub schedule: String,
    pub shard: u32,
}

impl SeenKey {
    pub fn new(url: impl Into<String>, schedule: impl Into<String>, shard: u32) -> Self {
        Self {
            url: url.into(),
            schedule: schedule.into(),
            shard,
        }
    }
}

// ============================================================================
// Store trait
// ============================================================================

/// Storage interface consumed by the core
#[async_trait]
pub trait Store: Send + Sync {
    /// Every subscription, disabled ones included
    async fn subscriptions(&self) -> StorageResult<Vec<Subscription>>;

    /// Subscriptions whose source is `url`
    async fn subscriptions_by_url(&self, url: &str) -> StorageResult<Vec<Subscription>> {
        Ok(self
            .subscriptions()
            .await?
            .into_iter()
            .filter(|s| s.url == url)
            .collect())
    }

    /// Insert or replace a subscription by id
    async fn save_subscription(&self, subscription: &Subscription) -> StorageResult<()>;

    async fn fail_record(&self, url: &str) -> StorageResult<Option<FailRecord>>;

    /// All failure records keyed by URL
    async fn fail_records(&self) -> StorageResult<HashMap<String, FailRecord>>;

    async fn upsert_fail_record(&self, record: &FailRecord) -> StorageResult<()>;

    /// Delete a failure record, returning whether one existed
    async fn delete_fail_record(&self, url: &str) -> StorageResult<bool>;

    async fn append_delivery_record(&self, record: &DeliveryRecord) -> StorageResult<()>;

    /// Audit rows, oldest first
    async fn delivery_records(&self) -> StorageResult<Vec<DeliveryRecord>>;

    async fn cycle_stats(&self, schedule: &str) -> StorageResult<Option<CycleStats>>;

    async fn all_cycle_stats(&self) -> StorageResult<Vec<CycleStats>>;

    async fn upsert_cycle_stats(&self, stats: &CycleStats) -> StorageResult<()>;

    /// Seen ids of a scope, `None` if the scope was never initialised
    async fn seen(&self, key: &SeenKey) -> StorageResult<Option<HashSet<String>>>;

    /// Add ids to a scope, initialising it if needed
    async fn insert_seen(&self, key: &SeenKey, ids: &[String]) -> StorageResult<()>;
}

/// Thread-safe shared store
pub type SharedStore = Arc<dyn Store>;

/// Open the backend selected by configuration
pub fn open_store(config: &StorageConfig) -> StorageResult<SharedStore> {
    let store: SharedStore = match config.backend {
        StorageBackend::Sqlite => Arc::new(SqliteStore::new(&config.sqlite_path)?),
        StorageBackend::File => Arc::new(FileStore::open(&config.data_dir)?),
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
    };
    tracing::info!(backend = ?config.backend, "Store opened");
    Ok(store)
}

// ============================================================================
// Tests
// ============================================================================
