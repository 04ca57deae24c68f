//! SQLite store
//!
//! Uses `Mutex` to ensure thread-safety for the SQLite connection. Writes are
//! single statements, so every upsert is atomic at the storage layer.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{SeenKey, StorageError, StorageResult, Store};
use crate::models::{CycleStats, DeliveryRecord, FailRecord, Subscription};

/// SQLite implementation of [`Store`]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn new(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite store initialized");
        Ok(store)
    }

    /// Create in-memory store (for testing)
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::LockPoisoned("sqlite connection"))
    }

    fn create_schema(&self) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS subscriptions (
                    id TEXT PRIMARY KEY,
                    url TEXT NOT NULL,
                    body TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_subscriptions_url
                    ON subscriptions(url);

                CREATE TABLE IF NOT EXISTS fail_records (
                    url TEXT PRIMARY KEY,
                    reason TEXT NOT NULL,
                    first_failed_at TEXT NOT NULL,
                    alerted INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS delivery_records (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL,
                    item_id TEXT NOT NULL,
                    source_url TEXT NOT NULL,
                    destination_channel TEXT NOT NULL,
                    delivered INTEGER NOT NULL DEFAULT 0,
                    comment TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS cycle_stats (
                    schedule_name TEXT PRIMARY KEY,
                    subscription_count INTEGER NOT NULL,
                    cycle_time_seconds REAL NOT NULL,
                    cycle_fail_count INTEGER NOT NULL,
                    cycle_url_count INTEGER NOT NULL,
                    last_updated TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS seen_scopes (
                    url TEXT NOT NULL,
                    schedule TEXT NOT NULL,
                    shard INTEGER NOT NULL,
                    initialized_at TEXT NOT NULL,
                    PRIMARY KEY (url, schedule, shard)
                );

                CREATE TABLE IF NOT EXISTS seen_items (
                    url TEXT NOT NULL,
                    schedule TEXT NOT NULL,
                    shard INTEGER NOT NULL,
                    item_key TEXT NOT NULL,
                    PRIMARY KEY (url, schedule, shard, item_key)
                );
                "#,
        )?;

        Ok(())
    }
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn fail_record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FailRecord> {
    Ok(FailRecord {
        url: row.get(0)?,
        reason: row.get(1)?,
        first_failed_at: parse_time(&row.get::<_, String>(2)?),
        alerted: row.get::<_, i64>(3)? != 0,
    })
}

fn stats_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CycleStats> {
    Ok(CycleStats {
        schedule_name: row.get(0)?,
        subscription_count: row.get::<_, i64>(1)? as u64,
        cycle_time_seconds: row.get(2)?,
        cycle_fail_count: row.get::<_, i64>(3)? as u64,
        cycle_url_count: row.get::<_, i64>(4)? as u64,
        last_updated: parse_time(&row.get::<_, String>(5)?),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn subscriptions(&self) -> StorageResult<Vec<Subscription>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT body FROM subscriptions ORDER BY rowid")?;
        let bodies: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StorageError::from))
            .collect()
    }

    async fn subscriptions_by_url(&self, url: &str) -> StorageResult<Vec<Subscription>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT body FROM subscriptions WHERE url = ?1 ORDER BY rowid")?;
        let bodies: Vec<String> = stmt
            .query_map(params![url], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StorageError::from))
            .collect()
    }

    async fn save_subscription(&self, subscription: &Subscription) -> StorageResult<()> {
        let body = serde_json::to_string(subscription)?;
        let conn = self.lock()?;
        conn.execute(
            r#"
                INSERT INTO subscriptions (id, url, body) VALUES (?1, ?2, ?3)
                ON CONFLICT(id) DO UPDATE SET url = excluded.url, body = excluded.body
                "#,
            params![subscription.id, subscription.url, body],
        )?;
        Ok(())
    }

    async fn fail_record(&self, url: &str) -> StorageResult<Option<FailRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT url, reason, first_failed_at, alerted FROM fail_records WHERE url = ?1",
                params![url],
                fail_record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    async fn fail_records(&self) -> StorageResult<HashMap<String, FailRecord>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT url, reason, first_failed_at, alerted FROM fail_records")?;
        let records = stmt
            .query_map([], fail_record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records.into_iter().map(|r| (r.url.clone(), r)).collect())
    }

    async fn upsert_fail_record(&self, record: &FailRecord) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
                INSERT INTO fail_records (url, reason, first_failed_at, alerted)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(url) DO UPDATE SET
                    reason = excluded.reason,
                    first_failed_at = excluded.first_failed_at,
                    alerted = excluded.alerted
                "#,
            params![
                record.url,
                record.reason,
                record.first_failed_at.to_rfc3339(),
                record.alerted as i64
            ],
        )?;
        Ok(())
    }

    async fn delete_fail_record(&self, url: &str) -> StorageResult<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM fail_records WHERE url = ?1", params![url])?;
        Ok(deleted > 0)
    }

    async fn append_delivery_record(&self, record: &DeliveryRecord) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
                INSERT INTO delivery_records
                    (id, item_id, source_url, destination_channel, delivered, comment, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            params![
                record.id,
                record.item_id,
                record.source_url,
                record.destination_channel,
                record.delivered as i64,
                record.comment,
                record.created_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    async fn delivery_records(&self) -> StorageResult<Vec<DeliveryRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, item_id, source_url, destination_channel, delivered, comment, created_at
             FROM delivery_records ORDER BY seq",
        )?;
        let records = stmt
            .query_map([], |row| {
                Ok(DeliveryRecord {
                    id: row.get(0)?,
                    item_id: row.get(1)?,
                    source_url: row.get(2)?,
                    destination_channel: row.get(3)?,
                    delivered: row.get::<_, i64>(4)? != 0,
                    comment: row.get(5)?,
                    created_at: parse_time(&row.get::<_, String>(6)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    async fn cycle_stats(&self, schedule: &str) -> StorageResult<Option<CycleStats>> {
        let conn = self.lock()?;
        let stats = conn
            .query_row(
                "SELECT schedule_name, subscription_count, cycle_time_seconds, cycle_fail_count,
                        cycle_url_count, last_updated
                 FROM cycle_stats WHERE schedule_name = ?1",
                params![schedule],
                stats_from_row,
            )
            .optional()?;
        Ok(stats)
    }

    async fn all_cycle_stats(&self) -> StorageResult<Vec<CycleStats>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT schedule_name, subscription_count, cycle_time_seconds, cycle_fail_count,
                    cycle_url_count, last_updated
             FROM cycle_stats ORDER BY schedule_name",
        )?;
        let stats = stmt
            .query_map([], stats_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stats)
    }

    async fn upsert_cycle_stats(&self, stats: &CycleStats) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
                INSERT INTO cycle_stats
                    (schedule_name, subscription_count, cycle_time_seconds, cycle_fail_count,
                     cycle_url_count, last_updated)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(schedule_name) DO UPDATE SET
                    subscription_count = excluded.subscription_count,
                    cycle_time_seconds = excluded.cycle_time_seconds,
                    cycle_fail_count = excluded.cycle_fail_count,
                    cycle_url_count = excluded.cycle_url_count,
                    last_updated = excluded.last_updated
                "#,
            params![
                stats.schedule_name,
                stats.subscription_count as i64,
                stats.cycle_time_seconds,
                stats.cycle_fail_count as i64,
                stats.cycle_url_count as i64,
                stats.last_updated.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    async fn seen(&self, key: &SeenKey) -> StorageResult<Option<HashSet<String>>> {
        let conn = self.lock()?;
        let initialized: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM seen_scopes WHERE url = ?1 AND schedule = ?2 AND shard = ?3)",
            params![key.url, key.schedule, key.shard],
            |row| row.get(0),
        )?;
        if !initialized {
            return Ok(None);
        }

        let mut stmt = conn.prepare(
            "SELECT item_key FROM seen_items WHERE url = ?1 AND schedule = ?2 AND shard = ?3",
        )?;
        let ids = stmt
            .query_map(params![key.url, key.schedule, key.shard], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(Some(ids))
    }

    async fn insert_seen(&self, key: &SeenKey, ids: &[String]) -> StorageResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO seen_scopes (url, schedule, shard, initialized_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key.url, key.schedule, key.shard, Utc::now().to_rfc3339()],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO seen_items (url, schedule, shard, item_key)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for id in ids {
                stmt.execute(params![key.url, key.schedule, key.shard, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
