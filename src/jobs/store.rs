//! Persisted job status.
//!
//! The controller only needs a small key-value contract (`set` with TTL,
//! `get`, prefix `scan`, `ping`). Two backends: an in-process map for tests
//! and single-node runs, and SQLite for status that survives restarts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;
use tokio::time::Instant;
use worldgen_common::Job;

use crate::errors::StoreError;

pub const KEY_PREFIX: &str = "worldgen:";

pub fn job_key(job_id: &str) -> String {
    format!("{KEY_PREFIX}job:{job_id}")
}

pub fn seed_job_key(seed_hash: &str) -> String {
    format!("{KEY_PREFIX}seed_job:{seed_hash}")
}

/// Key-value store with per-key expiry. Writes are idempotent.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// `ttl` of zero keeps the key forever.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Live keys starting with `prefix`, sorted, at most `limit`.
    async fn scan(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StoreError>;

    async fn ping(&self) -> bool;
}

#[derive(Default)]
pub struct MemoryStatusStore {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    async fn stored_len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

fn live(expires: &Option<Instant>, now: Instant) -> bool {
    expires.is_none_or(|at| at > now)
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let expires = (!ttl.is_zero()).then(|| now + ttl);
        let mut entries = self.entries.lock().await;
        entries.retain(|_, (_, expires)| live(expires, now));
        entries.insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get(key) {
            Some((value, expires)) if live(expires, now) => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn scan(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, (_, expires)| live(expires, now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    async fn ping(&self) -> bool {
        true
    }
}

/// SQLite-backed store. All access runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteStatusStore {
    conn: Arc<std::sync::Mutex<Connection>>,
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(anyhow::Error::new(e))
}

impl SqliteStatusStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?;
        }
        Self::init(Connection::open(path).map_err(backend)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            );",
        )
        .map_err(backend)?;
        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, rusqlite::Error> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard).map_err(backend)
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("status store task panicked: {e}")))?
    }
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[async_trait]
impl StatusStore for SqliteStatusStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        let now = Utc::now().timestamp();
        let expires_at = (!ttl.is_zero()).then(|| now + ttl.as_secs() as i64);
        self.call(move |conn| {
            let purged = conn.execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )?;
            if purged > 0 {
                tracing::debug!(purged, "removed expired status records");
            }
            conn.execute(
                "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, expires_at],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        let now = Utc::now().timestamp();
        self.call(move |conn| {
            conn.query_row(
                "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn scan(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let pattern = like_prefix(prefix);
        let now = Utc::now().timestamp();
        let limit = limit as i64;
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM kv
                 WHERE key LIKE ?1 ESCAPE '\\' AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY key LIMIT ?3",
            )?;
            let keys = stmt
                .query_map(params![pattern, now, limit], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(keys)
        })
        .await
    }

    async fn ping(&self) -> bool {
        self.call(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .await
            .is_ok()
    }
}

/// Typed job records on top of a [`StatusStore`].
#[derive(Clone)]
pub struct JobRecords {
    store: Arc<dyn StatusStore>,
    ttl: Duration,
}

impl JobRecords {
    pub fn new(store: Arc<dyn StatusStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    /// Write the job and point its seed at it.
    pub async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let json = serde_json::to_string(job)?;
        self.store.set(&job_key(&job.id), &json, self.ttl).await?;
        self.store
            .set(&seed_job_key(&job.seed_hash), &job.id, self.ttl)
            .await
    }

    pub async fn load(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        match self.store.get(&job_key(job_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Most recently submitted job for a seed.
    pub async fn latest_for_seed(&self, seed_hash: &str) -> Result<Option<Job>, StoreError> {
        match self.store.get(&seed_job_key(seed_hash)).await? {
            Some(job_id) => self.load(&job_id).await,
            None => Ok(None),
        }
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let prefix = job_key("");
        let mut jobs = Vec::new();
        for key in self.store.scan(&prefix, limit).await? {
            if let Some(job) = self.load(&key[prefix.len()..]).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worldgen_common::JobStatus;

    async fn exercise(store: &dyn StatusStore) {
        store.set("worldgen:job:b", "2", Duration::ZERO).await.unwrap();
        store.set("worldgen:job:a", "1", Duration::ZERO).await.unwrap();
        store.set("worldgen:seed_job:x", "a", Duration::ZERO).await.unwrap();
        store.set("worldgen:job:a", "1", Duration::ZERO).await.unwrap();

        assert_eq!(store.get("worldgen:job:a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("missing").await.unwrap(), None);
        assert_eq!(
            store.scan("worldgen:job:", 10).await.unwrap(),
            vec!["worldgen:job:a", "worldgen:job:b"]
        );
        assert_eq!(store.scan("worldgen:job:", 1).await.unwrap(), vec!["worldgen:job:a"]);
        assert!(store.ping().await);
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        exercise(&MemoryStatusStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_contract() {
        exercise(&SqliteStatusStore::open_in_memory().unwrap()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_expires_keys() {
        let store = MemoryStatusStore::new();
        store.set("k", "v", Duration::from_secs(60)).await.unwrap();
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.scan("", 10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_drops_expired_records() {
        let store = MemoryStatusStore::new();
        for key in ["a", "b", "c"] {
            store.set(key, "v", Duration::from_secs(60)).await.unwrap();
        }
        store.set("kept", "v", Duration::ZERO).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        // Never read back, but gone after the next write.
        store.set("d", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.stored_len().await, 2);
    }

    #[tokio::test]
    async fn test_sqlite_set_deletes_expired_rows() {
        let store = SqliteStatusStore::open_in_memory().unwrap();
        let past = Utc::now().timestamp() - 10;
        store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO kv (key, value, expires_at) VALUES ('old', 'v', ?1)",
                    params![past],
                )
                .map(|_| ())
            })
            .await
            .unwrap();
        store.set("forever", "v", Duration::ZERO).await.unwrap();
        store.set("fresh", "v", Duration::from_secs(3600)).await.unwrap();

        let keys: Vec<String> = store
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
                let keys = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(keys)
            })
            .await
            .unwrap();
        assert_eq!(keys, vec!["forever", "fresh"]);
    }

    #[tokio::test]
    async fn test_sqlite_scan_treats_wildcards_literally() {
        let store = SqliteStatusStore::open_in_memory().unwrap();
        store.set("a_b", "1", Duration::ZERO).await.unwrap();
        store.set("axb", "2", Duration::ZERO).await.unwrap();
        assert_eq!(store.scan("a_", 10).await.unwrap(), vec!["a_b"]);
    }

    #[tokio::test]
    async fn test_sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/status.db");
        SqliteStatusStore::open(&path)
            .unwrap()
            .set("k", "v", Duration::from_secs(3600))
            .await
            .unwrap();
        let reopened = SqliteStatusStore::open(&path).unwrap();
        assert_eq!(reopened.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_job_records_round_trip_and_seed_index() {
        let records = JobRecords::new(Arc::new(MemoryStatusStore::new()), Duration::ZERO);
        let mut job = Job::new("Seed", "hash1");
        records.save(&job).await.unwrap();
        job.transition(JobStatus::Running).unwrap();
        records.save(&job).await.unwrap();

        let loaded = records.load(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        let latest = records.latest_for_seed("hash1").await.unwrap().unwrap();
        assert_eq!(latest.id, job.id);
        assert!(records.latest_for_seed("other").await.unwrap().is_none());
        assert_eq!(records.list(10).await.unwrap().len(), 1);
    }
}
