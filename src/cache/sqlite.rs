//! SQLite-backed cache store
//!
//! Lets separate CLI processes share one cache file. Timestamps are unix
//! milliseconds; pattern deletes use SQLite GLOB with `[` escaped, so
//! patterns match the same keys as in the in-memory store.

use super::store::{CacheStore, KeyInfo, MemoryStats};
use super::CacheError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use std::time::Duration;

type DbPool = Pool<SqliteConnectionManager>;

const MIGRATIONS: &[&str] = &[r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    last_accessed INTEGER NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at);
"#];

pub struct SqliteCacheStore {
    pool: DbPool,
    capacity_bytes: u64,
}

impl SqliteCacheStore {
    /// Open (or create) the cache database at `path`
    pub fn open(path: &Path, capacity_bytes: u64) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::Connection(format!(
                    "Failed to create cache directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        Self::with_manager(SqliteConnectionManager::file(path), capacity_bytes, 8)
    }

    /// Private in-memory database, for tests
    pub fn in_memory(capacity_bytes: u64) -> Result<Self, CacheError> {
        // Each in-memory connection is its own database, so the pool holds one
        Self::with_manager(SqliteConnectionManager::memory(), capacity_bytes, 1)
    }

    fn with_manager(
        manager: SqliteConnectionManager,
        capacity_bytes: u64,
        max_size: u32,
    ) -> Result<Self, CacheError> {
        let pool = Pool::builder()
            .max_size(max_size)
            .build(manager)
            .map_err(|e| {
                CacheError::Connection(format!("Failed to create connection pool: {}", e))
            })?;

        let store = Self {
            pool,
            capacity_bytes,
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), CacheError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| CacheError::operation("migrate", e))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM _migrations",
                [],
                |row| row.get(0),
            )
            .map_err(|e| CacheError::operation("migrate", e))?;

        for (version, migration) in MIGRATIONS.iter().enumerate() {
            let version = version as i64 + 1;
            if version > current_version {
                tracing::info!("Applying cache migration {}", version);
                conn.execute_batch(migration)
                    .map_err(|e| CacheError::operation("migrate", e))?;
                conn.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    params![version],
                )
                .map_err(|e| CacheError::operation("migrate", e))?;
            }
        }

        Ok(())
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, CacheError> {
        self.pool
            .get()
            .map_err(|e| CacheError::Connection(format!("Failed to get connection: {}", e)))
    }

    /// Run a closure on a pooled connection off the async runtime
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| CacheError::Connection(format!("Failed to get connection: {}", e)))?;
            f(&conn).map_err(|e| CacheError::operation(operation, e))
        })
        .await
        .map_err(|e| CacheError::operation(operation, e))?
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let key = key.to_string();
        self.with_conn("get", move |conn| {
            let now = now_millis();
            let value: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT value FROM cache_entries
                     WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                    params![key, now],
                    |row| row.get(0),
                )
                .optional()?;

            if value.is_some() {
                conn.execute(
                    "UPDATE cache_entries
                     SET last_accessed = ?2, access_count = access_count + 1
                     WHERE key = ?1",
                    params![key, now],
                )?;
            }
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let key = key.to_string();
        self.with_conn("set", move |conn| {
            let now = now_millis();
            let expires_at = (!ttl.is_zero()).then(|| now + ttl.as_millis() as i64);
            conn.execute(
                "INSERT OR REPLACE INTO cache_entries
                 (key, value, created_at, last_accessed, access_count, expires_at)
                 VALUES (?1, ?2, ?3, ?3, 0, ?4)",
                params![key, value, now, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let key = key.to_string();
        self.with_conn("delete", move |conn| {
            Ok(conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])? > 0)
        })
        .await
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let pattern = literal_brackets(pattern);
        self.with_conn("delete_pattern", move |conn| {
            conn.execute(
                "DELETE FROM cache_entries WHERE key GLOB ?1",
                params![pattern],
            )
        })
        .await
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<KeyInfo>, CacheError> {
        let pattern = literal_brackets(pattern);
        self.with_conn("scan", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, length(key) + length(value), created_at, last_accessed,
                        access_count, expires_at
                 FROM cache_entries
                 WHERE key GLOB ?1 AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY key",
            )?;
            let rows = stmt.query_map(params![pattern, now_millis()], |row| {
                Ok(KeyInfo {
                    key: row.get(0)?,
                    size_bytes: row.get::<_, i64>(1)? as u64,
                    created_at: from_millis(row.get(2)?),
                    last_accessed: from_millis(row.get(3)?),
                    access_count: row.get::<_, i64>(4)? as u64,
                    expires_at: row.get::<_, Option<i64>>(5)?.map(from_millis),
                })
            })?;
            let keys: rusqlite::Result<Vec<KeyInfo>> = rows.collect();
            keys
        })
        .await
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        self.with_conn("purge_expired", |conn| {
            conn.execute(
                "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now_millis()],
            )
        })
        .await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.with_conn("ping", |conn| conn.query_row("SELECT 1", [], |_| Ok(())))
            .await
    }

    async fn memory_stats(&self) -> Result<MemoryStats, CacheError> {
        let capacity_bytes = self.capacity_bytes;
        self.with_conn("memory_stats", move |conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(length(key) + length(value)), 0), COUNT(*)
                 FROM cache_entries",
                [],
                |row| {
                    Ok(MemoryStats {
                        used_bytes: row.get::<_, i64>(0)? as u64,
                        total_bytes: capacity_bytes,
                        key_count: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
        })
        .await
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

/// SQLite GLOB reads `[...]` as a character class; only `*` and `?` are
/// wildcards in cache patterns
fn literal_brackets(pattern: &str) -> String {
    pattern.replace('[', "[[]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_roundtrip_and_access_tracking() {
        let store = SqliteCacheStore::in_memory(1 << 20).unwrap();
        store.set("rag:a", b"payload".to_vec(), HOUR).await.unwrap();

        assert_eq!(store.get("rag:a").await.unwrap(), Some(b"payload".to_vec()));
        assert_eq!(store.get("rag:b").await.unwrap(), None);

        let keys = store.scan("rag:*").await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].access_count, 1);
        assert_eq!(keys[0].size_bytes, 5 + 7);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_expiry_and_patterns() {
        let store = SqliteCacheStore::in_memory(1 << 20).unwrap();
        store
            .set("rag:short", b"x".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();
        store.set("rag:long", b"y".to_vec(), HOUR).await.unwrap();
        store.set("other", b"z".to_vec(), HOUR).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.get("rag:short").await.unwrap(), None);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.delete_pattern("rag:*").await.unwrap(), 1);

        let stats = store.memory_stats().await.unwrap();
        assert_eq!(stats.key_count, 1);
        assert_eq!(stats.used_bytes, 6);
    }

    #[tokio::test]
    async fn test_brackets_match_literally() {
        let store = SqliteCacheStore::in_memory(1 << 20).unwrap();
        for key in ["rag:[a]", "rag:a", "rag:b"] {
            store.set(key, b"x".to_vec(), HOUR).await.unwrap();
        }

        let keys = store.scan("rag:[ab]").await.unwrap();
        assert!(keys.is_empty());
        assert_eq!(store.delete_pattern("rag:[a]*").await.unwrap(), 1);
        assert_eq!(store.get("rag:a").await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache").join("cache.sqlite");

        {
            let store = SqliteCacheStore::open(&path, 1 << 20).unwrap();
            store.set("k", b"v".to_vec(), HOUR).await.unwrap();
        }

        let store = SqliteCacheStore::open(&path, 1 << 20).unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }
}
