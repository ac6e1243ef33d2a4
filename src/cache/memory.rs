use super::store::{glob_matcher, CacheStore, KeyInfo, MemoryStats};
use super::CacheError;
use ahash::AHashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

struct Entry {
    value: Vec<u8>,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    access_count: u64,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn size(key: &str, value: &[u8]) -> u64 {
        (key.len() + value.len()) as u64
    }

    fn info(&self, key: &str) -> KeyInfo {
        KeyInfo {
            key: key.to_string(),
            size_bytes: Self::size(key, &self.value),
            created_at: self.created_at,
            last_accessed: self.last_accessed,
            access_count: self.access_count,
            expires_at: self.expires_at,
        }
    }
}

/// In-process cache store
///
/// Size accounting counts key plus value bytes against `capacity_bytes`.
/// The store never evicts on its own; the cache manager does.
pub struct MemoryCacheStore {
    entries: Mutex<AHashMap<String, Entry>>,
    capacity_bytes: u64,
}

impl MemoryCacheStore {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            entries: Mutex::new(AHashMap::new()),
            capacity_bytes,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AHashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    if ttl.is_zero() {
        return None;
    }
    chrono::Duration::from_std(ttl).ok().map(|ttl| now + ttl)
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Utc::now();
        let mut entries = self.lock();

        match entries.get_mut(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => {
                entry.last_accessed = now;
                entry.access_count += 1;
                Ok(Some(entry.value.clone()))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let now = Utc::now();
        self.lock().insert(
            key.to_string(),
            Entry {
                value,
                created_at: now,
                last_accessed: now,
                access_count: 0,
                expires_at: expiry(now, ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.lock().remove(key).is_some())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let matcher = glob_matcher(pattern)?;
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !matcher.is_match(key));
        Ok(before - entries.len())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<KeyInfo>, CacheError> {
        let matcher = glob_matcher(pattern)?;
        let now = Utc::now();
        let mut keys: Vec<KeyInfo> = self
            .lock()
            .iter()
            .filter(|(key, entry)| !entry.is_expired(now) && matcher.is_match(key))
            .map(|(key, entry)| entry.info(key))
            .collect();
        keys.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(keys)
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Utc::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before - entries.len())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn memory_stats(&self) -> Result<MemoryStats, CacheError> {
        let entries = self.lock();
        Ok(MemoryStats {
            used_bytes: entries
                .iter()
                .map(|(key, entry)| Entry::size(key, &entry.value))
                .sum(),
            total_bytes: self.capacity_bytes,
            key_count: entries.len() as u64,
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}
