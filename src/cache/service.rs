use super::codec::{decode_entry, encode_entry, CacheEntry};
use super::key::cache_key;
use super::manager::CachePolicy;
use super::CacheError;
use crate::config::CacheConfig;
use crate::monitor::{CacheMonitor, OperationKind};
use crate::retrieval::{RetrievalConfig, SearchResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Outcome of a cache lookup
#[derive(Debug)]
pub enum CacheLookup {
    Hit(Vec<SearchResult>),
    Miss,
    /// Caching disabled for this call or globally; the store was not touched
    Bypassed,
    /// Store unavailable or entry unreadable; treated as a miss
    Failed(CacheError),
}

impl CacheLookup {
    pub fn into_results(self) -> Option<Vec<SearchResult>> {
        match self {
            Self::Hit(results) => Some(results),
            _ => None,
        }
    }
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheServiceStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub sets: u64,
    /// Reads and writes that reached the store
    pub operations: u64,
    pub avg_response_time_ms: f64,
    pub enabled: bool,
}

/// Query-level cache over a monitored store
pub struct CacheService {
    monitor: Arc<CacheMonitor>,
    policy: Arc<RwLock<CachePolicy>>,
    key_prefix: String,
    compression_threshold: usize,
    enabled: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    sets: AtomicU64,
    operations: AtomicU64,
    response_micros: AtomicU64,
}

impl CacheService {
    pub fn new(monitor: Arc<CacheMonitor>, config: &CacheConfig) -> Self {
        Self {
            monitor,
            policy: Arc::new(RwLock::new(config.policy.clone())),
            key_prefix: config.key_prefix.clone(),
            compression_threshold: config.compression_threshold_bytes,
            enabled: AtomicBool::new(true),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            operations: AtomicU64::new(0),
            response_micros: AtomicU64::new(0),
        }
    }

    pub fn monitor(&self) -> &Arc<CacheMonitor> {
        &self.monitor
    }

    /// Policy shared with the cache manager
    pub fn policy(&self) -> Arc<RwLock<CachePolicy>> {
        Arc::clone(&self.policy)
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn key(&self, query: &str, config: &RetrievalConfig) -> String {
        cache_key(&self.key_prefix, query, config)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        tracing::info!("Cache {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn active_for(&self, config: &RetrievalConfig) -> bool {
        config.enable_cache && self.is_enabled()
    }

    pub async fn get(&self, query: &str, config: &RetrievalConfig) -> Option<Vec<SearchResult>> {
        self.lookup(query, config).await.into_results()
    }

    pub async fn lookup(&self, query: &str, config: &RetrievalConfig) -> CacheLookup {
        if !self.active_for(config) {
            return CacheLookup::Bypassed;
        }

        let key = self.key(query, config);
        let started = Instant::now();
        let read = self
            .monitor
            .protect(OperationKind::Read, self.monitor.store().get(&key))
            .await;
        self.record_timing(started);

        let bytes = match read {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cache miss for {}", key);
                return CacheLookup::Miss;
            }
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cache read failed, treating as miss: {}", e);
                return CacheLookup::Failed(e);
            }
        };

        match decode_entry(&bytes) {
            Ok(entry) if entry.key == key => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cache hit for {} ({} results)", key, entry.results.len());
                CacheLookup::Hit(entry.results)
            }
            decoded => {
                let error = match decoded {
                    Err(e) => e,
                    Ok(entry) => CacheError::Serialization(format!(
                        "entry stored under {} belongs to {}",
                        key, entry.key
                    )),
                };
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping unreadable cache entry {}: {}", key, error);
                let _ = self
                    .monitor
                    .protect(OperationKind::Write, self.monitor.store().delete(&key))
                    .await;
                CacheLookup::Failed(error)
            }
        }
    }

    /// Store results, logging and swallowing failures
    pub async fn set(&self, query: &str, config: &RetrievalConfig, results: &[SearchResult]) {
        if let Err(e) = self.try_set(query, config, results).await {
            tracing::warn!("Failed to cache results for query: {}", e);
        }
    }

    /// Store results. Ok(false) when caching is off for this call.
    pub async fn try_set(
        &self,
        query: &str,
        config: &RetrievalConfig,
        results: &[SearchResult],
    ) -> Result<bool, CacheError> {
        if !self.active_for(config) {
            return Ok(false);
        }

        let ttl_secs = match config.cache_ttl_override {
            Some(ttl) => ttl,
            None => self.policy.read().await.default_ttl_secs,
        };
        let key = self.key(query, config);
        let entry = CacheEntry {
            key: key.clone(),
            query: query.to_string(),
            mode: config.search_mode,
            results: results.to_vec(),
            created_at: chrono::Utc::now(),
            ttl_secs,
        };

        let bytes = encode_entry(&entry, self.compression_threshold).map_err(|e| {
            self.errors.fetch_add(1, Ordering::Relaxed);
            e
        })?;

        let started = Instant::now();
        let written = self
            .monitor
            .protect(
                OperationKind::Write,
                self.monitor
                    .store()
                    .set(&key, bytes, Duration::from_secs(ttl_secs)),
            )
            .await;
        self.record_timing(started);

        match written {
            Ok(()) => {
                self.sets.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cached {} results under {} for {}s", results.len(), key, ttl_secs);
                Ok(true)
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Whether a live entry exists; does not count as an access
    pub async fn contains(&self, query: &str, config: &RetrievalConfig) -> bool {
        if !self.active_for(config) {
            return false;
        }
        let key = self.key(query, config);
        self.monitor
            .protect(OperationKind::Read, self.monitor.store().scan(&key))
            .await
            .map(|keys| !keys.is_empty())
            .unwrap_or(false)
    }

    /// Delete entries matching a glob; defaults to this service's namespace
    pub async fn clear(&self, pattern: Option<&str>) -> Result<usize, CacheError> {
        let pattern = match pattern {
            Some(pattern) => pattern.to_string(),
            None => format!("{}*", self.key_prefix),
        };
        let deleted = self
            .monitor
            .protect(
                OperationKind::Write,
                self.monitor.store().delete_pattern(&pattern),
            )
            .await?;
        tracing::info!("Cleared {} cache entries matching {}", deleted, pattern);
        Ok(deleted)
    }

    fn record_timing(&self, started: Instant) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.response_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheServiceStats {
        let operations = self.operations.load(Ordering::Relaxed);
        let micros = self.response_micros.load(Ordering::Relaxed);
        CacheServiceStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            operations,
            avg_response_time_ms: if operations == 0 {
                0.0
            } else {
                micros as f64 / operations as f64 / 1000.0
            },
            enabled: self.is_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, MemoryCacheStore};
    use crate::config::MonitorConfig;
    use crate::monitor::AlertManager;

    fn service() -> CacheService {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new(1 << 20));
        let monitor = Arc::new(CacheMonitor::new(
            store,
            &MonitorConfig::default(),
            Duration::from_millis(250),
            Arc::new(AlertManager::new()),
        ));
        CacheService::new(monitor, &CacheConfig::default())
    }

    fn results() -> Vec<SearchResult> {
        vec![
            SearchResult::new("p1", "d1", "RAG is retrieval augmented generation", 0.9),
            SearchResult::new("p2", "d2", "Caches store results", 0.4),
        ]
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let service = service();
        let config = RetrievalConfig::default();

        assert!(service.get("what is RAG?", &config).await.is_none());
        assert!(service.try_set("what is RAG?", &config, &results()).await.unwrap());
        assert_eq!(service.get("what is RAG?", &config).await.unwrap(), results());
        assert!(service.contains("what is RAG?", &config).await);

        let stats = service.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
    }

    #[tokio::test]
    async fn test_disabled_call_bypasses_store() {
        let service = service();
        let config = RetrievalConfig {
            enable_cache: false,
            ..RetrievalConfig::default()
        };

        assert!(!service.try_set("q", &config, &results()).await.unwrap());
        assert!(matches!(service.lookup("q", &config).await, CacheLookup::Bypassed));
        assert_eq!(service.stats().operations, 0);
        assert!(service.monitor().store().scan("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_global_toggle() {
        let service = service();
        let config = RetrievalConfig::default();
        service.set("q", &config, &results()).await;

        service.set_enabled(false);
        assert!(service.get("q", &config).await.is_none());
        service.set_enabled(true);
        assert!(service.get("q", &config).await.is_some());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_deleted() {
        let service = service();
        let config = RetrievalConfig::default();
        let key = service.key("q", &config);
        service
            .monitor()
            .store()
            .set(&key, vec![42, 1, 2, 3], Duration::from_secs(60))
            .await
            .unwrap();

        assert!(matches!(
            service.lookup("q", &config).await,
            CacheLookup::Failed(CacheError::Serialization(_))
        ));
        assert!(service.monitor().store().scan("*").await.unwrap().is_empty());
        assert_eq!(service.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_clear_defaults_to_namespace() {
        let service = service();
        let config = RetrievalConfig::default();
        service.set("a", &config, &results()).await;
        service.set("b", &config, &results()).await;
        service
            .monitor()
            .store()
            .set("foreign:key", vec![1], Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(service.clear(None).await.unwrap(), 2);
        assert_eq!(service.clear(Some("*")).await.unwrap(), 1);
    }
}
