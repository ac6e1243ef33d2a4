//! Cache policy, metrics, eviction and warm-up

use super::service::CacheService;
use super::store::MemoryStats;
use super::CacheError;
use crate::error::{Result, ValidationError};
use crate::monitor::OperationKind;
use crate::retrieval::{RetrievalConfig, SearchResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Memory usage the performance score considers ideal, as a fraction of
/// `memory_threshold`
const TARGET_MEMORY_FRACTION: f64 = 0.7;

/// Runtime-tunable cache policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    pub max_memory_mb: u64,
    pub max_entries: u64,
    pub default_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Fraction of `max_memory_mb` above which optimization evicts, in (0, 1]
    pub memory_threshold: f64,
    /// Hit rate below which a recommendation is produced, in (0, 1]
    pub hit_rate_threshold: f64,
    pub enable_auto_cleanup: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            max_memory_mb: 256,
            max_entries: 10_000,
            default_ttl_secs: 3600,
            cleanup_interval_secs: 300,
            memory_threshold: 0.8,
            hit_rate_threshold: 0.5,
            enable_auto_cleanup: true,
        }
    }
}

impl CachePolicy {
    pub fn validation_errors(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for (field, value) in [
            ("max_memory_mb", self.max_memory_mb),
            ("max_entries", self.max_entries),
            ("default_ttl_secs", self.default_ttl_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
        ] {
            if value == 0 {
                errors.push(ValidationError::new(field, "Must be greater than 0"));
            }
        }

        for (field, value) in [
            ("memory_threshold", self.memory_threshold),
            ("hit_rate_threshold", self.hit_rate_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                errors.push(ValidationError::new(
                    field,
                    format!("Must be in (0, 1], got {}", value),
                ));
            }
        }

        errors
    }

    fn memory_limit_bytes(&self) -> u64 {
        self.max_memory_mb.saturating_mul(BYTES_PER_MB)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub memory_used_bytes: u64,
    pub memory_usage_percent: f64,
    pub entry_count: u64,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
    pub last_cleanup: Option<DateTime<Utc>>,
    /// 0 to 100
    pub performance_score: f64,
    pub recommendations: Vec<String>,
}

/// Runs a real search for cache warm-up
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &str, config: &RetrievalConfig) -> Result<Vec<SearchResult>>;
}

struct CleanupTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct CacheManager {
    service: Arc<CacheService>,
    policy: Arc<RwLock<CachePolicy>>,
    last_cleanup: StdMutex<Option<DateTime<Utc>>>,
    cleanup: Mutex<Option<CleanupTask>>,
}

impl CacheManager {
    pub fn new(service: Arc<CacheService>) -> Arc<Self> {
        Arc::new(Self {
            policy: service.policy(),
            service,
            last_cleanup: StdMutex::new(None),
            cleanup: Mutex::new(None),
        })
    }

    pub fn service(&self) -> &Arc<CacheService> {
        &self.service
    }

    pub async fn policy(&self) -> CachePolicy {
        self.policy.read().await.clone()
    }

    /// Validate and swap the policy, restarting the cleanup loop if its
    /// toggle or interval changed. Invalid policies are rejected.
    pub async fn update_policy(self: &Arc<Self>, policy: CachePolicy) -> bool {
        let errors = policy.validation_errors();
        if !errors.is_empty() {
            tracing::warn!(
                "Rejected cache policy update: {}",
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ")
            );
            return false;
        }

        let previous = {
            let mut current = self.policy.write().await;
            std::mem::replace(&mut *current, policy.clone())
        };
        tracing::info!("Cache policy updated");

        let loop_changed = previous.enable_auto_cleanup != policy.enable_auto_cleanup
            || previous.cleanup_interval_secs != policy.cleanup_interval_secs;
        if loop_changed {
            self.stop_auto_cleanup().await;
            if policy.enable_auto_cleanup {
                self.start_auto_cleanup().await;
            }
        }

        true
    }

    /// Spawn the background cleanup loop if the policy enables it
    pub async fn start_auto_cleanup(self: &Arc<Self>) {
        let policy = self.policy().await;
        if !policy.enable_auto_cleanup {
            return;
        }

        let mut cleanup = self.cleanup.lock().await;
        if cleanup.is_some() {
            return;
        }

        let interval = Duration::from_secs(policy.cleanup_interval_secs);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let manager = Arc::downgrade(self);
        let handle = tokio::spawn(cleanup_loop(manager, interval, shutdown_rx));

        tracing::info!("Cache auto cleanup every {:?}", interval);
        *cleanup = Some(CleanupTask { shutdown, handle });
    }

    /// Signal the cleanup loop and wait for it to finish
    pub async fn stop_auto_cleanup(&self) {
        let task = self.cleanup.lock().await.take();
        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            if let Err(e) = task.handle.await {
                tracing::warn!("Cache cleanup task ended abnormally: {}", e);
            }
            tracing::debug!("Cache auto cleanup stopped");
        }
    }

    pub async fn is_auto_cleanup_running(&self) -> bool {
        self.cleanup.lock().await.is_some()
    }

    /// Purge expired entries, then evict least recently used ones until
    /// memory and entry limits are met. Returns the actions taken.
    pub async fn optimize(&self) -> Vec<String> {
        match self.try_optimize().await {
            Ok(actions) => actions,
            Err(e) => {
                tracing::warn!("Cache optimization aborted: {}", e);
                vec![format!("Optimization aborted: {}", e)]
            }
        }
    }

    async fn try_optimize(&self) -> std::result::Result<Vec<String>, CacheError> {
        let policy = self.policy().await;
        let monitor = self.service.monitor();
        let store = monitor.store();
        let limit = policy.memory_limit_bytes();
        let target_bytes = (limit as f64 * policy.memory_threshold) as u64;
        let over = |stats: &MemoryStats| {
            stats.used_bytes > target_bytes || stats.key_count > policy.max_entries
        };

        let mut actions = Vec::new();
        let stats = monitor
            .protect(OperationKind::Read, store.memory_stats())
            .await?;
        if !over(&stats) {
            return Ok(actions);
        }

        let purged = monitor
            .protect(OperationKind::Write, store.purge_expired())
            .await?;
        actions.push(format!("Purged {} expired entries", purged));

        let mut stats = monitor
            .protect(OperationKind::Read, store.memory_stats())
            .await?;

        if over(&stats) {
            let pattern = format!("{}*", self.service.key_prefix());
            let mut keys = monitor
                .protect(OperationKind::Read, store.scan(&pattern))
                .await?;
            let now = Utc::now();
            keys.sort_by(|a, b| {
                b.idle(now)
                    .cmp(&a.idle(now))
                    .then(a.access_count.cmp(&b.access_count))
            });

            let mut evicted = 0usize;
            let mut freed = 0u64;
            for key in keys {
                if !over(&stats) {
                    break;
                }
                if monitor
                    .protect(OperationKind::Write, store.delete(&key.key))
                    .await?
                {
                    stats.used_bytes = stats.used_bytes.saturating_sub(key.size_bytes);
                    stats.key_count = stats.key_count.saturating_sub(1);
                    freed += key.size_bytes;
                    evicted += 1;
                }
            }
            actions.push(format!(
                "Evicted {} least recently used entries ({} bytes)",
                evicted, freed
            ));
        }

        *self
            .last_cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        tracing::info!("Cache optimized: {}", actions.join(", "));
        Ok(actions)
    }

    /// Populate the cache for each (query, config) pair that is not already
    /// cached. Returns how many entries were written.
    pub async fn warm_up(
        &self,
        queries: &[(String, RetrievalConfig)],
        executor: &dyn QueryExecutor,
    ) -> usize {
        let mut warmed = 0;
        for (query, config) in queries {
            if self.service.contains(query, config).await {
                tracing::debug!("Warm-up skipping cached query: {}", query);
                continue;
            }

            match executor.execute(query, config).await {
                Ok(results) => match self.service.try_set(query, config, &results).await {
                    Ok(true) => warmed += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!("Warm-up could not cache '{}': {}", query, e),
                },
                Err(e) => tracing::warn!("Warm-up search failed for '{}': {}", query, e),
            }
        }
        tracing::info!("Cache warm-up stored {} of {} queries", warmed, queries.len());
        warmed
    }

    pub async fn metrics(&self) -> CacheMetrics {
        let policy = self.policy().await;
        let service = self.service.stats();
        let monitor = self.service.monitor();
        let memory = monitor
            .protect(OperationKind::Read, monitor.store().memory_stats())
            .await
            .unwrap_or_default();

        let lookups = service.hits + service.misses;
        let ratio = |n: u64, d: u64| if d == 0 { 0.0 } else { n as f64 / d as f64 };
        let hit_rate = ratio(service.hits, lookups);
        let miss_rate = ratio(service.misses, lookups);
        let error_rate = ratio(service.errors, service.operations.max(service.errors));
        let usage = ratio(memory.used_bytes, policy.memory_limit_bytes());

        let signals = Signals {
            lookups,
            hit_rate,
            usage,
            error_rate,
            avg_response_time_ms: service.avg_response_time_ms,
            entry_count: memory.key_count,
        };

        CacheMetrics {
            memory_used_bytes: memory.used_bytes,
            memory_usage_percent: usage * 100.0,
            entry_count: memory.key_count,
            hits: service.hits,
            misses: service.misses,
            errors: service.errors,
            hit_rate,
            miss_rate,
            error_rate,
            avg_response_time_ms: service.avg_response_time_ms,
            last_cleanup: *self
                .last_cleanup
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            performance_score: performance_score(&signals, &policy),
            recommendations: recommendations(&signals, &policy),
        }
    }

    pub async fn shutdown(&self) {
        self.stop_auto_cleanup().await;
    }
}

async fn cleanup_loop(
    manager: Weak<CacheManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let actions = manager.optimize().await;
                if !actions.is_empty() {
                    tracing::debug!("Auto cleanup: {}", actions.join(", "));
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

struct Signals {
    lookups: u64,
    hit_rate: f64,
    usage: f64,
    error_rate: f64,
    avg_response_time_ms: f64,
    entry_count: u64,
}

/// Hit rate 40%, memory balance 30%, error rate 20%, latency 10%
fn performance_score(signals: &Signals, policy: &CachePolicy) -> f64 {
    let target = TARGET_MEMORY_FRACTION * policy.memory_threshold;
    let memory_balance = if signals.usage <= target {
        signals.usage / target
    } else {
        (1.0 - (signals.usage - target) / (1.0 - target).max(f64::EPSILON)).max(0.0)
    };

    // 10ms or less is full marks, 100ms or more is zero
    let latency = (1.0 - (signals.avg_response_time_ms - 10.0).max(0.0) / 90.0).clamp(0.0, 1.0);

    let score = signals.hit_rate * 40.0
        + memory_balance * 30.0
        + (1.0 - signals.error_rate) * 20.0
        + latency * 10.0;
    score.clamp(0.0, 100.0)
}

fn recommendations(signals: &Signals, policy: &CachePolicy) -> Vec<String> {
    let mut out = Vec::new();
    let target = TARGET_MEMORY_FRACTION * policy.memory_threshold;

    if signals.lookups > 0 && signals.hit_rate < policy.hit_rate_threshold {
        out.push(format!(
            "Hit rate {:.1}% is below the {:.1}% target; warm frequent queries or raise default_ttl_secs",
            signals.hit_rate * 100.0,
            policy.hit_rate_threshold * 100.0
        ));
    }
    if signals.usage > policy.memory_threshold {
        out.push(format!(
            "Memory usage {:.1}% exceeds the {:.1}% threshold; run optimize or raise max_memory_mb",
            signals.usage * 100.0,
            policy.memory_threshold * 100.0
        ));
    } else if signals.entry_count > 0 && signals.usage < target * 0.25 {
        out.push(format!(
            "Memory usage {:.1}% is far below the {:.1}% target; max_memory_mb could be lowered",
            signals.usage * 100.0,
            target * 100.0
        ));
    }
    if signals.entry_count > policy.max_entries {
        out.push(format!(
            "{} entries exceed max_entries ({}); run optimize",
            signals.entry_count, policy.max_entries
        ));
    }
    if signals.error_rate > 0.05 {
        out.push(format!(
            "Cache error rate {:.1}% is high; check cache store connectivity",
            signals.error_rate * 100.0
        ));
    }
    if signals.avg_response_time_ms > 50.0 {
        out.push(format!(
            "Average cache response {:.1}ms is slow",
            signals.avg_response_time_ms
        ));
    }
    out
}
