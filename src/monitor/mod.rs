//! Cache health monitoring
//!
//! [`CacheMonitor`] wraps every cache store call in a timeout and the
//! [`CircuitBreaker`], keeps rolling error counters that feed the
//! [`AlertManager`], and runs synthetic health checks.

mod alerts;
mod breaker;

pub use alerts::{
    Alert, AlertHandler, AlertLevel, AlertManager, AlertThresholds, CallbackAlertHandler,
    ConsoleAlertHandler, LogAlertHandler,
};
pub use breaker::{CircuitBreaker, CircuitBreakerState, CircuitState, Permit};

use crate::cache::{CacheError, CacheStore};
use crate::config::MonitorConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

const BREAKER_ALERT_KEY: &str = "cache.circuit_breaker";
const HEALTH_KEY_PREFIX: &str = "__ragpipe_health__:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheHealth {
    pub status: HealthStatus,
    pub message: String,
    pub latency_ms: Option<f64>,
    pub checked_at: Option<DateTime<Utc>>,
}

impl CacheHealth {
    fn unknown() -> Self {
        Self {
            status: HealthStatus::Unknown,
            message: "No health check has run yet".to_string(),
            latency_ms: None,
            checked_at: None,
        }
    }
}

/// Which side of the store a protected call touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CounterKind {
    ConnectionFailures,
    ReadErrors,
    WriteErrors,
    Timeouts,
}

impl CounterKind {
    fn index(self) -> usize {
        self as usize
    }

    fn alert_key(self) -> &'static str {
        match self {
            Self::ConnectionFailures => "cache.connection_failures",
            Self::ReadErrors => "cache.read_errors",
            Self::WriteErrors => "cache.write_errors",
            Self::Timeouts => "cache.timeouts",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::ConnectionFailures => "connection failures",
            Self::ReadErrors => "read errors",
            Self::WriteErrors => "write errors",
            Self::Timeouts => "timeouts",
        }
    }

    fn level(self) -> AlertLevel {
        match self {
            Self::ConnectionFailures => AlertLevel::Error,
            Self::ReadErrors | Self::WriteErrors | Self::Timeouts => AlertLevel::Warning,
        }
    }
}

/// Totals since start plus current breaker state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStats {
    pub calls: u64,
    pub failures: u64,
    /// Calls refused by an open breaker
    pub rejected: u64,
    pub timeouts: u64,
    pub circuit_breaker: CircuitBreakerState,
    pub active_alerts: usize,
}

pub struct CacheMonitor {
    store: Arc<dyn CacheStore>,
    breaker: CircuitBreaker,
    alerts: Arc<AlertManager>,
    operation_timeout: Duration,
    health_timeout: Duration,
    slow_threshold: Duration,
    thresholds: AlertThresholds,
    window: Duration,
    windows: Mutex<[VecDeque<Instant>; 4]>,
    last_health: Mutex<CacheHealth>,
    calls: AtomicU64,
    failures: AtomicU64,
    rejected: AtomicU64,
    timeouts: AtomicU64,
}

impl CacheMonitor {
    pub fn new(
        store: Arc<dyn CacheStore>,
        config: &MonitorConfig,
        operation_timeout: Duration,
        alerts: Arc<AlertManager>,
    ) -> Self {
        Self {
            store,
            breaker: CircuitBreaker::new(config.failure_threshold, config.recovery_timeout()),
            alerts,
            operation_timeout,
            health_timeout: config.health_check_timeout(),
            slow_threshold: Duration::from_millis(config.slow_threshold_ms),
            thresholds: config.alert_thresholds.clone(),
            window: config.alert_window(),
            windows: Mutex::new(Default::default()),
            last_health: Mutex::new(CacheHealth::unknown()),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run a store call through the breaker under the operation timeout
    ///
    /// `operation` is not polled when the breaker rejects the call.
    pub async fn protect<T>(
        &self,
        kind: OperationKind,
        operation: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        let permit = match self.breaker.acquire() {
            Ok(permit) => permit,
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        self.calls.fetch_add(1, Ordering::Relaxed);

        let result = match tokio::time::timeout(self.operation_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(self.operation_timeout)),
        };

        match &result {
            Ok(_) => {
                if permit.succeed() {
                    self.alerts.resolve_key(BREAKER_ALERT_KEY);
                }
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                let opened = permit.fail();
                self.record_failure(kind, e);
                if opened {
                    self.alerts.raise(
                        BREAKER_ALERT_KEY,
                        AlertLevel::Critical,
                        "cache",
                        format!("Cache circuit breaker opened: {}", e),
                    );
                }
            }
        }

        result
    }

    fn record_failure(&self, kind: OperationKind, error: &CacheError) {
        let counter = match (error, kind) {
            (CacheError::Connection(_), _) => CounterKind::ConnectionFailures,
            (CacheError::Timeout(_), _) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                CounterKind::Timeouts
            }
            (_, OperationKind::Read) => CounterKind::ReadErrors,
            (_, OperationKind::Write) => CounterKind::WriteErrors,
        };
        let threshold = match counter {
            CounterKind::ConnectionFailures => self.thresholds.connection_failures,
            CounterKind::ReadErrors => self.thresholds.read_errors,
            CounterKind::WriteErrors => self.thresholds.write_errors,
            CounterKind::Timeouts => self.thresholds.timeouts,
        };

        let now = Instant::now();
        let count = {
            let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
            let events = &mut windows[counter.index()];
            events.push_back(now);
            while events
                .front()
                .is_some_and(|at| now.duration_since(*at) > self.window)
            {
                events.pop_front();
            }
            events.len()
        };

        tracing::debug!("Cache {} in window: {}", counter.label(), count);

        if count >= threshold as usize {
            self.alerts.raise(
                counter.alert_key(),
                counter.level(),
                "cache",
                format!(
                    "{} cache {} within {:?} (threshold {}): {}",
                    count,
                    counter.label(),
                    self.window,
                    threshold,
                    error
                ),
            );
        }
    }

    /// Ping, then a synthetic write/read/delete round-trip
    pub async fn health_check(&self) -> CacheHealth {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.health_timeout, self.probe()).await;
        let latency = started.elapsed();

        let (status, message) = match outcome {
            Err(_) => (
                HealthStatus::Unhealthy,
                format!("Health check timed out after {:?}", self.health_timeout),
            ),
            Ok(Err(ProbeFailure::Connection(e))) => {
                (HealthStatus::Unhealthy, format!("Store unreachable: {}", e))
            }
            Ok(Err(ProbeFailure::Operation(e))) => {
                (HealthStatus::Degraded, format!("Store operation failed: {}", e))
            }
            Ok(Ok(())) if latency > self.slow_threshold => (
                HealthStatus::Degraded,
                format!("Slow round-trip: {:?}", latency),
            ),
            Ok(Ok(())) => (HealthStatus::Healthy, "OK".to_string()),
        };

        if status != HealthStatus::Healthy {
            tracing::warn!("Cache health {}: {}", status.as_str(), message);
        }

        let health = CacheHealth {
            status,
            message,
            latency_ms: Some(latency.as_secs_f64() * 1000.0),
            checked_at: Some(Utc::now()),
        };
        *self
            .last_health
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = health.clone();
        health
    }

    async fn probe(&self) -> Result<(), ProbeFailure> {
        self.store.ping().await.map_err(ProbeFailure::Connection)?;

        let token = uuid::Uuid::new_v4().to_string();
        let key = format!("{}{}", HEALTH_KEY_PREFIX, token);
        self.store
            .set(&key, token.clone().into_bytes(), Duration::from_secs(60))
            .await
            .map_err(ProbeFailure::Operation)?;
        let read = self.store.get(&key).await.map_err(ProbeFailure::Operation)?;
        self.store
            .delete(&key)
            .await
            .map_err(ProbeFailure::Operation)?;

        if read.as_deref() != Some(token.as_bytes()) {
            return Err(ProbeFailure::Operation(CacheError::operation(
                "health_check",
                "read back a different value than written",
            )));
        }
        Ok(())
    }

    /// Result of the most recent health check, Unknown before the first
    pub fn last_health(&self) -> CacheHealth {
        self.last_health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            calls: self.calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            circuit_breaker: self.breaker.snapshot(),
            active_alerts: self.alerts.active().len(),
        }
    }

    /// Operator reset of the breaker; resolves its alert
    pub fn reset_breaker(&self) {
        self.breaker.reset();
        self.alerts.resolve_key(BREAKER_ALERT_KEY);
    }
}

enum ProbeFailure {
    Connection(CacheError),
    Operation(CacheError),
}
