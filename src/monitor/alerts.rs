//! Alerts raised by the cache monitor and the error handler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Keep at most this many alerts (active plus resolved)
const MAX_HISTORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    /// Deduplication key; one unresolved alert per key
    pub key: String,
    pub level: AlertLevel,
    pub component: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
}

/// Counts within the alert window above which the monitor raises an alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub connection_failures: u32,
    pub read_errors: u32,
    pub write_errors: u32,
    pub timeouts: u32,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            connection_failures: 3,
            read_errors: 10,
            write_errors: 10,
            timeouts: 5,
        }
    }
}

pub trait AlertHandler: Send + Sync {
    fn handle(&self, alert: &Alert);
}

/// Emits alerts through `tracing`
pub struct LogAlertHandler;

impl AlertHandler for LogAlertHandler {
    fn handle(&self, alert: &Alert) {
        match alert.level {
            AlertLevel::Info => tracing::info!(
                alert_id = %alert.id,
                component = %alert.component,
                "{}",
                alert.message
            ),
            AlertLevel::Warning => tracing::warn!(
                alert_id = %alert.id,
                component = %alert.component,
                "{}",
                alert.message
            ),
            AlertLevel::Error | AlertLevel::Critical => tracing::error!(
                alert_id = %alert.id,
                component = %alert.component,
                level = %alert.level,
                "{}",
                alert.message
            ),
        }
    }
}

/// Prints alerts to stderr
pub struct ConsoleAlertHandler;

impl AlertHandler for ConsoleAlertHandler {
    fn handle(&self, alert: &Alert) {
        eprintln!(
            "[{}] {} {}: {}",
            alert.level,
            alert.timestamp.format("%Y-%m-%d %H:%M:%S"),
            alert.component,
            alert.message
        );
    }
}

pub struct CallbackAlertHandler {
    callback: Box<dyn Fn(&Alert) + Send + Sync>,
}

impl CallbackAlertHandler {
    pub fn new(callback: impl Fn(&Alert) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl AlertHandler for CallbackAlertHandler {
    fn handle(&self, alert: &Alert) {
        (self.callback)(alert)
    }
}

#[derive(Default)]
pub struct AlertManager {
    handlers: RwLock<Vec<Arc<dyn AlertHandler>>>,
    alerts: Mutex<Vec<Alert>>,
}

impl AlertManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn AlertHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Raise an alert unless one with the same key is still unresolved
    pub fn raise(
        &self,
        key: &str,
        level: AlertLevel,
        component: &str,
        message: impl Into<String>,
    ) -> Option<Alert> {
        let alert = {
            let mut alerts = self.alerts.lock().unwrap_or_else(PoisonError::into_inner);
            if alerts.iter().any(|a| a.key == key && !a.resolved) {
                return None;
            }

            let alert = Alert {
                id: uuid::Uuid::new_v4().to_string(),
                key: key.to_string(),
                level,
                component: component.to_string(),
                message: message.into(),
                timestamp: Utc::now(),
                resolved: false,
            };
            alerts.push(alert.clone());
            if alerts.len() > MAX_HISTORY {
                // Drop the oldest resolved alert, or the oldest alert if none is resolved
                let index = alerts.iter().position(|a| a.resolved).unwrap_or(0);
                alerts.remove(index);
            }
            alert
        };

        let handlers: Vec<Arc<dyn AlertHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler.handle(&alert);
        }

        Some(alert)
    }

    /// Mark an alert resolved. Returns false for unknown ids; resolving twice
    /// is a no-op that still returns true.
    pub fn resolve(&self, id: &str) -> bool {
        let mut alerts = self.alerts.lock().unwrap_or_else(PoisonError::into_inner);
        match alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.resolved = true;
                true
            }
            None => false,
        }
    }

    /// Resolve the unresolved alert for `key`, if any
    pub fn resolve_key(&self, key: &str) -> bool {
        let mut alerts = self.alerts.lock().unwrap_or_else(PoisonError::into_inner);
        match alerts.iter_mut().find(|a| a.key == key && !a.resolved) {
            Some(alert) => {
                alert.resolved = true;
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|a| !a.resolved)
            .cloned()
            .collect()
    }

    pub fn history(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
