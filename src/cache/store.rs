use super::CacheError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bookkeeping for one stored key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub key: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl KeyInfo {
    pub fn idle(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_accessed).to_std().unwrap_or_default()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub key_count: u64,
}

impl MemoryStats {
    /// Used fraction of capacity in [0, 1]
    pub fn usage_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.used_bytes as f64 / self.total_bytes as f64).min(1.0)
        }
    }
}

/// Key-value store backing the search cache
///
/// Patterns are globs: `*` matches any run of characters, `?` exactly one.
/// Every other character, brackets included, matches itself.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Value for `key`, or None when absent or expired. Counts as an access.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError>;

    /// Live keys matching `pattern`; does not count as an access
    async fn scan(&self, pattern: &str) -> Result<Vec<KeyInfo>, CacheError>;

    /// Drop expired entries, returning how many were removed
    async fn purge_expired(&self) -> Result<usize, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;

    async fn memory_stats(&self) -> Result<MemoryStats, CacheError>;

    fn name(&self) -> &str;
}

/// Compile a glob into an anchored regex
pub fn glob_matcher(pattern: &str) -> Result<Regex, CacheError> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| CacheError::operation("pattern", e))
}
