//! Search result caching
//!
//! - `CacheStore`: async key-value store with TTL (in-memory or SQLite)
//! - `CacheService`: query-level get/set with deterministic keys
//! - `CacheManager`: policy, metrics, eviction and warm-up

mod codec;
mod key;
mod manager;
mod memory;
mod service;
mod sqlite;
mod store;

pub use codec::{decode_entry, encode_entry, CacheEntry};
pub use key::cache_key;
pub use manager::{CacheManager, CacheMetrics, CachePolicy, QueryExecutor};
pub use memory::MemoryCacheStore;
pub use service::{CacheLookup, CacheService, CacheServiceStats};
pub use sqlite::SqliteCacheStore;
pub use store::{glob_matcher, CacheStore, KeyInfo, MemoryStats};

use crate::error::RetrievalError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache store connection failed: {0}")]
    Connection(String),

    #[error("Cache {operation} failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },

    #[error("Cache operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cache circuit breaker is open")]
    CircuitOpen,

    #[error("Cache entry serialization failed: {0}")]
    Serialization(String),
}

impl CacheError {
    pub fn operation(operation: &'static str, message: impl ToString) -> Self {
        Self::Operation {
            operation,
            message: message.to_string(),
        }
    }
}

impl From<CacheError> for RetrievalError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Connection(_) | CacheError::Timeout(_) | CacheError::CircuitOpen => {
                RetrievalError::CacheConnection(err.to_string())
            }
            CacheError::Operation { operation, message } => RetrievalError::CacheOperation {
                operation: operation.to_string(),
                message,
            },
            CacheError::Serialization(message) => RetrievalError::CacheOperation {
                operation: "decode".to_string(),
                message,
            },
        }
    }
}
