//! ragpipe - Configurable retrieval pipeline for RAG backends
//!
//! Turns a query into a ranked, optionally cached, optionally reranked list of
//! passages, and keeps answering when the cache store, the reranking model or
//! one search mode fails.

pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod monitor;
pub mod providers;
pub mod rerank;
pub mod retrieval;

pub use engine::{
    ComponentHealth, Degradation, EngineMetrics, HealthReport, RetrievalEngine,
    RetrievalEngineBuilder, SearchResponse,
};
pub use error::{ErrorCategory, Result, RetrievalError, Severity};
pub use retrieval::{RetrievalConfig, RetrievalOptions, SearchMode, SearchResult};
