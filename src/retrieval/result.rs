//! Passage results returned by search providers

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Metadata key holding the pre-rerank score
pub const ORIGINAL_SCORE_KEY: &str = "original_score";
/// Metadata key holding the rerank model score
pub const RERANK_SCORE_KEY: &str = "rerank_score";
/// Metadata key holding the provider rank (0-based)
pub const ORIGINAL_RANK_KEY: &str = "original_rank";
/// Metadata key holding the chunk position inside its document
pub const CHUNK_INDEX_KEY: &str = "chunk_index";
/// Metadata key naming the hybrid leg a result came from
pub const SEARCH_LEG_KEY: &str = "search_leg";
/// Metadata key set when one hybrid leg failed
pub const PARTIAL_HYBRID_KEY: &str = "partial_hybrid";
/// Metadata key naming the hybrid leg that failed
pub const FAILED_LEG_KEY: &str = "failed_leg";

/// A passage with relevance score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Passage identifier (unique across the corpus)
    pub id: String,

    /// Identifier of the source document
    pub document_id: String,

    /// Passage text
    pub content: String,

    /// Relevance score, higher is better
    pub score: f32,

    /// Ordered metadata map
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl SearchResult {
    pub fn new(
        id: impl Into<String>,
        document_id: impl Into<String>,
        content: impl Into<String>,
        score: f32,
    ) -> Self {
        Self {
            id: id.into(),
            document_id: document_id.into(),
            content: content.into(),
            score,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn chunk_index(&self) -> Option<u64> {
        self.metadata.get(CHUNK_INDEX_KEY).and_then(Value::as_u64)
    }

    pub fn original_rank(&self) -> Option<u64> {
        self.metadata.get(ORIGINAL_RANK_KEY).and_then(Value::as_u64)
    }

    pub fn original_score(&self) -> Option<f32> {
        self.metadata
            .get(ORIGINAL_SCORE_KEY)
            .and_then(Value::as_f64)
            .map(|s| s as f32)
    }

    pub fn rerank_score(&self) -> Option<f32> {
        self.metadata
            .get(RERANK_SCORE_KEY)
            .and_then(Value::as_f64)
            .map(|s| s as f32)
    }

    pub fn is_partial_hybrid(&self) -> bool {
        self.metadata
            .get(PARTIAL_HYBRID_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Get a short preview of the content (first N characters)
    pub fn preview(&self, max_chars: usize) -> String {
        match self.content.char_indices().nth(max_chars) {
            Some((idx, _)) => format!("{}...", &self.content[..idx]),
            None => self.content.clone(),
        }
    }
}

/// Sort results by score descending; stable for equal scores
pub fn sort_by_score_desc(results: &mut [SearchResult]) {
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
}
