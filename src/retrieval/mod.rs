//! Search mode routing
//!
//! Semantic, keyword and hybrid retrieval over pluggable search providers,
//! with score fusion, de-duplication and a mode fallback chain.

mod deduplication;
mod fusion;
mod keywords;
mod result;
mod router;

pub use deduplication::deduplicate_results;
pub use fusion::{fuse_results, reciprocal_rank_fusion, weighted_fusion, FusionConfig, FusionStrategy};
pub use keywords::extract_keywords;
pub use result::{
    sort_by_score_desc, SearchResult, CHUNK_INDEX_KEY, FAILED_LEG_KEY, ORIGINAL_RANK_KEY,
    ORIGINAL_SCORE_KEY, PARTIAL_HYBRID_KEY, RERANK_SCORE_KEY, SEARCH_LEG_KEY,
};
pub use router::{ModeUsage, RouteOutcome, SearchModeRouter};

use crate::error::{RetrievalError, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Retrieval strategy for one query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Semantic,
    Keyword,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Keyword => "keyword",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "semantic" => Ok(Self::Semantic),
            "keyword" => Ok(Self::Keyword),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(RetrievalError::ConfigValidation {
                errors: vec![ValidationError::new(
                    "search_mode",
                    format!("Mode must be one of semantic, keyword, hybrid; got '{}'", other),
                )],
            }),
        }
    }
}

/// Effective parameters for one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Maximum number of results
    pub top_k: usize,

    /// Semantic results below this score are dropped
    pub similarity_threshold: f32,

    pub search_mode: SearchMode,

    pub enable_rerank: bool,

    pub enable_cache: bool,

    /// Cache TTL in seconds, overriding the policy default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_override: Option<u64>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            similarity_threshold: 0.0,
            search_mode: SearchMode::Hybrid,
            enable_rerank: true,
            enable_cache: true,
            cache_ttl_override: None,
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let errors = self.field_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn field_errors(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.top_k == 0 {
            errors.push(ValidationError::new(
                "top_k",
                "top_k must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            errors.push(ValidationError::new(
                "similarity_threshold",
                format!(
                    "similarity_threshold must be between 0.0 and 1.0, got {}",
                    self.similarity_threshold
                ),
            ));
        }
        if self.cache_ttl_override == Some(0) {
            errors.push(ValidationError::new(
                "cache_ttl_override",
                "cache TTL override must be greater than 0",
            ));
        }
        errors
    }
}

/// Caller-facing retrieval parameters; omitted fields take engine defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_mode: Option<SearchMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_rerank: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_cache: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_override: Option<u64>,
}

impl RetrievalOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = Some(threshold);
        self
    }

    pub fn search_mode(mut self, mode: SearchMode) -> Self {
        self.search_mode = Some(mode);
        self
    }

    pub fn enable_rerank(mut self, enabled: bool) -> Self {
        self.enable_rerank = Some(enabled);
        self
    }

    pub fn enable_cache(mut self, enabled: bool) -> Self {
        self.enable_cache = Some(enabled);
        self
    }

    pub fn cache_ttl(mut self, ttl_secs: u64) -> Self {
        self.cache_ttl_override = Some(ttl_secs);
        self
    }

    /// Merge with defaults. Invalid caller values are replaced by the
    /// default value and reported back as validation errors.
    pub fn resolve(&self, defaults: &RetrievalConfig) -> (RetrievalConfig, Vec<ValidationError>) {
        let mut config = RetrievalConfig {
            top_k: self.top_k.unwrap_or(defaults.top_k),
            similarity_threshold: self
                .similarity_threshold
                .unwrap_or(defaults.similarity_threshold),
            search_mode: self.search_mode.unwrap_or(defaults.search_mode),
            enable_rerank: self.enable_rerank.unwrap_or(defaults.enable_rerank),
            enable_cache: self.enable_cache.unwrap_or(defaults.enable_cache),
            cache_ttl_override: self.cache_ttl_override.or(defaults.cache_ttl_override),
        };

        let errors = config.field_errors();
        for error in &errors {
            match error.path.as_str() {
                "top_k" => config.top_k = defaults.top_k,
                "similarity_threshold" => {
                    config.similarity_threshold = defaults.similarity_threshold
                }
                "cache_ttl_override" => config.cache_ttl_override = defaults.cache_ttl_override,
                _ => {}
            }
        }

        (config, errors)
    }
}

impl From<RetrievalConfig> for RetrievalOptions {
    fn from(config: RetrievalConfig) -> Self {
        Self {
            top_k: Some(config.top_k),
            similarity_threshold: Some(config.similarity_threshold),
            search_mode: Some(config.search_mode),
            enable_rerank: Some(config.enable_rerank),
            enable_cache: Some(config.enable_cache),
            cache_ttl_override: config.cache_ttl_override,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!("Hybrid".parse::<SearchMode>().unwrap(), SearchMode::Hybrid);
        assert_eq!(" keyword ".parse::<SearchMode>().unwrap(), SearchMode::Keyword);
        assert!("fuzzy".parse::<SearchMode>().is_err());
    }

    #[test]
    fn test_resolve_uses_defaults() {
        let defaults = RetrievalConfig::default();
        let (config, errors) = RetrievalOptions::new()
            .search_mode(SearchMode::Keyword)
            .resolve(&defaults);

        assert!(errors.is_empty());
        assert_eq!(config.search_mode, SearchMode::Keyword);
        assert_eq!(config.top_k, defaults.top_k);
        assert!(config.enable_cache);
    }

    #[test]
    fn test_resolve_reverts_invalid_fields() {
        let defaults = RetrievalConfig::default();
        let (config, errors) = RetrievalOptions::new()
            .top_k(0)
            .similarity_threshold(1.5)
            .resolve(&defaults);

        assert_eq!(errors.len(), 2);
        assert_eq!(config.top_k, defaults.top_k);
        assert_eq!(config.similarity_threshold, defaults.similarity_threshold);
        assert!(config.validate().is_ok());
    }
}
