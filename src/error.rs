use crate::retrieval::SearchMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the retrieval pipeline
///
/// Every variant belongs to exactly one [`ErrorCategory`], which decides the
/// fallback strategy applied by [`crate::fallback::ErrorHandler`].
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// Query rejected before any provider was called
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// A single search mode failed (provider unreachable, timeout, ...)
    #[error("{mode} search failed: {message}")]
    SearchMode { mode: SearchMode, message: String },

    /// Every mode in the fallback chain failed
    #[error("All search modes exhausted (tried {attempted:?}): {last_error}")]
    SearchFallback {
        attempted: Vec<SearchMode>,
        last_error: String,
    },

    /// Cache store unreachable
    #[error("Cache store unreachable: {0}")]
    CacheConnection(String),

    /// Cache read/write/serialization failure
    #[error("Cache {operation} failed: {message}")]
    CacheOperation { operation: String, message: String },

    /// Reranking model could not be loaded
    #[error("Reranking model {model} unavailable: {message}")]
    RerankingModel { model: String, message: String },

    /// Reranking inference failed or timed out
    #[error("Reranking with {model} failed: {message}")]
    RerankingCompute { model: String, message: String },

    /// Configuration file could not be read or parsed
    #[error("Configuration load failed{}: {message}", path.as_ref().map(|p| format!(" ({})", p.display())).unwrap_or_default())]
    ConfigLoad {
        path: Option<PathBuf>,
        message: String,
    },

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },
}

impl RetrievalError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidQuery(_) | Self::SearchMode { .. } | Self::SearchFallback { .. } => {
                ErrorCategory::Search
            }
            Self::CacheConnection(_) | Self::CacheOperation { .. } => ErrorCategory::Cache,
            Self::RerankingModel { .. } | Self::RerankingCompute { .. } => ErrorCategory::Rerank,
            Self::ConfigLoad { .. }
            | Self::ConfigValidation { .. }
            | Self::Io { .. }
            | Self::Toml(_)
            | Self::TomlSerialization(_)
            | Self::Json { .. } => ErrorCategory::Config,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::InvalidQuery(_) | Self::CacheOperation { .. } | Self::RerankingCompute { .. } => {
                Severity::Low
            }
            Self::CacheConnection(_)
            | Self::RerankingModel { .. }
            | Self::ConfigValidation { .. }
            | Self::Io { .. }
            | Self::Toml(_)
            | Self::TomlSerialization(_)
            | Self::Json { .. } => Severity::Medium,
            Self::SearchMode { .. } | Self::ConfigLoad { .. } => Severity::High,
            Self::SearchFallback { .. } => Severity::Critical,
        }
    }

    /// Stable machine-readable code surfaced to callers
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidQuery(_) => "E_SEARCH_INVALID_QUERY",
            Self::SearchMode { .. } => "E_SEARCH_MODE",
            Self::SearchFallback { .. } => "E_SEARCH_EXHAUSTED",
            Self::CacheConnection(_) => "E_CACHE_CONNECTION",
            Self::CacheOperation { .. } => "E_CACHE_OPERATION",
            Self::RerankingModel { .. } => "E_RERANK_MODEL",
            Self::RerankingCompute { .. } => "E_RERANK_COMPUTE",
            Self::ConfigValidation { .. } => "E_CONFIG_VALIDATION",
            Self::ConfigLoad { .. }
            | Self::Io { .. }
            | Self::Toml(_)
            | Self::TomlSerialization(_)
            | Self::Json { .. } => "E_CONFIG_LOAD",
        }
    }
}

/// Which part of the pipeline an error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Search,
    Cache,
    Rerank,
    Config,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 4] = [Self::Search, Self::Cache, Self::Rerank, Self::Config];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Cache => "cache",
            Self::Rerank => "rerank",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration validation error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Result type for retrieval operations
pub type Result<T> = std::result::Result<T, RetrievalError>;
