//! Configuration management for ragpipe
//!
//! Loading, validation and environment overrides for the TOML config file,
//! plus [`ConfigManager`] which keeps the last valid configuration around so a
//! broken reload never takes the pipeline down.

use crate::cache::CachePolicy;
use crate::error::{Result, RetrievalError};
use crate::fallback::Locale;
use crate::monitor::AlertThresholds;
use crate::rerank::{ModelConfig, ModelKind};
use crate::retrieval::{FusionConfig, FusionStrategy, RetrievalConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod manager;
mod validator;

pub use manager::{ConfigManager, ConfigSource, LoadedConfig};
pub use validator::ConfigValidator;

pub const SCHEMA_VERSION: &str = "1.0.0";

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    /// Per-query defaults applied when callers omit a field
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub errors: ErrorConfig,
}

/// Metadata about the configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Search mode router configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub fusion: FusionStrategy,
    pub semantic_weight: f32,
    pub keyword_weight: f32,
    pub rrf_k: f32,
    /// Each hybrid leg fetches `top_k * candidate_multiplier` candidates
    pub candidate_multiplier: usize,
    pub timeout_ms: u64,
    pub extra_stopwords: Vec<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            fusion: FusionStrategy::Weighted,
            semantic_weight: 1.0,
            keyword_weight: 0.3,
            rrf_k: 60.0,
            candidate_multiplier: 2,
            timeout_ms: 5000,
            extra_stopwords: Vec::new(),
        }
    }
}

impl SearchConfig {
    pub fn fusion_config(&self) -> Result<FusionConfig> {
        FusionConfig::new(
            self.fusion,
            self.rrf_k,
            self.semantic_weight,
            self.keyword_weight,
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Which cache store backs the cache service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Sqlite,
}

/// Cache layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub sqlite_path: PathBuf,
    /// Capacity reported by the store as its total memory
    pub capacity_mb: u64,
    pub key_prefix: String,
    pub operation_timeout_ms: u64,
    /// Serialized payloads larger than this are zstd-compressed
    pub compression_threshold_bytes: usize,
    pub policy: CachePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            sqlite_path: PathBuf::from("~/.ragpipe/cache.sqlite"),
            capacity_mb: 512,
            key_prefix: "ragpipe:search:".to_string(),
            operation_timeout_ms: 250,
            compression_threshold_bytes: 1024,
            policy: CachePolicy::default(),
        }
    }
}

impl CacheConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Cache monitor, circuit breaker and alerting configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub health_check_timeout_ms: u64,
    /// Health round-trips slower than this report Degraded
    pub slow_threshold_ms: u64,
    pub alert_window_secs: u64,
    pub alert_thresholds: AlertThresholds,
    /// Also print alerts to stderr
    pub console_alerts: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            health_check_timeout_ms: 1000,
            slow_threshold_ms: 200,
            alert_window_secs: 300,
            alert_thresholds: AlertThresholds::default(),
            console_alerts: false,
        }
    }
}

impl MonitorConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn alert_window(&self) -> Duration {
        Duration::from_secs(self.alert_window_secs)
    }
}

/// Reranking service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    pub primary: ModelConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<ModelConfig>,
    pub batch_size: usize,
    /// Passage text is truncated to this many characters before scoring
    pub max_length: usize,
    pub timeout_ms: u64,
    /// Concurrent inference calls allowed against the shared model
    pub max_concurrency: usize,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            primary: ModelConfig::new(ModelKind::Lexical, "lexical-overlap"),
            fallback: None,
            batch_size: 16,
            max_length: 512,
            timeout_ms: 3000,
            max_concurrency: 2,
        }
    }
}

impl RerankConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Error handling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorConfig {
    pub locale: Locale,
    /// Same error seen this many times within the window raises an alert
    pub repeated_error_threshold: u32,
    pub window_secs: u64,
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            locale: Locale::En,
            repeated_error_threshold: 5,
            window_secs: 300,
        }
    }
}

impl ErrorConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RetrievalError::ConfigLoad {
                path: Some(path.to_path_buf()),
                message: "Configuration file not found".to_string(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| RetrievalError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        // Apply environment variable overrides
        config.apply_env_overrides();

        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RetrievalError::Io {
                source: e,
                context: format!("Failed to create config directory: {:?}", parent),
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| RetrievalError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: RAGPIPE_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(std::env::vars());
    }

    pub(crate) fn apply_overrides(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        for (key, value) in vars {
            if let Some(config_key) = key.strip_prefix("RAGPIPE_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "RETRIEVAL__TOP_K" => self.retrieval.top_k = parse_value(path, value)?,
            "RETRIEVAL__SIMILARITY_THRESHOLD" => {
                self.retrieval.similarity_threshold = parse_value(path, value)?
            }
            "RETRIEVAL__SEARCH_MODE" => self.retrieval.search_mode = value.parse()?,
            "RETRIEVAL__ENABLE_RERANK" => self.retrieval.enable_rerank = parse_value(path, value)?,
            "RETRIEVAL__ENABLE_CACHE" => self.retrieval.enable_cache = parse_value(path, value)?,
            "CACHE__BACKEND" => {
                self.cache.backend = match value.to_ascii_lowercase().as_str() {
                    "memory" => CacheBackend::Memory,
                    "sqlite" => CacheBackend::Sqlite,
                    _ => return Err(invalid_value(path, value, "cache backend")),
                }
            }
            "CACHE__SQLITE_PATH" => self.cache.sqlite_path = PathBuf::from(value),
            "CACHE__DEFAULT_TTL_SECS" => {
                self.cache.policy.default_ttl_secs = parse_value(path, value)?
            }
            "RERANK__PRIMARY_KIND" => self.rerank.primary.kind = value.parse()?,
            "RERANK__PRIMARY_MODEL" => self.rerank.primary.name = value.to_string(),
            "ERRORS__LOCALE" => self.errors.locale = value.parse()?,
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| RetrievalError::ConfigLoad {
            path: None,
            message: "Cannot determine config directory".to_string(),
        })?;

        Ok(config_dir.join("ragpipe").join("config.toml"))
    }
}

fn parse_value<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| invalid_value(path, value, std::any::type_name::<T>()))
}

fn invalid_value(path: &str, value: &str, expected: &str) -> RetrievalError {
    RetrievalError::ConfigValidation {
        errors: vec![crate::error::ValidationError::new(
            path,
            format!("Cannot parse '{}' as {}", value, expected),
        )],
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta: MetaConfig {
                schema_version: SCHEMA_VERSION.to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            retrieval: RetrievalConfig::default(),
            search: SearchConfig::default(),
            cache: CacheConfig::default(),
            monitor: MonitorConfig::default(),
            rerank: RerankConfig::default(),
            errors: ErrorConfig::default(),
        }
    }
}
