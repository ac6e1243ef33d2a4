//! Retrieval orchestrator
//!
//! [`RetrievalEngine`] wires the cache, search router, reranker, monitor and
//! error handler together and runs the per-request flow:
//! cache lookup, search, rerank, cache store. Every sub-service failure
//! short of exhausting the search chain degrades instead of failing, and the
//! degradation is reported back on the [`SearchResponse`].

use crate::cache::{
    CacheLookup, CacheManager, CacheMetrics, CachePolicy, CacheService, CacheStore,
    MemoryCacheStore, QueryExecutor, SqliteCacheStore,
};
use crate::config::{expand_tilde, CacheBackend, CacheConfig, Config, ConfigValidator};
use crate::error::{ErrorCategory, Result, RetrievalError};
use crate::fallback::{ErrorContext, ErrorHandler, ErrorResponse, ErrorStats, FallbackAction};
use crate::monitor::{
    Alert, AlertHandler, AlertManager, CacheHealth, CacheMonitor, CircuitBreakerState,
    CircuitState, ConsoleAlertHandler, HealthStatus, LogAlertHandler, MonitorStats,
};
use crate::providers::{EmbeddingProvider, KeywordSearchProvider, SimilaritySearchProvider};
use crate::rerank::{RerankingMetrics, RerankingService, ScoringModel};
use crate::retrieval::{
    ModeUsage, RetrievalConfig, RetrievalOptions, SearchMode, SearchModeRouter, SearchResult,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// A sub-service failure the request recovered from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Degradation {
    pub category: ErrorCategory,
    pub code: String,
    pub action: FallbackAction,
    pub message: String,
}

impl From<&ErrorResponse> for Degradation {
    fn from(response: &ErrorResponse) -> Self {
        Self {
            category: response.category,
            code: response.code.clone(),
            action: response.fallback_action,
            message: response.technical_message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub request_id: String,
    pub results: Vec<SearchResult>,
    pub mode_used: SearchMode,
    pub cache_hit: bool,
    pub reranked: bool,
    pub degradations: Vec<Degradation>,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub cache: CacheMetrics,
    pub rerank: RerankingMetrics,
    pub search_mode_usage: ModeUsage,
    pub errors: ErrorStats,
    pub circuit_breaker: CircuitBreakerState,
    pub monitor: MonitorStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    /// Latest cache probe, including latency
    pub cache: CacheHealth,
}

pub struct RetrievalEngineBuilder {
    config: Config,
    embedder: Arc<dyn EmbeddingProvider>,
    semantic: Arc<dyn SimilaritySearchProvider>,
    keyword: Arc<dyn KeywordSearchProvider>,
    store: Option<Arc<dyn CacheStore>>,
    primary_scorer: Option<Arc<dyn ScoringModel>>,
    fallback_scorer: Option<Arc<dyn ScoringModel>>,
    alert_handlers: Vec<Arc<dyn AlertHandler>>,
}

impl RetrievalEngineBuilder {
    /// Use this store instead of the one named by `cache.backend`
    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use these scoring models instead of loading `rerank.primary`/`rerank.fallback`
    pub fn scorers(
        mut self,
        primary: Arc<dyn ScoringModel>,
        fallback: Option<Arc<dyn ScoringModel>>,
    ) -> Self {
        self.primary_scorer = Some(primary);
        self.fallback_scorer = fallback;
        self
    }

    pub fn alert_handler(mut self, handler: Arc<dyn AlertHandler>) -> Self {
        self.alert_handlers.push(handler);
        self
    }

    /// Validate the configuration and assemble the engine. Starts the cache
    /// cleanup loop when the policy enables it.
    pub async fn build(self) -> Result<RetrievalEngine> {
        ConfigValidator::validate(&self.config)?;
        let config = self.config;

        let alerts = Arc::new(AlertManager::new());
        alerts.add_handler(Arc::new(LogAlertHandler));
        if config.monitor.console_alerts {
            alerts.add_handler(Arc::new(ConsoleAlertHandler));
        }
        for handler in self.alert_handlers {
            alerts.add_handler(handler);
        }

        let errors = Arc::new(
            ErrorHandler::new(config.errors.locale).with_repeated_error_alerts(
                Arc::clone(&alerts),
                config.errors.repeated_error_threshold,
                config.errors.window(),
            ),
        );

        let store = match self.store {
            Some(store) => store,
            None => open_store(&config.cache),
        };
        tracing::info!("Cache store: {}", store.name());

        let monitor = Arc::new(CacheMonitor::new(
            store,
            &config.monitor,
            config.cache.operation_timeout(),
            Arc::clone(&alerts),
        ));
        let cache = Arc::new(CacheService::new(monitor, &config.cache));
        let cache_manager = CacheManager::new(cache);
        cache_manager.start_auto_cleanup().await;

        let router = SearchModeRouter::new(
            self.embedder,
            self.semantic,
            self.keyword,
            &config.search,
            Arc::clone(&errors),
        )?;

        let reranker = match self.primary_scorer {
            Some(primary) => {
                RerankingService::with_models(Some(primary), self.fallback_scorer, &config.rerank)
            }
            None => RerankingService::from_config(&config.rerank),
        };
        match reranker.model_name() {
            Some(name) => tracing::info!("Reranking model: {}", name),
            None => tracing::warn!("No reranking model loaded, results keep search order"),
        }

        Ok(RetrievalEngine {
            defaults: config.retrieval.clone(),
            config,
            router,
            cache_manager,
            reranker,
            errors,
            alerts,
        })
    }
}

/// Cache stores that fail to open leave the engine on an in-process store
fn open_store(config: &CacheConfig) -> Arc<dyn CacheStore> {
    let capacity_bytes = config.capacity_mb.saturating_mul(1024 * 1024);
    match config.backend {
        CacheBackend::Memory => Arc::new(MemoryCacheStore::new(capacity_bytes)),
        CacheBackend::Sqlite => {
            let path = expand_tilde(&config.sqlite_path);
            match SqliteCacheStore::open(&path, capacity_bytes) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    tracing::warn!(
                        "Could not open SQLite cache at {}, using in-memory cache: {}",
                        path.display(),
                        e
                    );
                    Arc::new(MemoryCacheStore::new(capacity_bytes))
                }
            }
        }
    }
}

pub struct RetrievalEngine {
    config: Config,
    defaults: RetrievalConfig,
    router: SearchModeRouter,
    cache_manager: Arc<CacheManager>,
    reranker: RerankingService,
    errors: Arc<ErrorHandler>,
    alerts: Arc<AlertManager>,
}

impl RetrievalEngine {
    pub fn builder(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        semantic: Arc<dyn SimilaritySearchProvider>,
        keyword: Arc<dyn KeywordSearchProvider>,
    ) -> RetrievalEngineBuilder {
        RetrievalEngineBuilder {
            config,
            embedder,
            semantic,
            keyword,
            store: None,
            primary_scorer: None,
            fallback_scorer: None,
            alert_handlers: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn defaults(&self) -> &RetrievalConfig {
        &self.defaults
    }

    pub fn cache(&self) -> &Arc<CacheService> {
        self.cache_manager.service()
    }

    pub fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.cache_manager
    }

    pub fn reranker(&self) -> &RerankingService {
        &self.reranker
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    fn monitor(&self) -> &Arc<CacheMonitor> {
        self.cache().monitor()
    }

    /// Answer `query`, degrading around cache and reranker failures
    ///
    /// Fails only when the query is invalid or every search mode in the
    /// fallback chain failed.
    pub async fn search(
        &self,
        query: &str,
        options: RetrievalOptions,
    ) -> std::result::Result<SearchResponse, ErrorResponse> {
        let started = Instant::now();
        let request_id = uuid::Uuid::new_v4().to_string();
        self.errors.record_operation();

        let mut degradations = Vec::new();
        let (config, invalid) = options.resolve(&self.defaults);
        if !invalid.is_empty() {
            let err = RetrievalError::ConfigValidation { errors: invalid };
            degradations.push(self.degrade(&err, "engine", "resolve_options", &request_id));
        }

        tracing::debug!(request_id = %request_id, mode = %config.search_mode, "Searching: {}", query);

        match self.cache().lookup(query, &config).await {
            CacheLookup::Hit(results) => {
                let reranked = results.iter().any(|r| r.rerank_score().is_some());
                tracing::debug!(request_id = %request_id, "Cache hit, {} results", results.len());
                return Ok(SearchResponse {
                    request_id,
                    results,
                    mode_used: config.search_mode,
                    cache_hit: true,
                    reranked,
                    degradations,
                    elapsed_ms: elapsed_ms(started),
                });
            }
            CacheLookup::Failed(e) => {
                let err = RetrievalError::from(e);
                degradations.push(self.degrade(&err, "cache_service", "get", &request_id));
            }
            CacheLookup::Miss | CacheLookup::Bypassed => {}
        }

        let outcome = match self.router.route(query, &config).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let context =
                    ErrorContext::from_error(&err, "engine", "search").with_request_id(&request_id);
                return Err(self.errors.handle(context));
            }
        };

        if let Some(from) = outcome.fallback_from {
            let err = RetrievalError::SearchMode {
                mode: from,
                message: outcome
                    .fallback_reason
                    .clone()
                    .unwrap_or_else(|| format!("answered with {}", outcome.mode_used)),
            };
            let context = ErrorContext::from_error(&err, "search_router", "route")
                .with_search_mode(from)
                .with_request_id(&request_id);
            degradations.push(Degradation::from(&self.errors.handle(context)));
        }

        let reranked = self
            .reranker
            .rerank_detailed(query, outcome.results, &config)
            .await;
        if let Some(e) = &reranked.error {
            let err = RetrievalError::RerankingCompute {
                model: reranked.failed_model.clone().unwrap_or_default(),
                message: e.to_string(),
            };
            degradations.push(self.degrade(&err, "reranker", "rerank", &request_id));
        }

        // Only complete answers are cached: no partial hybrid, downgrade or skipped rerank
        let complete = !outcome.partial
            && outcome.fallback_from.is_none()
            && (reranked.applied || reranked.error.is_none());
        if complete {
            if let Err(e) = self.cache().try_set(query, &config, &reranked.results).await {
                let err = RetrievalError::from(e);
                degradations.push(self.degrade(&err, "cache_service", "set", &request_id));
            }
        }

        let response = SearchResponse {
            request_id,
            results: reranked.results,
            mode_used: outcome.mode_used,
            cache_hit: false,
            reranked: reranked.applied,
            degradations,
            elapsed_ms: elapsed_ms(started),
        };
        tracing::debug!(
            request_id = %response.request_id,
            "{} results in {:.1}ms ({} degradations)",
            response.results.len(),
            response.elapsed_ms,
            response.degradations.len()
        );
        Ok(response)
    }

    fn degrade(
        &self,
        err: &RetrievalError,
        component: &str,
        operation: &str,
        request_id: &str,
    ) -> Degradation {
        let context = ErrorContext::from_error(err, component, operation).with_request_id(request_id);
        Degradation::from(&self.errors.handle(context))
    }

    pub async fn metrics(&self) -> EngineMetrics {
        let monitor = self.monitor().stats();
        EngineMetrics {
            cache: self.cache_manager.metrics().await,
            rerank: self.reranker.metrics(),
            search_mode_usage: self.router.usage(),
            errors: self.errors.stats(),
            circuit_breaker: monitor.circuit_breaker.clone(),
            monitor,
        }
    }

    /// Delete cached entries matching `pattern` (default: this engine's namespace)
    pub async fn clear_cache(&self, pattern: Option<&str>) -> Result<usize> {
        self.cache().clear(pattern).await.map_err(RetrievalError::from)
    }

    pub async fn update_cache_policy(&self, policy: CachePolicy) -> bool {
        self.cache_manager.update_policy(policy).await
    }

    pub async fn optimize_cache(&self) -> Vec<String> {
        self.cache_manager.optimize().await
    }

    /// Pre-populate the cache; existing entries are left alone
    pub async fn warm_up_cache(&self, queries: &[(String, RetrievalOptions)]) -> usize {
        let resolved: Vec<(String, RetrievalConfig)> = queries
            .iter()
            .map(|(query, options)| (query.clone(), options.resolve(&self.defaults).0))
            .collect();
        self.cache_manager.warm_up(&resolved, self).await
    }

    pub async fn health_check(&self) -> HealthReport {
        let cache = self.monitor().health_check().await;
        let mut components = BTreeMap::new();

        components.insert(
            "cache".to_string(),
            ComponentHealth {
                status: cache.status,
                message: cache.message.clone(),
            },
        );

        let breaker = self.monitor().breaker().snapshot();
        components.insert(
            "circuit_breaker".to_string(),
            ComponentHealth {
                status: match breaker.state {
                    CircuitState::Closed => HealthStatus::Healthy,
                    CircuitState::Open | CircuitState::HalfOpen => HealthStatus::Degraded,
                },
                message: format!(
                    "{} ({} consecutive failures)",
                    breaker.state.as_str(),
                    breaker.failure_count
                ),
            },
        );

        components.insert(
            "reranker".to_string(),
            match self.reranker.model_name() {
                Some(name) => ComponentHealth {
                    status: HealthStatus::Healthy,
                    message: format!("model {} loaded", name),
                },
                None => ComponentHealth {
                    status: HealthStatus::Degraded,
                    message: "no model loaded, reranking disabled".to_string(),
                },
            },
        );

        let usage = self.router.usage();
        let answered = usage.semantic + usage.keyword + usage.hybrid;
        components.insert(
            "search".to_string(),
            ComponentHealth {
                status: if usage.failures > 0 && answered == 0 {
                    HealthStatus::Unhealthy
                } else if usage.downgrades > 0 || usage.partial_hybrid > 0 {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                },
                message: format!(
                    "{} answered, {} downgraded, {} partial, {} failed",
                    answered, usage.downgrades, usage.partial_hybrid, usage.failures
                ),
            },
        );

        HealthReport {
            status: overall_status(&components),
            components,
            cache,
        }
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.active()
    }

    pub fn resolve_alert(&self, id: &str) -> bool {
        self.alerts.resolve(id)
    }

    pub fn reset_circuit_breaker(&self) {
        self.monitor().reset_breaker();
    }

    pub fn reset_rerank_metrics(&self) {
        self.reranker.reset_metrics();
    }

    /// Stop background work; the engine still answers queries afterwards
    pub async fn shutdown(&self) {
        self.cache_manager.shutdown().await;
        tracing::info!("Retrieval engine shut down");
    }
}

/// Search decides availability; every other component only degrades
fn overall_status(components: &BTreeMap<String, ComponentHealth>) -> HealthStatus {
    let search = components.get("search").map(|c| c.status);
    if search == Some(HealthStatus::Unhealthy) {
        return HealthStatus::Unhealthy;
    }
    if components
        .values()
        .any(|c| !matches!(c.status, HealthStatus::Healthy | HealthStatus::Unknown))
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[async_trait]
impl QueryExecutor for RetrievalEngine {
    async fn execute(&self, query: &str, config: &RetrievalConfig) -> Result<Vec<SearchResult>> {
        let outcome = self.router.route(query, config).await?;
        Ok(self.reranker.rerank(query, outcome.results, config).await)
    }
}
