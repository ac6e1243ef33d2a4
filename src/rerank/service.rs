use super::model::{load_model, RerankError, ScoringModel};
use crate::config::RerankConfig;
use crate::retrieval::{
    sort_by_score_desc, RetrievalConfig, SearchResult, ORIGINAL_SCORE_KEY, RERANK_SCORE_KEY,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Reranking counters; reset only through [`RerankingService::reset_metrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerankingMetrics {
    pub total_requests: u64,
    pub successful_reranks: u64,
    pub failed_reranks: u64,
    pub fallback_uses: u64,
    pub avg_processing_time_ms: f64,
    pub model_load_time_ms: f64,
    pub success_rate: f64,
    pub model: Option<String>,
}

#[derive(Default)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
    fallback_uses: u64,
    processing_ms: f64,
}

/// What happened to one rerank request
#[derive(Debug)]
pub struct RerankOutcome {
    pub results: Vec<SearchResult>,
    /// Scores were replaced by model scores
    pub applied: bool,
    /// Model that produced the scores
    pub model: Option<String>,
    pub used_fallback: bool,
    /// Last failure, when the original order was kept or the fallback was used
    pub error: Option<RerankError>,
    /// Model that raised `error`
    pub failed_model: Option<String>,
}

impl RerankOutcome {
    fn unchanged(results: Vec<SearchResult>) -> Self {
        Self {
            results,
            applied: false,
            model: None,
            used_fallback: false,
            error: None,
            failed_model: None,
        }
    }

    fn failed(results: Vec<SearchResult>, model: &str, error: RerankError) -> Self {
        Self {
            error: Some(error),
            failed_model: Some(model.to_string()),
            ..Self::unchanged(results)
        }
    }
}

pub struct RerankingService {
    primary: Option<Arc<dyn ScoringModel>>,
    fallback: Option<Arc<dyn ScoringModel>>,
    batch_size: usize,
    max_length: usize,
    timeout: Duration,
    semaphore: Arc<Semaphore>,
    model_load_time: Duration,
    counters: Mutex<Counters>,
}

impl RerankingService {
    /// Load models from configuration
    ///
    /// When the primary fails to load and a fallback is configured, the
    /// fallback becomes the only model. When nothing loads, reranking is a
    /// no-op.
    pub fn from_config(config: &RerankConfig) -> Self {
        let started = Instant::now();

        let primary = match load_model(&config.primary) {
            Ok(model) => Some(model),
            Err(e) => {
                tracing::warn!("Primary reranker {} unavailable: {}", config.primary.name, e);
                None
            }
        };

        let fallback = match &config.fallback {
            Some(fallback_config) => match load_model(fallback_config) {
                Ok(model) => Some(model),
                Err(e) => {
                    tracing::warn!("Fallback reranker {} unavailable: {}", fallback_config.name, e);
                    None
                }
            },
            None => None,
        };

        let (primary, fallback) = match (primary, fallback) {
            (None, Some(fallback)) => {
                tracing::info!("Using fallback reranker {} as the only model", fallback.name());
                (Some(fallback), None)
            }
            pair => pair,
        };

        let mut service = Self::with_models(primary, fallback, config);
        service.model_load_time = started.elapsed();
        service
    }

    /// Use already constructed models (remote runtimes, test doubles)
    pub fn with_models(
        primary: Option<Arc<dyn ScoringModel>>,
        fallback: Option<Arc<dyn ScoringModel>>,
        config: &RerankConfig,
    ) -> Self {
        Self {
            primary,
            fallback,
            batch_size: config.batch_size.max(1),
            max_length: config.max_length.max(1),
            timeout: config.timeout(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            model_load_time: Duration::ZERO,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.primary.is_some()
    }

    pub fn model_name(&self) -> Option<&str> {
        self.primary.as_ref().map(|m| m.name())
    }

    pub async fn rerank(
        &self,
        query: &str,
        results: Vec<SearchResult>,
        config: &RetrievalConfig,
    ) -> Vec<SearchResult> {
        self.rerank_detailed(query, results, config).await.results
    }

    /// Rerank only the first `top_n` results; the rest keep their order and
    /// scores and follow the reranked head
    pub async fn rerank_with_limit(
        &self,
        query: &str,
        mut results: Vec<SearchResult>,
        config: &RetrievalConfig,
        top_n: usize,
    ) -> Vec<SearchResult> {
        let tail = results.split_off(top_n.min(results.len()));
        let mut head = self.rerank(query, results, config).await;
        head.extend(tail);
        head
    }

    pub async fn rerank_detailed(
        &self,
        query: &str,
        results: Vec<SearchResult>,
        config: &RetrievalConfig,
    ) -> RerankOutcome {
        if !config.enable_rerank || results.is_empty() {
            return RerankOutcome::unchanged(results);
        }
        let Some(primary) = &self.primary else {
            return RerankOutcome::unchanged(results);
        };

        let started = Instant::now();
        let pairs: Vec<(String, String)> = results
            .iter()
            .map(|r| (query.to_string(), truncate_chars(&r.content, self.max_length)))
            .collect();

        let primary_error = match self.score(primary, pairs.clone()).await {
            Ok(scores) => {
                self.record(started, true, false);
                return RerankOutcome {
                    results: apply_scores(results, scores),
                    applied: true,
                    model: Some(primary.name().to_string()),
                    used_fallback: false,
                    error: None,
                    failed_model: None,
                };
            }
            Err(e) => e,
        };

        tracing::warn!("Reranking with {} failed: {}", primary.name(), primary_error);

        let Some(fallback) = &self.fallback else {
            self.record(started, false, false);
            return RerankOutcome::failed(results, primary.name(), primary_error);
        };

        match self.score(fallback, pairs).await {
            Ok(scores) => {
                self.record(started, true, true);
                RerankOutcome {
                    results: apply_scores(results, scores),
                    applied: true,
                    model: Some(fallback.name().to_string()),
                    used_fallback: true,
                    error: Some(primary_error),
                    failed_model: Some(primary.name().to_string()),
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Fallback reranker {} failed, keeping original order: {}",
                    fallback.name(),
                    e
                );
                self.record(started, false, true);
                RerankOutcome::failed(results, fallback.name(), e)
            }
        }
    }

    /// Score all pairs in batches on the blocking pool, under the timeout
    async fn score(
        &self,
        model: &Arc<dyn ScoringModel>,
        pairs: Vec<(String, String)>,
    ) -> Result<Vec<f32>, RerankError> {
        let model = Arc::clone(model);
        let semaphore = Arc::clone(&self.semaphore);
        let batch_size = self.batch_size;

        let work = async move {
            let permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| RerankError::Scoring(e.to_string()))?;

            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let mut scores = Vec::with_capacity(pairs.len());
                for batch in pairs.chunks(batch_size) {
                    let batch_scores = model.score(batch)?;
                    if batch_scores.len() != batch.len() {
                        return Err(RerankError::ScoreCountMismatch {
                            expected: batch.len(),
                            actual: batch_scores.len(),
                        });
                    }
                    if batch_scores.iter().any(|s| !s.is_finite()) {
                        return Err(RerankError::Scoring("non-finite score".to_string()));
                    }
                    scores.extend(batch_scores);
                }
                Ok(scores)
            })
            .await
            .map_err(|e| RerankError::Scoring(format!("scoring task failed: {}", e)))?
        };

        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| RerankError::Timeout(self.timeout))?
    }

    fn record(&self, started: Instant, success: bool, used_fallback: bool) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.total += 1;
        if success {
            counters.successful += 1;
        } else {
            counters.failed += 1;
        }
        if used_fallback {
            counters.fallback_uses += 1;
        }
        counters.processing_ms += started.elapsed().as_secs_f64() * 1000.0;
    }

    pub fn metrics(&self) -> RerankingMetrics {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let ratio = |n: f64| if counters.total == 0 { 0.0 } else { n / counters.total as f64 };
        RerankingMetrics {
            total_requests: counters.total,
            successful_reranks: counters.successful,
            failed_reranks: counters.failed,
            fallback_uses: counters.fallback_uses,
            avg_processing_time_ms: ratio(counters.processing_ms),
            model_load_time_ms: self.model_load_time.as_secs_f64() * 1000.0,
            success_rate: ratio(counters.successful as f64),
            model: self.model_name().map(str::to_string),
        }
    }

    pub fn reset_metrics(&self) {
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner) = Counters::default();
        tracing::info!("Reranking metrics reset");
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

fn apply_scores(mut results: Vec<SearchResult>, scores: Vec<f32>) -> Vec<SearchResult> {
    for (result, score) in results.iter_mut().zip(scores) {
        result.set_metadata(ORIGINAL_SCORE_KEY, result.score as f64);
        result.set_metadata(RERANK_SCORE_KEY, score as f64);
        result.score = score;
    }
    sort_by_score_desc(&mut results);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rerank::{LexicalScorer, ModelConfig, ModelKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingScorer;

    impl ScoringModel for FailingScorer {
        fn score(&self, _pairs: &[(String, String)]) -> Result<Vec<f32>, RerankError> {
            Err(RerankError::Scoring("model crashed".to_string()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    /// Records batch sizes and returns one fewer score than asked on request
    struct BatchRecorder {
        calls: AtomicUsize,
        short: bool,
    }

    impl ScoringModel for BatchRecorder {
        fn score(&self, pairs: &[(String, String)]) -> Result<Vec<f32>, RerankError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let n = if self.short { pairs.len() - 1 } else { pairs.len() };
            Ok((0..n).map(|i| i as f32).collect())
        }

        fn name(&self) -> &str {
            "recorder"
        }
    }

    struct SlowScorer;

    impl ScoringModel for SlowScorer {
        fn score(&self, pairs: &[(String, String)]) -> Result<Vec<f32>, RerankError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(vec![1.0; pairs.len()])
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    fn results() -> Vec<SearchResult> {
        vec![
            SearchResult::new("p1", "d1", "Weather is sunny", 0.9),
            SearchResult::new("p2", "d2", "RAG means retrieval augmented generation", 0.5),
            SearchResult::new("p3", "d3", "Retrieval systems", 0.3),
        ]
    }

    fn config() -> RerankConfig {
        RerankConfig {
            batch_size: 2,
            ..RerankConfig::default()
        }
    }

    fn service(primary: Arc<dyn ScoringModel>, fallback: Option<Arc<dyn ScoringModel>>) -> RerankingService {
        RerankingService::with_models(Some(primary), fallback, &config())
    }

    #[tokio::test]
    async fn test_rerank_reorders_and_preserves_scores() {
        let service = service(Arc::new(LexicalScorer::new("lexical")), None);
        let reranked = service
            .rerank("what is retrieval augmented generation", results(), &RetrievalConfig::default())
            .await;

        assert_eq!(reranked[0].id, "p2");
        assert_eq!(reranked[0].original_score(), Some(0.5));
        assert_eq!(reranked[0].rerank_score(), Some(reranked[0].score));
        assert!(reranked.windows(2).all(|w| w[0].score >= w[1].score));

        let metrics = service.metrics();
        assert_eq!(metrics.total_requests, 1);
        assert_eq!(metrics.successful_reranks, 1);
        assert_eq!(metrics.success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_failing_model_keeps_original() {
        let service = service(Arc::new(FailingScorer), None);
        let outcome = service
            .rerank_detailed("query", results(), &RetrievalConfig::default())
            .await;

        assert!(!outcome.applied);
        assert!(outcome.error.is_some());
        assert_eq!(outcome.failed_model.as_deref(), Some("failing"));
        assert_eq!(outcome.results, results());
        assert_eq!(service.metrics().failed_reranks, 1);
    }

    #[tokio::test]
    async fn test_fallback_model_used_once() {
        let service = service(
            Arc::new(FailingScorer),
            Some(Arc::new(LexicalScorer::new("lexical"))),
        );
        let outcome = service
            .rerank_detailed("retrieval generation", results(), &RetrievalConfig::default())
            .await;

        assert!(outcome.applied);
        assert!(outcome.used_fallback);
        assert_eq!(outcome.model.as_deref(), Some("lexical"));

        let metrics = service.metrics();
        assert_eq!(metrics.fallback_uses, 1);
        assert_eq!(metrics.successful_reranks, 1);
    }

    #[tokio::test]
    async fn test_failed_fallback_is_reported() {
        let service = service(
            Arc::new(FailingScorer),
            Some(Arc::new(BatchRecorder {
                calls: AtomicUsize::new(0),
                short: true,
            })),
        );
        let outcome = service
            .rerank_detailed("q", results(), &RetrievalConfig::default())
            .await;

        assert!(!outcome.applied);
        assert_eq!(outcome.failed_model.as_deref(), Some("recorder"));
        assert!(matches!(
            outcome.error,
            Some(RerankError::ScoreCountMismatch { .. })
        ));
        assert_eq!(outcome.results, results());
    }

    #[tokio::test]
    async fn test_batches_and_count_mismatch() {
        let recorder = Arc::new(BatchRecorder {
            calls: AtomicUsize::new(0),
            short: false,
        });
        let svc = service(recorder.clone(), None);
        svc.rerank("q", results(), &RetrievalConfig::default()).await;
        // Three passages in batches of two
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 2);

        let short = service(
            Arc::new(BatchRecorder {
                calls: AtomicUsize::new(0),
                short: true,
            }),
            None,
        );
        let outcome = short
            .rerank_detailed("q", results(), &RetrievalConfig::default())
            .await;
        assert!(matches!(
            outcome.error,
            Some(RerankError::ScoreCountMismatch { .. })
        ));
        assert_eq!(outcome.results, results());
    }

    #[tokio::test]
    async fn test_timeout_keeps_original() {
        let config = RerankConfig {
            timeout_ms: 20,
            ..RerankConfig::default()
        };
        let service = RerankingService::with_models(Some(Arc::new(SlowScorer)), None, &config);
        let outcome = service
            .rerank_detailed("q", results(), &RetrievalConfig::default())
            .await;
        assert!(matches!(outcome.error, Some(RerankError::Timeout(_))));
        assert_eq!(outcome.results, results());
    }

    #[tokio::test]
    async fn test_disabled_or_empty_is_noop() {
        let service = service(Arc::new(FailingScorer), None);
        let disabled = RetrievalConfig {
            enable_rerank: false,
            ..RetrievalConfig::default()
        };
        assert_eq!(service.rerank("q", results(), &disabled).await, results());
        assert!(service
            .rerank("q", Vec::new(), &RetrievalConfig::default())
            .await
            .is_empty());
        assert_eq!(service.metrics().total_requests, 0);
    }

    #[tokio::test]
    async fn test_rerank_with_limit_appends_tail() {
        let service = service(Arc::new(LexicalScorer::new("lexical")), None);
        let reranked = service
            .rerank_with_limit("sunny weather", results(), &RetrievalConfig::default(), 2)
            .await;

        assert_eq!(reranked.len(), 3);
        assert_eq!(reranked[0].id, "p1");
        assert_eq!(reranked[2], results()[2]);
    }

    #[test]
    fn test_from_config_promotes_fallback() {
        let config = RerankConfig {
            primary: ModelConfig::new(ModelKind::FastEmbed, "no-such-model"),
            fallback: Some(ModelConfig::new(ModelKind::Mock, "mock")),
            ..RerankConfig::default()
        };
        let service = RerankingService::from_config(&config);
        assert!(service.is_available());
        assert_eq!(service.model_name(), Some("mock"));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
