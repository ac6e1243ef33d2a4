//! Search mode routing with the hybrid -> semantic fallback chain

use super::{
    deduplicate_results, extract_keywords, fuse_results, FusionConfig, RetrievalConfig,
    SearchMode, SearchResult, FAILED_LEG_KEY, PARTIAL_HYBRID_KEY, SEARCH_LEG_KEY,
};
use crate::config::SearchConfig;
use crate::error::{Result, RetrievalError};
use crate::fallback::{ErrorContext, ErrorHandler, FallbackAction};
use crate::providers::{EmbeddingProvider, KeywordSearchProvider, SimilaritySearchProvider};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Results of one routed query
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub results: Vec<SearchResult>,
    /// Mode that actually produced `results`
    pub mode_used: SearchMode,
    /// Hybrid query answered by one leg only
    pub partial: bool,
    /// Requested mode when the chain downgraded
    pub fallback_from: Option<SearchMode>,
    /// Error that triggered the downgrade
    pub fallback_reason: Option<String>,
}

/// Snapshot of routing counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeUsage {
    pub semantic: u64,
    pub keyword: u64,
    pub hybrid: u64,
    pub partial_hybrid: u64,
    pub downgrades: u64,
    pub failures: u64,
}

#[derive(Default)]
struct UsageCounters {
    semantic: AtomicU64,
    keyword: AtomicU64,
    hybrid: AtomicU64,
    partial_hybrid: AtomicU64,
    downgrades: AtomicU64,
    failures: AtomicU64,
}

pub struct SearchModeRouter {
    embedder: Arc<dyn EmbeddingProvider>,
    semantic: Arc<dyn SimilaritySearchProvider>,
    keyword: Arc<dyn KeywordSearchProvider>,
    fusion: FusionConfig,
    timeout: Duration,
    candidate_multiplier: usize,
    extra_stopwords: Vec<String>,
    errors: Arc<ErrorHandler>,
    usage: UsageCounters,
}

impl SearchModeRouter {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        semantic: Arc<dyn SimilaritySearchProvider>,
        keyword: Arc<dyn KeywordSearchProvider>,
        config: &SearchConfig,
        errors: Arc<ErrorHandler>,
    ) -> Result<Self> {
        Ok(Self {
            embedder,
            semantic,
            keyword,
            fusion: config.fusion_config()?,
            timeout: config.timeout(),
            candidate_multiplier: config.candidate_multiplier.max(1),
            extra_stopwords: config.extra_stopwords.clone(),
            errors,
            usage: UsageCounters::default(),
        })
    }

    /// Run `query` in the configured mode, downgrading along the fallback
    /// chain when the error handler offers a downgrade
    ///
    /// Failures are not recorded here; the caller records the downgrade or
    /// the final error once per request.
    pub async fn route(&self, query: &str, config: &RetrievalConfig) -> Result<RouteOutcome> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RetrievalError::InvalidQuery("Query is empty".to_string()));
        }

        let requested = config.search_mode;
        let mut mode = requested;
        let mut attempted = Vec::new();
        let mut fallback_reason = None;

        loop {
            attempted.push(mode);

            let err = match self.execute(mode, query, config).await {
                Ok((results, partial)) => {
                    self.record_usage(mode, partial, mode != requested);
                    tracing::debug!(
                        "{} search returned {} results{}",
                        mode,
                        results.len(),
                        if partial { " (partial)" } else { "" }
                    );
                    return Ok(RouteOutcome {
                        results,
                        mode_used: mode,
                        partial,
                        fallback_from: (mode != requested).then_some(requested),
                        fallback_reason,
                    });
                }
                Err(err) => err,
            };

            let context = ErrorContext::from_error(&err, "search_router", "route")
                .with_search_mode(mode);
            match self.errors.decide(&context) {
                FallbackAction::DowngradeSearchMode { to, .. } if !attempted.contains(&to) => {
                    tracing::warn!("{} search failed ({}), falling back to {}", mode, err, to);
                    fallback_reason.get_or_insert_with(|| err.to_string());
                    mode = to;
                }
                _ => {
                    self.usage.failures.fetch_add(1, Ordering::Relaxed);
                    if attempted.len() > 1 {
                        tracing::error!("Search fallback chain exhausted: {:?}", attempted);
                        return Err(RetrievalError::SearchFallback {
                            attempted,
                            last_error: err.to_string(),
                        });
                    }
                    return Err(err);
                }
            }
        }
    }

    pub fn usage(&self) -> ModeUsage {
        ModeUsage {
            semantic: self.usage.semantic.load(Ordering::Relaxed),
            keyword: self.usage.keyword.load(Ordering::Relaxed),
            hybrid: self.usage.hybrid.load(Ordering::Relaxed),
            partial_hybrid: self.usage.partial_hybrid.load(Ordering::Relaxed),
            downgrades: self.usage.downgrades.load(Ordering::Relaxed),
            failures: self.usage.failures.load(Ordering::Relaxed),
        }
    }

    fn record_usage(&self, mode: SearchMode, partial: bool, downgraded: bool) {
        let counter = match mode {
            SearchMode::Semantic => &self.usage.semantic,
            SearchMode::Keyword => &self.usage.keyword,
            SearchMode::Hybrid => &self.usage.hybrid,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if partial {
            self.usage.partial_hybrid.fetch_add(1, Ordering::Relaxed);
        }
        if downgraded {
            self.usage.downgrades.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn execute(
        &self,
        mode: SearchMode,
        query: &str,
        config: &RetrievalConfig,
    ) -> Result<(Vec<SearchResult>, bool)> {
        match mode {
            SearchMode::Semantic => {
                let results = self
                    .semantic_leg(query, config.top_k, config.similarity_threshold)
                    .await?;
                Ok((results, false))
            }
            SearchMode::Keyword => Ok((self.keyword_leg(query, config.top_k).await?, false)),
            SearchMode::Hybrid => self.hybrid(query, config).await,
        }
    }

    async fn hybrid(
        &self,
        query: &str,
        config: &RetrievalConfig,
    ) -> Result<(Vec<SearchResult>, bool)> {
        let candidates = config.top_k.saturating_mul(self.candidate_multiplier);

        let (semantic, keyword) = tokio::join!(
            self.semantic_leg(query, candidates, config.similarity_threshold),
            self.keyword_leg(query, candidates)
        );

        let (mut results, partial) = match (semantic, keyword) {
            (Ok(semantic), Ok(keyword)) => (fuse_results(semantic, keyword, &self.fusion), false),
            (Ok(semantic), Err(e)) => {
                tracing::warn!("Keyword leg failed, returning semantic results only: {}", e);
                (mark_partial(semantic, SearchMode::Semantic, SearchMode::Keyword), true)
            }
            (Err(e), Ok(keyword)) => {
                tracing::warn!("Semantic leg failed, returning keyword results only: {}", e);
                (mark_partial(keyword, SearchMode::Keyword, SearchMode::Semantic), true)
            }
            (Err(semantic_err), Err(keyword_err)) => {
                return Err(RetrievalError::SearchMode {
                    mode: SearchMode::Hybrid,
                    message: format!(
                        "both legs failed (semantic: {}; keyword: {})",
                        semantic_err, keyword_err
                    ),
                });
            }
        };

        results.truncate(config.top_k);
        Ok((results, partial))
    }

    async fn semantic_leg(
        &self,
        query: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchResult>> {
        let embedder = Arc::clone(&self.embedder);
        let text = query.to_string();
        let embedding = tokio::task::spawn_blocking(move || embedder.embed(&text));

        let embedding = match tokio::time::timeout(self.timeout, embedding).await {
            Ok(Ok(Ok(embedding))) => embedding,
            Ok(Ok(Err(e))) => return Err(leg_error(SearchMode::Semantic, e.to_string())),
            Ok(Err(join)) => {
                return Err(leg_error(
                    SearchMode::Semantic,
                    format!("embedding task failed: {}", join),
                ))
            }
            Err(_) => {
                return Err(leg_error(
                    SearchMode::Semantic,
                    format!("embedding timed out after {:?}", self.timeout),
                ))
            }
        };

        let results = tokio::time::timeout(
            self.timeout,
            self.semantic.similarity_search(&embedding, top_k),
        )
        .await
        .map_err(|_| {
            leg_error(
                SearchMode::Semantic,
                format!("{} timed out after {:?}", self.semantic.name(), self.timeout),
            )
        })?
        .map_err(|e| leg_error(SearchMode::Semantic, format!("{}: {}", self.semantic.name(), e)))?;

        Ok(deduplicate_results(
            results
                .into_iter()
                .filter(|r| r.score >= threshold)
                .collect(),
        ))
    }

    async fn keyword_leg(&self, query: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        let keywords = extract_keywords(query, &self.extra_stopwords);
        if keywords.is_empty() {
            tracing::debug!("No keywords in query, keyword leg is empty");
            return Ok(Vec::new());
        }

        let results =
            tokio::time::timeout(self.timeout, self.keyword.keyword_search(&keywords, top_k))
                .await
                .map_err(|_| {
                    leg_error(
                        SearchMode::Keyword,
                        format!("{} timed out after {:?}", self.keyword.name(), self.timeout),
                    )
                })?
                .map_err(|e| {
                    leg_error(SearchMode::Keyword, format!("{}: {}", self.keyword.name(), e))
                })?;

        Ok(deduplicate_results(results))
    }
}

fn leg_error(mode: SearchMode, message: String) -> RetrievalError {
    RetrievalError::SearchMode { mode, message }
}

fn mark_partial(
    results: Vec<SearchResult>,
    leg: SearchMode,
    failed: SearchMode,
) -> Vec<SearchResult> {
    results
        .into_iter()
        .map(|r| {
            r.with_metadata(SEARCH_LEG_KEY, leg.as_str())
                .with_metadata(PARTIAL_HYBRID_KEY, true)
                .with_metadata(FAILED_LEG_KEY, failed.as_str())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::Locale;
    use crate::providers::{HashingEmbedder, MemoryCorpus, Passage, ProviderError};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct Unreachable;

    #[async_trait]
    impl SimilaritySearchProvider for Unreachable {
        async fn similarity_search(
            &self,
            _query_embedding: &[f32],
            _top_k: usize,
        ) -> std::result::Result<Vec<SearchResult>, ProviderError> {
            Err(ProviderError::Unavailable("index offline".to_string()))
        }

        fn name(&self) -> &str {
            "unreachable"
        }
    }

    #[async_trait]
    impl KeywordSearchProvider for Unreachable {
        async fn keyword_search(
            &self,
            _keywords: &[String],
            _top_k: usize,
        ) -> std::result::Result<Vec<SearchResult>, ProviderError> {
            Err(ProviderError::Unavailable("index offline".to_string()))
        }

        fn name(&self) -> &str {
            "unreachable"
        }
    }

    struct FailsFirstCall {
        inner: Arc<MemoryCorpus>,
        failed: AtomicBool,
    }

    #[async_trait]
    impl SimilaritySearchProvider for FailsFirstCall {
        async fn similarity_search(
            &self,
            query_embedding: &[f32],
            top_k: usize,
        ) -> std::result::Result<Vec<SearchResult>, ProviderError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(ProviderError::Unavailable("index warming up".to_string()));
            }
            self.inner.similarity_search(query_embedding, top_k).await
        }

        fn name(&self) -> &str {
            "fails-first-call"
        }
    }

    fn corpus() -> Arc<MemoryCorpus> {
        let passages = [
            ("p1", "RAG is retrieval augmented generation"),
            ("p2", "Retrieval finds relevant passages for generation"),
            ("p3", "Caches store recent search results"),
        ]
        .into_iter()
        .map(|(id, content)| Passage {
            id: id.to_string(),
            document_id: format!("doc-{}", id),
            content: content.to_string(),
            chunk_index: None,
        })
        .collect();
        Arc::new(MemoryCorpus::new(passages, Arc::new(HashingEmbedder::default())).unwrap())
    }

    fn router(
        semantic: Arc<dyn SimilaritySearchProvider>,
        keyword: Arc<dyn KeywordSearchProvider>,
    ) -> SearchModeRouter {
        SearchModeRouter::new(
            Arc::new(HashingEmbedder::default()),
            semantic,
            keyword,
            &SearchConfig::default(),
            Arc::new(ErrorHandler::new(Locale::En)),
        )
        .unwrap()
    }

    fn config(mode: SearchMode) -> RetrievalConfig {
        RetrievalConfig {
            search_mode: mode,
            ..RetrievalConfig::default()
        }
    }

    #[tokio::test]
    async fn test_hybrid_fuses_both_legs() {
        let corpus = corpus();
        let router = router(corpus.clone(), corpus);

        let outcome = router
            .route("what is RAG retrieval?", &config(SearchMode::Hybrid))
            .await
            .unwrap();

        assert_eq!(outcome.mode_used, SearchMode::Hybrid);
        assert!(!outcome.partial);
        assert!(outcome.results.len() <= 5);
        assert_eq!(outcome.results[0].id, "p1");
        assert_eq!(router.usage().hybrid, 1);
    }

    #[tokio::test]
    async fn test_failed_keyword_leg_is_partial() {
        let router = router(corpus(), Arc::new(Unreachable));

        let outcome = router
            .route("retrieval generation", &config(SearchMode::Hybrid))
            .await
            .unwrap();

        assert_eq!(outcome.mode_used, SearchMode::Hybrid);
        assert!(outcome.partial);
        assert!(!outcome.results.is_empty());
        for result in &outcome.results {
            assert!(result.is_partial_hybrid());
            assert_eq!(result.metadata[FAILED_LEG_KEY], "keyword");
        }
    }

    #[tokio::test]
    async fn test_keyword_mode_does_not_fall_back() {
        let router = router(corpus(), Arc::new(Unreachable));

        let err = router
            .route("retrieval", &config(SearchMode::Keyword))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::SearchMode {
                mode: SearchMode::Keyword,
                ..
            }
        ));
        assert_eq!(router.usage().failures, 1);
        assert_eq!(router.errors.stats().total_errors, 0);
    }

    #[tokio::test]
    async fn test_failed_hybrid_downgrades_to_semantic() {
        let errors = Arc::new(ErrorHandler::new(Locale::En));
        let semantic = Arc::new(FailsFirstCall {
            inner: corpus(),
            failed: AtomicBool::new(false),
        });
        let router = SearchModeRouter::new(
            Arc::new(HashingEmbedder::default()),
            semantic,
            Arc::new(Unreachable),
            &SearchConfig::default(),
            Arc::clone(&errors),
        )
        .unwrap();

        let outcome = router
            .route("retrieval generation", &config(SearchMode::Hybrid))
            .await
            .unwrap();

        assert_eq!(outcome.mode_used, SearchMode::Semantic);
        assert_eq!(outcome.fallback_from, Some(SearchMode::Hybrid));
        assert!(outcome.fallback_reason.unwrap().contains("both legs failed"));
        assert!(!outcome.results.is_empty());
        assert_eq!(router.usage().downgrades, 1);
        assert_eq!(errors.stats().total_errors, 0);
    }

    #[tokio::test]
    async fn test_hybrid_exhausts_chain() {
        let router = router(Arc::new(Unreachable), Arc::new(Unreachable));

        let err = router
            .route("retrieval", &config(SearchMode::Hybrid))
            .await
            .unwrap_err();
        match err {
            RetrievalError::SearchFallback { attempted, .. } => {
                assert_eq!(attempted, vec![SearchMode::Hybrid, SearchMode::Semantic]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stopword_query_keyword_mode_is_empty() {
        let router = router(Arc::new(Unreachable), Arc::new(Unreachable));

        let outcome = router
            .route("what is the", &config(SearchMode::Keyword))
            .await
            .unwrap();
        assert!(outcome.results.is_empty());
    }

    #[tokio::test]
    async fn test_threshold_filters_semantic_results() {
        let corpus = corpus();
        let router = router(corpus.clone(), corpus);

        let mut strict = config(SearchMode::Semantic);
        strict.similarity_threshold = 1.0;
        let outcome = router.route("caches", &strict).await.unwrap();
        assert!(outcome.results.iter().all(|r| r.score >= 1.0));
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let corpus = corpus();
        let router = router(corpus.clone(), corpus);
        let err = router
            .route("   ", &config(SearchMode::Semantic))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidQuery(_)));
    }
}
