//! End-to-end retrieval pipeline behaviour: caching, degradation and fallback

mod common;

use common::{harness, harness_with_scorer, test_config, FailingScorer};
use ragpipe::error::ErrorCategory;
use ragpipe::fallback::FallbackAction;
use ragpipe::monitor::HealthStatus;
use ragpipe::{RetrievalOptions, SearchMode};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_what_is_rag_scenario() {
    let h = harness(test_config()).await;
    h.provider.set_delay(Duration::from_millis(200));
    let options = RetrievalOptions::new()
        .top_k(5)
        .search_mode(SearchMode::Hybrid)
        .enable_rerank(true)
        .enable_cache(true);

    let first = h.engine.search("what is RAG?", options.clone()).await.unwrap();
    assert!(!first.cache_hit);
    assert!(first.reranked);
    assert_eq!(first.mode_used, SearchMode::Hybrid);
    assert!(!first.results.is_empty());
    assert!(first.results.len() <= 5);
    assert!(first.results[0].content.contains("RAG"));
    assert!(first.degradations.is_empty());

    let hits_before = h.engine.metrics().await.cache.hits;
    let second = h.engine.search("what is RAG?", options).await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.results, first.results);
    assert_eq!(h.engine.metrics().await.cache.hits, hits_before + 1);

    // The hit never waits on the providers
    assert!(first.elapsed_ms >= 200.0);
    assert!(second.elapsed_ms * 4.0 < first.elapsed_ms);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_cached_call_skips_providers() {
    let h = harness(test_config()).await;

    h.engine
        .search("vector index", RetrievalOptions::new())
        .await
        .unwrap();
    let calls = h.provider.calls();
    assert_eq!(calls, (1, 1));

    let cached = h
        .engine
        .search("vector index", RetrievalOptions::new())
        .await
        .unwrap();
    assert!(cached.cache_hit);
    assert_eq!(h.provider.calls(), calls);

    // A different top_k is a different key
    let other = h
        .engine
        .search("vector index", RetrievalOptions::new().top_k(2))
        .await
        .unwrap();
    assert!(!other.cache_hit);
    assert_eq!(h.provider.calls(), (2, 2));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_cache_disabled_never_touches_store() {
    let h = harness(test_config()).await;
    let options = RetrievalOptions::new().enable_cache(false);

    for _ in 0..3 {
        let response = h.engine.search("keyword search", options.clone()).await.unwrap();
        assert!(!response.cache_hit);
    }

    assert_eq!(h.store.calls(), 0);
    assert_eq!(h.provider.calls(), (3, 3));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_partial_hybrid_when_keyword_leg_fails() {
    let h = harness(test_config()).await;
    h.provider.fail_keyword.store(true, Ordering::SeqCst);

    let response = h
        .engine
        .search("retrieval augmented generation", RetrievalOptions::new())
        .await
        .unwrap();

    assert_eq!(response.mode_used, SearchMode::Hybrid);
    assert!(!response.results.is_empty());
    assert!(response.results.iter().all(|r| r.is_partial_hybrid()));
    assert_eq!(
        response.results[0].metadata.get("failed_leg").and_then(|v| v.as_str()),
        Some("keyword")
    );
    assert_eq!(h.engine.metrics().await.search_mode_usage.partial_hybrid, 1);

    // Partial answers are not cached
    assert!(
        !h.engine
            .cache()
            .contains("retrieval augmented generation", h.engine.defaults())
            .await
    );
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_hybrid_falls_back_to_semantic() {
    let h = harness(test_config()).await;
    h.provider.fail_keyword.store(true, Ordering::SeqCst);
    h.provider.fail_semantic_times(1);

    let response = h
        .engine
        .search("retrieval augmented generation", RetrievalOptions::new())
        .await
        .unwrap();

    // Hybrid failed on both legs, the semantic retry answered
    assert_eq!(h.provider.calls(), (2, 1));
    assert_eq!(response.mode_used, SearchMode::Semantic);
    assert!(!response.results.is_empty());
    assert!(response.results.iter().all(|r| !r.is_partial_hybrid()));
    assert_eq!(response.degradations.len(), 1);
    assert_eq!(response.degradations[0].code, "E_SEARCH_MODE");
    assert_eq!(
        response.degradations[0].action,
        FallbackAction::DowngradeSearchMode {
            from: SearchMode::Hybrid,
            to: SearchMode::Semantic
        }
    );

    let metrics = h.engine.metrics().await;
    assert_eq!(metrics.search_mode_usage.downgrades, 1);
    assert_eq!(metrics.search_mode_usage.semantic, 1);
    assert_eq!(metrics.errors.total_errors, 1);
    assert_eq!(metrics.errors.fallbacks_applied, 1);

    // Downgraded answers are not cached
    assert!(
        !h.engine
            .cache()
            .contains("retrieval augmented generation", h.engine.defaults())
            .await
    );
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_hybrid_fallback_chain_exhausted() {
    let h = harness(test_config()).await;
    h.provider.fail_keyword.store(true, Ordering::SeqCst);
    h.provider.fail_semantic.store(true, Ordering::SeqCst);

    let err = h
        .engine
        .search("retrieval", RetrievalOptions::new())
        .await
        .unwrap_err();

    // Hybrid (both legs) then semantic were tried
    assert_eq!(err.code, "E_SEARCH_EXHAUSTED");
    assert_eq!(err.category, ErrorCategory::Search);
    assert!(!err.user_message.contains("vector index down"));
    assert_eq!(h.provider.calls(), (2, 1));

    let errors = h.engine.metrics().await.errors;
    assert_eq!(errors.total_errors, 1);
    assert_eq!(errors.fallbacks_exhausted, 1);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_single_mode_failure_does_not_fall_back() {
    let h = harness(test_config()).await;
    h.provider.fail_keyword.store(true, Ordering::SeqCst);

    let err = h
        .engine
        .search("retrieval", RetrievalOptions::new().search_mode(SearchMode::Keyword))
        .await
        .unwrap_err();

    assert_eq!(err.code, "E_SEARCH_MODE");
    assert_eq!(h.provider.calls(), (0, 1));

    let errors = h.engine.metrics().await.errors;
    assert_eq!(errors.operations, 1);
    assert_eq!(errors.total_errors, 1);
    assert_eq!(errors.by_category[&ErrorCategory::Search], 1);
    assert!((errors.error_rate - 1.0).abs() < f64::EPSILON);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_failing_scorer_keeps_search_order() {
    let h = harness_with_scorer(test_config(), Arc::new(FailingScorer)).await;
    let options = RetrievalOptions::new()
        .search_mode(SearchMode::Keyword)
        .enable_cache(false);

    let unranked = h
        .engine
        .search("RAG retrieval", options.clone().enable_rerank(false))
        .await
        .unwrap();
    let response = h.engine.search("RAG retrieval", options).await.unwrap();

    assert!(!response.reranked);
    assert_eq!(response.results, unranked.results);
    assert_eq!(response.degradations.len(), 1);
    assert_eq!(response.degradations[0].category, ErrorCategory::Rerank);
    assert_eq!(response.degradations[0].action, FallbackAction::SkipRerank);

    let metrics = h.engine.metrics().await;
    assert_eq!(metrics.rerank.failed_reranks, 1);
    assert_eq!(metrics.rerank.successful_reranks, 0);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_offline_store_still_searches() {
    let h = harness(test_config()).await;
    h.store.set_offline(true);

    let response = h
        .engine
        .search("what is RAG?", RetrievalOptions::new())
        .await
        .unwrap();

    assert!(!response.cache_hit);
    assert!(!response.results.is_empty());
    assert!(response
        .degradations
        .iter()
        .all(|d| d.category == ErrorCategory::Cache && d.action == FallbackAction::BypassCache));
    assert!(!response.degradations.is_empty());

    let health = h.engine.health_check().await;
    assert_eq!(health.components["cache"].status, HealthStatus::Unhealthy);
    assert_eq!(health.status, HealthStatus::Degraded);

    h.engine.shutdown().await;
}
