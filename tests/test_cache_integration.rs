//! Cache store, circuit breaker and policy behaviour through the engine

mod common;

use common::{harness, test_config};
use ragpipe::cache::{CachePolicy, SqliteCacheStore};
use ragpipe::config::Config;
use ragpipe::monitor::{AlertLevel, CallbackAlertHandler, CircuitState};
use ragpipe::providers::{EmbeddingProvider, HashingEmbedder, MemoryCorpus};
use ragpipe::{RetrievalEngine, RetrievalOptions};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn breaker_config() -> Config {
    let mut config = test_config();
    config.monitor.failure_threshold = 3;
    config.monitor.recovery_timeout_ms = 500;
    config
}

#[tokio::test]
async fn test_breaker_opens_and_recovers() {
    let h = harness(breaker_config()).await;
    h.store.set_offline(true);

    // Each search makes one read and one write
    for _ in 0..2 {
        h.engine
            .search("vector index", RetrievalOptions::new())
            .await
            .unwrap();
    }
    let metrics = h.engine.metrics().await;
    assert_eq!(metrics.circuit_breaker.state, CircuitState::Open);
    assert!(h
        .engine
        .active_alerts()
        .iter()
        .any(|a| a.key == "cache.circuit_breaker" && a.level == AlertLevel::Critical));

    // Open breaker fails fast without reaching the store
    let calls = h.store.calls();
    let response = h
        .engine
        .search("vector index", RetrievalOptions::new())
        .await
        .unwrap();
    assert!(!response.results.is_empty());
    assert_eq!(h.store.calls(), calls);

    tokio::time::sleep(Duration::from_millis(600)).await;
    h.store.set_offline(false);

    h.engine
        .search("vector index", RetrievalOptions::new())
        .await
        .unwrap();
    let metrics = h.engine.metrics().await;
    assert_eq!(metrics.circuit_breaker.state, CircuitState::Closed);
    assert_eq!(metrics.circuit_breaker.failure_count, 0);
    assert!(h
        .engine
        .active_alerts()
        .iter()
        .all(|a| a.key != "cache.circuit_breaker"));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_reset_circuit_breaker() {
    let h = harness(breaker_config()).await;
    h.store.set_offline(true);
    for _ in 0..2 {
        h.engine
            .search("keyword search", RetrievalOptions::new())
            .await
            .unwrap();
    }
    assert_eq!(h.engine.metrics().await.circuit_breaker.state, CircuitState::Open);

    h.engine.reset_circuit_breaker();
    assert_eq!(h.engine.metrics().await.circuit_breaker.state, CircuitState::Closed);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_alert_handlers_receive_breaker_alert() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);

    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbedder::default());
    let corpus = Arc::new(MemoryCorpus::new(common::passages(), Arc::clone(&embedder)).unwrap());
    let store = Arc::new(common::FlakyStore::new());
    store.set_offline(true);

    let engine = RetrievalEngine::builder(breaker_config(), embedder, corpus.clone(), corpus)
        .store(store)
        .alert_handler(Arc::new(CallbackAlertHandler::new(move |alert| {
            sink.lock().unwrap().push(alert.key.clone());
        })))
        .build()
        .await
        .unwrap();

    for _ in 0..2 {
        engine.search("RAG", RetrievalOptions::new()).await.unwrap();
    }

    let keys = received.lock().unwrap().clone();
    assert!(keys.iter().any(|k| k == "cache.circuit_breaker"));
    assert!(keys.iter().any(|k| k == "cache.connection_failures"));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_sqlite_cache_survives_engine_restart() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("cache.sqlite");

    let build = |path: std::path::PathBuf| async move {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbedder::default());
        let corpus =
            Arc::new(MemoryCorpus::new(common::passages(), Arc::clone(&embedder)).unwrap());
        let store = Arc::new(SqliteCacheStore::open(&path, 16 * 1024 * 1024).unwrap());
        RetrievalEngine::builder(test_config(), embedder, corpus.clone(), corpus)
            .store(store)
            .build()
            .await
            .unwrap()
    };

    let first = build(path.clone()).await;
    let original = first
        .search("what is RAG?", RetrievalOptions::new())
        .await
        .unwrap();
    first.shutdown().await;
    drop(first);

    let second = build(path).await;
    let cached = second
        .search("what is RAG?", RetrievalOptions::new())
        .await
        .unwrap();
    assert!(cached.cache_hit);
    assert_eq!(cached.results, original.results);
    second.shutdown().await;
}

#[tokio::test]
async fn test_policy_update_controls_cleanup_loop() {
    let mut config = test_config();
    config.cache.policy.enable_auto_cleanup = true;
    let h = harness(config).await;
    assert!(h.engine.cache_manager().is_auto_cleanup_running().await);

    let disabled = CachePolicy {
        enable_auto_cleanup: false,
        ..CachePolicy::default()
    };
    assert!(h.engine.update_cache_policy(disabled).await);
    assert!(!h.engine.cache_manager().is_auto_cleanup_running().await);

    let invalid = CachePolicy {
        max_entries: 0,
        ..CachePolicy::default()
    };
    assert!(!h.engine.update_cache_policy(invalid).await);
    assert!(!h.engine.cache_manager().policy().await.enable_auto_cleanup);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_optimize_evicts_down_to_entry_limit() {
    let h = harness(test_config()).await;
    for query in ["RAG", "vector", "keyword", "weather", "caching"] {
        h.engine.search(query, RetrievalOptions::new()).await.unwrap();
    }

    let policy = CachePolicy {
        max_entries: 2,
        enable_auto_cleanup: false,
        ..CachePolicy::default()
    };
    assert!(h.engine.update_cache_policy(policy).await);

    let actions = h.engine.optimize_cache().await;
    assert!(!actions.is_empty());
    assert_eq!(h.engine.metrics().await.cache.entry_count, 2);
    h.engine.shutdown().await;
}
