//! Test doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ragpipe::cache::{CacheError, CacheStore, KeyInfo, MemoryCacheStore, MemoryStats};
use ragpipe::config::Config;
use ragpipe::providers::{
    EmbeddingProvider, HashingEmbedder, KeywordSearchProvider, MemoryCorpus, Passage,
    ProviderError, SimilaritySearchProvider,
};
use ragpipe::rerank::{LexicalScorer, RerankError, ScoringModel};
use ragpipe::{RetrievalEngine, SearchResult};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn passages() -> Vec<Passage> {
    [
        ("rag-1", "rag-intro", "RAG combines retrieval with generation: relevant passages are retrieved and handed to the language model."),
        ("rag-2", "rag-intro", "Retrieval augmented generation (RAG) reduces hallucination by grounding answers in documents."),
        ("rag-3", "rag-cache", "Caching RAG retrieval results avoids repeated vector searches for popular questions."),
        ("vec-1", "vectors", "A vector index answers nearest neighbour queries over passage embeddings."),
        ("kw-1", "keywords", "BM25 keyword search scores passages by term frequency and document length."),
        ("misc-1", "misc", "The weather tomorrow is expected to be sunny with light wind."),
    ]
    .iter()
    .enumerate()
    .map(|(i, (id, document_id, content))| Passage {
        id: id.to_string(),
        document_id: document_id.to_string(),
        content: content.to_string(),
        chunk_index: Some(i as u64),
    })
    .collect()
}

/// Search providers over the test corpus that count calls and fail on demand
pub struct CountingProvider {
    corpus: MemoryCorpus,
    pub semantic_calls: AtomicUsize,
    pub keyword_calls: AtomicUsize,
    pub fail_semantic: AtomicBool,
    pub fail_keyword: AtomicBool,
    /// Semantic calls still to fail before the index recovers
    pub semantic_failures_left: AtomicUsize,
    pub delay_ms: AtomicU64,
}

impl CountingProvider {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            corpus: MemoryCorpus::new(passages(), embedder).unwrap(),
            semantic_calls: AtomicUsize::new(0),
            keyword_calls: AtomicUsize::new(0),
            fail_semantic: AtomicBool::new(false),
            fail_keyword: AtomicBool::new(false),
            semantic_failures_left: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
        }
    }

    /// Fail the next `n` semantic calls, then answer normally
    pub fn fail_semantic_times(&self, n: usize) {
        self.semantic_failures_left.store(n, Ordering::SeqCst);
    }

    /// Add latency to every provider call
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn wait(&self) {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    pub fn calls(&self) -> (usize, usize) {
        (
            self.semantic_calls.load(Ordering::SeqCst),
            self.keyword_calls.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl SimilaritySearchProvider for CountingProvider {
    async fn similarity_search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        self.semantic_calls.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        let fail_once = self
            .semantic_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail_once || self.fail_semantic.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("vector index down".to_string()));
        }
        self.corpus.similarity_search(query_embedding, top_k).await
    }

    fn name(&self) -> &str {
        "counting-vector"
    }
}

#[async_trait]
impl KeywordSearchProvider for CountingProvider {
    async fn keyword_search(
        &self,
        keywords: &[String],
        top_k: usize,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        self.keyword_calls.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        if self.fail_keyword.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("keyword index down".to_string()));
        }
        self.corpus.keyword_search(keywords, top_k).await
    }

    fn name(&self) -> &str {
        "counting-keyword"
    }
}

/// In-memory store that counts every call and can be taken offline
pub struct FlakyStore {
    inner: MemoryCacheStore,
    pub calls: AtomicUsize,
    pub offline: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryCacheStore::new(64 * 1024 * 1024),
            calls: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn enter(&self) -> Result<(), CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            Err(CacheError::Connection("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.enter()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.enter()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.enter()?;
        self.inner.delete(key).await
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        self.enter()?;
        self.inner.delete_pattern(pattern).await
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<KeyInfo>, CacheError> {
        self.enter()?;
        self.inner.scan(pattern).await
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        self.enter()?;
        self.inner.purge_expired().await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.enter()
    }

    async fn memory_stats(&self) -> Result<MemoryStats, CacheError> {
        self.enter()?;
        self.inner.memory_stats().await
    }

    fn name(&self) -> &str {
        "flaky-memory"
    }
}

pub struct FailingScorer;

impl ScoringModel for FailingScorer {
    fn score(&self, _pairs: &[(String, String)]) -> Result<Vec<f32>, RerankError> {
        Err(RerankError::Scoring("inference crashed".to_string()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Config with the cleanup loop off so only searches touch the store
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.cache.policy.enable_auto_cleanup = false;
    config
}

pub struct Harness {
    pub engine: RetrievalEngine,
    pub provider: Arc<CountingProvider>,
    pub store: Arc<FlakyStore>,
}

pub async fn harness(config: Config) -> Harness {
    harness_with_scorer(config, Arc::new(LexicalScorer::new("lexical"))).await
}

pub async fn harness_with_scorer(config: Config, scorer: Arc<dyn ScoringModel>) -> Harness {
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbedder::default());
    let provider = Arc::new(CountingProvider::new(Arc::clone(&embedder)));
    let store = Arc::new(FlakyStore::new());

    let engine = RetrievalEngine::builder(config, embedder, provider.clone(), provider.clone())
        .store(store.clone())
        .scorers(scorer, None)
        .build()
        .await
        .unwrap();

    Harness {
        engine,
        provider,
        store,
    }
}
