//! In-process passage corpus implementing both search provider traits

use super::{EmbeddingProvider, KeywordSearchProvider, ProviderError, SimilaritySearchProvider};
use crate::error::{Result, RetrievalError};
use crate::retrieval::{SearchResult, CHUNK_INDEX_KEY, ORIGINAL_RANK_KEY};
use ahash::AHashMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

const BM25_K1: f32 = 1.5;
const BM25_B: f32 = 0.75;

/// One passage record, as stored in a JSON-lines corpus file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    pub id: String,
    pub document_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u64>,
}

struct IndexedPassage {
    passage: Passage,
    embedding: Vec<f32>,
    term_freqs: AHashMap<String, u32>,
    length: usize,
}

/// Brute-force cosine search plus BM25 keyword scoring over a fixed passage set
pub struct MemoryCorpus {
    passages: Vec<IndexedPassage>,
    dimension: usize,
    doc_freqs: AHashMap<String, usize>,
    avg_length: f32,
}

impl MemoryCorpus {
    /// Embed and index passages
    pub fn new(passages: Vec<Passage>, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let dimension = embedder.dimension();
        let contents: Vec<String> = passages.iter().map(|p| p.content.clone()).collect();
        let embeddings = embedder
            .embed_batch(&contents)
            .map_err(|e| corpus_error(format!("Failed to embed corpus: {}", e)))?;
        if embeddings.len() != passages.len() {
            return Err(corpus_error(format!(
                "{} returned {} embeddings for {} passages",
                embedder.model_name(),
                embeddings.len(),
                passages.len()
            )));
        }

        let mut indexed = Vec::with_capacity(passages.len());
        let mut doc_freqs: AHashMap<String, usize> = AHashMap::new();

        for (passage, embedding) in passages.into_iter().zip(embeddings) {
            if embedding.len() != dimension {
                return Err(corpus_error(format!(
                    "Passage {} has a {}-dimension embedding, {} declares {}",
                    passage.id,
                    embedding.len(),
                    embedder.model_name(),
                    dimension
                )));
            }

            let tokens = tokenize(&passage.content);
            let mut term_freqs: AHashMap<String, u32> = AHashMap::new();
            for token in &tokens {
                *term_freqs.entry(token.clone()).or_insert(0) += 1;
            }
            for term in term_freqs.keys() {
                *doc_freqs.entry(term.clone()).or_insert(0) += 1;
            }

            indexed.push(IndexedPassage {
                passage,
                embedding,
                term_freqs,
                length: tokens.len(),
            });
        }

        let avg_length = if indexed.is_empty() {
            0.0
        } else {
            indexed.iter().map(|p| p.length).sum::<usize>() as f32 / indexed.len() as f32
        };

        tracing::debug!("Indexed {} passages in memory corpus", indexed.len());

        Ok(Self {
            passages: indexed,
            dimension,
            doc_freqs,
            avg_length,
        })
    }

    /// Load a JSON-lines file of [`Passage`] records
    pub fn from_jsonl(path: &Path, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| RetrievalError::Io {
            source: e,
            context: format!("Failed to open corpus file: {}", path.display()),
        })?;

        let mut passages = Vec::new();
        for (line_no, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| RetrievalError::Io {
                source: e,
                context: format!("Failed to read corpus line {}", line_no + 1),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let passage: Passage =
                serde_json::from_str(&line).map_err(|e| RetrievalError::Json {
                    source: e,
                    context: format!("Invalid passage on line {}", line_no + 1),
                })?;
            passages.push(passage);
        }

        Self::new(passages, embedder)
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Embedding dimension the index was built with
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn to_result(passage: &Passage, score: f32, rank: usize) -> SearchResult {
        let mut result = SearchResult::new(
            passage.id.clone(),
            passage.document_id.clone(),
            passage.content.clone(),
            score,
        )
        .with_metadata(ORIGINAL_RANK_KEY, rank as u64);
        if let Some(chunk_index) = passage.chunk_index {
            result.set_metadata(CHUNK_INDEX_KEY, chunk_index);
        }
        result
    }

    fn idf(&self, term: &str) -> f32 {
        let n = self.passages.len() as f32;
        let df = self.doc_freqs.get(term).copied().unwrap_or(0) as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    fn bm25(&self, passage: &IndexedPassage, keywords: &[String]) -> f32 {
        let length_norm = if self.avg_length > 0.0 {
            1.0 - BM25_B + BM25_B * passage.length as f32 / self.avg_length
        } else {
            1.0
        };

        keywords
            .iter()
            .filter_map(|term| {
                let tf = *passage.term_freqs.get(term.as_str())? as f32;
                Some(self.idf(term) * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * length_norm))
            })
            .sum()
    }

    fn rank(mut scored: Vec<(usize, f32)>, top_k: usize) -> Vec<(usize, f32)> {
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.truncate(top_k);
        scored
    }
}

fn corpus_error(message: String) -> RetrievalError {
    RetrievalError::ConfigLoad {
        path: None,
        message,
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl SimilaritySearchProvider for MemoryCorpus {
    async fn similarity_search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
    ) -> std::result::Result<Vec<SearchResult>, ProviderError> {
        if query_embedding.len() != self.dimension {
            return Err(ProviderError::InvalidInput(format!(
                "Embedding dimension mismatch: index has {}, query has {}",
                self.dimension,
                query_embedding.len()
            )));
        }

        let scored: Vec<(usize, f32)> = self
            .passages
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let cosine: f32 = p
                    .embedding
                    .iter()
                    .zip(query_embedding)
                    .map(|(a, b)| a * b)
                    .sum();
                (i, cosine.max(0.0))
            })
            .collect();

        Ok(Self::rank(scored, top_k)
            .into_iter()
            .enumerate()
            .map(|(rank, (i, score))| Self::to_result(&self.passages[i].passage, score, rank))
            .collect())
    }

    fn name(&self) -> &str {
        "memory-cosine"
    }
}

#[async_trait]
impl KeywordSearchProvider for MemoryCorpus {
    async fn keyword_search(
        &self,
        keywords: &[String],
        top_k: usize,
    ) -> std::result::Result<Vec<SearchResult>, ProviderError> {
        let scored: Vec<(usize, f32)> = self
            .passages
            .iter()
            .enumerate()
            .map(|(i, p)| (i, self.bm25(p, keywords)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        Ok(Self::rank(scored, top_k)
            .into_iter()
            .enumerate()
            .map(|(rank, (i, score))| Self::to_result(&self.passages[i].passage, score, rank))
            .collect())
    }

    fn name(&self) -> &str {
        "memory-bm25"
    }
}
