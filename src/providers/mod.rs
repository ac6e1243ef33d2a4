//! External search collaborators
//!
//! The vector index and the keyword index are black boxes to the pipeline.
//! They are reached through the traits below:
//! - EmbeddingProvider turns query text into a vector (CPU-bound, sync)
//! - SimilaritySearchProvider answers nearest-neighbour queries
//! - KeywordSearchProvider answers term queries
//!
//! `MemoryCorpus` implements both search traits over an in-process passage
//! list and backs the CLI and the tests.

mod embedding;
mod memory;

#[cfg(feature = "fastembed")]
pub use embedding::FastEmbedProvider;
pub use embedding::{EmbeddingError, EmbeddingProvider, HashingEmbedder};
pub use memory::{MemoryCorpus, Passage};

use crate::retrieval::SearchResult;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Search provider unavailable: {0}")]
    Unavailable(String),

    #[error("Search request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Nearest-neighbour search over passage embeddings
#[async_trait]
pub trait SimilaritySearchProvider: Send + Sync {
    /// Return up to `top_k` passages ordered by similarity, highest first
    async fn similarity_search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<SearchResult>, ProviderError>;

    fn name(&self) -> &str;
}

/// Term search over passage text
#[async_trait]
pub trait KeywordSearchProvider: Send + Sync {
    /// Return up to `top_k` passages matching `keywords`, highest score first
    async fn keyword_search(
        &self,
        keywords: &[String],
        top_k: usize,
    ) -> Result<Vec<SearchResult>, ProviderError>;

    fn name(&self) -> &str;
}
