//! Scoring models for the reranking stage

use crate::error::{RetrievalError, ValidationError};
use crate::retrieval::extract_keywords;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RerankError {
    #[error("Reranker initialization failed: {0}")]
    Initialization(String),

    #[error("Scoring failed: {0}")]
    Scoring(String),

    #[error("Reranking timed out after {0:?}")]
    Timeout(Duration),

    #[error("Model returned {actual} scores for {expected} pairs")]
    ScoreCountMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Deterministic hash scores, for tests
    Mock,
    /// Query term overlap
    Lexical,
    /// FastEmbed cross-encoder (requires the `fastembed` feature)
    FastEmbed,
}

impl FromStr for ModelKind {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "lexical" => Ok(Self::Lexical),
            "fastembed" => Ok(Self::FastEmbed),
            other => Err(RetrievalError::ConfigValidation {
                errors: vec![ValidationError::new(
                    "rerank.primary.kind",
                    format!("Unknown model kind '{}', expected mock, lexical or fastembed", other),
                )],
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub kind: ModelKind,
    pub name: String,
}

impl ModelConfig {
    pub fn new(kind: ModelKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

/// Scores (query, passage) pairs; higher is more relevant
///
/// Implementations are CPU-bound and are called on the blocking pool, one
/// batch at a time. Must return exactly one score per pair.
pub trait ScoringModel: Send + Sync {
    fn score(&self, pairs: &[(String, String)]) -> Result<Vec<f32>, RerankError>;

    fn name(&self) -> &str;
}

/// Build the model described by `config`
pub fn load_model(config: &ModelConfig) -> Result<Arc<dyn ScoringModel>, RerankError> {
    match config.kind {
        ModelKind::Mock => Ok(Arc::new(MockScorer::new(&config.name))),
        ModelKind::Lexical => Ok(Arc::new(LexicalScorer::new(&config.name))),
        #[cfg(feature = "fastembed")]
        ModelKind::FastEmbed => Ok(Arc::new(FastEmbedScorer::new(&config.name)?)),
        #[cfg(not(feature = "fastembed"))]
        ModelKind::FastEmbed => Err(RerankError::Initialization(format!(
            "{}: built without the fastembed feature",
            config.name
        ))),
    }
}

/// Pseudo-random but stable score in [0, 1) per pair
pub struct MockScorer {
    name: String,
}

impl MockScorer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl ScoringModel for MockScorer {
    fn score(&self, pairs: &[(String, String)]) -> Result<Vec<f32>, RerankError> {
        Ok(pairs
            .iter()
            .map(|(query, passage)| {
                let mut hasher = blake3::Hasher::new();
                hasher.update(query.as_bytes());
                hasher.update(&[0]);
                hasher.update(passage.as_bytes());
                let bytes = hasher.finalize();
                let mut word = [0u8; 4];
                word.copy_from_slice(&bytes.as_bytes()[..4]);
                (u32::from_le_bytes(word) >> 8) as f32 / (1u32 << 24) as f32
            })
            .collect())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Fraction of the query's keywords present in the passage
///
/// Small bonus for passages that also contain the query as a phrase.
pub struct LexicalScorer {
    name: String,
}

impl LexicalScorer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn score_pair(query: &str, passage: &str) -> f32 {
        let terms = extract_keywords(query, &[]);
        if terms.is_empty() {
            return 0.0;
        }

        let passage_lower = passage.to_lowercase();
        let passage_terms: HashSet<&str> = passage_lower
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|t| !t.is_empty())
            .collect();

        let matched = terms
            .iter()
            .filter(|t| passage_terms.contains(t.as_str()))
            .count();
        let overlap = matched as f32 / terms.len() as f32;

        let phrase = terms.join(" ");
        let bonus = if terms.len() > 1 && passage_lower.contains(&phrase) {
            0.1
        } else {
            0.0
        };

        (overlap * 0.9 + bonus).min(1.0)
    }
}

impl ScoringModel for LexicalScorer {
    fn score(&self, pairs: &[(String, String)]) -> Result<Vec<f32>, RerankError> {
        Ok(pairs
            .iter()
            .map(|(query, passage)| Self::score_pair(query, passage))
            .collect())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Cross-encoder reranking using FastEmbed
///
/// **Important**: The model is downloaded to `~/.cache/huggingface/` on first use.
#[cfg(feature = "fastembed")]
pub struct FastEmbedScorer {
    model: fastembed::TextRerank,
    name: String,
}

#[cfg(feature = "fastembed")]
impl FastEmbedScorer {
    pub fn new(name: &str) -> Result<Self, RerankError> {
        use fastembed::{RerankInitOptions, RerankerModel, TextRerank};

        let model = match name {
            "BAAI/bge-reranker-base" | "bge-reranker-base" => RerankerModel::BGERerankerBase,
            "jinaai/jina-reranker-v1-turbo-en" | "jina-reranker-v1-turbo-en" => {
                RerankerModel::JINARerankerV1TurboEn
            }
            _ => {
                return Err(RerankError::Initialization(format!(
                    "Unsupported reranker model: {}. Supported: bge-reranker-base, jina-reranker-v1-turbo-en",
                    name
                )))
            }
        };

        tracing::info!("Initializing reranker model: {}", name);
        let options = RerankInitOptions::new(model).with_show_download_progress(true);
        let model = TextRerank::try_new(options)
            .map_err(|e| RerankError::Initialization(e.to_string()))?;

        Ok(Self {
            model,
            name: name.to_string(),
        })
    }
}

#[cfg(feature = "fastembed")]
impl ScoringModel for FastEmbedScorer {
    fn score(&self, pairs: &[(String, String)]) -> Result<Vec<f32>, RerankError> {
        let mut scores = vec![0.0_f32; pairs.len()];

        // Pairs normally share one query; score each query group in one call
        let mut start = 0;
        while start < pairs.len() {
            let query = &pairs[start].0;
            let end = pairs[start..]
                .iter()
                .position(|(q, _)| q != query)
                .map_or(pairs.len(), |offset| start + offset);

            let documents: Vec<&str> = pairs[start..end].iter().map(|(_, d)| d.as_str()).collect();
            let ranked = self
                .model
                .rerank(query.as_str(), documents, false, None)
                .map_err(|e| RerankError::Scoring(e.to_string()))?;
            for result in ranked {
                scores[start + result.index] = result.score;
            }
            start = end;
        }

        Ok(scores)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
