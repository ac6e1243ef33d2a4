//! Result reranking
//!
//! A [`ScoringModel`] scores (query, passage) pairs; the
//! [`RerankingService`] batches pairs, bounds concurrent inference, and falls
//! back to a secondary model or the original order when scoring fails.

mod model;
mod service;

#[cfg(feature = "fastembed")]
pub use model::FastEmbedScorer;
pub use model::{
    load_model, LexicalScorer, MockScorer, ModelConfig, ModelKind, RerankError, ScoringModel,
};
pub use service::{RerankOutcome, RerankingMetrics, RerankingService};
