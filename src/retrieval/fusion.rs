//! Score fusion for hybrid search

use crate::error::{RetrievalError, ValidationError};
use crate::retrieval::{SearchResult, SEARCH_LEG_KEY};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// How hybrid legs are merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionStrategy {
    /// Weighted raw scores, higher weighted score wins per passage
    Weighted,
    /// Weighted Reciprocal Rank Fusion
    Rrf,
}

/// Configuration for fusion algorithm
#[derive(Debug, Clone, PartialEq)]
pub struct FusionConfig {
    pub strategy: FusionStrategy,

    /// RRF K constant (typically 60)
    pub rrf_k: f32,

    /// Weight for semantic results
    pub semantic_weight: f32,

    /// Weight for keyword results
    pub keyword_weight: f32,
}

impl FusionConfig {
    pub fn new(
        strategy: FusionStrategy,
        rrf_k: f32,
        semantic_weight: f32,
        keyword_weight: f32,
    ) -> Result<Self, RetrievalError> {
        let mut errors = Vec::new();
        if semantic_weight <= 0.0 {
            errors.push(ValidationError::new(
                "search.semantic_weight",
                "Semantic weight must be positive",
            ));
        }
        if keyword_weight < 0.0 {
            errors.push(ValidationError::new(
                "search.keyword_weight",
                "Keyword weight must not be negative",
            ));
        }
        if rrf_k < 0.0 {
            errors.push(ValidationError::new(
                "search.rrf_k",
                "RRF k must not be negative",
            ));
        }
        if !errors.is_empty() {
            return Err(RetrievalError::ConfigValidation { errors });
        }

        Ok(Self {
            strategy,
            rrf_k,
            semantic_weight,
            keyword_weight,
        })
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            strategy: FusionStrategy::Weighted,
            rrf_k: 60.0,
            semantic_weight: 1.0,
            keyword_weight: 0.3,
        }
    }
}

/// Merge semantic and keyword legs with the configured strategy
pub fn fuse_results(
    semantic: Vec<SearchResult>,
    keyword: Vec<SearchResult>,
    config: &FusionConfig,
) -> Vec<SearchResult> {
    match config.strategy {
        FusionStrategy::Weighted => weighted_fusion(semantic, keyword, config),
        FusionStrategy::Rrf => reciprocal_rank_fusion(semantic, keyword, config),
    }
}

struct Fused {
    result: SearchResult,
    semantic: Option<f32>,
    keyword: Option<f32>,
}

impl Fused {
    fn leg(&self) -> &'static str {
        match (self.semantic.is_some(), self.keyword.is_some()) {
            (true, true) => "both",
            (true, false) => "semantic",
            _ => "keyword",
        }
    }
}

/// Weighted score merge
///
/// Semantic scores are multiplied by `semantic_weight`; keyword scores are
/// max-normalized to [0, 1] first, then multiplied by `keyword_weight`.
/// A passage found by both legs keeps the higher weighted score. Equal scores
/// are ordered by keyword score.
pub fn weighted_fusion(
    semantic: Vec<SearchResult>,
    keyword: Vec<SearchResult>,
    config: &FusionConfig,
) -> Vec<SearchResult> {
    let max_keyword = keyword
        .iter()
        .map(|r| r.score)
        .fold(0.0_f32, f32::max);

    let mut order: Vec<Fused> = Vec::with_capacity(semantic.len() + keyword.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for result in semantic {
        let raw = result.score;
        let weighted = raw * config.semantic_weight;
        match index.get(&result.id) {
            Some(&i) => {
                let entry = &mut order[i];
                entry.semantic = Some(entry.semantic.map_or(raw, |s| s.max(raw)));
                if weighted > entry.result.score {
                    entry.result.score = weighted;
                }
            }
            None => {
                index.insert(result.id.clone(), order.len());
                let mut result = result;
                result.score = weighted;
                order.push(Fused {
                    result,
                    semantic: Some(raw),
                    keyword: None,
                });
            }
        }
    }

    for result in keyword {
        let normalized = if max_keyword > 0.0 {
            result.score / max_keyword
        } else {
            0.0
        };
        let weighted = normalized * config.keyword_weight;
        match index.get(&result.id) {
            Some(&i) => {
                let entry = &mut order[i];
                entry.keyword = Some(entry.keyword.map_or(normalized, |k| k.max(normalized)));
                if weighted > entry.result.score {
                    entry.result.score = weighted;
                }
            }
            None => {
                index.insert(result.id.clone(), order.len());
                let mut result = result;
                result.score = weighted;
                order.push(Fused {
                    result,
                    semantic: None,
                    keyword: Some(normalized),
                });
            }
        }
    }

    order.sort_by(|a, b| {
        b.result
            .score
            .partial_cmp(&a.result.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.keyword
                    .unwrap_or(0.0)
                    .partial_cmp(&a.keyword.unwrap_or(0.0))
                    .unwrap_or(Ordering::Equal)
            })
    });

    order.into_iter().map(annotate).collect()
}

/// Apply Reciprocal Rank Fusion to combine two ranked lists
///
/// RRF formula: score(id) = sum over all rankings of: weight / (k + rank)
pub fn reciprocal_rank_fusion(
    semantic: Vec<SearchResult>,
    keyword: Vec<SearchResult>,
    config: &FusionConfig,
) -> Vec<SearchResult> {
    let mut order: Vec<Fused> = Vec::with_capacity(semantic.len() + keyword.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    let legs = [
        (semantic, config.semantic_weight, true),
        (keyword, config.keyword_weight, false),
    ];

    for (results, weight, is_semantic) in legs {
        for (rank, result) in results.into_iter().enumerate() {
            let rrf_score = weight / (config.rrf_k + (rank as f32) + 1.0);
            let raw = result.score;
            let i = match index.get(&result.id) {
                Some(&i) => {
                    order[i].result.score += rrf_score;
                    i
                }
                None => {
                    index.insert(result.id.clone(), order.len());
                    let mut result = result;
                    result.score = rrf_score;
                    order.push(Fused {
                        result,
                        semantic: None,
                        keyword: None,
                    });
                    order.len() - 1
                }
            };
            if is_semantic {
                order[i].semantic.get_or_insert(raw);
            } else {
                order[i].keyword.get_or_insert(raw);
            }
        }
    }

    order.sort_by(|a, b| {
        b.result
            .score
            .partial_cmp(&a.result.score)
            .unwrap_or(Ordering::Equal)
    });

    order.into_iter().map(annotate).collect()
}

fn annotate(fused: Fused) -> SearchResult {
    let leg = fused.leg();
    let mut result = fused.result;
    if let Some(s) = fused.semantic {
        result.set_metadata("semantic_score", f64::from(s));
    }
    if let Some(k) = fused.keyword {
        result.set_metadata("keyword_score", f64::from(k));
    }
    result.set_metadata(SEARCH_LEG_KEY, leg);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(pairs: &[(&str, f32)]) -> Vec<SearchResult> {
        pairs
            .iter()
            .map(|(id, score)| SearchResult::new(*id, "doc", format!("text {}", id), *score))
            .collect()
    }

    #[test]
    fn test_weighted_semantic_dominates() {
        let semantic = results(&[("a", 0.9), ("b", 0.5)]);
        let keyword = results(&[("c", 12.0), ("b", 6.0)]);

        let fused = weighted_fusion(semantic, keyword, &FusionConfig::default());
        let ids: Vec<_> = fused.iter().map(|r| r.id.as_str()).collect();

        // b: max(0.5, 0.5 * 0.3) = 0.5; c: 1.0 * 0.3 = 0.3
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(fused[1].metadata[SEARCH_LEG_KEY], "both");
    }

    #[test]
    fn test_weighted_dedup_keeps_higher_score() {
        let semantic = results(&[("a", 0.1)]);
        let keyword = results(&[("a", 4.0)]);
        let config = FusionConfig::new(FusionStrategy::Weighted, 60.0, 1.0, 0.5).unwrap();

        let fused = weighted_fusion(semantic, keyword, &config);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_keyword_breaks_ties() {
        let semantic = results(&[("a", 0.5), ("b", 0.5)]);
        let keyword = results(&[("b", 1.0)]);
        let config = FusionConfig::new(FusionStrategy::Weighted, 60.0, 1.0, 0.1).unwrap();

        let fused = weighted_fusion(semantic, keyword, &config);
        assert_eq!(fused[0].id, "b");
    }

    #[test]
    fn test_rrf_basic() {
        let semantic = results(&[("1", 0.9), ("2", 0.8), ("3", 0.7)]);
        let keyword = results(&[("2", 0.95), ("1", 0.85), ("4", 0.75)]);

        let config = FusionConfig::new(FusionStrategy::Rrf, 60.0, 1.0, 1.0).unwrap();
        let fused = reciprocal_rank_fusion(semantic, keyword, &config);

        assert_eq!(fused.len(), 4);
        // IDs 1 and 2 appear in both lists, should rank higher
        assert!(fused[0].id == "1" || fused[0].id == "2");
    }

    #[test]
    fn test_rrf_weighted() {
        let config = FusionConfig::new(FusionStrategy::Rrf, 60.0, 0.7, 0.3).unwrap();
        let fused = reciprocal_rank_fusion(results(&[("1", 0.9)]), results(&[("2", 0.9)]), &config);

        assert_eq!(fused[0].id, "1");
    }

    #[test]
    fn test_invalid_weights() {
        assert!(FusionConfig::new(FusionStrategy::Weighted, 60.0, 0.0, 0.3).is_err());
        assert!(FusionConfig::new(FusionStrategy::Weighted, 60.0, 1.0, -0.1).is_err());
    }
}
