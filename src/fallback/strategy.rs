use super::ErrorContext;
use crate::error::ErrorCategory;
use crate::retrieval::SearchMode;
use serde::{Deserialize, Serialize};

/// What the pipeline does instead of failing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FallbackAction {
    DowngradeSearchMode { from: SearchMode, to: SearchMode },
    SkipRerank,
    BypassCache,
    RevertConfig,
    None,
}

impl FallbackAction {
    pub fn describe(&self) -> String {
        match self {
            Self::DowngradeSearchMode { from, to } => format!("downgraded {} search to {}", from, to),
            Self::SkipRerank => "skipped reranking".to_string(),
            Self::BypassCache => "bypassed cache".to_string(),
            Self::RevertConfig => "reverted to last valid configuration".to_string(),
            Self::None => "no fallback".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackDecision {
    pub handled: bool,
    pub action: FallbackAction,
}

impl FallbackDecision {
    pub fn handled(action: FallbackAction) -> Self {
        Self {
            handled: true,
            action,
        }
    }

    pub fn unhandled() -> Self {
        Self {
            handled: false,
            action: FallbackAction::None,
        }
    }
}

/// One link in the fallback chain
///
/// The handler asks each strategy in order; the first handled decision wins.
pub trait FallbackStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn applies_to(&self, context: &ErrorContext) -> bool;

    fn decide(&self, context: &ErrorContext) -> FallbackDecision;
}

/// Hybrid search failures retry as semantic; other modes have nowhere to go
pub struct SearchModeDowngrade;

impl FallbackStrategy for SearchModeDowngrade {
    fn name(&self) -> &str {
        "search_mode_downgrade"
    }

    fn applies_to(&self, context: &ErrorContext) -> bool {
        context.category == ErrorCategory::Search
    }

    fn decide(&self, context: &ErrorContext) -> FallbackDecision {
        match context.search_mode {
            Some(SearchMode::Hybrid) => FallbackDecision::handled(FallbackAction::DowngradeSearchMode {
                from: SearchMode::Hybrid,
                to: SearchMode::Semantic,
            }),
            _ => FallbackDecision::unhandled(),
        }
    }
}

pub struct SkipRerank;

impl FallbackStrategy for SkipRerank {
    fn name(&self) -> &str {
        "skip_rerank"
    }

    fn applies_to(&self, context: &ErrorContext) -> bool {
        context.category == ErrorCategory::Rerank
    }

    fn decide(&self, _context: &ErrorContext) -> FallbackDecision {
        FallbackDecision::handled(FallbackAction::SkipRerank)
    }
}

pub struct BypassCache;

impl FallbackStrategy for BypassCache {
    fn name(&self) -> &str {
        "bypass_cache"
    }

    fn applies_to(&self, context: &ErrorContext) -> bool {
        context.category == ErrorCategory::Cache
    }

    fn decide(&self, _context: &ErrorContext) -> FallbackDecision {
        FallbackDecision::handled(FallbackAction::BypassCache)
    }
}

pub struct RevertConfig;

impl FallbackStrategy for RevertConfig {
    fn name(&self) -> &str {
        "revert_config"
    }

    fn applies_to(&self, context: &ErrorContext) -> bool {
        context.category == ErrorCategory::Config
    }

    fn decide(&self, _context: &ErrorContext) -> FallbackDecision {
        FallbackDecision::handled(FallbackAction::RevertConfig)
    }
}

/// Search, rerank, cache and config strategies in that order
pub fn default_strategies() -> Vec<Box<dyn FallbackStrategy>> {
    vec![
        Box::new(SearchModeDowngrade),
        Box::new(SkipRerank),
        Box::new(BypassCache),
        Box::new(RevertConfig),
    ]
}
