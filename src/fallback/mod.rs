//! Error handling and fallback decisions
//!
//! Every recoverable failure in the pipeline is described by an
//! [`ErrorContext`] and passed to the [`ErrorHandler`], which asks its ordered
//! strategies for a fallback, keeps rolling statistics and turns the error
//! into a caller-safe [`ErrorResponse`].

mod messages;
mod strategy;

pub use messages::{user_message, Locale};
pub use strategy::{
    default_strategies, BypassCache, FallbackAction, FallbackDecision, FallbackStrategy,
    RevertConfig, SearchModeDowngrade, SkipRerank,
};

use crate::error::{ErrorCategory, RetrievalError, Severity};
use crate::monitor::{AlertLevel, AlertManager};
use crate::retrieval::SearchMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Where and how an error happened
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: String,
    pub operation: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub code: &'static str,
    pub technical_message: String,
    /// Mode being executed, for search errors
    pub search_mode: Option<SearchMode>,
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorContext {
    pub fn from_error(error: &RetrievalError, component: &str, operation: &str) -> Self {
        Self {
            component: component.to_string(),
            operation: operation.to_string(),
            category: error.category(),
            severity: error.severity(),
            code: error.code(),
            technical_message: error.to_string(),
            search_mode: None,
            request_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_search_mode(mut self, mode: SearchMode) -> Self {
        self.search_mode = Some(mode);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    fn fingerprint(&self) -> String {
        format!("{}:{}:{}", self.component, self.operation, self.code)
    }
}

/// What a caller sees when an error reaches the surface
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("{code}: {user_message}")]
pub struct ErrorResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub code: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    /// Localized, free of internals
    pub user_message: String,
    pub technical_message: String,
    pub fallback_action: FallbackAction,
    /// A fallback strategy handled the error
    pub fallback_applied: bool,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of error statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub operations: u64,
    /// total_errors / operations, 0 when nothing was recorded
    pub error_rate: f64,
    pub by_category: BTreeMap<ErrorCategory, u64>,
    pub by_severity: BTreeMap<Severity, u64>,
    pub fallbacks_applied: u64,
    pub fallbacks_exhausted: u64,
    pub repeated_error_alerts: u64,
}

#[derive(Default)]
struct StatsState {
    stats: ErrorStats,
    recent: VecDeque<(Instant, String)>,
}

pub struct ErrorHandler {
    strategies: Vec<Box<dyn FallbackStrategy>>,
    locale: Locale,
    repeated_threshold: u32,
    window: Duration,
    alerts: Option<Arc<AlertManager>>,
    state: Mutex<StatsState>,
}

impl ErrorHandler {
    /// Handler with the default strategy chain
    pub fn new(locale: Locale) -> Self {
        Self::with_strategies(locale, default_strategies())
    }

    pub fn with_strategies(locale: Locale, strategies: Vec<Box<dyn FallbackStrategy>>) -> Self {
        Self {
            strategies,
            locale,
            repeated_threshold: 5,
            window: Duration::from_secs(300),
            alerts: None,
            state: Mutex::new(StatsState::default()),
        }
    }

    /// Raise an alert when the same error repeats `threshold` times within `window`
    pub fn with_repeated_error_alerts(
        mut self,
        alerts: Arc<AlertManager>,
        threshold: u32,
        window: Duration,
    ) -> Self {
        self.alerts = Some(alerts);
        self.repeated_threshold = threshold.max(1);
        self.window = window;
        self
    }

    pub fn locale(&self) -> Locale {
        self.locale
    }

    /// Decide a fallback for `context` and build the caller-facing response
    pub fn handle(&self, context: ErrorContext) -> ErrorResponse {
        let (strategy, decision) = self.decision(&context);

        match context.severity {
            Severity::Low => tracing::debug!(
                code = context.code,
                component = %context.component,
                "{} ({})",
                context.technical_message,
                decision.action.describe()
            ),
            Severity::Medium | Severity::High => tracing::warn!(
                code = context.code,
                component = %context.component,
                strategy = strategy.unwrap_or("none"),
                "{} ({})",
                context.technical_message,
                decision.action.describe()
            ),
            Severity::Critical => tracing::error!(
                code = context.code,
                component = %context.component,
                "{}",
                context.technical_message
            ),
        }

        self.record(&context, decision.handled);

        ErrorResponse {
            request_id: context.request_id.clone(),
            code: context.code.to_string(),
            category: context.category,
            severity: context.severity,
            user_message: user_message(context.code, self.locale).to_string(),
            technical_message: context.technical_message,
            fallback_action: decision.action,
            fallback_applied: decision.handled,
            timestamp: context.timestamp,
        }
    }

    /// Fallback the strategies would pick for `context`, without logging or
    /// counting the error
    pub fn decide(&self, context: &ErrorContext) -> FallbackAction {
        self.decision(context).1.action
    }

    fn decision(&self, context: &ErrorContext) -> (Option<&str>, FallbackDecision) {
        self.strategies
            .iter()
            .filter(|s| s.applies_to(context))
            .map(|s| (s.name(), s.decide(context)))
            .find(|(_, d)| d.handled)
            .map(|(name, decision)| (Some(name), decision))
            .unwrap_or_else(|| (None, FallbackDecision::unhandled()))
    }

    /// Count one pipeline operation for the error rate
    pub fn record_operation(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.stats.operations += 1;
    }

    pub fn stats(&self) -> ErrorStats {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stats = state.stats.clone();
        stats.error_rate = if stats.operations == 0 {
            0.0
        } else {
            stats.total_errors as f64 / stats.operations as f64
        };
        stats
    }

    fn record(&self, context: &ErrorContext, handled: bool) {
        let fingerprint = context.fingerprint();
        let now = Instant::now();

        let repeated = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let stats = &mut state.stats;
            stats.total_errors += 1;
            *stats.by_category.entry(context.category).or_insert(0) += 1;
            *stats.by_severity.entry(context.severity).or_insert(0) += 1;
            if handled {
                stats.fallbacks_applied += 1;
            } else {
                stats.fallbacks_exhausted += 1;
            }

            while let Some((at, _)) = state.recent.front() {
                if now.duration_since(*at) > self.window {
                    state.recent.pop_front();
                } else {
                    break;
                }
            }
            state.recent.push_back((now, fingerprint.clone()));

            let occurrences = state
                .recent
                .iter()
                .filter(|(_, f)| *f == fingerprint)
                .count();
            occurrences >= self.repeated_threshold as usize
        };

        if !repeated {
            return;
        }

        if let Some(alerts) = &self.alerts {
            let raised = alerts.raise(
                &format!("errors.{}", fingerprint),
                AlertLevel::Warning,
                &context.component,
                format!(
                    "{} repeated {}+ times within {:?}: {}",
                    context.code, self.repeated_threshold, self.window, context.technical_message
                ),
            );
            if raised.is_some() {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                state.stats.repeated_error_alerts += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_error(mode: SearchMode) -> ErrorContext {
        let err = RetrievalError::SearchMode {
            mode,
            message: "provider down".to_string(),
        };
        ErrorContext::from_error(&err, "search_router", "route").with_search_mode(mode)
    }

    #[test]
    fn test_hybrid_downgrades_to_semantic() {
        let handler = ErrorHandler::new(Locale::En);
        let response = handler.handle(search_error(SearchMode::Hybrid));

        assert!(response.fallback_applied);
        assert_eq!(
            response.fallback_action,
            FallbackAction::DowngradeSearchMode {
                from: SearchMode::Hybrid,
                to: SearchMode::Semantic
            }
        );
    }

    #[test]
    fn test_semantic_has_no_fallback() {
        let handler = ErrorHandler::new(Locale::En);
        let response = handler.handle(search_error(SearchMode::Semantic));

        assert!(!response.fallback_applied);
        assert_eq!(response.fallback_action, FallbackAction::None);
        assert_eq!(response.code, "E_SEARCH_MODE");
        assert!(!response.user_message.contains("provider down"));
        assert!(response.technical_message.contains("provider down"));
    }

    #[test]
    fn test_category_strategies() {
        let handler = ErrorHandler::new(Locale::Zh);

        let cache = RetrievalError::CacheConnection("refused".to_string());
        let response = handler.handle(ErrorContext::from_error(&cache, "cache", "get"));
        assert_eq!(response.fallback_action, FallbackAction::BypassCache);
        assert_eq!(response.user_message, user_message("E_CACHE_CONNECTION", Locale::Zh));

        let rerank = RetrievalError::RerankingCompute {
            model: "lexical".to_string(),
            message: "timeout".to_string(),
        };
        let response = handler.handle(ErrorContext::from_error(&rerank, "rerank", "rerank"));
        assert_eq!(response.fallback_action, FallbackAction::SkipRerank);

        let config = RetrievalError::ConfigValidation { errors: vec![] };
        let response = handler.handle(ErrorContext::from_error(&config, "engine", "search"));
        assert_eq!(response.fallback_action, FallbackAction::RevertConfig);
    }

    #[test]
    fn test_stats() {
        let handler = ErrorHandler::new(Locale::En);
        for _ in 0..4 {
            handler.record_operation();
        }
        handler.handle(search_error(SearchMode::Hybrid));
        handler.handle(search_error(SearchMode::Keyword));

        let stats = handler.stats();
        assert_eq!(stats.total_errors, 2);
        assert_eq!(stats.by_category[&ErrorCategory::Search], 2);
        assert_eq!(stats.by_severity[&Severity::High], 2);
        assert_eq!(stats.fallbacks_applied, 1);
        assert_eq!(stats.fallbacks_exhausted, 1);
        assert!((stats.error_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_decide_does_not_record() {
        let handler = ErrorHandler::new(Locale::En);
        let action = handler.decide(&search_error(SearchMode::Hybrid));

        assert_eq!(
            action,
            FallbackAction::DowngradeSearchMode {
                from: SearchMode::Hybrid,
                to: SearchMode::Semantic
            }
        );
        assert_eq!(handler.decide(&search_error(SearchMode::Keyword)), FallbackAction::None);
        assert_eq!(handler.stats().total_errors, 0);
    }

    #[test]
    fn test_repeated_errors_raise_one_alert() {
        let alerts = Arc::new(AlertManager::new());
        let handler = ErrorHandler::new(Locale::En).with_repeated_error_alerts(
            Arc::clone(&alerts),
            3,
            Duration::from_secs(60),
        );

        for _ in 0..5 {
            handler.handle(search_error(SearchMode::Keyword));
        }

        assert_eq!(alerts.active().len(), 1);
        assert_eq!(handler.stats().repeated_error_alerts, 1);
    }
}
