//! User-facing error messages

use crate::error::{RetrievalError, ValidationError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    En,
    Zh,
}

impl FromStr for Locale {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "en" => Ok(Self::En),
            "zh" => Ok(Self::Zh),
            other => Err(RetrievalError::ConfigValidation {
                errors: vec![ValidationError::new(
                    "errors.locale",
                    format!("Unsupported locale '{}', expected en or zh", other),
                )],
            }),
        }
    }
}

/// Message shown to callers for an error code
pub fn user_message(code: &str, locale: Locale) -> &'static str {
    match (locale, code) {
        (Locale::En, "E_SEARCH_INVALID_QUERY") => "Please enter a search query.",
        (Locale::Zh, "E_SEARCH_INVALID_QUERY") => "请输入搜索内容。",
        (Locale::En, "E_SEARCH_MODE") => {
            "The selected search mode is unavailable. Try another mode or retry later."
        }
        (Locale::Zh, "E_SEARCH_MODE") => "所选搜索模式暂不可用，请更换模式或稍后重试。",
        (Locale::En, "E_SEARCH_EXHAUSTED") => {
            "Search is temporarily unavailable. Please try again later."
        }
        (Locale::Zh, "E_SEARCH_EXHAUSTED") => "搜索服务暂时不可用，请稍后重试。",
        (Locale::En, "E_CACHE_CONNECTION" | "E_CACHE_OPERATION") => {
            "Results were retrieved without the cache."
        }
        (Locale::Zh, "E_CACHE_CONNECTION" | "E_CACHE_OPERATION") => "缓存不可用，结果未经缓存直接返回。",
        (Locale::En, "E_RERANK_MODEL" | "E_RERANK_COMPUTE") => {
            "Results are shown in their original order."
        }
        (Locale::Zh, "E_RERANK_MODEL" | "E_RERANK_COMPUTE") => "重排序暂不可用，结果按原始顺序显示。",
        (Locale::En, "E_CONFIG_VALIDATION" | "E_CONFIG_LOAD") => {
            "Invalid settings were replaced with defaults."
        }
        (Locale::Zh, "E_CONFIG_VALIDATION" | "E_CONFIG_LOAD") => "配置无效，已使用默认设置。",
        (Locale::En, _) => "An unexpected error occurred. Please try again later.",
        (Locale::Zh, _) => "发生意外错误，请稍后重试。",
    }
}
