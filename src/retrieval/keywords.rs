//! Keyword extraction for the keyword search leg

use std::collections::HashSet;
use std::sync::OnceLock;

const STOPWORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "been", "but", "by", "can", "could",
    "did", "do", "does", "for", "from", "had", "has", "have", "how", "i", "if", "in", "into",
    "is", "it", "its", "me", "my", "of", "on", "or", "our", "should", "so", "than", "that",
    "the", "their", "them", "then", "there", "these", "they", "this", "to", "was", "we",
    "were", "what", "when", "where", "which", "who", "why", "will", "with", "would", "you",
    "your",
];

const MIN_TOKEN_CHARS: usize = 2;

fn stopwords() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STOPWORDS.iter().copied().collect())
}

/// Extract search keywords from a query
///
/// Lowercases, splits on anything that is not a letter, digit or underscore,
/// drops stopwords and short tokens, and de-duplicates preserving order.
/// `extra_stopwords` are matched case-insensitively.
pub fn extract_keywords(query: &str, extra_stopwords: &[String]) -> Vec<String> {
    let lowered = query.to_lowercase();
    let extra: HashSet<String> = extra_stopwords.iter().map(|w| w.to_lowercase()).collect();
    let mut seen: HashSet<&str> = HashSet::new();

    lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|token| token.chars().count() >= MIN_TOKEN_CHARS)
        .filter(|token| !stopwords().contains(*token) && !extra.contains(*token))
        .filter(|token| seen.insert(*token))
        .map(str::to_string)
        .collect()
}
