//! Cache entry encoding
//!
//! Layout: one tag byte followed by the JSON-encoded [`CacheEntry`], either
//! raw (`TAG_RAW`) or zstd-compressed (`TAG_ZSTD`).

use super::CacheError;
use crate::retrieval::{SearchMode, SearchResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const TAG_RAW: u8 = 0;
const TAG_ZSTD: u8 = 1;
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub query: String,
    pub mode: SearchMode,
    pub results: Vec<SearchResult>,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

pub fn encode_entry(entry: &CacheEntry, compression_threshold: usize) -> Result<Vec<u8>, CacheError> {
    let json = serde_json::to_vec(entry).map_err(|e| CacheError::Serialization(e.to_string()))?;

    if json.len() > compression_threshold {
        let compressed = zstd::encode_all(&json[..], ZSTD_LEVEL)
            .map_err(|e| CacheError::Serialization(format!("compression failed: {}", e)))?;
        let mut out = Vec::with_capacity(compressed.len() + 1);
        out.push(TAG_ZSTD);
        out.extend_from_slice(&compressed);
        Ok(out)
    } else {
        let mut out = Vec::with_capacity(json.len() + 1);
        out.push(TAG_RAW);
        out.extend_from_slice(&json);
        Ok(out)
    }
}

pub fn decode_entry(bytes: &[u8]) -> Result<CacheEntry, CacheError> {
    let (tag, body) = bytes
        .split_first()
        .ok_or_else(|| CacheError::Serialization("empty cache entry".to_string()))?;

    let json = match *tag {
        TAG_RAW => std::borrow::Cow::Borrowed(body),
        TAG_ZSTD => std::borrow::Cow::Owned(
            zstd::decode_all(body)
                .map_err(|e| CacheError::Serialization(format!("decompression failed: {}", e)))?,
        ),
        other => {
            return Err(CacheError::Serialization(format!(
                "unknown entry tag {}",
                other
            )))
        }
    };

    serde_json::from_slice(&json).map_err(|e| CacheError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(passages: usize) -> CacheEntry {
        CacheEntry {
            key: "ragpipe:search:abc".to_string(),
            query: "what is RAG?".to_string(),
            mode: SearchMode::Hybrid,
            results: (0..passages)
                .map(|i| {
                    SearchResult::new(
                        format!("p{}", i),
                        "doc",
                        "Retrieval augmented generation grounds answers in passages. ".repeat(4),
                        1.0 / (i + 1) as f32,
                    )
                    .with_metadata("chunk_index", i as u64)
                })
                .collect(),
            created_at: Utc::now(),
            ttl_secs: 3600,
        }
    }

    #[test]
    fn test_small_entries_stay_raw() {
        let original = entry(1);
        let bytes = encode_entry(&original, 1 << 20).unwrap();
        assert_eq!(bytes[0], TAG_RAW);
        assert_eq!(decode_entry(&bytes).unwrap(), original);
    }

    #[test]
    fn test_large_entries_are_compressed() {
        let original = entry(20);
        let raw_len = serde_json::to_vec(&original).unwrap().len();
        let bytes = encode_entry(&original, 256).unwrap();

        assert_eq!(bytes[0], TAG_ZSTD);
        assert!(bytes.len() < raw_len);
        assert_eq!(decode_entry(&bytes).unwrap(), original);
    }

    #[test]
    fn test_corrupt_entries_rejected() {
        assert!(decode_entry(&[]).is_err());
        assert!(decode_entry(&[9, 1, 2]).is_err());
        assert!(decode_entry(&[TAG_RAW, b'{']).is_err());
        assert!(decode_entry(&[TAG_ZSTD, 0, 0, 0]).is_err());
    }
}
