use crate::retrieval::RetrievalConfig;

/// Bumped whenever the key layout changes so old entries stop matching
const KEY_VERSION: &[u8] = b"v1";

/// Deterministic cache key for a query under `config`
///
/// Hashes a length-prefixed encoding of the query bytes, search mode, top_k,
/// the threshold's bit pattern and the rerank flag. `enable_cache` and the TTL
/// override do not change which results a query produces, so they are not
/// part of the key.
pub fn cache_key(prefix: &str, query: &str, config: &RetrievalConfig) -> String {
    let mut hasher = blake3::Hasher::new();
    write_field(&mut hasher, KEY_VERSION);
    write_field(&mut hasher, query.as_bytes());
    write_field(&mut hasher, config.search_mode.as_str().as_bytes());
    write_field(&mut hasher, &(config.top_k as u64).to_le_bytes());
    write_field(&mut hasher, &config.similarity_threshold.to_bits().to_le_bytes());
    write_field(&mut hasher, &[u8::from(config.enable_rerank)]);
    format!("{}{}", prefix, hasher.finalize().to_hex())
}

fn write_field(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
