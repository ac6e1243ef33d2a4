//! Result deduplication by passage ID

use crate::retrieval::SearchResult;
use std::collections::HashMap;

/// Deduplicate results by passage id, keeping the highest-scored instance
///
/// The surviving instance takes the position of the first occurrence, so an
/// already score-sorted list stays sorted.
pub fn deduplicate_results(results: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut deduped: Vec<SearchResult> = Vec::with_capacity(results.len());

    for result in results {
        match positions.get(&result.id) {
            Some(&i) => {
                if result.score > deduped[i].score {
                    deduped[i] = result;
                }
            }
            None => {
                positions.insert(result.id.clone(), deduped.len());
                deduped.push(result);
            }
        }
    }

    deduped
}
