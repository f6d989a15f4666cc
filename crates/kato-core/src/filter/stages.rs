//! In-process portions of the filter pipeline's hybrid/optional stages.

use super::{char_ratio, token_ratio};
use crate::bloom::BloomCache;
use crate::error::FilterError;
use crate::minhash;
use crate::settings::SessionConfig;
use crate::settings::THRESHOLD_SLACK;
use crate::store::PatternStore;

/// `minhash` stage: db-side band-overlap prefilter, then in-process
/// re-scoring by estimated Jaccard (§4.5).
pub(super) fn minhash_stage(
    store: &dyn PatternStore,
    kb_id: &str,
    stm_sketch: &[u64],
    stm_bands: &[u64],
    within: Option<&[String]>,
    config: &SessionConfig,
) -> Result<Vec<String>, FilterError> {
    let band_candidates = store.names_with_band_overlap(kb_id, stm_bands, within)?;
    let rows = store.load_rows(kb_id, &band_candidates)?;
    Ok(rows
        .into_iter()
        .filter(|row| minhash::estimated_jaccard(&row.minhash_sketch, stm_sketch) >= config.minhash_threshold as f64)
        .map(|row| row.name)
        .collect())
}

/// `bloom` stage: process-scoped, zero-false-negative prefilter (§4.5, §5).
pub(super) fn bloom_stage(
    store: &dyn PatternStore,
    bloom_cache: &BloomCache,
    kb_id: &str,
    stm_tokens: &[String],
    within: Option<&[String]>,
) -> Result<Vec<String>, FilterError> {
    let names = match within {
        Some(names) => names.to_vec(),
        None => store.all_names(kb_id)?,
    };
    Ok(names.into_iter().filter(|name| bloom_cache.might_match(kb_id, name, stm_tokens)).collect())
}

/// `rapidfuzz` stage: fast approximate similarity, token- or character-level
/// depending on `use_token_matching`; kept candidates satisfy
/// `ratio >= recall_threshold - THRESHOLD_SLACK` (§4.5, §7).
pub(super) fn rapidfuzz_stage(
    store: &dyn PatternStore,
    kb_id: &str,
    stm_events: &[Vec<String>],
    stm_tokens: &[String],
    within: Option<&[String]>,
    config: &SessionConfig,
) -> Result<Vec<String>, FilterError> {
    let names = match within {
        Some(names) => names.to_vec(),
        None => store.all_names(kb_id)?,
    };
    let rows = store.load_rows(kb_id, &names)?;
    let threshold = (config.recall_threshold - THRESHOLD_SLACK) as f64;

    Ok(rows
        .into_iter()
        .filter(|row| {
            let pattern_tokens: Vec<String> = row.pattern_data.iter().flatten().cloned().collect();
            let ratio = if config.use_token_matching {
                token_ratio(&pattern_tokens, stm_tokens)
            } else {
                let stm_flat: Vec<String> = stm_events.iter().flatten().cloned().collect();
                char_ratio(&pattern_tokens, &stm_flat)
            };
            ratio >= threshold
        })
        .map(|row| row.name)
        .collect())
}
