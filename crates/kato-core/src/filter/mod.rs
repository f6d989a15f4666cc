//! Filter pipeline (C5, §4.5).
//!
//! An ordered list of stages narrows the kb_id's pattern-name set down to a
//! small candidate list before the sequence matcher (C6) ever runs. Each
//! stage receives the previous stage's candidate names (`None` before the
//! first stage means "unrestricted") and returns a narrower set.

mod stages;

use crate::bloom::BloomCache;
use crate::error::FilterError;
use crate::matcher;
use crate::minhash;
use crate::settings::{FilterStage, SessionConfig};
use crate::store::PatternStore;
use std::collections::BTreeSet;
use std::time::Instant;

/// Per-stage observability (§4.5 "exposed when metrics are enabled").
#[derive(Debug, Clone, PartialEq)]
pub struct StageMetrics {
    pub stage: &'static str,
    pub candidates_before: usize,
    pub candidates_after: usize,
    pub elapsed_ms: f64,
}

/// Result of running the whole pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    pub candidate_names: Vec<String>,
    pub stage_metrics: Vec<StageMetrics>,
}

/// Runs `config.filter_pipeline` in order over `kb_id`'s patterns.
///
/// `stm_events` / `stm_tokens` describe the observing session's current STM;
/// `bloom_cache` backs the optional `bloom` stage.
pub fn run(
    store: &dyn PatternStore,
    bloom_cache: &BloomCache,
    kb_id: &str,
    stm_events: &[Vec<String>],
    stm_tokens: &[String],
    config: &SessionConfig,
) -> Result<FilterOutcome, FilterError> {
    if config.filter_pipeline.is_empty() {
        tracing::warn!(target: "kato::filter", kb_id, "filter_pipeline is empty; loading all patterns for kb_id");
        let names = store.all_names(kb_id)?;
        return Ok(FilterOutcome { candidate_names: names, stage_metrics: Vec::new() });
    }

    let stm_len = stm_events.len() as f32;
    let stm_token_set: BTreeSet<String> = stm_tokens.iter().cloned().collect();
    let stm_sketch = minhash::sketch(stm_tokens, config.minhash_num_hashes);
    let stm_bands = minhash::lsh_bands(&stm_sketch, config.minhash_bands, config.minhash_rows);

    minhash::warn_if_below_inflection(config.minhash_threshold, config.minhash_bands, config.minhash_rows);

    let mut current: Option<Vec<String>> = None;
    let mut metrics = Vec::with_capacity(config.filter_pipeline.len());

    for stage in &config.filter_pipeline {
        let before = current.as_ref().map(|c| c.len()).unwrap_or_else(|| store.all_names(kb_id).map(|v| v.len()).unwrap_or(0));
        let started = Instant::now();

        let after = match stage {
            FilterStage::Length => {
                let min_len = (stm_len * config.length_min_ratio).ceil().max(0.0) as u32;
                let max_len = (stm_len * config.length_max_ratio).floor() as u32;
                store.names_with_length_in_range(kb_id, min_len, max_len, current.as_deref())?
            }
            FilterStage::Minhash => stages::minhash_stage(store, kb_id, &stm_sketch, &stm_bands, current.as_deref(), config)?,
            FilterStage::Jaccard => {
                store.jaccard_filter(kb_id, &stm_token_set, config.jaccard_threshold, config.jaccard_min_overlap, current.as_deref())?
            }
            FilterStage::Bloom => stages::bloom_stage(store, bloom_cache, kb_id, stm_tokens, current.as_deref())?,
            FilterStage::Rapidfuzz => stages::rapidfuzz_stage(store, kb_id, stm_events, stm_tokens, current.as_deref(), config)?,
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if after.len() > config.max_candidates_per_stage {
            return Err(FilterError::Overflow { stage: stage.as_str().to_string(), size: after.len(), limit: config.max_candidates_per_stage });
        }
        metrics.push(StageMetrics { stage: stage.as_str(), candidates_before: before, candidates_after: after.len(), elapsed_ms });
        current = Some(after);
    }

    Ok(FilterOutcome { candidate_names: current.unwrap_or_default(), stage_metrics: metrics })
}

/// Token-level ratio, exactly the detailed matcher's `2*matches/(len a + len b)`.
pub(crate) fn token_ratio(a: &[String], b: &[String]) -> f64 {
    let blocks = matcher::matching_blocks(a, b);
    let matches: usize = blocks.iter().map(|blk| blk.size).sum();
    let denom = a.len() + b.len();
    if denom == 0 {
        0.0
    } else {
        2.0 * matches as f64 / denom as f64
    }
}

/// Character-level ratio: the same algorithm over flattened character streams
/// of the joined token sequence (§4.5 "≈0.03 looser" approximation).
pub(crate) fn char_ratio(a: &[String], b: &[String]) -> f64 {
    let ca: Vec<String> = a.iter().flat_map(|t| t.chars()).map(|c| c.to_string()).collect();
    let cb: Vec<String> = b.iter().flat_map(|t| t.chars()).map(|c| c.to_string()).collect();
    let blocks = matcher::matching_blocks(&ca, &cb);
    let matches: usize = blocks.iter().map(|blk| blk.size).sum();
    let denom = ca.len() + cb.len();
    if denom == 0 {
        0.0
    } else {
        2.0 * matches as f64 / denom as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn token_ratio_is_one_for_identical_sequences() {
        let a = toks(&["a", "b", "c"]);
        assert_eq!(token_ratio(&a, &a), 1.0);
    }

    #[test]
    fn char_ratio_is_between_zero_and_one() {
        let a = toks(&["hello"]);
        let b = toks(&["hallo"]);
        let r = char_ratio(&a, &b);
        assert!((0.0..=1.0).contains(&r));
        assert!(r > 0.5);
    }
}
