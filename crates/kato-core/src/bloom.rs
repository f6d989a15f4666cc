//! Process-scoped Bloom filter stage (§4.5 `bloom`, §5).
//!
//! Zero false negatives: if a candidate's bloom filter says a token is
//! absent, it really is absent, so candidates that cannot possibly overlap
//! the STM token set are rejected without ever loading their full row.

use ahash::AHasher;
use dashmap::DashMap;
use std::hash::{Hash, Hasher};

/// A small bit-vector Bloom filter over one pattern's token set.
#[derive(Debug, Clone)]
pub struct Bloom {
    bits: Vec<u64>,
    num_hashes: u32,
}

impl Bloom {
    /// Sizes the filter for `expected_items` at the given false-positive rate,
    /// using the standard `m = -n*ln(p)/ln(2)^2`, `k = m/n*ln(2)` formulas.
    pub fn from_tokens(tokens: &[String], false_positive_rate: f32) -> Self {
        let n = tokens.len().max(1) as f64;
        let p = (false_positive_rate as f64).clamp(1e-6, 0.5);
        let m = (-(n * p.ln()) / std::f64::consts::LN_2.powi(2)).ceil().max(64.0) as usize;
        let k = ((m as f64 / n) * std::f64::consts::LN_2).round().max(1.0) as u32;
        let words = m.div_ceil(64);
        let mut bloom = Self { bits: vec![0u64; words], num_hashes: k };
        for token in tokens {
            bloom.insert(token);
        }
        bloom
    }

    fn bit_positions(&self, token: &str) -> impl Iterator<Item = usize> + '_ {
        let total_bits = self.bits.len() * 64;
        (0..self.num_hashes).map(move |i| {
            let mut hasher = AHasher::default();
            i.hash(&mut hasher);
            token.hash(&mut hasher);
            (hasher.finish() as usize) % total_bits
        })
    }

    fn insert(&mut self, token: &str) {
        for pos in self.bit_positions(token) {
            self.bits[pos / 64] |= 1 << (pos % 64);
        }
    }

    fn might_contain(&self, token: &str) -> bool {
        self.bit_positions(token).all(|pos| self.bits[pos / 64] & (1 << (pos % 64)) != 0)
    }

    /// True if any of `query_tokens` might be present in this filter.
    pub fn might_contain_any(&self, query_tokens: &[String]) -> bool {
        query_tokens.iter().any(|t| self.might_contain(t))
    }
}

/// Process-scoped cache of one Bloom filter per `(kb_id, pattern_name)`,
/// rebuilt on startup per kb_id and updated on each pattern insert (§5).
#[derive(Debug, Default)]
pub struct BloomCache {
    filters: DashMap<(String, String), Bloom>,
}

impl BloomCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, kb_id: &str, name: &str, tokens: &[String], false_positive_rate: f32) {
        self.filters.insert((kb_id.to_string(), name.to_string()), Bloom::from_tokens(tokens, false_positive_rate));
    }

    /// Rejects `name` only when its cached filter proves no overlap is possible.
    /// Absence from the cache (not yet built) never rejects — no false negatives.
    pub fn might_match(&self, kb_id: &str, name: &str, query_tokens: &[String]) -> bool {
        match self.filters.get(&(kb_id.to_string(), name.to_string())) {
            Some(bloom) => bloom.might_contain_any(query_tokens),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn never_rejects_true_overlap() {
        let bloom = Bloom::from_tokens(&toks(&["alpha", "beta", "gamma"]), 0.01);
        assert!(bloom.might_contain_any(&toks(&["beta", "zzz_not_present"])));
    }

    #[test]
    fn cache_defaults_to_possible_match_when_unbuilt() {
        let cache = BloomCache::new();
        assert!(cache.might_match("kb", "PTRN|x", &toks(&["a"])));
    }

    #[test]
    fn cache_reflects_inserted_filter() {
        let cache = BloomCache::new();
        cache.insert("kb", "PTRN|x", &toks(&["alpha", "beta"]), 0.01);
        assert!(cache.might_match("kb", "PTRN|x", &toks(&["alpha"])));
    }
}
