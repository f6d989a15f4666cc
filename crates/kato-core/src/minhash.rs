//! MinHash sketches and LSH banding (§4.5).

use ahash::AHasher;
use std::hash::{Hash, Hasher};
use std::sync::Once;

/// Mixes a token with a hash-function index to produce one of the `H`
/// permutation hashes used to build a MinHash sketch.
fn seeded_hash(token: &str, seed: u64) -> u64 {
    let mut hasher = AHasher::default();
    seed.hash(&mut hasher);
    token.hash(&mut hasher);
    hasher.finish()
}

/// Builds a MinHash sketch of `num_hashes` 64-bit values over `tokens`.
pub fn sketch(tokens: &[String], num_hashes: u32) -> Vec<u64> {
    (0..num_hashes as u64)
        .map(|seed| tokens.iter().map(|t| seeded_hash(t, seed)).min().unwrap_or(u64::MAX))
        .collect()
}

/// Splits a sketch of `bands * rows` values into `bands` band hashes.
pub fn lsh_bands(sketch: &[u64], bands: u32, rows: u32) -> Vec<u64> {
    let rows = rows as usize;
    (0..bands as usize)
        .map(|b| {
            let slice = &sketch[b * rows..(b + 1) * rows];
            let mut hasher = AHasher::default();
            slice.hash(&mut hasher);
            hasher.finish()
        })
        .collect()
}

/// Estimated Jaccard similarity between two sketches: fraction of matching positions.
pub fn estimated_jaccard(a: &[u64], b: &[u64]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let matches = a.iter().zip(b.iter()).filter(|(x, y)| x == y).count();
    matches as f64 / a.len() as f64
}

/// Probability that a pair with true Jaccard `j` shares at least one LSH band,
/// for the configured (bands, rows): `1 - (1 - j^rows)^bands` (§4.5).
pub fn retention_probability(j: f64, bands: u32, rows: u32) -> f64 {
    1.0 - (1.0 - j.powi(rows as i32)).powi(bands as i32)
}

static WARN_ONCE: Once = Once::new();

/// Warns (once per process) if `threshold` sits below the inflection of the
/// retention-probability curve for (bands, rows) — i.e. the LSH stage would
/// retain fewer than half of true matches at that threshold (§4.5, §9).
pub fn warn_if_below_inflection(threshold: f32, bands: u32, rows: u32) {
    let retained_at_threshold = retention_probability(threshold as f64, bands, rows);
    if retained_at_threshold < 0.5 {
        WARN_ONCE.call_once(|| {
            tracing::warn!(
                target: "kato::filter::minhash",
                threshold,
                bands,
                rows,
                retained_at_threshold,
                "minhash_threshold is below the LSH retention-probability inflection for (bands, rows); \
                 true near-threshold matches may be systematically dropped by the banding stage"
            );
        });
    }
}
