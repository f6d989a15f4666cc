//! Metrics computer (C7, §4.7).
//!
//! All formulas use 64-bit arithmetic and are guarded against divide-by-zero:
//! a zero denominator raises `MetricError` rather than silently returning 0.

use crate::error::MetricError;
use crate::matcher::Matched;
use std::collections::{BTreeMap, HashMap};

/// Everything a prediction needs beyond the raw match (§4.7, §4.8).
#[derive(Debug, Clone, PartialEq)]
pub struct Metrics {
    pub similarity: f64,
    pub evidence: f64,
    pub confidence: f64,
    pub snr: f64,
    pub fragmentation: i64,
    pub entropy: f64,
    pub hamiltonian: f64,
    pub grand_hamiltonian: f64,
    pub confluence: f64,
    pub itfdf_similarity: f64,
    pub predictive_information: f64,
    pub potential: f64,
}

fn token_counts(tokens: &[String]) -> BTreeMap<&str, usize> {
    let mut counts = BTreeMap::new();
    for t in tokens {
        *counts.entry(t.as_str()).or_insert(0) += 1;
    }
    counts
}

/// Shannon entropy (base 2) of a token multiset's symbol distribution.
///
/// Counts are accumulated in a `BTreeMap` (not a `HashMap`) so the summation
/// order over `p * log2(p)` terms is fixed by symbol, not by a per-process
/// random hasher seed — float addition isn't associative, so an unordered
/// sum would make `entropy`/`hamiltonian`/`potential` vary run-to-run for any
/// token stream with unequal symbol counts, breaking the bytewise-identical
/// determinism contract.
fn shannon_entropy(tokens: &[String]) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let counts = token_counts(tokens);
    let total = tokens.len() as f64;
    -counts.values().map(|&c| {
        let p = c as f64 / total;
        p * p.log2()
    }).sum::<f64>()
}

fn flatten(events: &[Vec<String>]) -> Vec<String> {
    events.iter().flatten().cloned().collect()
}

/// Computes every metric for one matched candidate.
///
/// `pattern_tokens_total` is the candidate pattern's whole-pattern token
/// count (used by `evidence`); `stm_tokens` is the flattened STM token
/// stream; `frequency` is the candidate's stored frequency;
/// `ensemble_frequency_sum` is the sum of `frequency` across every candidate
/// in this prediction request (the "ensemble", §4.7 `itfdf_similarity`);
/// `global_symbol_probabilities` is the process-scoped per-kb_id cache used
/// by `grand_hamiltonian`/`confluence` (§5).
pub fn compute(
    matched: &Matched,
    pattern_tokens_total: usize,
    stm_tokens: &[String],
    frequency: u64,
    ensemble_frequency_sum: u64,
    global_symbol_probabilities: &HashMap<String, f64>,
) -> Result<Metrics, MetricError> {
    let present_tokens = flatten(&matched.present);
    let future_tokens = flatten(&matched.future);

    if present_tokens.is_empty() {
        return Err(MetricError::DivideByZero { metric: "confidence" });
    }
    if pattern_tokens_total == 0 {
        return Err(MetricError::DivideByZero { metric: "evidence" });
    }

    let matches = matched.matches as f64;

    // similarity is scoped to the present segment plus the observed STM, so
    // that an unobserved future never penalizes a fully-consistent partial
    // match: a whole-pattern denominator would understate a perfect partial
    // match instead of reporting 1.0.
    let similarity_denom = present_tokens.len() + stm_tokens.len();
    if similarity_denom == 0 {
        return Err(MetricError::DivideByZero { metric: "similarity" });
    }
    let similarity = (2.0 * matches) / similarity_denom as f64;

    let evidence = matches / pattern_tokens_total as f64;
    let confidence = matches / present_tokens.len() as f64;

    let extras = matched.extras.len() as f64;
    let snr_denom = 2.0 * matches + extras;
    if snr_denom == 0.0 {
        return Err(MetricError::DivideByZero { metric: "snr" });
    }
    let snr = (2.0 * matches - extras) / snr_denom;

    let entropy = shannon_entropy(&present_tokens);
    let hamiltonian = shannon_entropy(stm_tokens);

    let grand_hamiltonian = -stm_tokens
        .iter()
        .filter_map(|t| global_symbol_probabilities.get(t))
        .filter(|&&p| p > 0.0)
        .map(|&p| p * p.log2())
        .sum::<f64>();

    let p_seen = if ensemble_frequency_sum == 0 { 0.0 } else { frequency as f64 / ensemble_frequency_sum as f64 };
    let present_unique: std::collections::BTreeSet<&String> = present_tokens.iter().collect();
    let p_random: f64 = present_unique
        .iter()
        .map(|t| global_symbol_probabilities.get(t.as_str()).copied().unwrap_or(0.0))
        .product();
    let confluence = (p_seen * (1.0 - p_random)).clamp(0.0, 1.0);

    let distance = 1.0 - similarity;
    let itfdf_similarity = if ensemble_frequency_sum == 0 {
        0.0
    } else {
        (1.0 - (distance * frequency as f64 / ensemble_frequency_sum as f64)).clamp(0.0, 1.0)
    };

    let predictive_information = if future_tokens.is_empty() {
        1.0
    } else {
        let unique_future: std::collections::BTreeSet<&String> = future_tokens.iter().collect();
        let alphabet = unique_future.len().max(2) as f64;
        let max_entropy = alphabet.log2();
        let future_entropy = shannon_entropy(&future_tokens);
        (1.0 - future_entropy / max_entropy).clamp(0.0, 1.0)
    };

    let potential = (similarity * predictive_information).clamp(0.0, 1.0);

    Ok(Metrics {
        similarity,
        evidence,
        confidence,
        snr,
        fragmentation: matched.fragmentation as i64,
        entropy,
        hamiltonian,
        grand_hamiltonian,
        confluence,
        itfdf_similarity,
        predictive_information,
        potential,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{match_pattern, MatchOutcome};

    fn ev(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn s1_full_match_has_unit_similarity_and_confidence() {
        let pattern = vec![ev(&["hello", "world"]), ev(&["bar", "foo"])];
        let stm = vec![ev(&["hello", "world"])];
        let m = match match_pattern(&stm, &pattern) {
            MatchOutcome::Match(m) => *m,
            MatchOutcome::NoMatch => panic!(),
        };
        let stm_tokens: Vec<String> = stm.iter().flatten().cloned().collect();
        let metrics = compute(&m, 4, &stm_tokens, 1, 1, &HashMap::new()).unwrap();
        assert_eq!(metrics.similarity, 1.0);
        assert_eq!(metrics.confidence, 1.0);
    }

    #[test]
    fn snr_is_one_when_no_extras() {
        let pattern = vec![ev(&["a", "b"])];
        let stm = vec![ev(&["a", "b"])];
        let m = match match_pattern(&stm, &pattern) {
            MatchOutcome::Match(m) => *m,
            MatchOutcome::NoMatch => panic!(),
        };
        let stm_tokens: Vec<String> = stm.iter().flatten().cloned().collect();
        let metrics = compute(&m, 2, &stm_tokens, 1, 1, &HashMap::new()).unwrap();
        assert_eq!(metrics.snr, 1.0);
    }

    #[test]
    fn potential_stays_within_unit_range() {
        let pattern = vec![ev(&["a", "b", "c"]), ev(&["d", "e"])];
        let stm = vec![ev(&["a", "z"])];
        let m = match match_pattern(&stm, &pattern) {
            MatchOutcome::Match(m) => *m,
            MatchOutcome::NoMatch => panic!(),
        };
        let stm_tokens: Vec<String> = stm.iter().flatten().cloned().collect();
        let metrics = compute(&m, 5, &stm_tokens, 3, 10, &HashMap::new()).unwrap();
        assert!((0.0..=1.0).contains(&metrics.potential));
    }

    /// Entropy over a repeated-symbol token stream must sum in a fixed order
    /// (by symbol, not by hashmap iteration) so the result is bytewise
    /// identical across repeated calls regardless of process hasher seed.
    #[test]
    fn shannon_entropy_is_stable_across_repeated_calls() {
        let tokens = ev(&["a", "a", "b", "b", "b", "c", "d", "e", "f", "g"]);
        let first = shannon_entropy(&tokens);
        for _ in 0..50 {
            assert_eq!(shannon_entropy(&tokens), first);
        }
    }
}
