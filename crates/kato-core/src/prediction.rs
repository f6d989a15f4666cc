//! Prediction assembler (C8, §4.8).

use crate::emotive;
use crate::error::{FilterError, MetricError};
use crate::matcher::{match_pattern, MatchOutcome};
use crate::metrics::{self, Metrics};
use crate::pattern;
use crate::settings::{SessionConfig, THRESHOLD_SLACK};
use crate::store::PatternStore;
use std::collections::HashMap;

/// One ranked prediction (§4.8's minimum field set).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Prediction {
    pub name: String,
    pub frequency: u64,
    pub matches: usize,
    pub missing: Vec<String>,
    pub extras: Vec<String>,
    pub past: Vec<Vec<String>>,
    pub present: Vec<Vec<String>>,
    pub future: Vec<Vec<String>>,
    pub similarity: f64,
    pub confidence: f64,
    pub evidence: f64,
    pub snr: f64,
    pub fragmentation: i64,
    pub entropy: f64,
    pub hamiltonian: f64,
    pub grand_hamiltonian: f64,
    pub confluence: f64,
    pub itfdf_similarity: f64,
    pub predictive_information: f64,
    pub potential: f64,
    pub emotives: HashMap<String, f64>,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

/// Errors from prediction assembly: either the store (via a prior filter
/// stage's candidate load) or a metric's divide-by-zero.
#[derive(Debug)]
pub enum PredictionError {
    Filter(FilterError),
    Metric(MetricError),
}

impl std::fmt::Display for PredictionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PredictionError::Filter(e) => write!(f, "{e}"),
            PredictionError::Metric(e) => write!(f, "{e}"),
        }
    }
}
impl std::error::Error for PredictionError {}
impl From<FilterError> for PredictionError {
    fn from(e: FilterError) -> Self {
        PredictionError::Filter(e)
    }
}
impl From<MetricError> for PredictionError {
    fn from(e: MetricError) -> Self {
        PredictionError::Metric(e)
    }
}

/// Runs C6 (matcher) and C7 (metrics) over every filtered candidate, builds
/// `Prediction` records, excludes sub-threshold/zero-match candidates, and
/// sorts by `potential` desc, `frequency` desc, `name` asc (§4.8).
pub fn assemble(
    store: &dyn PatternStore,
    kb_id: &str,
    stm_events: &[Vec<String>],
    stm_tokens: &[String],
    candidate_names: &[String],
    config: &SessionConfig,
    global_symbol_probabilities: &HashMap<String, f64>,
) -> Result<Vec<Prediction>, PredictionError> {
    let rows = store.load_rows(kb_id, candidate_names).map_err(FilterError::from)?;
    let ensemble_frequency_sum: u64 = rows.iter().map(|r| r.frequency).sum();

    let mut predictions = Vec::with_capacity(rows.len());
    let threshold = config.recall_threshold - THRESHOLD_SLACK;

    for row in rows {
        let outcome = match_pattern(stm_events, &row.pattern_data);
        let matched = match outcome {
            MatchOutcome::Match(m) => m,
            MatchOutcome::NoMatch => continue,
        };

        let pattern_tokens_total = pattern::total_token_count(&row.pattern_data);
        let metrics: Metrics = metrics::compute(&matched, pattern_tokens_total, stm_tokens, row.frequency, ensemble_frequency_sum, global_symbol_probabilities)?;

        if (metrics.similarity as f32) < threshold {
            continue;
        }

        predictions.push(Prediction {
            name: row.name,
            frequency: row.frequency,
            matches: matched.matches,
            missing: matched.missing,
            extras: matched.extras,
            past: matched.past,
            present: matched.present,
            future: matched.future,
            similarity: metrics.similarity,
            confidence: metrics.confidence,
            evidence: metrics.evidence,
            snr: metrics.snr,
            fragmentation: metrics.fragmentation,
            entropy: metrics.entropy,
            hamiltonian: metrics.hamiltonian,
            grand_hamiltonian: metrics.grand_hamiltonian,
            confluence: metrics.confluence,
            itfdf_similarity: metrics.itfdf_similarity,
            predictive_information: metrics.predictive_information,
            potential: metrics.potential,
            emotives: emotive::pattern_emotive_means(&row.emotives),
            kind: "prototypical",
        });
    }

    predictions.sort_by(|a, b| {
        b.potential
            .partial_cmp(&a.potential)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.frequency.cmp(&a.frequency))
            .then_with(|| a.name.cmp(&b.name))
    });
    predictions.truncate(config.max_predictions as usize);

    Ok(predictions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MinhashConfig, SledPatternStore};
    use std::collections::HashSet;

    fn ev(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn minhash_cfg() -> MinhashConfig {
        MinhashConfig { bands: 20, rows: 5, num_hashes: 100 }
    }

    #[test]
    fn excludes_zero_match_and_sub_threshold_candidates() {
        let store = SledPatternStore::open_path(tempfile::tempdir().unwrap().keep()).unwrap();
        store.upsert_learn("kb1", &[ev(&["hello", "world"]), ev(&["bar", "foo"])], &HashMap::new(), &HashSet::new(), 5, minhash_cfg()).unwrap();
        store.upsert_learn("kb1", &[ev(&["zzz"])], &HashMap::new(), &HashSet::new(), 5, minhash_cfg()).unwrap();

        let names = store.all_names("kb1").unwrap();
        let stm = vec![ev(&["hello", "world"])];
        let stm_tokens: Vec<String> = stm.iter().flatten().cloned().collect();
        let config = SessionConfig::default();

        let predictions = assemble(&store, "kb1", &stm, &stm_tokens, &names, &config, &HashMap::new()).unwrap();
        assert_eq!(predictions.len(), 1);
        assert!(predictions[0].name.starts_with(pattern::PATTERN_NAME_PREFIX));
    }

    #[test]
    fn ranking_prefers_higher_potential_then_frequency_then_name() {
        let store = SledPatternStore::open_path(tempfile::tempdir().unwrap().keep()).unwrap();
        store.upsert_learn("kb1", &[ev(&["a", "b"])], &HashMap::new(), &HashSet::new(), 5, minhash_cfg()).unwrap();
        store.upsert_learn("kb1", &[ev(&["a", "b"]), ev(&["c"])], &HashMap::new(), &HashSet::new(), 5, minhash_cfg()).unwrap();

        let names = store.all_names("kb1").unwrap();
        let stm = vec![ev(&["a", "b"])];
        let stm_tokens: Vec<String> = stm.iter().flatten().cloned().collect();
        let mut config = SessionConfig::default();
        config.recall_threshold = 0.0;

        let predictions = assemble(&store, "kb1", &stm, &stm_tokens, &names, &config, &HashMap::new()).unwrap();
        assert!(predictions.len() >= 1);
        for pair in predictions.windows(2) {
            assert!(pair[0].potential >= pair[1].potential);
        }
    }
}
