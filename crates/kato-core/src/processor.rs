//! Processor orchestrator (C10, §4.10).
//!
//! The only component that coordinates C2-C9: every mutating call resolves
//! the session, acquires its lease, loads its view, executes the operation,
//! persists, and releases the lease (§4.10's six-step procedure).
//! `get_predictions` is read-only and purely functional over session + store,
//! so it skips the lease (§4.10 note: "no writes").

use crate::bloom::BloomCache;
use crate::error::{InputError, KatoError, TwoStringRuleViolated};
use crate::kb_id::derive_kb_id;
use crate::prediction::{self, Prediction};
use crate::settings::{SessionConfig, SessionConfigPatch, Settings};
use crate::session::{SessionManager, SessionView};
use crate::store::{MinhashConfig, PatternStore};
use crate::symbol::{vector_symbol, Event};
use crate::symbol_cache::SymbolProbabilityCache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Result of `observe` (§4.10, §6.2).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ObserveOutcome {
    pub stm: Vec<Event>,
    pub auto_learned_pattern_name: Option<String>,
}

/// Result of an explicit `learn` call (§4.4's "no-op sentinel" for an
/// unsatisfied 2-string rule).
#[derive(Debug, Clone, PartialEq)]
pub enum LearnOutcome {
    Learned { name: String, frequency: u64 },
    NoOp,
}

fn validate_observation(vectors: &[Vec<f64>], emotives: &HashMap<String, f64>) -> Result<(), InputError> {
    for vector in vectors {
        if vector.is_empty() {
            return Err(InputError::EmptyVector);
        }
        for (index, component) in vector.iter().enumerate() {
            if !component.is_finite() {
                return Err(InputError::NonFiniteVectorComponent { index });
            }
        }
    }
    for (key, value) in emotives {
        if !value.is_finite() {
            return Err(InputError::NonFiniteEmotive { key: key.clone(), value: *value });
        }
    }
    Ok(())
}

fn has_vector_symbol(events: &[Event]) -> bool {
    events.iter().flatten().any(|t| t.starts_with("VCTR|"))
}

/// The processor orchestrator (C10). Stateless w.r.t. sessions; holds only
/// shared references to C4 and the process-scoped caches (§4.10, §9).
pub struct Processor {
    store: Arc<dyn PatternStore>,
    sessions: Arc<SessionManager>,
    bloom_cache: Arc<BloomCache>,
    symbol_cache: Arc<SymbolProbabilityCache>,
    settings: Settings,
}

impl Processor {
    pub fn new(store: Arc<dyn PatternStore>, sessions: Arc<SessionManager>, bloom_cache: Arc<BloomCache>, settings: Settings) -> Self {
        Self { store, sessions, bloom_cache, symbol_cache: Arc::new(SymbolProbabilityCache::new(Duration::from_secs(30))), settings }
    }

    fn effective_config(&self, view: &SessionView) -> Result<SessionConfig, KatoError> {
        Ok(self.settings.default_session_config.merged(&view.config_override)?)
    }

    fn minhash_cfg(config: &SessionConfig) -> MinhashConfig {
        MinhashConfig { bands: config.minhash_bands, rows: config.minhash_rows, num_hashes: config.minhash_num_hashes }
    }

    /// `create(node_id, ttl, config_override?) -> session_id` (§4.9).
    pub fn create_session(&self, node_id: &str, ttl_secs: Option<u64>, config_override: SessionConfigPatch) -> Result<String, KatoError> {
        let kb_id = derive_kb_id(node_id, &self.settings.service_name);
        Ok(self.sessions.create(node_id, &kb_id, ttl_secs, config_override, &self.settings.default_session_config)?)
    }

    /// §4.10 step 4 `observe`.
    pub async fn observe(
        &self,
        session_id: &str,
        strings: Vec<String>,
        vectors: Vec<Vec<f64>>,
        emotives: HashMap<String, f64>,
        metadata: Vec<String>,
    ) -> Result<ObserveOutcome, KatoError> {
        validate_observation(&vectors, &emotives).map_err(KatoError::from)?;

        let store = self.store.clone();
        let bloom_cache = self.bloom_cache.clone();
        let symbol_cache = self.symbol_cache.clone();

        let outcome = self
            .sessions
            .update(session_id, move |view| {
                let config = self.settings.default_session_config.merged(&view.config_override)?;

                let mut event: Event = strings;
                for vector in &vectors {
                    event.push(vector_symbol(vector));
                }

                let mut auto_learned_pattern_name = None;
                let trigger = view.stm.append(event, config.sort_symbols_within_event, config.max_pattern_length);
                if trigger.is_some() {
                    let name = learn_now(&store, &bloom_cache, &symbol_cache, view, &config).map_err(crate::error::SessionError::from)?;
                    if let Some(name) = name {
                        auto_learned_pattern_name = Some(name);
                        view.stm.apply_post_learn(config.stm_mode, true);
                        view.emotive_accumulator.clear();
                    }
                }

                if !emotives.is_empty() {
                    view.emotive_accumulator.push(emotives);
                }
                view.metadata.extend(metadata);

                Ok(ObserveOutcome { stm: view.stm.snapshot(), auto_learned_pattern_name })
            })
            .await?;

        Ok(outcome)
    }

    /// §4.4's explicit `learn`.
    pub async fn learn(&self, session_id: &str) -> Result<LearnOutcome, KatoError> {
        let store = self.store.clone();
        let bloom_cache = self.bloom_cache.clone();
        let symbol_cache = self.symbol_cache.clone();

        let outcome = self
            .sessions
            .update(session_id, move |view| {
                let config = self.settings.default_session_config.merged(&view.config_override)?;
                let name = learn_now(&store, &bloom_cache, &symbol_cache, view, &config).map_err(crate::error::SessionError::from)?;
                match name {
                    Some(name) => {
                        let row = store.get(&view.kb_id, &name).map_err(crate::error::SessionError::from)?;
                        let frequency = row.map(|r| r.frequency).unwrap_or(0);
                        view.stm.apply_post_learn(config.stm_mode, false);
                        view.emotive_accumulator.clear();
                        Ok(LearnOutcome::Learned { name, frequency })
                    }
                    None => Ok(LearnOutcome::NoOp),
                }
            })
            .await?;

        Ok(outcome)
    }

    /// `get_predictions()` (§4.10): read-only, no session lease required.
    pub fn get_predictions(&self, session_id: &str) -> Result<Vec<Prediction>, KatoError> {
        let view = self.sessions.get(session_id)?;
        let config = self.effective_config(&view)?;

        let stm_events = view.stm.events();
        let stm_tokens: Vec<String> = stm_events.iter().flatten().cloned().collect();
        let two_string_rule_holds = stm_tokens.len() >= 2 || has_vector_symbol(stm_events);
        if !two_string_rule_holds {
            return Err(KatoError::from(TwoStringRuleViolated { total_tokens: stm_tokens.len() }));
        }

        let outcome = crate::filter::run(self.store.as_ref(), &self.bloom_cache, &view.kb_id, stm_events, &stm_tokens, &config)?;
        let probabilities = self.symbol_cache.get_or_refresh(self.store.as_ref(), &view.kb_id)?;

        let predictions = prediction::assemble(self.store.as_ref(), &view.kb_id, stm_events, &stm_tokens, &outcome.candidate_names, &config, &probabilities)
            .map_err(|e| match e {
                crate::prediction::PredictionError::Filter(f) => KatoError::from(f),
                crate::prediction::PredictionError::Metric(m) => KatoError::from(m),
            })?;

        Ok(predictions)
    }

    /// `get_stm(session_id)` (§6.2): read-only snapshot of the session's STM.
    pub fn get_stm(&self, session_id: &str) -> Result<Vec<Event>, KatoError> {
        let view = self.sessions.get(session_id)?;
        Ok(view.stm.snapshot())
    }

    /// `extend_session(session_id, ttl)` (§6.2).
    pub fn extend_session(&self, session_id: &str, ttl_secs: u64) -> Result<(), KatoError> {
        self.sessions.extend(session_id, ttl_secs)?;
        Ok(())
    }

    /// `delete_session(session_id)` (§6.2).
    pub fn delete_session(&self, session_id: &str) -> Result<(), KatoError> {
        self.sessions.delete(session_id)?;
        Ok(())
    }

    /// Per-kb_id observability snapshot (§3 supplement).
    pub fn store_stats(&self, session_id: &str) -> Result<crate::store::StoreStats, KatoError> {
        let view = self.sessions.get(session_id)?;
        Ok(self.store.stats(&view.kb_id)?)
    }

    /// Runtime health probe for the pattern store (§6.3 `STRICT_MODE`, §7
    /// `StoreUnavailable`). Callers decide what an unhealthy store means —
    /// the gateway's `/v1/health` reports "degraded" rather than failing the
    /// whole process.
    pub fn store_healthy(&self) -> bool {
        self.store.health_check().is_ok()
    }

    pub fn strict_mode(&self) -> bool {
        self.settings.strict_mode
    }

    /// `clear_stm()` (§4.10): session-side state reset only.
    pub async fn clear_stm(&self, session_id: &str) -> Result<(), KatoError> {
        self.sessions
            .update(session_id, |view| {
                view.stm.clear();
                view.emotive_accumulator.clear();
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// `clear_all()` (§4.10): session-side reset, plus (if requested) the
    /// kb_id's persisted patterns. Defaults to session-only.
    pub async fn clear_all(&self, session_id: &str, drop_patterns: bool) -> Result<(), KatoError> {
        let store = self.store.clone();
        let symbol_cache = self.symbol_cache.clone();
        self.sessions
            .update(session_id, move |view| {
                view.stm.clear();
                view.emotive_accumulator.clear();
                view.metadata.clear();
                if drop_patterns {
                    store.drop_partition(&view.kb_id).map_err(crate::error::SessionError::from)?;
                    symbol_cache.invalidate(&view.kb_id);
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// `update_config(partial)` (§4.10): validate, merge, persist.
    pub async fn update_config(&self, session_id: &str, patch: SessionConfigPatch) -> Result<(), KatoError> {
        let default_config = self.settings.default_session_config.clone();
        self.sessions
            .update(session_id, move |view| {
                let merged = default_config.merged(&patch)?;
                merged.validate(false)?;
                view.config_override = patch;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Shared learn logic (§4.4 steps 1-2), used by both auto-learn and explicit learn.
/// Returns `None` if the 2-string rule fails (no-op).
fn learn_now(
    store: &Arc<dyn PatternStore>,
    bloom_cache: &BloomCache,
    symbol_cache: &SymbolProbabilityCache,
    view: &SessionView,
    config: &SessionConfig,
) -> Result<Option<String>, crate::error::StoreError> {
    if view.stm.total_tokens() < 2 && !has_vector_symbol(view.stm.events()) {
        return Ok(None);
    }

    let averaged = crate::emotive::average_accumulator(&view.emotive_accumulator);
    let outcome = store.upsert_learn(&view.kb_id, view.stm.events(), &averaged, &view.metadata, config.persistence, Processor::minhash_cfg(config))?;

    if let Some(row) = store.get(&view.kb_id, &outcome.name)? {
        bloom_cache.insert(&view.kb_id, &outcome.name, &row.tokens, config.bloom_false_positive_rate);
    }
    symbol_cache.invalidate(&view.kb_id);

    Ok(Some(outcome.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStore;
    use crate::store::SledPatternStore;

    fn processor() -> Processor {
        let store: Arc<dyn PatternStore> = Arc::new(SledPatternStore::open_path(tempfile::tempdir().unwrap().keep()).unwrap());
        let sessions = Arc::new(SessionManager::new(SessionStore::open_path(tempfile::tempdir().unwrap().keep()).unwrap(), false));
        Processor::new(store, sessions, Arc::new(BloomCache::new()), Settings::default())
    }

    #[test]
    fn fresh_store_reports_healthy_and_non_strict_by_default() {
        let proc = processor();
        assert!(proc.store_healthy());
        assert!(!proc.strict_mode());
    }

    #[tokio::test]
    async fn observe_then_clear_stm_leaves_patterns_untouched() {
        let proc = processor();
        let session_id = proc.create_session("alice", None, SessionConfigPatch::default()).unwrap();
        proc.observe(&session_id, vec!["hello".to_string(), "world".to_string()], vec![], HashMap::new(), vec![]).await.unwrap();
        proc.clear_stm(&session_id).await.unwrap();

        let outcome = proc.learn(&session_id).await.unwrap();
        assert_eq!(outcome, LearnOutcome::NoOp);
    }

    #[tokio::test]
    async fn explicit_learn_name_matches_canonical_name_at_call_time() {
        let proc = processor();
        let session_id = proc.create_session("bob", None, SessionConfigPatch::default()).unwrap();
        proc.observe(&session_id, vec!["hello".to_string(), "world".to_string()], vec![], HashMap::new(), vec![]).await.unwrap();

        let expected_name = {
            let view = proc.sessions.get(&session_id).unwrap();
            crate::pattern::pattern_name(view.stm.events())
        };
        let outcome = proc.learn(&session_id).await.unwrap();
        match outcome {
            LearnOutcome::Learned { name, frequency } => {
                assert_eq!(name, expected_name);
                assert_eq!(frequency, 1);
            }
            LearnOutcome::NoOp => panic!("expected a learn"),
        }
    }

    #[tokio::test]
    async fn get_stm_reflects_prior_observations() {
        let proc = processor();
        let session_id = proc.create_session("dave", None, SessionConfigPatch::default()).unwrap();
        proc.observe(&session_id, vec!["hello".to_string()], vec![], HashMap::new(), vec![]).await.unwrap();
        assert_eq!(proc.get_stm(&session_id).unwrap(), vec![vec!["hello".to_string()]]);
    }

    #[tokio::test]
    async fn delete_session_then_get_stm_errors() {
        let proc = processor();
        let session_id = proc.create_session("erin", None, SessionConfigPatch::default()).unwrap();
        proc.delete_session(&session_id).unwrap();
        assert!(proc.get_stm(&session_id).is_err());
    }

    #[tokio::test]
    async fn observe_then_predict_returns_the_learned_pattern() {
        let proc = processor();
        let session_id = proc.create_session("carol", None, SessionConfigPatch::default()).unwrap();
        proc.observe(&session_id, vec!["hello".to_string(), "world".to_string()], vec![], HashMap::new(), vec![]).await.unwrap();
        proc.learn(&session_id).await.unwrap();
        proc.observe(&session_id, vec!["hello".to_string(), "world".to_string()], vec![], HashMap::new(), vec![]).await.unwrap();

        let predictions = proc.get_predictions(&session_id).unwrap();
        assert!(!predictions.is_empty());
        assert_eq!(predictions[0].similarity, 1.0);
    }

    /// §8.3 S3: a high `recall_threshold` excludes a partial match, a low one
    /// admits it. The minhash/jaccard stages are configured out of the
    /// pipeline so the test isolates `recall_threshold`'s effect on
    /// prediction assembly rather than on candidate selection.
    fn s3_patch(recall_threshold: f32) -> SessionConfigPatch {
        use crate::settings::FilterStage;
        SessionConfigPatch {
            recall_threshold: Some(recall_threshold),
            filter_pipeline: Some(vec![FilterStage::Length, FilterStage::Rapidfuzz]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn recall_threshold_excludes_or_admits_partial_match() {
        let strict = processor();
        let session_id = strict.create_session("frank", None, s3_patch(0.5)).unwrap();
        strict
            .observe(&session_id, vec!["p".into(), "q".into(), "r".into(), "s".into()], vec![], HashMap::new(), vec![])
            .await
            .unwrap();
        strict.learn(&session_id).await.unwrap();
        strict.observe(&session_id, vec!["p".into(), "z".into()], vec![], HashMap::new(), vec![]).await.unwrap();
        assert!(strict.get_predictions(&session_id).unwrap().is_empty());

        let lenient = processor();
        let session_id = lenient.create_session("frank", None, s3_patch(0.1)).unwrap();
        lenient
            .observe(&session_id, vec!["p".into(), "q".into(), "r".into(), "s".into()], vec![], HashMap::new(), vec![])
            .await
            .unwrap();
        lenient.learn(&session_id).await.unwrap();
        lenient.observe(&session_id, vec!["p".into(), "z".into()], vec![], HashMap::new(), vec![]).await.unwrap();

        let predictions = lenient.get_predictions(&session_id).unwrap();
        assert!(!predictions.is_empty());
        assert_eq!(predictions[0].missing, vec!["q".to_string(), "r".to_string(), "s".to_string()]);
        assert_eq!(predictions[0].extras, vec!["z".to_string()]);
    }

    /// §8.3 S4: a single-token STM fails the 2-string rule; a second token
    /// (here from a vector symbol) satisfies it. The minhash/jaccard stages
    /// are dropped from the pipeline for the same reason as `s3_patch` — a
    /// one-token learned pattern is far too small to clear their similarity
    /// thresholds, which would confound the 2-string-rule assertion itself.
    #[tokio::test]
    async fn two_string_rule_blocks_single_token_stm() {
        use crate::settings::FilterStage;
        let proc = processor();
        let session_id = proc
            .create_session(
                "grace",
                None,
                SessionConfigPatch { filter_pipeline: Some(vec![FilterStage::Length, FilterStage::Rapidfuzz]), ..Default::default() },
            )
            .unwrap();
        proc.observe(&session_id, vec!["x".into()], vec![], HashMap::new(), vec![]).await.unwrap();
        proc.learn(&session_id).await.unwrap();
        proc.observe(&session_id, vec!["y".into()], vec![], HashMap::new(), vec![]).await.unwrap();
        proc.learn(&session_id).await.unwrap();

        proc.observe(&session_id, vec!["x".into()], vec![], HashMap::new(), vec![]).await.unwrap();
        assert!(proc.get_predictions(&session_id).is_err());

        proc.observe(&session_id, vec![], vec![vec![1.0, 2.0]], HashMap::new(), vec![]).await.unwrap();
        assert!(!proc.get_predictions(&session_id).unwrap().is_empty());
    }

    /// §8.3 S5: two sessions under the same kb_id that learn the same
    /// canonicalized events produce the identical, content-addressed name.
    #[tokio::test]
    async fn same_observations_under_same_kb_id_learn_identical_names() {
        let store: Arc<dyn PatternStore> = Arc::new(SledPatternStore::open_path(tempfile::tempdir().unwrap().keep()).unwrap());
        let sessions = Arc::new(SessionManager::new(SessionStore::open_path(tempfile::tempdir().unwrap().keep()).unwrap(), false));
        let proc = Processor::new(store, sessions, Arc::new(BloomCache::new()), Settings::default());

        let session_a = proc.create_session("henry", None, SessionConfigPatch::default()).unwrap();
        let session_b = proc.create_session("henry", None, SessionConfigPatch::default()).unwrap();

        proc.observe(&session_a, vec!["beta".into(), "alpha".into()], vec![], HashMap::new(), vec![]).await.unwrap();
        proc.observe(&session_b, vec!["beta".into(), "alpha".into()], vec![], HashMap::new(), vec![]).await.unwrap();

        let name_a = match proc.learn(&session_a).await.unwrap() {
            LearnOutcome::Learned { name, .. } => name,
            LearnOutcome::NoOp => panic!("expected a learn"),
        };
        let name_b = match proc.learn(&session_b).await.unwrap() {
            LearnOutcome::Learned { name, .. } => name,
            LearnOutcome::NoOp => panic!("expected a learn"),
        };

        assert_eq!(name_a, name_b);
        assert_eq!(name_a, crate::pattern::pattern_name(&[vec!["alpha".to_string(), "beta".to_string()]]));
    }

    /// §8.3 S6: `stm_mode = Rolling` with `max_pattern_length = 2` auto-learns
    /// on the triggering observation and carries the last event forward.
    #[tokio::test]
    async fn rolling_auto_learn_carries_last_event_forward() {
        let proc = processor();
        let session_id = proc
            .create_session(
                "iris",
                None,
                SessionConfigPatch { max_pattern_length: Some(2), stm_mode: Some(crate::settings::StmMode::Rolling), ..Default::default() },
            )
            .unwrap();

        let outcome_a = proc.observe(&session_id, vec!["A".into()], vec![], HashMap::new(), vec![]).await.unwrap();
        assert!(outcome_a.auto_learned_pattern_name.is_none());

        let outcome_b = proc.observe(&session_id, vec!["B".into()], vec![], HashMap::new(), vec![]).await.unwrap();
        let learned_name = outcome_b.auto_learned_pattern_name.expect("expected auto-learn to fire");
        assert_eq!(learned_name, crate::pattern::pattern_name(&[vec!["A".to_string()], vec!["B".to_string()]]));
        assert_eq!(proc.get_stm(&session_id).unwrap(), vec![vec!["B".to_string()]]);
    }
}
