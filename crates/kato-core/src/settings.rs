//! Process-wide settings and per-session configuration (§3, §6.3, §9).
//!
//! §9 replaces process-global mutable state with an explicit, immutable
//! `Settings` value threaded through component constructors and loaded once
//! at startup via a layered `config::Config` builder.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// On learn, whether STM is fully cleared or rolls forward its last event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StmMode {
    Clear,
    Rolling,
}

impl Default for StmMode {
    fn default() -> Self {
        StmMode::Clear
    }
}

/// A named filter-pipeline stage (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterStage {
    Length,
    Minhash,
    Jaccard,
    Bloom,
    Rapidfuzz,
}

impl FilterStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterStage::Length => "length",
            FilterStage::Minhash => "minhash",
            FilterStage::Jaccard => "jaccard",
            FilterStage::Bloom => "bloom",
            FilterStage::Rapidfuzz => "rapidfuzz",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "length" => Ok(FilterStage::Length),
            "minhash" => Ok(FilterStage::Minhash),
            "jaccard" => Ok(FilterStage::Jaccard),
            "bloom" => Ok(FilterStage::Bloom),
            "rapidfuzz" => Ok(FilterStage::Rapidfuzz),
            other => Err(ConfigError::UnknownStage { stage: other.to_string() }),
        }
    }
}

fn default_filter_pipeline() -> Vec<FilterStage> {
    vec![FilterStage::Length, FilterStage::Minhash, FilterStage::Jaccard, FilterStage::Rapidfuzz]
}

/// Per-session configuration (§3 `SessionConfig`). Every field is optional at
/// the wire boundary (`SessionConfigOverride`) and defaults here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_pattern_length: u32,
    pub stm_mode: StmMode,
    pub persistence: u32,
    pub recall_threshold: f32,
    pub max_predictions: u32,
    pub filter_pipeline: Vec<FilterStage>,
    pub minhash_threshold: f32,
    pub minhash_bands: u32,
    pub minhash_rows: u32,
    pub minhash_num_hashes: u32,
    pub length_min_ratio: f32,
    pub length_max_ratio: f32,
    pub jaccard_threshold: f32,
    pub jaccard_min_overlap: u32,
    pub use_token_matching: bool,
    pub sort_symbols_within_event: bool,
    pub max_candidates_per_stage: usize,
    pub bloom_false_positive_rate: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_pattern_length: 0,
            stm_mode: StmMode::Clear,
            persistence: 5,
            recall_threshold: 0.1,
            max_predictions: 100,
            filter_pipeline: default_filter_pipeline(),
            minhash_threshold: 0.7,
            minhash_bands: 20,
            minhash_rows: 5,
            minhash_num_hashes: 100,
            length_min_ratio: 0.5,
            length_max_ratio: 2.0,
            jaccard_threshold: 0.3,
            jaccard_min_overlap: 2,
            use_token_matching: true,
            sort_symbols_within_event: true,
            max_candidates_per_stage: 100_000,
            bloom_false_positive_rate: 0.01,
        }
    }
}

/// Numeric slack tolerated when comparing a similarity/threshold pair (§7, §8.1 property 7).
pub const THRESHOLD_SLACK: f32 = 1e-6;

impl SessionConfig {
    /// Applies a partial override on top of this config, then validates the result.
    pub fn merged(&self, patch: &SessionConfigPatch) -> Result<Self, ConfigError> {
        let mut cfg = self.clone();
        if let Some(v) = patch.max_pattern_length {
            cfg.max_pattern_length = v;
        }
        if let Some(v) = patch.stm_mode {
            cfg.stm_mode = v;
        }
        if let Some(v) = patch.persistence {
            cfg.persistence = v;
        }
        if let Some(v) = patch.recall_threshold {
            cfg.recall_threshold = v;
        }
        if let Some(v) = patch.max_predictions {
            cfg.max_predictions = v;
        }
        if let Some(ref v) = patch.filter_pipeline {
            cfg.filter_pipeline = v.clone();
        }
        if let Some(v) = patch.minhash_threshold {
            cfg.minhash_threshold = v;
        }
        if let Some(v) = patch.minhash_bands {
            cfg.minhash_bands = v;
        }
        if let Some(v) = patch.minhash_rows {
            cfg.minhash_rows = v;
        }
        if let Some(v) = patch.minhash_num_hashes {
            cfg.minhash_num_hashes = v;
        }
        if let Some(v) = patch.length_min_ratio {
            cfg.length_min_ratio = v;
        }
        if let Some(v) = patch.length_max_ratio {
            cfg.length_max_ratio = v;
        }
        if let Some(v) = patch.jaccard_threshold {
            cfg.jaccard_threshold = v;
        }
        if let Some(v) = patch.jaccard_min_overlap {
            cfg.jaccard_min_overlap = v;
        }
        if let Some(v) = patch.use_token_matching {
            cfg.use_token_matching = v;
        }
        if let Some(v) = patch.sort_symbols_within_event {
            cfg.sort_symbols_within_event = v;
        }
        cfg.validate(false)?;
        Ok(cfg)
    }

    /// Validates invariants from §3/§7. `strict_mode` additionally rejects an empty pipeline.
    pub fn validate(&self, strict_mode: bool) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.recall_threshold) {
            return Err(ConfigError::OutOfRange { field: "recall_threshold", value: self.recall_threshold as f64 });
        }
        if !(0.0..=1.0).contains(&self.minhash_threshold) {
            return Err(ConfigError::OutOfRange { field: "minhash_threshold", value: self.minhash_threshold as f64 });
        }
        if !(0.0..=1.0).contains(&self.jaccard_threshold) {
            return Err(ConfigError::OutOfRange { field: "jaccard_threshold", value: self.jaccard_threshold as f64 });
        }
        if self.minhash_bands * self.minhash_rows != self.minhash_num_hashes {
            return Err(ConfigError::BandsRowsMismatch {
                bands: self.minhash_bands,
                rows: self.minhash_rows,
                num_hashes: self.minhash_num_hashes,
            });
        }
        if strict_mode && self.filter_pipeline.is_empty() {
            return Err(ConfigError::EmptyFilterPipelineUnderStrictMode);
        }
        Ok(())
    }
}

/// Wire-level partial config (all `Option`, §6.2 `update_config`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfigPatch {
    pub max_pattern_length: Option<u32>,
    pub stm_mode: Option<StmMode>,
    pub persistence: Option<u32>,
    pub recall_threshold: Option<f32>,
    pub max_predictions: Option<u32>,
    pub filter_pipeline: Option<Vec<FilterStage>>,
    pub minhash_threshold: Option<f32>,
    pub minhash_bands: Option<u32>,
    pub minhash_rows: Option<u32>,
    pub minhash_num_hashes: Option<u32>,
    pub length_min_ratio: Option<f32>,
    pub length_max_ratio: Option<f32>,
    pub jaccard_threshold: Option<f32>,
    pub jaccard_min_overlap: Option<u32>,
    pub use_token_matching: Option<bool>,
    pub sort_symbols_within_event: Option<bool>,
}

/// Process-wide settings (§6.3 environment knobs), loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub service_name: String,
    pub log_level: String,
    pub session_ttl_secs: u64,
    pub session_auto_extend: bool,
    pub strict_mode: bool,
    #[serde(default)]
    pub default_session_config: SessionConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_name: "kato".to_string(),
            log_level: "info".to_string(),
            session_ttl_secs: 3600,
            session_auto_extend: false,
            strict_mode: false,
            default_session_config: SessionConfig::default(),
        }
    }
}

impl Settings {
    /// Load from file and environment. Precedence: env `KATO_CONFIG` path >
    /// `config/kato.toml` > defaults. Environment variables use the
    /// `KATO__` prefix with `__` as the nested separator, e.g.
    /// `KATO__SESSION_TTL_SECS=7200`.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path = std::env::var("KATO_CONFIG").unwrap_or_else(|_| "config/kato".to_string());
        let builder = config::Config::builder()
            .set_default("service_name", "kato")?
            .set_default("log_level", "info")?
            .set_default("session_ttl_secs", 3600_i64)?
            .set_default("session_auto_extend", false)?
            .set_default("strict_mode", false)?;

        let path = Path::new(&config_path);
        let builder = if path.exists() { builder.add_source(config::File::from(path)) } else { builder };

        let built = builder.add_source(config::Environment::with_prefix("KATO").separator("__")).build()?;

        built.try_deserialize()
    }
}
