//! Pattern store interface (C4, §4.1, §6.1).
//!
//! This module defines the contract every backing store must satisfy; the
//! filter pipeline (C5) and processor orchestrator (C10) depend only on the
//! trait, never on a concrete store, breaking the cyclic
//! processor/searcher/store references the source exhibited (§9).

mod sled_store;

pub use sled_store::SledPatternStore;

use crate::emotive::PatternEmotives;
use crate::error::StoreError;
use crate::symbol::Event;
use std::collections::{BTreeSet, HashMap, HashSet};

/// One persisted pattern row (§3 `Pattern`, §6.1 columnar schema).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PatternRow {
    pub kb_id: String,
    pub name: String,
    pub pattern_data: Vec<Event>,
    pub length: u32,
    pub tokens: Vec<String>,
    pub minhash_sketch: Vec<u64>,
    pub lsh_bands: Vec<u64>,
    pub frequency: u64,
    pub emotives: PatternEmotives,
    pub metadata: HashSet<String>,
}

/// Result of a learn upsert (§4.4).
#[derive(Debug, Clone, PartialEq)]
pub struct LearnOutcome {
    pub name: String,
    pub frequency: u64,
    pub created: bool,
}

/// Per-kb_id observability snapshot (§3's supplemental status/introspection feature).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StoreStats {
    pub kb_id: String,
    pub pattern_count: u64,
    pub average_length: f64,
    pub approximate_size_bytes: u64,
}

/// MinHash configuration passed into `upsert_learn` so the store can compute
/// the sketch/bands at write time (§4.1, §4.5).
#[derive(Debug, Clone, Copy)]
pub struct MinhashConfig {
    pub bands: u32,
    pub rows: u32,
    pub num_hashes: u32,
}

/// The pattern store contract (C4). Implementations own all persisted rows
/// and metadata exclusively; callers reach them only through this trait.
pub trait PatternStore: Send + Sync {
    /// Opens every tree/partition this store needs and reports whether the
    /// backend is reachable (§9 supplement: store health/verify routine).
    fn health_check(&self) -> Result<(), StoreError>;

    fn get(&self, kb_id: &str, name: &str) -> Result<Option<PatternRow>, StoreError>;

    /// Idempotent upsert-by-name: creates with `frequency=1` or increments an
    /// existing row's frequency and merges emotives/metadata (§4.4).
    fn upsert_learn(
        &self,
        kb_id: &str,
        events: &[Event],
        averaged_emotives: &HashMap<String, f64>,
        metadata: &HashSet<String>,
        persistence: u32,
        minhash: MinhashConfig,
    ) -> Result<LearnOutcome, StoreError>;

    /// §4.5 `length` stage. `within`, when `Some`, restricts to a prior
    /// stage's candidate names (fused db-side predicate, §4.5).
    fn names_with_length_in_range(&self, kb_id: &str, min_len: u32, max_len: u32, within: Option<&[String]>) -> Result<Vec<String>, StoreError>;

    /// §4.5 `minhash` stage 1 (band overlap, db-side).
    fn names_with_band_overlap(&self, kb_id: &str, bands: &[u64], within: Option<&[String]>) -> Result<Vec<String>, StoreError>;

    /// §4.5 `jaccard` stage: exact Jaccard over token sets, db-side.
    fn jaccard_filter(
        &self,
        kb_id: &str,
        stm_tokens: &BTreeSet<String>,
        threshold: f32,
        min_overlap: u32,
        within: Option<&[String]>,
    ) -> Result<Vec<String>, StoreError>;

    /// All pattern names in `kb_id` (empty-pipeline fallback, §4.5).
    fn all_names(&self, kb_id: &str) -> Result<Vec<String>, StoreError>;

    fn load_rows(&self, kb_id: &str, names: &[String]) -> Result<Vec<PatternRow>, StoreError>;

    /// Global per-token occurrence counts across the kb_id, the basis of the
    /// symbol-probability cache used by `grand_hamiltonian`/`confluence` (§5).
    fn token_frequencies(&self, kb_id: &str) -> Result<HashMap<String, u64>, StoreError>;

    fn stats(&self, kb_id: &str) -> Result<StoreStats, StoreError>;

    /// Hermetic deletion of every row for `kb_id` (§6.1 `drop_partition`).
    fn drop_partition(&self, kb_id: &str) -> Result<(), StoreError>;
}
