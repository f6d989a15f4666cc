//! Sled-backed pattern store — one tree, keys namespaced by `kb_id` (§6.1).
//!
//! One `sled::Db`, trees opened by name, structured `tracing` on every
//! write; here there is a single `patterns` tree and the kb_id lives in the
//! key prefix instead of in a separate tree per slot, since kb_id is an
//! open-ended caller-chosen value rather than a fixed small enum.
//!
//! Candidate-selection operations (`names_with_length_in_range`,
//! `names_with_band_overlap`, `jaccard_filter`) are implemented as a
//! kb_id-prefixed scan with the predicate applied in-process. A production
//! backing (the columnar store §6.1 describes, e.g. with pushdown predicates
//! over `length`/`lsh_bands`/`tokens`) would replace this scan with an
//! indexed query; the trait boundary is what matters to the filter pipeline,
//! which never looks past `PatternStore`.

use super::{LearnOutcome, MinhashConfig, PatternRow, PatternStore, StoreStats};
use crate::emotive;
use crate::error::StoreError;
use crate::minhash;
use crate::pattern;
use crate::symbol::Event;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

const TREE_NAME: &str = "kato_patterns";
const KEY_SEP: u8 = 0;

pub struct SledPatternStore {
    db: sled::Db,
}

impl SledPatternStore {
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Ok(Self { db: sled::open(path)? })
    }

    fn tree(&self) -> Result<sled::Tree, StoreError> {
        Ok(self.db.open_tree(TREE_NAME)?)
    }

    fn key(kb_id: &str, name: &str) -> Vec<u8> {
        let mut k = Vec::with_capacity(kb_id.len() + name.len() + 1);
        k.extend_from_slice(kb_id.as_bytes());
        k.push(KEY_SEP);
        k.extend_from_slice(name.as_bytes());
        k
    }

    fn prefix(kb_id: &str) -> Vec<u8> {
        let mut k = kb_id.as_bytes().to_vec();
        k.push(KEY_SEP);
        k
    }

    fn scan_kb(&self, kb_id: &str) -> Result<Vec<PatternRow>, StoreError> {
        let tree = self.tree()?;
        let mut rows = Vec::new();
        for item in tree.scan_prefix(Self::prefix(kb_id)) {
            let (_, v) = item?;
            rows.push(serde_json::from_slice::<PatternRow>(&v)?);
        }
        Ok(rows)
    }
}

impl PatternStore for SledPatternStore {
    fn health_check(&self) -> Result<(), StoreError> {
        let tree = self.tree()?;
        tree.get(b"__health_probe__")?;
        Ok(())
    }

    fn get(&self, kb_id: &str, name: &str) -> Result<Option<PatternRow>, StoreError> {
        let tree = self.tree()?;
        match tree.get(Self::key(kb_id, name))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn upsert_learn(
        &self,
        kb_id: &str,
        events: &[Event],
        averaged_emotives: &HashMap<String, f64>,
        metadata: &HashSet<String>,
        persistence: u32,
        minhash_cfg: MinhashConfig,
    ) -> Result<LearnOutcome, StoreError> {
        let tree = self.tree()?;
        let name = pattern::pattern_name(events);
        let key = Self::key(kb_id, &name);

        let mut created = false;
        let mut final_frequency = 0u64;
        let result = tree.fetch_and_update(&key, |existing| {
            let mut row: PatternRow = match existing {
                Some(bytes) => serde_json::from_slice(bytes).expect("stored pattern rows are always valid"),
                None => {
                    created = true;
                    let tokens = pattern::unique_tokens(events);
                    let sketch = minhash::sketch(&tokens, minhash_cfg.num_hashes);
                    let lsh_bands = minhash::lsh_bands(&sketch, minhash_cfg.bands, minhash_cfg.rows);
                    PatternRow {
                        kb_id: kb_id.to_string(),
                        name: name.clone(),
                        pattern_data: events.to_vec(),
                        length: events.len() as u32,
                        tokens,
                        minhash_sketch: sketch,
                        lsh_bands,
                        frequency: 0,
                        emotives: emotive::PatternEmotives::new(),
                        metadata: HashSet::new(),
                    }
                }
            };
            row.frequency += 1;
            emotive::merge_into_pattern(&mut row.emotives, averaged_emotives, persistence);
            row.metadata.extend(metadata.iter().cloned());
            final_frequency = row.frequency;
            Some(serde_json::to_vec(&row).expect("PatternRow always serializes"))
        })?;
        let _ = result;

        Ok(LearnOutcome { name, frequency: final_frequency, created })
    }

    fn names_with_length_in_range(&self, kb_id: &str, min_len: u32, max_len: u32, within: Option<&[String]>) -> Result<Vec<String>, StoreError> {
        let restrict: Option<HashSet<&str>> = within.map(|names| names.iter().map(String::as_str).collect());
        let rows = self.scan_kb(kb_id)?;
        Ok(rows
            .into_iter()
            .filter(|r| r.length >= min_len && r.length <= max_len)
            .filter(|r| restrict.as_ref().is_none_or(|s| s.contains(r.name.as_str())))
            .map(|r| r.name)
            .collect())
    }

    fn names_with_band_overlap(&self, kb_id: &str, bands: &[u64], within: Option<&[String]>) -> Result<Vec<String>, StoreError> {
        let restrict: Option<HashSet<&str>> = within.map(|names| names.iter().map(String::as_str).collect());
        let band_set: HashSet<u64> = bands.iter().copied().collect();
        let rows = self.scan_kb(kb_id)?;
        Ok(rows
            .into_iter()
            .filter(|r| r.lsh_bands.iter().any(|b| band_set.contains(b)))
            .filter(|r| restrict.as_ref().is_none_or(|s| s.contains(r.name.as_str())))
            .map(|r| r.name)
            .collect())
    }

    fn jaccard_filter(
        &self,
        kb_id: &str,
        stm_tokens: &BTreeSet<String>,
        threshold: f32,
        min_overlap: u32,
        within: Option<&[String]>,
    ) -> Result<Vec<String>, StoreError> {
        let restrict: Option<HashSet<&str>> = within.map(|names| names.iter().map(String::as_str).collect());
        let rows = self.scan_kb(kb_id)?;
        Ok(rows
            .into_iter()
            .filter(|r| restrict.as_ref().is_none_or(|s| s.contains(r.name.as_str())))
            .filter_map(|r| {
                let pattern_tokens: BTreeSet<&String> = r.tokens.iter().collect();
                let intersection = pattern_tokens.iter().filter(|t| stm_tokens.contains(t.as_str())).count();
                let union = pattern_tokens.len() + stm_tokens.len() - intersection;
                let jaccard = if union == 0 { 0.0 } else { intersection as f32 / union as f32 };
                if jaccard >= threshold && intersection as u32 >= min_overlap {
                    Some(r.name)
                } else {
                    None
                }
            })
            .collect())
    }

    fn all_names(&self, kb_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.scan_kb(kb_id)?.into_iter().map(|r| r.name).collect())
    }

    fn load_rows(&self, kb_id: &str, names: &[String]) -> Result<Vec<PatternRow>, StoreError> {
        let tree = self.tree()?;
        let mut rows = Vec::with_capacity(names.len());
        for name in names {
            if let Some(bytes) = tree.get(Self::key(kb_id, name))? {
                rows.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(rows)
    }

    fn token_frequencies(&self, kb_id: &str) -> Result<HashMap<String, u64>, StoreError> {
        let mut counts: HashMap<String, u64> = HashMap::new();
        for row in self.scan_kb(kb_id)? {
            for token in &row.tokens {
                *counts.entry(token.clone()).or_insert(0) += row.frequency;
            }
        }
        Ok(counts)
    }

    fn stats(&self, kb_id: &str) -> Result<StoreStats, StoreError> {
        let rows = self.scan_kb(kb_id)?;
        let pattern_count = rows.len() as u64;
        let average_length = if pattern_count == 0 { 0.0 } else { rows.iter().map(|r| r.length as f64).sum::<f64>() / pattern_count as f64 };
        let approximate_size_bytes = rows.iter().map(|r| serde_json::to_vec(r).map(|v| v.len() as u64).unwrap_or(0)).sum();
        Ok(StoreStats { kb_id: kb_id.to_string(), pattern_count, average_length, approximate_size_bytes })
    }

    fn drop_partition(&self, kb_id: &str) -> Result<(), StoreError> {
        let tree = self.tree()?;
        let keys: Vec<_> = tree.scan_prefix(Self::prefix(kb_id)).keys().collect::<Result<Vec<_>, _>>()?;
        for key in keys {
            tree.remove(key)?;
        }
        tracing::info!(target: "kato::store", kb_id, "dropped pattern partition");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SledPatternStore {
        SledPatternStore::open_path(tempfile::tempdir().unwrap().keep()).unwrap()
    }

    fn minhash_cfg() -> MinhashConfig {
        MinhashConfig { bands: 20, rows: 5, num_hashes: 100 }
    }

    #[test]
    fn learn_is_idempotent_and_monotonically_increments_frequency() {
        let store = store();
        let events = vec![vec!["alpha".to_string(), "beta".to_string()]];
        let first = store.upsert_learn("kb1", &events, &HashMap::new(), &HashSet::new(), 5, minhash_cfg()).unwrap();
        assert!(first.created);
        assert_eq!(first.frequency, 1);

        let second = store.upsert_learn("kb1", &events, &HashMap::new(), &HashSet::new(), 5, minhash_cfg()).unwrap();
        assert!(!second.created);
        assert_eq!(second.frequency, 2);
        assert_eq!(first.name, second.name);
    }

    #[test]
    fn kb_isolation_holds_for_identical_events() {
        let store = store();
        let events = vec![vec!["x".to_string()], vec!["y".to_string()]];
        store.upsert_learn("kb_a", &events, &HashMap::new(), &HashSet::new(), 5, minhash_cfg()).unwrap();
        store.upsert_learn("kb_b", &events, &HashMap::new(), &HashSet::new(), 5, minhash_cfg()).unwrap();

        assert_eq!(store.all_names("kb_a").unwrap().len(), 1);
        assert_eq!(store.all_names("kb_b").unwrap().len(), 1);
        store.drop_partition("kb_a").unwrap();
        assert!(store.all_names("kb_a").unwrap().is_empty());
        assert_eq!(store.all_names("kb_b").unwrap().len(), 1);
    }

    #[test]
    fn length_filter_respects_range() {
        let store = store();
        store.upsert_learn("kb1", &[vec!["a".to_string()]], &HashMap::new(), &HashSet::new(), 5, minhash_cfg()).unwrap();
        store
            .upsert_learn("kb1", &[vec!["b".to_string()], vec!["c".to_string()], vec!["d".to_string()]], &HashMap::new(), &HashSet::new(), 5, minhash_cfg())
            .unwrap();

        let names = store.names_with_length_in_range("kb1", 2, 5, None).unwrap();
        assert_eq!(names.len(), 1);
    }
}
