//! Symbol-probability cache (§4.7, §5).
//!
//! `grand_hamiltonian`/`confluence` need each token's probability across the
//! *whole* kb_id, not just the matched candidate set. Recomputing that from
//! scratch on every prediction would mean scanning every pattern row per
//! request, so it is cached per kb_id with a TTL and refreshed
//! single-writer, matching §5's "process-scoped with TTL; safe under
//! concurrent readers and single-writer refresh".

use crate::error::StoreError;
use crate::store::PatternStore;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Entry {
    probabilities: Arc<HashMap<String, f64>>,
    computed_at: Instant,
}

/// Process-scoped, per-kb_id cache of global symbol probabilities.
pub struct SymbolProbabilityCache {
    entries: DashMap<String, Entry>,
    ttl: Duration,
}

impl SymbolProbabilityCache {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: DashMap::new(), ttl }
    }

    /// Returns the cached distribution for `kb_id`, refreshing from `store`
    /// if absent or stale. A concurrent miss may refresh twice; both writers
    /// converge on the same value, so this never corrupts the cache.
    pub fn get_or_refresh(&self, store: &dyn PatternStore, kb_id: &str) -> Result<Arc<HashMap<String, f64>>, StoreError> {
        if let Some(entry) = self.entries.get(kb_id) {
            if entry.computed_at.elapsed() < self.ttl {
                return Ok(entry.probabilities.clone());
            }
        }

        let counts = store.token_frequencies(kb_id)?;
        let total: u64 = counts.values().sum();
        let probabilities: HashMap<String, f64> = if total == 0 {
            HashMap::new()
        } else {
            counts.into_iter().map(|(token, count)| (token, count as f64 / total as f64)).collect()
        };
        let probabilities = Arc::new(probabilities);
        self.entries.insert(kb_id.to_string(), Entry { probabilities: probabilities.clone(), computed_at: Instant::now() });
        Ok(probabilities)
    }

    /// Forces the next `get_or_refresh` for `kb_id` to recompute (e.g. after a learn).
    pub fn invalidate(&self, kb_id: &str) {
        self.entries.remove(kb_id);
    }
}
