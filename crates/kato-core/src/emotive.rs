//! Emotive aggregation (C2, §4.3).
//!
//! Pattern-side: per emotive key, a bounded FIFO window of floats, capacity
//! `persistence`. Session-side: a running accumulator of per-observation
//! dicts, averaged on read.

use std::collections::{HashMap, VecDeque};

/// A bounded FIFO window of emotive values for one pattern's one emotive key.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct EmotiveWindow(pub VecDeque<f64>);

impl EmotiveWindow {
    pub fn push(&mut self, value: f64, capacity: u32) {
        self.0.push_back(value);
        while self.0.len() > capacity.max(1) as usize {
            self.0.pop_front();
        }
    }

    pub fn mean(&self) -> f64 {
        if self.0.is_empty() {
            return 0.0;
        }
        self.0.iter().sum::<f64>() / self.0.len() as f64
    }
}

/// A pattern's full emotive map: key -> bounded window.
pub type PatternEmotives = HashMap<String, EmotiveWindow>;

/// Averages the per-key accumulator entries from a session's observations.
///
/// Each accumulator entry is one observation's emotive dict; keys absent from
/// an entry are simply not counted toward that key's average.
pub fn average_accumulator(accumulator: &[HashMap<String, f64>]) -> HashMap<String, f64> {
    let mut sums: HashMap<String, (f64, usize)> = HashMap::new();
    for entry in accumulator {
        for (key, value) in entry {
            let slot = sums.entry(key.clone()).or_insert((0.0, 0));
            slot.0 += value;
            slot.1 += 1;
        }
    }
    sums.into_iter().map(|(k, (sum, count))| (k, sum / count as f64)).collect()
}

/// Merges a learn's averaged session emotives into a pattern's stored
/// windows, trimming each window to `persistence` and dropping zero-valued
/// entries to preserve sparsity (§4.3).
pub fn merge_into_pattern(pattern_emotives: &mut PatternEmotives, averaged: &HashMap<String, f64>, persistence: u32) {
    for (key, value) in averaged {
        if *value == 0.0 {
            continue;
        }
        pattern_emotives.entry(key.clone()).or_default().push(*value, persistence);
    }
}

/// Returns the per-key mean across a pattern's stored windows (read view).
pub fn pattern_emotive_means(pattern_emotives: &PatternEmotives) -> HashMap<String, f64> {
    pattern_emotives.iter().map(|(k, w)| (k.clone(), w.mean())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_trims_to_capacity_fifo() {
        let mut w = EmotiveWindow::default();
        for v in [1.0, 2.0, 3.0, 4.0] {
            w.push(v, 3);
        }
        assert_eq!(w.0, VecDeque::from(vec![2.0, 3.0, 4.0]));
    }

    #[test]
    fn average_ignores_missing_keys_per_entry() {
        let acc = vec![
            HashMap::from([("joy".to_string(), 1.0)]),
            HashMap::from([("joy".to_string(), 3.0), ("fear".to_string(), 0.5)]),
        ];
        let avg = average_accumulator(&acc);
        assert_eq!(avg.get("joy"), Some(&2.0));
        assert_eq!(avg.get("fear"), Some(&0.5));
    }

    #[test]
    fn merge_drops_zero_valued_entries() {
        let mut pe = PatternEmotives::new();
        let averaged = HashMap::from([("joy".to_string(), 0.0), ("fear".to_string(), 0.2)]);
        merge_into_pattern(&mut pe, &averaged, 5);
        assert!(!pe.contains_key("joy"));
        assert!(pe.contains_key("fear"));
    }
}
