//! Pattern naming and canonicalization (§3, §4.1).

use crate::symbol::{sha1_hex, Event};
use std::collections::BTreeSet;

/// Prefix every pattern name carries.
pub const PATTERN_NAME_PREFIX: &str = "PTRN|";

/// Serializes an event list into the fixed, stable byte form used for naming.
///
/// Events keep their original order; symbols within each event are assumed
/// already sorted by the caller (STM/pattern-store boundary enforces this).
/// `serde_json` array serialization preserves element order and produces a
/// deterministic byte sequence for a given `Vec<Vec<String>>`, so it is used
/// directly as the canonical form rather than hand-rolling a delimiter scheme.
pub fn canonical_bytes(events: &[Event]) -> Vec<u8> {
    serde_json::to_vec(events).expect("Vec<Vec<String>> always serializes")
}

/// Computes the deterministic `"PTRN|" + sha1hex(canonical(events))` name.
pub fn pattern_name(events: &[Event]) -> String {
    format!("{PATTERN_NAME_PREFIX}{}", sha1_hex(&canonical_bytes(events)))
}

/// Total token count across all events (the "2-string rule" denominator, §4.4).
pub fn total_token_count(events: &[Event]) -> usize {
    events.iter().map(|e| e.len()).sum()
}

/// Sorted-unique token projection used by the filter pipeline (§3 `tokens`).
pub fn unique_tokens(events: &[Event]) -> Vec<String> {
    let set: BTreeSet<&String> = events.iter().flatten().collect();
    set.into_iter().cloned().collect()
}

/// Flattens an event list into one token stream, preserving order, alongside
/// each token's owning event index. Used by the sequence matcher (C6).
pub fn flatten_with_event_index(events: &[Event]) -> (Vec<String>, Vec<usize>) {
    let mut tokens = Vec::new();
    let mut event_idx = Vec::new();
    for (i, event) in events.iter().enumerate() {
        for tok in event {
            tokens.push(tok.clone());
            event_idx.push(i);
        }
    }
    (tokens, event_idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_deterministic_and_content_addressed() {
        let events: Vec<Event> = vec![vec!["alpha".into(), "beta".into()]];
        let a = pattern_name(&events);
        let b = pattern_name(&events);
        assert_eq!(a, b);
        assert!(a.starts_with(PATTERN_NAME_PREFIX));
    }

    #[test]
    fn distinct_event_lists_yield_distinct_names() {
        let a: Vec<Event> = vec![vec!["alpha".into(), "beta".into()]];
        let b: Vec<Event> = vec![vec!["alpha".into()], vec!["beta".into()]];
        assert_ne!(pattern_name(&a), pattern_name(&b));
    }

    #[test]
    fn unique_tokens_are_sorted_and_deduped() {
        let events: Vec<Event> = vec![vec!["b".into(), "a".into()], vec!["a".into(), "c".into()]];
        assert_eq!(unique_tokens(&events), vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }
}
