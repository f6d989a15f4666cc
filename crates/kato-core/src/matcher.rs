//! Sequence matcher (C6, §4.6).
//!
//! Longest-common-subsequence-of-matching-blocks, ratcliff/obershelp-style:
//! maximal matching blocks chosen greedy-longest-first, ties broken by
//! earliest position in `a` (the pattern) then earliest in `b` (the STM).
//! This is a direct port of the algorithm behind Python's
//! `difflib.SequenceMatcher.get_matching_blocks`, specialized to our token
//! streams and their multiplicities.

use std::collections::HashMap;

/// One maximal matching block: `a[a_start..a_start+size] == b[b_start..b_start+size]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchBlock {
    pub a_start: usize,
    pub b_start: usize,
    pub size: usize,
}

/// Builds, for each value in `b`, the ascending list of indices where it occurs.
fn index_b(b: &[String]) -> HashMap<&str, Vec<usize>> {
    let mut map: HashMap<&str, Vec<usize>> = HashMap::new();
    for (j, v) in b.iter().enumerate() {
        map.entry(v.as_str()).or_default().push(j);
    }
    map
}

/// Finds the longest matching block within `a[alo..ahi]` / `b[blo..bhi]`,
/// preferring the one starting earliest in `a`, then earliest in `b`.
fn find_longest_match(a: &[String], b2j: &HashMap<&str, Vec<usize>>, alo: usize, ahi: usize, blo: usize, bhi: usize) -> MatchBlock {
    let mut besti = alo;
    let mut bestj = blo;
    let mut bestsize = 0usize;
    let mut j2len: HashMap<usize, usize> = HashMap::new();

    for i in alo..ahi {
        let mut newj2len: HashMap<usize, usize> = HashMap::new();
        if let Some(js) = b2j.get(a[i].as_str()) {
            for &j in js {
                if j < blo {
                    continue;
                }
                if j >= bhi {
                    break;
                }
                let k = j.checked_sub(1).and_then(|jm1| j2len.get(&jm1)).copied().unwrap_or(0) + 1;
                newj2len.insert(j, k);
                if k > bestsize {
                    besti = i + 1 - k;
                    bestj = j + 1 - k;
                    bestsize = k;
                }
            }
        }
        j2len = newj2len;
    }

    MatchBlock { a_start: besti, b_start: bestj, size: bestsize }
}

/// Returns all maximal matching blocks covering `a` vs `b`, in ascending
/// order of `a_start`, deterministically split by recursive bisection.
pub fn matching_blocks(a: &[String], b: &[String]) -> Vec<MatchBlock> {
    let b2j = index_b(b);
    let mut queue = vec![(0usize, a.len(), 0usize, b.len())];
    let mut blocks = Vec::new();

    while let Some((alo, ahi, blo, bhi)) = queue.pop() {
        let m = find_longest_match(a, &b2j, alo, ahi, blo, bhi);
        if m.size > 0 {
            blocks.push(m);
            if alo < m.a_start && blo < m.b_start {
                queue.push((alo, m.a_start, blo, m.b_start));
            }
            if m.a_start + m.size < ahi && m.b_start + m.size < bhi {
                queue.push((m.a_start + m.size, ahi, m.b_start + m.size, bhi));
            }
        }
    }

    blocks.sort_by_key(|b| (b.a_start, b.b_start));
    blocks
}

/// The outcome of matching STM against one candidate pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    NoMatch,
    Match(Box<Matched>),
}

/// Temporal segmentation and matched/unmatched token accounting (§4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matched {
    pub matches: usize,
    pub fragmentation: usize,
    pub first_match_event: usize,
    pub last_match_event: usize,
    pub past: Vec<Vec<String>>,
    pub present: Vec<Vec<String>>,
    pub future: Vec<Vec<String>>,
    pub missing: Vec<String>,
    pub extras: Vec<String>,
}

/// Runs the matcher: `pattern` is `a`, `stm` is `b` (§4.6's tie-break order
/// is stated in terms of "earliest in pattern then earliest in STM").
pub fn match_pattern(stm_events: &[Vec<String>], pattern_events: &[Vec<String>]) -> MatchOutcome {
    let (pattern_tokens, pattern_event_idx) = crate::pattern::flatten_with_event_index(pattern_events);
    let (stm_tokens, _stm_event_idx) = crate::pattern::flatten_with_event_index(stm_events);

    let blocks = matching_blocks(&pattern_tokens, &stm_tokens);
    let total_matches: usize = blocks.iter().map(|b| b.size).sum();
    if total_matches == 0 {
        return MatchOutcome::NoMatch;
    }

    let mut matched_a = vec![false; pattern_tokens.len()];
    let mut matched_b = vec![false; stm_tokens.len()];
    for block in &blocks {
        for i in block.a_start..block.a_start + block.size {
            matched_a[i] = true;
        }
        for j in block.b_start..block.b_start + block.size {
            matched_b[j] = true;
        }
    }

    let first_match_a = matched_a.iter().position(|&m| m).expect("total_matches > 0");
    let last_match_a = matched_a.iter().rposition(|&m| m).expect("total_matches > 0");
    let first_match_event = pattern_event_idx[first_match_a];
    let last_match_event = pattern_event_idx[last_match_a];

    let past = pattern_events[..first_match_event].to_vec();
    let present = pattern_events[first_match_event..=last_match_event].to_vec();
    let future = pattern_events[last_match_event + 1..].to_vec();

    // missing: present-span pattern tokens never matched, in pattern order.
    let present_a_start = pattern_event_idx.iter().position(|&e| e == first_match_event).unwrap();
    let present_a_end = pattern_event_idx.iter().rposition(|&e| e == last_match_event).unwrap() + 1;
    let missing: Vec<String> = (present_a_start..present_a_end)
        .filter(|&i| !matched_a[i])
        .map(|i| pattern_tokens[i].clone())
        .collect();

    // extras: all STM tokens never matched, in STM order.
    let extras: Vec<String> = (0..stm_tokens.len()).filter(|&j| !matched_b[j]).map(|j| stm_tokens[j].clone()).collect();

    MatchOutcome::Match(Box::new(Matched {
        matches: total_matches,
        fragmentation: blocks.len().saturating_sub(1),
        first_match_event,
        last_match_event,
        past,
        present,
        future,
        missing,
        extras,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn full_single_event_match_has_empty_past_present_future_split() {
        // Observed event matches the pattern's first event exactly.
        let pattern = vec![ev(&["hello", "world"]), ev(&["bar", "foo"])];
        let stm = vec![ev(&["hello", "world"])];
        let outcome = match_pattern(&stm, &pattern);
        let m = match outcome {
            MatchOutcome::Match(m) => m,
            MatchOutcome::NoMatch => panic!("expected a match"),
        };
        assert_eq!(m.matches, 2);
        assert!(m.past.is_empty());
        assert_eq!(m.present, vec![ev(&["hello", "world"])]);
        assert_eq!(m.future, vec![ev(&["bar", "foo"])]);
        assert!(m.missing.is_empty());
        assert!(m.extras.is_empty());
    }

    #[test]
    fn partial_match_reports_missing_and_extras_in_order() {
        // Each observed event partially overlaps its matching pattern event.
        let pattern = vec![ev(&["a", "b", "c"]), ev(&["d", "e"]), ev(&["f", "g", "h"])];
        let stm = vec![ev(&["a", "x"]), ev(&["d"]), ev(&["f", "g", "y"])];
        let outcome = match_pattern(&stm, &pattern);
        let m = match outcome {
            MatchOutcome::Match(m) => m,
            MatchOutcome::NoMatch => panic!("expected a match"),
        };
        assert_eq!(m.matches, 4);
        assert_eq!(m.missing, vec!["b".to_string(), "c".to_string(), "e".to_string(), "h".to_string()]);
        assert_eq!(m.extras, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(m.present.len(), 3);
        assert!(m.past.is_empty());
        assert!(m.future.is_empty());
    }

    #[test]
    fn zero_matches_yields_no_match() {
        let pattern = vec![ev(&["a", "b"])];
        let stm = vec![ev(&["x", "y"])];
        assert_eq!(match_pattern(&stm, &pattern), MatchOutcome::NoMatch);
    }
}
