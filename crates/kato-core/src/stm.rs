//! Short-term memory buffer (C3, §4.2).

use crate::settings::StmMode;
use crate::symbol::{sort_event, Event};

/// The per-session accumulation buffer. Never holds an empty event.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Stm {
    events: Vec<Event>,
}

/// Whether `append` crossed `max_pattern_length` and auto-learn should fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoLearnTrigger;

impl Stm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events(events: Vec<Event>) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn total_tokens(&self) -> usize {
        self.events.iter().map(|e| e.len()).sum()
    }

    /// Appends `event` (optionally sorting it first); drops it if empty.
    /// Returns `Some(AutoLearnTrigger)` if `max_pattern_length > 0` and the
    /// append brought STM exactly to that length.
    pub fn append(&mut self, mut event: Event, sort_within_event: bool, max_pattern_length: u32) -> Option<AutoLearnTrigger> {
        if sort_within_event {
            sort_event(&mut event);
        }
        if event.is_empty() {
            return None;
        }
        self.events.push(event);
        if max_pattern_length > 0 && self.events.len() as u32 == max_pattern_length {
            Some(AutoLearnTrigger)
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Applies post-learn semantics: explicit learn always clears fully;
    /// auto-learn respects `stm_mode` (§4.4).
    pub fn apply_post_learn(&mut self, mode: StmMode, is_auto_learn: bool) {
        if !is_auto_learn {
            self.clear();
            return;
        }
        match mode {
            StmMode::Clear => self.clear(),
            StmMode::Rolling => {
                if let Some(last) = self.events.last().cloned() {
                    self.events = vec![last];
                } else {
                    self.events.clear();
                }
            }
        }
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_sorts_and_drops_empty() {
        let mut stm = Stm::new();
        stm.append(vec!["b".into(), "a".into()], true, 0);
        stm.append(vec![], true, 0);
        assert_eq!(stm.events(), &[vec!["a".to_string(), "b".to_string()]]);
    }

    #[test]
    fn auto_learn_fires_exactly_at_threshold() {
        let mut stm = Stm::new();
        assert!(stm.append(vec!["a".into()], true, 2).is_none());
        assert!(stm.append(vec!["b".into()], true, 2).is_some());
    }

    #[test]
    fn rolling_retains_last_event_clear_drops_all() {
        let mut stm = Stm::from_events(vec![vec!["a".into()], vec!["b".into()]]);
        stm.apply_post_learn(StmMode::Rolling, true);
        assert_eq!(stm.events(), &[vec!["b".to_string()]]);

        let mut stm2 = Stm::from_events(vec![vec!["a".into()], vec!["b".into()]]);
        stm2.apply_post_learn(StmMode::Clear, true);
        assert!(stm2.is_empty());
    }

    #[test]
    fn explicit_learn_always_clears() {
        let mut stm = Stm::from_events(vec![vec!["a".into()], vec!["b".into()]]);
        stm.apply_post_learn(StmMode::Rolling, false);
        assert!(stm.is_empty());
    }
}
