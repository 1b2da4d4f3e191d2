//! Per-event cached matcher evaluation.
//!
//! The wizard borrows the matcher arena and memoizes results in a
//! per-event cache indexed by matcher position, so a matcher shared by
//! several conditions and metrics is evaluated once per event.
//! Combination matchers are resolved after their children by recursion.

use crate::event::Event;

use super::{evaluate, transform, AtomMatcherTracker, MatchResult};

/// Per-event memo of matcher results and transformed events.
pub struct MatchCache {
    results: Vec<Option<MatchResult>>,
    transformed: Vec<Option<Event>>,
}

impl MatchCache {
    pub fn new(matcher_count: usize) -> Self {
        Self {
            results: vec![None; matcher_count],
            transformed: vec![None; matcher_count],
        }
    }

    pub fn result(&self, index: usize) -> MatchResult {
        self.results
            .get(index)
            .copied()
            .flatten()
            .unwrap_or(MatchResult::NotComputed)
    }
}

/// Borrowed view over the matcher arena.
pub struct MatcherWizard<'a> {
    matchers: &'a [AtomMatcherTracker],
}

impl<'a> MatcherWizard<'a> {
    pub fn new(matchers: &'a [AtomMatcherTracker]) -> Self {
        Self { matchers }
    }

    pub fn matcher_count(&self) -> usize {
        self.matchers.len()
    }

    /// Evaluate matcher `index` against `event`, memoizing into `cache`.
    pub fn match_event(&self, cache: &mut MatchCache, event: &Event, index: usize) -> MatchResult {
        let result = evaluate(self.matchers, index, event, &mut cache.results);
        if result == MatchResult::Matched && cache.transformed[index].is_none() {
            cache.transformed[index] = transform(&self.matchers[index], event);
        }
        result
    }

    /// The transformed event matcher `index` produced for the cached
    /// event, if it declares field transformations.
    pub fn transformed<'c>(&self, cache: &'c MatchCache, index: usize) -> Option<&'c Event> {
        cache.transformed.get(index).and_then(|t| t.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AtomMatcherConfig, SimpleMatcherConfig};
    use crate::event::EventBuilder;
    use crate::matcher::build_matchers;

    fn arena() -> Vec<AtomMatcherTracker> {
        let configs = vec![AtomMatcherConfig {
            id: 1,
            simple: Some(SimpleMatcherConfig {
                atom_id: 10,
                field_value_matchers: Vec::new(),
                strip_fields: Vec::new(),
            }),
            combination: None,
        }];
        build_matchers(&configs).expect("build").0
    }

    #[test]
    fn test_cache_memoizes() {
        let matchers = arena();
        let wizard = MatcherWizard::new(&matchers);
        let event = EventBuilder::new(10, 0).build();
        let mut cache = MatchCache::new(matchers.len());

        assert_eq!(cache.result(0), MatchResult::NotComputed);
        assert_eq!(wizard.match_event(&mut cache, &event, 0), MatchResult::Matched);
        assert_eq!(cache.result(0), MatchResult::Matched);
        // Second call reads the memo.
        assert_eq!(wizard.match_event(&mut cache, &event, 0), MatchResult::Matched);
    }

    #[test]
    fn test_fresh_cache_per_event() {
        let matchers = arena();
        let wizard = MatcherWizard::new(&matchers);

        let hit = EventBuilder::new(10, 0).build();
        let mut cache = MatchCache::new(matchers.len());
        assert_eq!(wizard.match_event(&mut cache, &hit, 0), MatchResult::Matched);

        let miss = EventBuilder::new(11, 0).build();
        let mut cache = MatchCache::new(matchers.len());
        assert_eq!(
            wizard.match_event(&mut cache, &miss, 0),
            MatchResult::NotMatched
        );
    }
}
