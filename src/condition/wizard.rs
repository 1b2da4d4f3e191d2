//! Point queries against the condition arena.
//!
//! Producers do not hold condition trackers; they hold an index and ask
//! the wizard at dispatch time, passing the condition key translated
//! from the triggering event through their metric-to-condition links.

use crate::event::field::DimensionKey;

use super::{ConditionState, ConditionTracker};

/// Borrowed view over the condition arena.
pub struct ConditionWizard<'a> {
    trackers: &'a [ConditionTracker],
}

impl<'a> ConditionWizard<'a> {
    pub fn new(trackers: &'a [ConditionTracker]) -> Self {
        Self { trackers }
    }

    /// Overall value of condition `index`.
    pub fn value(&self, index: usize) -> ConditionState {
        self.trackers
            .get(index)
            .map(|t| t.last_value())
            .unwrap_or(ConditionState::Unknown)
    }

    /// Value of condition `index` for the given condition key. Sliced
    /// trackers resolve the matching slice; non-sliced trackers ignore
    /// the key. Combinations fold their children under the same key.
    pub fn query(&self, index: usize, key: &DimensionKey) -> ConditionState {
        let Some(tracker) = self.trackers.get(index) else {
            return ConditionState::Unknown;
        };
        if tracker.is_simple() {
            tracker.query_slice(key)
        } else {
            self.query_combination(index, key)
        }
    }

    fn query_combination(&self, index: usize, key: &DimensionKey) -> ConditionState {
        use crate::config::LogicalOperation;

        let Some(tracker) = self.trackers.get(index) else {
            return ConditionState::Unknown;
        };
        match &tracker.kind {
            super::ConditionKind::Simple(_) => tracker.query_slice(key),
            super::ConditionKind::Combination {
                operation,
                children,
            } => match operation {
                LogicalOperation::And => children
                    .iter()
                    .map(|&c| self.query(c, key))
                    .fold(ConditionState::True, ConditionState::and),
                LogicalOperation::Or => children
                    .iter()
                    .map(|&c| self.query(c, key))
                    .fold(ConditionState::False, ConditionState::or),
                LogicalOperation::Not => children
                    .first()
                    .map(|&c| self.query(c, key).not())
                    .unwrap_or(ConditionState::Unknown),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::condition::{build_conditions, refresh};
    use crate::config::{
        AtomMatcherConfig, ConditionConfig, SimpleConditionConfig, SimpleMatcherConfig,
    };
    use crate::event::field::{filter_values, translate_field_matcher, DimensionSpec, FieldMatcherNode, Value};
    use crate::event::EventBuilder;

    fn matcher_map() -> HashMap<i64, usize> {
        let configs = vec![AtomMatcherConfig {
            id: 1,
            simple: Some(SimpleMatcherConfig {
                atom_id: 11,
                field_value_matchers: Vec::new(),
                strip_fields: Vec::new(),
            }),
            combination: None,
        }];
        crate::matcher::build_matchers(&configs).expect("build").1
    }

    #[test]
    fn test_query_unsliced_ignores_key() {
        let configs = vec![ConditionConfig {
            id: 50,
            simple: Some(SimpleConditionConfig {
                start: 1,
                stop: None,
                stop_all: None,
                count_nesting: true,
                dimensions: None,
                initial_value: Default::default(),
            }),
            combination: None,
        }];
        let (mut trackers, _) = build_conditions(&configs, &matcher_map()).expect("build");

        let start = EventBuilder::new(11, 0).field(Value::Int(1)).build();
        trackers[0].handle_matched(0, &start);
        refresh(&mut trackers, &[true]);

        let wizard = ConditionWizard::new(&trackers);
        let any_key = DimensionKey::default();
        assert_eq!(wizard.query(0, &any_key), ConditionState::True);
    }

    #[test]
    fn test_query_sliced_resolves_slice() {
        let dims = DimensionSpec {
            atom_id: 11,
            fields: vec![FieldMatcherNode::leaf(1)],
        };
        let configs = vec![ConditionConfig {
            id: 50,
            simple: Some(SimpleConditionConfig {
                start: 1,
                stop: None,
                stop_all: None,
                count_nesting: true,
                dimensions: Some(dims.clone()),
                initial_value: Default::default(),
            }),
            combination: None,
        }];
        let (mut trackers, _) = build_conditions(&configs, &matcher_map()).expect("build");

        let start = EventBuilder::new(11, 0).field(Value::Int(7)).build();
        trackers[0].handle_matched(0, &start);
        refresh(&mut trackers, &[true]);

        let matchers = translate_field_matcher(&dims);
        let hit = filter_values(&matchers, start.values());
        let other = EventBuilder::new(11, 0).field(Value::Int(8)).build();
        let miss = filter_values(&matchers, other.values());

        let wizard = ConditionWizard::new(&trackers);
        assert_eq!(wizard.query(0, &hit), ConditionState::True);
        assert_eq!(wizard.query(0, &miss), ConditionState::False);
    }
}
