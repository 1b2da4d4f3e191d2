//! Tri-valued condition trackers: the interior nodes of the evaluation
//! graph.
//!
//! A condition is true, false, or unknown, and unknown participates in
//! the Kleene AND/OR algebra rather than collapsing to false. Simple
//! trackers count outstanding starts per dimension slice; combination
//! trackers fold child states.

pub mod wizard;

use std::collections::HashMap;

use crate::config::{ConditionConfig, InitialConditionValue, InvalidConfigReason, LogicalOperation};
use crate::event::field::{filter_values, translate_field_matcher, DimensionKey, Matcher};
use crate::event::Event;

/// Tri-valued condition state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionState {
    True,
    False,
    Unknown,
}

impl ConditionState {
    pub fn and(self, other: ConditionState) -> ConditionState {
        match (self, other) {
            (ConditionState::False, _) | (_, ConditionState::False) => ConditionState::False,
            (ConditionState::Unknown, _) | (_, ConditionState::Unknown) => ConditionState::Unknown,
            _ => ConditionState::True,
        }
    }

    pub fn or(self, other: ConditionState) -> ConditionState {
        match (self, other) {
            (ConditionState::True, _) | (_, ConditionState::True) => ConditionState::True,
            (ConditionState::Unknown, _) | (_, ConditionState::Unknown) => ConditionState::Unknown,
            _ => ConditionState::False,
        }
    }

    pub fn not(self) -> ConditionState {
        match self {
            ConditionState::True => ConditionState::False,
            ConditionState::False => ConditionState::True,
            ConditionState::Unknown => ConditionState::Unknown,
        }
    }

    pub fn is_true(self) -> bool {
        self == ConditionState::True
    }
}

impl From<bool> for ConditionState {
    fn from(v: bool) -> Self {
        if v {
            ConditionState::True
        } else {
            ConditionState::False
        }
    }
}

/// One node of the condition layer.
#[derive(Debug)]
pub struct ConditionTracker {
    id: i64,
    last_value: ConditionState,
    kind: ConditionKind,
}

#[derive(Debug)]
enum ConditionKind {
    Simple(SimpleConditionTracker),
    Combination {
        operation: LogicalOperation,
        children: Vec<usize>,
    },
}

#[derive(Debug)]
pub struct SimpleConditionTracker {
    start_index: usize,
    stop_index: Option<usize>,
    stop_all_index: Option<usize>,
    count_nesting: bool,
    output_dimensions: Vec<Matcher>,
    initial: ConditionState,
    /// Outstanding start count per slice; the default key is used when
    /// the condition is unsliced.
    slice_counts: HashMap<DimensionKey, u32>,
    seen_event: bool,
}

impl ConditionTracker {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn is_simple(&self) -> bool {
        matches!(self.kind, ConditionKind::Simple(_))
    }

    pub fn is_sliced(&self) -> bool {
        match &self.kind {
            ConditionKind::Simple(s) => !s.output_dimensions.is_empty(),
            ConditionKind::Combination { .. } => false,
        }
    }

    /// Matcher indices whose matches drive this tracker (simple only).
    pub fn input_matchers(&self) -> Vec<usize> {
        match &self.kind {
            ConditionKind::Simple(s) => {
                let mut v = vec![s.start_index];
                v.extend(s.stop_index);
                v.extend(s.stop_all_index);
                v
            }
            ConditionKind::Combination { .. } => Vec::new(),
        }
    }

    /// Start/stop/stop-all indices, for duration metrics whose state
    /// machine is driven by a simple condition's matchers.
    pub fn duration_matchers(&self) -> Option<(usize, Option<usize>, Option<usize>)> {
        match &self.kind {
            ConditionKind::Simple(s) => Some((s.start_index, s.stop_index, s.stop_all_index)),
            ConditionKind::Combination { .. } => None,
        }
    }

    pub fn count_nesting(&self) -> Option<bool> {
        match &self.kind {
            ConditionKind::Simple(s) => Some(s.count_nesting),
            ConditionKind::Combination { .. } => None,
        }
    }

    pub fn last_value(&self) -> ConditionState {
        self.last_value
    }

    /// Applies a matched event to a simple tracker. Returns whether any
    /// slice (or the overall value) changed.
    pub fn handle_matched(&mut self, matcher_index: usize, event: &Event) -> bool {
        let ConditionKind::Simple(s) = &mut self.kind else {
            return false;
        };

        let key = if s.output_dimensions.is_empty() {
            DimensionKey::default()
        } else {
            filter_values(&s.output_dimensions, event.values())
        };

        let mut changed = false;
        if matcher_index == s.start_index {
            let entry = s.slice_counts.entry(key).or_insert(0);
            let was_zero = *entry == 0;
            if s.count_nesting {
                *entry = entry.saturating_add(1);
            } else {
                *entry = 1;
            }
            changed = was_zero;
        } else if Some(matcher_index) == s.stop_index {
            if let Some(entry) = s.slice_counts.get_mut(&key) {
                *entry = entry.saturating_sub(1);
                if *entry == 0 {
                    s.slice_counts.remove(&key);
                    changed = true;
                }
            }
        } else if Some(matcher_index) == s.stop_all_index {
            changed = !s.slice_counts.is_empty();
            s.slice_counts.clear();
        }

        // Unknown resolves on the first relevant event either way.
        if !s.seen_event {
            s.seen_event = true;
            changed = true;
        }
        changed
    }

    fn simple_value(&self) -> Option<ConditionState> {
        match &self.kind {
            ConditionKind::Simple(s) => Some(s.value()),
            ConditionKind::Combination { .. } => None,
        }
    }

    /// Per-slice point query; falls back to containment scan when the
    /// query key covers only part of the slicing dimension.
    pub fn query_slice(&self, key: &DimensionKey) -> ConditionState {
        match &self.kind {
            ConditionKind::Simple(s) => {
                if s.output_dimensions.is_empty() || key.is_empty() {
                    return s.value();
                }
                if !s.seen_event && s.initial == ConditionState::Unknown {
                    return ConditionState::Unknown;
                }
                if let Some(count) = s.slice_counts.get(key) {
                    return ConditionState::from(*count > 0);
                }
                let any = s
                    .slice_counts
                    .iter()
                    .any(|(slice, count)| *count > 0 && slice.contains(key));
                ConditionState::from(any)
            }
            ConditionKind::Combination { .. } => self.last_value,
        }
    }
}

impl SimpleConditionTracker {
    fn value(&self) -> ConditionState {
        if !self.seen_event && self.initial == ConditionState::Unknown {
            return ConditionState::Unknown;
        }
        ConditionState::from(self.slice_counts.values().any(|c| *c > 0))
    }
}

/// Build the condition arena from config, resolving matcher and child
/// references to indices and rejecting malformed or cyclic definitions.
pub fn build_conditions(
    configs: &[ConditionConfig],
    matcher_map: &HashMap<i64, usize>,
) -> Result<(Vec<ConditionTracker>, HashMap<i64, usize>), InvalidConfigReason> {
    let mut id_map: HashMap<i64, usize> = HashMap::with_capacity(configs.len());
    for (i, cfg) in configs.iter().enumerate() {
        if id_map.insert(cfg.id, i).is_some() {
            return Err(InvalidConfigReason::DuplicateId(cfg.id));
        }
    }

    let mut trackers = Vec::with_capacity(configs.len());
    for cfg in configs {
        let kind = match (&cfg.simple, &cfg.combination) {
            (Some(simple), None) => {
                let resolve = |id: i64| {
                    matcher_map
                        .get(&id)
                        .copied()
                        .ok_or(InvalidConfigReason::MatcherNotFound(id))
                };
                let initial = match simple.initial_value {
                    InitialConditionValue::Unknown => ConditionState::Unknown,
                    InitialConditionValue::False => ConditionState::False,
                };
                ConditionKind::Simple(SimpleConditionTracker {
                    start_index: resolve(simple.start)?,
                    stop_index: simple.stop.map(resolve).transpose()?,
                    stop_all_index: simple.stop_all.map(resolve).transpose()?,
                    count_nesting: simple.count_nesting,
                    output_dimensions: simple
                        .dimensions
                        .as_ref()
                        .map(translate_field_matcher)
                        .unwrap_or_default(),
                    initial,
                    slice_counts: HashMap::new(),
                    seen_event: false,
                })
            }
            (None, Some(comb)) => {
                if comb.operation == LogicalOperation::Not && comb.children.len() != 1 {
                    return Err(InvalidConfigReason::NotArity(cfg.id));
                }
                let mut children = Vec::with_capacity(comb.children.len());
                for child_id in &comb.children {
                    let idx = *id_map
                        .get(child_id)
                        .ok_or(InvalidConfigReason::ConditionNotFound(*child_id))?;
                    children.push(idx);
                }
                ConditionKind::Combination {
                    operation: comb.operation,
                    children,
                }
            }
            _ => return Err(InvalidConfigReason::ConditionMalformed(cfg.id)),
        };
        trackers.push(ConditionTracker {
            id: cfg.id,
            last_value: ConditionState::Unknown,
            kind,
        });
    }

    detect_cycles(&trackers)?;

    // Settle initial values now that the graph is acyclic.
    for i in 0..trackers.len() {
        trackers[i].last_value = compute_value(&trackers, i);
    }

    Ok((trackers, id_map))
}

fn detect_cycles(trackers: &[ConditionTracker]) -> Result<(), InvalidConfigReason> {
    #[derive(Clone, Copy, PartialEq)]
    enum V {
        Unvisited,
        InProgress,
        Done,
    }
    fn visit(
        index: usize,
        trackers: &[ConditionTracker],
        state: &mut [V],
    ) -> Result<(), InvalidConfigReason> {
        match state[index] {
            V::Done => return Ok(()),
            V::InProgress => return Err(InvalidConfigReason::ConditionCycle(trackers[index].id)),
            V::Unvisited => {}
        }
        state[index] = V::InProgress;
        if let ConditionKind::Combination { children, .. } = &trackers[index].kind {
            for &child in children {
                visit(child, trackers, state)?;
            }
        }
        state[index] = V::Done;
        Ok(())
    }

    let mut state = vec![V::Unvisited; trackers.len()];
    for i in 0..trackers.len() {
        visit(i, trackers, &mut state)?;
    }
    Ok(())
}

/// Current value of condition `index`, folding combinations recursively.
pub fn compute_value(trackers: &[ConditionTracker], index: usize) -> ConditionState {
    match &trackers[index].kind {
        ConditionKind::Simple(_) => trackers[index]
            .simple_value()
            .unwrap_or(ConditionState::Unknown),
        ConditionKind::Combination {
            operation,
            children,
        } => fold_children(trackers, *operation, children),
    }
}

fn fold_children(
    trackers: &[ConditionTracker],
    operation: LogicalOperation,
    children: &[usize],
) -> ConditionState {
    match operation {
        LogicalOperation::And => children
            .iter()
            .map(|&c| compute_value(trackers, c))
            .fold(ConditionState::True, ConditionState::and),
        LogicalOperation::Or => children
            .iter()
            .map(|&c| compute_value(trackers, c))
            .fold(ConditionState::False, ConditionState::or),
        LogicalOperation::Not => children
            .first()
            .map(|&c| compute_value(trackers, c).not())
            .unwrap_or(ConditionState::Unknown),
    }
}

/// Recomputes every tracker's value after simple trackers absorbed an
/// event. Returns per-tracker change flags; a sliced simple tracker is
/// flagged whenever any of its slices moved, even if the overall value
/// did not.
pub fn refresh(trackers: &mut Vec<ConditionTracker>, simple_changed: &[bool]) -> Vec<bool> {
    let mut changed = vec![false; trackers.len()];
    for i in 0..trackers.len() {
        let new_value = compute_value(trackers, i);
        let value_changed = new_value != trackers[i].last_value;
        changed[i] = value_changed || simple_changed.get(i).copied().unwrap_or(false);
        trackers[i].last_value = new_value;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AtomMatcherConfig, CombinationConfig, SimpleConditionConfig, SimpleMatcherConfig,
    };
    use crate::event::field::{DimensionSpec, FieldMatcherNode};
    use crate::event::EventBuilder;
    use crate::event::field::Value;

    fn matcher_map() -> HashMap<i64, usize> {
        // Matchers: 1=start, 2=stop, 3=stop_all.
        let configs: Vec<AtomMatcherConfig> = (1..=3)
            .map(|id| AtomMatcherConfig {
                id,
                simple: Some(SimpleMatcherConfig {
                    atom_id: 10 + id as i32,
                    field_value_matchers: Vec::new(),
                    strip_fields: Vec::new(),
                }),
                combination: None,
            })
            .collect();
        crate::matcher::build_matchers(&configs).expect("build").1
    }

    fn simple_condition(id: i64, dimensions: Option<DimensionSpec>) -> ConditionConfig {
        ConditionConfig {
            id,
            simple: Some(SimpleConditionConfig {
                start: 1,
                stop: Some(2),
                stop_all: Some(3),
                count_nesting: true,
                dimensions,
                initial_value: InitialConditionValue::Unknown,
            }),
            combination: None,
        }
    }

    #[test]
    fn test_kleene_algebra() {
        use ConditionState::*;
        assert_eq!(Unknown.and(False), False);
        assert_eq!(Unknown.and(True), Unknown);
        assert_eq!(Unknown.or(True), True);
        assert_eq!(Unknown.or(False), Unknown);
        assert_eq!(Unknown.not(), Unknown);
        assert_eq!(True.and(True), True);
        assert_eq!(False.or(False), False);
    }

    #[test]
    fn test_simple_start_stop() {
        let (mut trackers, _) =
            build_conditions(&[simple_condition(50, None)], &matcher_map()).expect("build");
        assert_eq!(trackers[0].last_value(), ConditionState::Unknown);

        let start = EventBuilder::new(11, 0).build();
        let stop = EventBuilder::new(12, 0).build();

        assert!(trackers[0].handle_matched(0, &start));
        let changed = refresh(&mut trackers, &[true]);
        assert!(changed[0]);
        assert_eq!(trackers[0].last_value(), ConditionState::True);

        assert!(trackers[0].handle_matched(1, &stop));
        let changed = refresh(&mut trackers, &[true]);
        assert!(changed[0]);
        assert_eq!(trackers[0].last_value(), ConditionState::False);
    }

    #[test]
    fn test_nesting_counts_starts() {
        let (mut trackers, _) =
            build_conditions(&[simple_condition(50, None)], &matcher_map()).expect("build");
        let start = EventBuilder::new(11, 0).build();
        let stop = EventBuilder::new(12, 0).build();

        trackers[0].handle_matched(0, &start);
        trackers[0].handle_matched(0, &start);
        refresh(&mut trackers, &[true]);

        // One stop is not enough to close two nested starts.
        trackers[0].handle_matched(1, &stop);
        refresh(&mut trackers, &[true]);
        assert_eq!(trackers[0].last_value(), ConditionState::True);

        trackers[0].handle_matched(1, &stop);
        refresh(&mut trackers, &[true]);
        assert_eq!(trackers[0].last_value(), ConditionState::False);
    }

    #[test]
    fn test_non_nesting_coalesces_starts() {
        let mut cfg = simple_condition(50, None);
        cfg.simple.as_mut().unwrap().count_nesting = false;
        let (mut trackers, _) = build_conditions(&[cfg], &matcher_map()).expect("build");
        let start = EventBuilder::new(11, 0).build();
        let stop = EventBuilder::new(12, 0).build();

        trackers[0].handle_matched(0, &start);
        trackers[0].handle_matched(0, &start);
        trackers[0].handle_matched(1, &stop);
        refresh(&mut trackers, &[true]);
        assert_eq!(trackers[0].last_value(), ConditionState::False);
    }

    #[test]
    fn test_stop_all_resets_every_slice() {
        let dims = DimensionSpec {
            atom_id: 11,
            fields: vec![FieldMatcherNode::leaf(1)],
        };
        let (mut trackers, _) =
            build_conditions(&[simple_condition(50, Some(dims))], &matcher_map()).expect("build");

        let start_a = EventBuilder::new(11, 0).field(Value::Int(1)).build();
        let start_b = EventBuilder::new(11, 0).field(Value::Int(2)).build();
        trackers[0].handle_matched(0, &start_a);
        trackers[0].handle_matched(0, &start_b);
        refresh(&mut trackers, &[true]);
        assert_eq!(trackers[0].last_value(), ConditionState::True);

        let stop_all = EventBuilder::new(13, 0).build();
        assert!(trackers[0].handle_matched(2, &stop_all));
        refresh(&mut trackers, &[true]);
        assert_eq!(trackers[0].last_value(), ConditionState::False);
    }

    #[test]
    fn test_sliced_query() {
        let dims = DimensionSpec {
            atom_id: 11,
            fields: vec![FieldMatcherNode::leaf(1)],
        };
        let (mut trackers, _) =
            build_conditions(&[simple_condition(50, Some(dims.clone()))], &matcher_map())
                .expect("build");

        let start_a = EventBuilder::new(11, 0).field(Value::Int(1)).build();
        trackers[0].handle_matched(0, &start_a);
        refresh(&mut trackers, &[true]);

        let matchers = translate_field_matcher(&dims);
        let key_a = filter_values(&matchers, start_a.values());
        assert_eq!(trackers[0].query_slice(&key_a), ConditionState::True);

        let start_b = EventBuilder::new(11, 0).field(Value::Int(2)).build();
        let key_b = filter_values(&matchers, start_b.values());
        assert_eq!(trackers[0].query_slice(&key_b), ConditionState::False);
    }

    #[test]
    fn test_combination_condition() {
        let mut configs = vec![simple_condition(50, None)];
        configs.push(ConditionConfig {
            id: 60,
            simple: None,
            combination: Some(CombinationConfig {
                operation: LogicalOperation::Not,
                children: vec![50],
            }),
        });
        let (mut trackers, _) = build_conditions(&configs, &matcher_map()).expect("build");
        assert_eq!(trackers[1].last_value(), ConditionState::Unknown);

        let start = EventBuilder::new(11, 0).build();
        trackers[0].handle_matched(0, &start);
        let changed = refresh(&mut trackers, &[true, false]);
        assert!(changed[1]);
        assert_eq!(trackers[1].last_value(), ConditionState::False);
    }

    #[test]
    fn test_cycle_rejected() {
        let configs = vec![
            ConditionConfig {
                id: 1,
                simple: None,
                combination: Some(CombinationConfig {
                    operation: LogicalOperation::And,
                    children: vec![2],
                }),
            },
            ConditionConfig {
                id: 2,
                simple: None,
                combination: Some(CombinationConfig {
                    operation: LogicalOperation::And,
                    children: vec![1],
                }),
            },
        ];
        let err = build_conditions(&configs, &matcher_map()).unwrap_err();
        assert!(matches!(err, InvalidConfigReason::ConditionCycle(_)));
    }

    #[test]
    fn test_initial_false_skips_unknown() {
        let mut cfg = simple_condition(50, None);
        cfg.simple.as_mut().unwrap().initial_value = InitialConditionValue::False;
        let (trackers, _) = build_conditions(&[cfg], &matcher_map()).expect("build");
        assert_eq!(trackers[0].last_value(), ConditionState::False);
    }
}
