//! Atom matchers: per-event predicates forming the leaves of the
//! evaluation graph.

pub mod wizard;

use std::collections::{HashMap, HashSet};

use crate::config::{
    AtomMatcherConfig, FieldValueMatcherConfig, InvalidConfigReason, LogicalOperation, MatchValue,
    SimpleMatcherConfig,
};
use crate::event::field::{translate_field_matcher, Matcher, Position, Value, INDEX_MASK};
use crate::event::Event;

/// Outcome of evaluating one matcher against one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    Matched,
    NotMatched,
    NotComputed,
}

/// One node of the matcher layer: a simple predicate or a logical
/// combination of other matchers referenced by index.
#[derive(Debug)]
pub struct AtomMatcherTracker {
    id: i64,
    kind: MatcherKind,
    covered_tags: HashSet<i32>,
}

#[derive(Debug)]
enum MatcherKind {
    Simple(SimpleMatcher),
    Combination {
        operation: LogicalOperation,
        children: Vec<usize>,
    },
}

#[derive(Debug)]
struct SimpleMatcher {
    atom_id: i32,
    constraints: Vec<FieldConstraint>,
    strip: Vec<Matcher>,
}

#[derive(Debug)]
struct FieldConstraint {
    field: u8,
    position: Option<Position>,
    kind: ConstraintKind,
}

#[derive(Debug)]
enum ConstraintKind {
    Eq(MatchValue),
    Tuple(Vec<(u8, MatchValue)>),
}

impl AtomMatcherTracker {
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Atom ids this matcher can ever match; drives the tag index.
    pub fn covered_tag_ids(&self) -> &HashSet<i32> {
        &self.covered_tags
    }

    pub fn is_simple(&self) -> bool {
        matches!(self.kind, MatcherKind::Simple(_))
    }

    fn simple(&self) -> Option<&SimpleMatcher> {
        match &self.kind {
            MatcherKind::Simple(s) => Some(s),
            MatcherKind::Combination { .. } => None,
        }
    }
}

impl SimpleMatcher {
    /// Pure per-event evaluation.
    fn matches(&self, event: &Event) -> MatchResult {
        if event.atom_id() != self.atom_id {
            return MatchResult::NotMatched;
        }
        for constraint in &self.constraints {
            if !constraint.satisfied(event) {
                return MatchResult::NotMatched;
            }
        }
        MatchResult::Matched
    }
}

impl FieldConstraint {
    fn satisfied(&self, event: &Event) -> bool {
        match (&self.kind, self.position) {
            (ConstraintKind::Eq(expected), None) => event
                .values()
                .iter()
                .find(|v| {
                    v.path.child_index_at(0) == self.field && v.path.index_at(1) == 0
                })
                .is_some_and(|v| value_eq(&v.value, expected)),
            (ConstraintKind::Eq(expected), Some(position)) => {
                let elements: Vec<_> = event
                    .values()
                    .iter()
                    .filter(|v| {
                        v.path.child_index_at(0) == self.field
                            && v.path.index_at(1) != 0
                            && v.path.index_at(2) == 0
                    })
                    .collect();
                if elements.is_empty() {
                    return false;
                }
                match position {
                    Position::First => elements
                        .iter()
                        .find(|v| v.path.child_index_at(1) == 1)
                        .is_some_and(|v| value_eq(&v.value, expected)),
                    Position::Last => elements
                        .iter()
                        .find(|v| v.path.is_last_at(1))
                        .is_some_and(|v| value_eq(&v.value, expected)),
                    Position::Any => elements.iter().any(|v| value_eq(&v.value, expected)),
                    Position::All => elements.iter().all(|v| value_eq(&v.value, expected)),
                }
            }
            (ConstraintKind::Tuple(subs), position) => {
                // Sub-message elements, grouped by their element index.
                let mut element_indices: Vec<u8> = event
                    .values()
                    .iter()
                    .filter(|v| {
                        v.path.child_index_at(0) == self.field && v.path.index_at(1) != 0
                    })
                    .map(|v| v.path.index_at(1) & INDEX_MASK)
                    .collect();
                element_indices.sort_unstable();
                element_indices.dedup();
                if element_indices.is_empty() {
                    return false;
                }
                let last = *element_indices.last().unwrap_or(&0);
                let element_ok = |idx: u8| {
                    subs.iter().all(|(sub_field, expected)| {
                        event
                            .values()
                            .iter()
                            .find(|v| {
                                v.path.child_index_at(0) == self.field
                                    && v.path.index_at(1) & INDEX_MASK == idx
                                    && v.path.child_index_at(2) == *sub_field
                            })
                            .is_some_and(|v| value_eq(&v.value, expected))
                    })
                };
                match position.unwrap_or(Position::Any) {
                    Position::First => element_ok(element_indices[0]),
                    Position::Last => element_ok(last),
                    Position::Any => element_indices.iter().any(|&i| element_ok(i)),
                    Position::All => element_indices.iter().all(|&i| element_ok(i)),
                }
            }
        }
    }
}

fn value_eq(actual: &Value, expected: &MatchValue) -> bool {
    match (actual, expected) {
        (Value::Int(a), MatchValue::Int(b)) => i64::from(*a) == *b,
        (Value::Long(a), MatchValue::Int(b)) => a == b,
        (Value::Str(a), MatchValue::Str(b)) => a == b,
        (Value::Bool(a), MatchValue::Bool(b)) => a == b,
        _ => false,
    }
}

fn combine(operation: LogicalOperation, results: impl Iterator<Item = MatchResult>) -> MatchResult {
    match operation {
        LogicalOperation::And => {
            let mut out = MatchResult::Matched;
            for r in results {
                match r {
                    MatchResult::NotMatched => return MatchResult::NotMatched,
                    MatchResult::NotComputed => out = MatchResult::NotComputed,
                    MatchResult::Matched => {}
                }
            }
            out
        }
        LogicalOperation::Or => {
            let mut out = MatchResult::NotMatched;
            for r in results {
                match r {
                    MatchResult::Matched => return MatchResult::Matched,
                    MatchResult::NotComputed => out = MatchResult::NotComputed,
                    MatchResult::NotMatched => {}
                }
            }
            out
        }
        LogicalOperation::Not => {
            let mut iter = results;
            match iter.next() {
                Some(MatchResult::Matched) => MatchResult::NotMatched,
                Some(MatchResult::NotMatched) => MatchResult::Matched,
                _ => MatchResult::NotComputed,
            }
        }
    }
}

/// Build the matcher arena from config, resolving references to indices
/// and rejecting malformed or cyclic definitions.
pub fn build_matchers(
    configs: &[AtomMatcherConfig],
) -> Result<(Vec<AtomMatcherTracker>, HashMap<i64, usize>), InvalidConfigReason> {
    let mut id_map: HashMap<i64, usize> = HashMap::with_capacity(configs.len());
    for (i, cfg) in configs.iter().enumerate() {
        if id_map.insert(cfg.id, i).is_some() {
            return Err(InvalidConfigReason::DuplicateId(cfg.id));
        }
    }

    let mut trackers = Vec::with_capacity(configs.len());
    for cfg in configs {
        let kind = match (&cfg.simple, &cfg.combination) {
            (Some(simple), None) => MatcherKind::Simple(build_simple(simple)),
            (None, Some(comb)) => {
                if comb.operation == LogicalOperation::Not && comb.children.len() != 1 {
                    return Err(InvalidConfigReason::NotArity(cfg.id));
                }
                let mut children = Vec::with_capacity(comb.children.len());
                for child_id in &comb.children {
                    let idx = *id_map
                        .get(child_id)
                        .ok_or(InvalidConfigReason::MatcherNotFound(*child_id))?;
                    children.push(idx);
                }
                MatcherKind::Combination {
                    operation: comb.operation,
                    children,
                }
            }
            _ => return Err(InvalidConfigReason::MatcherMalformed(cfg.id)),
        };
        trackers.push(AtomMatcherTracker {
            id: cfg.id,
            kind,
            covered_tags: HashSet::new(),
        });
    }

    // Cycle detection and covered-tag propagation, children first.
    let mut state = vec![VisitState::Unvisited; trackers.len()];
    for i in 0..trackers.len() {
        visit_matcher(i, &mut trackers, &mut state)?;
    }

    Ok((trackers, id_map))
}

#[derive(Clone, Copy, PartialEq)]
enum VisitState {
    Unvisited,
    InProgress,
    Done,
}

fn visit_matcher(
    index: usize,
    trackers: &mut [AtomMatcherTracker],
    state: &mut [VisitState],
) -> Result<(), InvalidConfigReason> {
    match state[index] {
        VisitState::Done => return Ok(()),
        VisitState::InProgress => {
            return Err(InvalidConfigReason::MatcherCycle(trackers[index].id))
        }
        VisitState::Unvisited => {}
    }
    state[index] = VisitState::InProgress;

    let tags = match &trackers[index].kind {
        MatcherKind::Simple(simple) => HashSet::from([simple.atom_id]),
        MatcherKind::Combination { children, .. } => {
            let children = children.clone();
            let mut tags = HashSet::new();
            for child in children {
                visit_matcher(child, trackers, state)?;
                tags.extend(trackers[child].covered_tags.iter().copied());
            }
            tags
        }
    };
    trackers[index].covered_tags = tags;
    state[index] = VisitState::Done;
    Ok(())
}

fn build_simple(cfg: &SimpleMatcherConfig) -> SimpleMatcher {
    let constraints = cfg
        .field_value_matchers
        .iter()
        .map(build_constraint)
        .collect();
    let strip = cfg
        .strip_fields
        .iter()
        .flat_map(|spec| translate_field_matcher(spec))
        .collect();
    SimpleMatcher {
        atom_id: cfg.atom_id,
        constraints,
        strip,
    }
}

fn build_constraint(cfg: &FieldValueMatcherConfig) -> FieldConstraint {
    let kind = if !cfg.matches_tuple.is_empty() {
        ConstraintKind::Tuple(
            cfg.matches_tuple
                .iter()
                .map(|s| (s.field, s.eq_value.clone()))
                .collect(),
        )
    } else {
        // An absent value degenerates to a never-matching constraint.
        ConstraintKind::Eq(cfg.eq_value.clone().unwrap_or(MatchValue::Bool(false)))
    };
    FieldConstraint {
        field: cfg.field,
        position: cfg.position,
        kind,
    }
}

/// Evaluates a matcher with no cache, for callers outside the dispatch
/// path (pulled-data re-matching goes through the wizard instead).
pub(crate) fn evaluate(
    trackers: &[AtomMatcherTracker],
    index: usize,
    event: &Event,
    results: &mut [Option<MatchResult>],
) -> MatchResult {
    if let Some(r) = results[index] {
        return r;
    }
    let result = match &trackers[index].kind {
        MatcherKind::Simple(simple) => simple.matches(event),
        MatcherKind::Combination {
            operation,
            children,
        } => {
            let child_results: Vec<MatchResult> = children
                .iter()
                .map(|&c| evaluate(trackers, c, event, results))
                .collect();
            combine(*operation, child_results.into_iter())
        }
    };
    results[index] = Some(result);
    result
}

/// The transformed event a simple matcher reports when it declares field
/// transformations, or `None` when the event passes through unchanged.
pub(crate) fn transform(tracker: &AtomMatcherTracker, event: &Event) -> Option<Event> {
    let simple = tracker.simple()?;
    if simple.strip.is_empty() {
        return None;
    }
    Some(event.without_fields(&simple.strip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBuilder;

    fn simple(id: i64, atom_id: i32) -> AtomMatcherConfig {
        AtomMatcherConfig {
            id,
            simple: Some(SimpleMatcherConfig {
                atom_id,
                field_value_matchers: Vec::new(),
                strip_fields: Vec::new(),
            }),
            combination: None,
        }
    }

    fn combination(id: i64, op: LogicalOperation, children: Vec<i64>) -> AtomMatcherConfig {
        AtomMatcherConfig {
            id,
            simple: None,
            combination: Some(crate::config::CombinationConfig {
                operation: op,
                children,
            }),
        }
    }

    fn eval(trackers: &[AtomMatcherTracker], index: usize, event: &Event) -> MatchResult {
        let mut results = vec![None; trackers.len()];
        evaluate(trackers, index, event, &mut results)
    }

    #[test]
    fn test_simple_matches_atom_id() {
        let (trackers, _) = build_matchers(&[simple(1, 10)]).expect("build");
        let hit = EventBuilder::new(10, 0).build();
        let miss = EventBuilder::new(11, 0).build();
        assert_eq!(eval(&trackers, 0, &hit), MatchResult::Matched);
        assert_eq!(eval(&trackers, 0, &miss), MatchResult::NotMatched);
    }

    #[test]
    fn test_field_eq_constraint() {
        let mut cfg = simple(1, 10);
        cfg.simple.as_mut().unwrap().field_value_matchers = vec![FieldValueMatcherConfig {
            field: 2,
            position: None,
            eq_value: Some(MatchValue::Int(7)),
            matches_tuple: Vec::new(),
        }];
        let (trackers, _) = build_matchers(&[cfg]).expect("build");

        let hit = EventBuilder::new(10, 0)
            .field(Value::Str("x".into()))
            .field(Value::Int(7))
            .build();
        let miss = EventBuilder::new(10, 0)
            .field(Value::Str("x".into()))
            .field(Value::Int(8))
            .build();
        assert_eq!(eval(&trackers, 0, &hit), MatchResult::Matched);
        assert_eq!(eval(&trackers, 0, &miss), MatchResult::NotMatched);
    }

    #[test]
    fn test_position_semantics_subset() {
        // Repeated field 1 with elements [5, 9]; constraint eq 5 under
        // each position.
        let mk = |position| {
            let mut cfg = simple(1, 10);
            cfg.simple.as_mut().unwrap().field_value_matchers = vec![FieldValueMatcherConfig {
                field: 1,
                position: Some(position),
                eq_value: Some(MatchValue::Int(5)),
                matches_tuple: Vec::new(),
            }];
            build_matchers(&[cfg]).expect("build").0
        };
        let event = EventBuilder::new(10, 0)
            .repeated_field(vec![Value::Int(5), Value::Int(9)])
            .build();

        assert_eq!(eval(&mk(Position::First), 0, &event), MatchResult::Matched);
        assert_eq!(eval(&mk(Position::Last), 0, &event), MatchResult::NotMatched);
        assert_eq!(eval(&mk(Position::Any), 0, &event), MatchResult::Matched);
        assert_eq!(eval(&mk(Position::All), 0, &event), MatchResult::NotMatched);

        let uniform = EventBuilder::new(10, 0)
            .repeated_field(vec![Value::Int(5), Value::Int(5)])
            .build();
        assert_eq!(eval(&mk(Position::All), 0, &uniform), MatchResult::Matched);
    }

    #[test]
    fn test_combination_and_or_not() {
        let configs = vec![
            simple(1, 10),
            simple(2, 11),
            combination(3, LogicalOperation::Or, vec![1, 2]),
            combination(4, LogicalOperation::And, vec![1, 2]),
            combination(5, LogicalOperation::Not, vec![1]),
        ];
        let (trackers, _) = build_matchers(&configs).expect("build");
        let event = EventBuilder::new(10, 0).build();

        assert_eq!(eval(&trackers, 2, &event), MatchResult::Matched);
        assert_eq!(eval(&trackers, 3, &event), MatchResult::NotMatched);
        assert_eq!(eval(&trackers, 4, &event), MatchResult::NotMatched);
    }

    #[test]
    fn test_covered_tags_union() {
        let configs = vec![
            simple(1, 10),
            simple(2, 11),
            combination(3, LogicalOperation::Or, vec![1, 2]),
        ];
        let (trackers, _) = build_matchers(&configs).expect("build");
        let tags = trackers[2].covered_tag_ids();
        assert!(tags.contains(&10));
        assert!(tags.contains(&11));
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn test_cycle_rejected() {
        let configs = vec![
            combination(1, LogicalOperation::And, vec![2]),
            combination(2, LogicalOperation::And, vec![1]),
        ];
        let err = build_matchers(&configs).unwrap_err();
        assert!(matches!(err, InvalidConfigReason::MatcherCycle(_)));
    }

    #[test]
    fn test_missing_child_rejected() {
        let configs = vec![combination(1, LogicalOperation::And, vec![99])];
        let err = build_matchers(&configs).unwrap_err();
        assert_eq!(err, InvalidConfigReason::MatcherNotFound(99));
    }

    #[test]
    fn test_not_arity_rejected() {
        let configs = vec![
            simple(1, 10),
            simple(2, 11),
            combination(3, LogicalOperation::Not, vec![1, 2]),
        ];
        let err = build_matchers(&configs).unwrap_err();
        assert_eq!(err, InvalidConfigReason::NotArity(3));
    }

    #[test]
    fn test_strip_fields_transform() {
        let mut cfg = simple(1, 10);
        cfg.simple.as_mut().unwrap().strip_fields = vec![crate::event::field::DimensionSpec {
            atom_id: 10,
            fields: vec![crate::event::field::FieldMatcherNode::leaf(2)],
        }];
        let (trackers, _) = build_matchers(&[cfg]).expect("build");

        let event = EventBuilder::new(10, 0)
            .field(Value::Int(1))
            .field(Value::Str("secret".into()))
            .build();
        let transformed = transform(&trackers[0], &event).expect("transformed event");
        assert_eq!(transformed.values().len(), 1);
        assert_eq!(transformed.values()[0].value, Value::Int(1));
    }
}
