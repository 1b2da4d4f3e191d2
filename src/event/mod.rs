//! The event model: an immutable record of one ingested atom.

pub mod field;
pub mod parse;

use crate::clock::NS_PER_SEC;

use self::field::{FieldPath, FieldValue, Value};

/// Report timestamps of atoms carrying an attribution chain are truncated
/// to this granularity.
pub const TIMESTAMP_TRUNCATION_NS: i64 = 5 * 60 * NS_PER_SEC;

/// One ingested atom: id, timestamps, origin, and an ordered sequence of
/// typed field values. Immutable after construction; the only mutation
/// the pipeline performs is re-stamping the elapsed timestamp of pulled
/// atoms to the pull request time.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    atom_id: i32,
    elapsed_ns: i64,
    wall_clock_ns: Option<i64>,
    uid: i32,
    pid: i32,
    values: Vec<FieldValue>,
}

impl Event {
    pub fn new(
        atom_id: i32,
        elapsed_ns: i64,
        wall_clock_ns: Option<i64>,
        uid: i32,
        pid: i32,
        values: Vec<FieldValue>,
    ) -> Self {
        Self {
            atom_id,
            elapsed_ns,
            wall_clock_ns,
            uid,
            pid,
            values,
        }
    }

    pub fn atom_id(&self) -> i32 {
        self.atom_id
    }

    pub fn elapsed_ns(&self) -> i64 {
        self.elapsed_ns
    }

    pub fn wall_clock_ns(&self) -> Option<i64> {
        self.wall_clock_ns
    }

    pub fn uid(&self) -> i32 {
        self.uid
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// Re-stamp the elapsed timestamp (pulled atoms carry the pull
    /// request time, not the provider's internal time).
    pub fn set_elapsed_ns(&mut self, ns: i64) {
        self.elapsed_ns = ns;
    }

    /// Returns a copy without the values whose paths match any of the
    /// given matchers. Used for matcher field transformations.
    pub fn without_fields(&self, strip: &[field::Matcher]) -> Self {
        let values = self
            .values
            .iter()
            .filter(|v| !strip.iter().any(|m| m.matches(v.path)))
            .cloned()
            .collect();
        Self {
            values,
            ..self.clone()
        }
    }

    pub fn has_attribution_chain(&self) -> bool {
        self.values
            .iter()
            .any(|v| matches!(v.value, Value::AttributionNode))
    }
}

/// The timestamp written to reports: truncated to five-minute boundaries
/// for atoms carrying an attribution chain, verbatim otherwise.
pub fn truncate_timestamp_if_necessary(event: &Event) -> i64 {
    if event.has_attribution_chain() {
        event.elapsed_ns() / TIMESTAMP_TRUNCATION_NS * TIMESTAMP_TRUNCATION_NS
    } else {
        event.elapsed_ns()
    }
}

/// Builder for events in tests and pullers.
#[derive(Debug, Default)]
pub struct EventBuilder {
    atom_id: i32,
    elapsed_ns: i64,
    wall_clock_ns: Option<i64>,
    uid: i32,
    pid: i32,
    values: Vec<FieldValue>,
    next_field: u8,
}

impl EventBuilder {
    pub fn new(atom_id: i32, elapsed_ns: i64) -> Self {
        Self {
            atom_id,
            elapsed_ns,
            next_field: 1,
            ..Self::default()
        }
    }

    pub fn uid(mut self, uid: i32) -> Self {
        self.uid = uid;
        self
    }

    pub fn pid(mut self, pid: i32) -> Self {
        self.pid = pid;
        self
    }

    pub fn wall_clock_ns(mut self, ns: i64) -> Self {
        self.wall_clock_ns = Some(ns);
        self
    }

    /// Appends a top-level field with the next field number.
    pub fn field(mut self, value: Value) -> Self {
        let path = FieldPath::for_atom(self.atom_id).with_index_at(0, self.next_field);
        self.values.push(FieldValue::new(path, value));
        self.next_field += 1;
        self
    }

    /// Appends a repeated top-level field; the final element is marked last.
    pub fn repeated_field(mut self, elements: Vec<Value>) -> Self {
        let base = FieldPath::for_atom(self.atom_id).with_index_at(0, self.next_field);
        let n = elements.len();
        for (i, value) in elements.into_iter().enumerate() {
            let mut path = base.with_index_at(1, (i + 1) as u8);
            if i + 1 == n {
                path = path.mark_last_at(1);
            }
            self.values.push(FieldValue::new(path, value));
        }
        self.next_field += 1;
        self
    }

    /// Appends an explicitly positioned value.
    pub fn value_at(mut self, path: FieldPath, value: Value) -> Self {
        self.values.push(FieldValue::new(path, value));
        self
    }

    pub fn build(self) -> Event {
        Event::new(
            self.atom_id,
            self.elapsed_ns,
            self.wall_clock_ns,
            self.uid,
            self.pid,
            self.values,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_assigns_field_numbers() {
        let e = EventBuilder::new(10, 5 * NS_PER_SEC)
            .uid(1000)
            .field(Value::Int(3))
            .field(Value::Str("wifi".into()))
            .build();
        assert_eq!(e.atom_id(), 10);
        assert_eq!(e.uid(), 1000);
        assert_eq!(e.values().len(), 2);
        assert_eq!(e.values()[0].path.child_index_at(0), 1);
        assert_eq!(e.values()[1].path.child_index_at(0), 2);
    }

    #[test]
    fn test_repeated_field_marks_last() {
        let e = EventBuilder::new(10, 0)
            .repeated_field(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
            .build();
        assert_eq!(e.values().len(), 3);
        assert!(!e.values()[0].path.is_last_at(1));
        assert!(e.values()[2].path.is_last_at(1));
        assert_eq!(e.values()[2].path.child_index_at(1), 3);
    }

    #[test]
    fn test_timestamp_truncation_only_with_attribution() {
        let plain = EventBuilder::new(10, 7 * 60 * NS_PER_SEC)
            .field(Value::Int(1))
            .build();
        assert_eq!(truncate_timestamp_if_necessary(&plain), 7 * 60 * NS_PER_SEC);

        let attributed = EventBuilder::new(10, 7 * 60 * NS_PER_SEC)
            .field(Value::AttributionNode)
            .build();
        assert_eq!(
            truncate_timestamp_if_necessary(&attributed),
            5 * 60 * NS_PER_SEC
        );
    }
}
