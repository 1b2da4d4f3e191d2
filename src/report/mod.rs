//! Length-delimited binary report encoding.
//!
//! [`ProtoWriter`] provides varint / tag / length-delimited primitives;
//! the field-number constants pin the wire layout of the report records.
//! [`ProtoReader`] walks the same layout back, for consumers and tests.

use crate::event::field::{DimensionKey, FieldValue, Value, INDEX_MASK, MAX_DEPTH};

/// Wire types.
const WIRE_VARINT: u32 = 0;
const WIRE_FIXED64: u32 = 1;
const WIRE_LEN: u32 = 2;
const WIRE_FIXED32: u32 = 5;

/// Field numbers of the report records.
pub mod fields {
    // StatsLogReport
    pub const REPORT_ID: u32 = 1;
    pub const REPORT_EVENT_METRICS: u32 = 4;
    pub const REPORT_COUNT_METRICS: u32 = 5;
    pub const REPORT_DURATION_METRICS: u32 = 6;
    pub const REPORT_VALUE_METRICS: u32 = 7;
    pub const REPORT_GAUGE_METRICS: u32 = 8;
    pub const REPORT_TIME_BASE: u32 = 9;
    pub const REPORT_BUCKET_SIZE: u32 = 10;
    pub const REPORT_DIMENSION_PATH_IN_WHAT: u32 = 11;
    pub const REPORT_IS_ACTIVE: u32 = 14;
    pub const REPORT_KLL_METRICS: u32 = 16;
    pub const REPORT_DIMENSION_GUARDRAIL_HIT: u32 = 17;

    // Per-kind data wrapper
    pub const WRAPPER_DATA: u32 = 1;
    pub const WRAPPER_SKIPPED: u32 = 2;

    // SkippedBucket
    pub const SKIPPED_START_MILLIS: u32 = 3;
    pub const SKIPPED_END_MILLIS: u32 = 4;
    pub const SKIPPED_DROP_EVENT: u32 = 5;

    // DropEvent
    pub const DROP_REASON: u32 = 1;
    pub const DROP_TIME: u32 = 2;

    // Per-kind metric data
    pub const DATA_DIMENSION_IN_WHAT: u32 = 1;
    pub const DATA_BUCKET_INFO: u32 = 3;
    pub const DATA_DIMENSION_LEAF_IN_WHAT: u32 = 4;

    // Bucket info (shared shape across kinds)
    pub const BUCKET_NUM: u32 = 6;
    pub const BUCKET_START_MILLIS: u32 = 7;
    pub const BUCKET_END_MILLIS: u32 = 8;
    /// Count for count metrics, duration nanos for duration metrics.
    pub const BUCKET_SCALAR: u32 = 3;
    /// Aggregated atoms (gauge/event), values (value), sketches (kll).
    pub const BUCKET_PAYLOAD: u32 = 9;

    // AggregatedAtomInfo
    pub const AGGREGATED_ATOM_VALUE: u32 = 1;
    pub const AGGREGATED_ATOM_TIMESTAMPS: u32 = 2;

    // DimensionsValue
    pub const DIMENSIONS_VALUE_FIELD: u32 = 1;
    pub const DIMENSIONS_VALUE_STR: u32 = 2;
    pub const DIMENSIONS_VALUE_INT: u32 = 3;
    pub const DIMENSIONS_VALUE_LONG: u32 = 4;
    pub const DIMENSIONS_VALUE_BOOL: u32 = 5;
    pub const DIMENSIONS_VALUE_FLOAT: u32 = 6;
    pub const DIMENSIONS_VALUE_TUPLE: u32 = 7;
    pub const DIMENSIONS_TUPLE_VALUE: u32 = 1;

    // ValueBucketInfo payload entries
    pub const VALUE_FIELD_INDEX: u32 = 1;
    pub const VALUE_LONG: u32 = 2;
    pub const VALUE_DOUBLE: u32 = 3;

    // KllBucketInfo payload entries
    pub const KLL_FIELD_INDEX: u32 = 1;
    pub const KLL_SERIALIZED_SKETCH: u32 = 2;
}

/// Append-only protobuf-style writer.
#[derive(Debug, Default)]
pub struct ProtoWriter {
    buf: Vec<u8>,
}

impl ProtoWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn raw_varint(&mut self, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.push(byte);
                break;
            }
            self.buf.push(byte | 0x80);
        }
    }

    fn key(&mut self, field: u32, wire_type: u32) {
        self.raw_varint(u64::from(field << 3 | wire_type));
    }

    pub fn varint(&mut self, field: u32, value: u64) {
        self.key(field, WIRE_VARINT);
        self.raw_varint(value);
    }

    pub fn int64(&mut self, field: u32, value: i64) {
        self.varint(field, value as u64);
    }

    pub fn int32(&mut self, field: u32, value: i32) {
        // Sign-extended like proto int32.
        self.varint(field, i64::from(value) as u64);
    }

    pub fn bool(&mut self, field: u32, value: bool) {
        self.varint(field, u64::from(value));
    }

    pub fn double(&mut self, field: u32, value: f64) {
        self.key(field, WIRE_FIXED64);
        self.buf.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    pub fn float(&mut self, field: u32, value: f32) {
        self.key(field, WIRE_FIXED32);
        self.buf.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    pub fn string(&mut self, field: u32, value: &str) {
        self.bytes_field(field, value.as_bytes());
    }

    pub fn bytes_field(&mut self, field: u32, value: &[u8]) {
        self.key(field, WIRE_LEN);
        self.raw_varint(value.len() as u64);
        self.buf.extend_from_slice(value);
    }

    /// Write a nested message built by `f`.
    pub fn message(&mut self, field: u32, f: impl FnOnce(&mut ProtoWriter)) {
        let mut nested = ProtoWriter::new();
        f(&mut nested);
        self.bytes_field(field, nested.bytes());
    }
}

/// Append one record to a length-delimited stream.
pub fn write_length_delimited(out: &mut Vec<u8>, record: &[u8]) {
    let mut w = ProtoWriter::new();
    w.raw_varint(record.len() as u64);
    out.extend_from_slice(w.bytes());
    out.extend_from_slice(record);
}

/// Writes a dimension key as a nested DimensionsValue tree rooted at the
/// atom.
pub fn write_dimension_key(w: &mut ProtoWriter, field: u32, key: &DimensionKey) {
    w.message(field, |root| {
        let atom = key
            .values()
            .first()
            .map(|v| u64::from(v.path.atom_byte()))
            .unwrap_or(0);
        root.varint(fields::DIMENSIONS_VALUE_FIELD, atom);
        root.message(fields::DIMENSIONS_VALUE_TUPLE, |tuple| {
            write_dimension_level(tuple, key.values(), 0);
        });
    });
}

fn write_dimension_level(w: &mut ProtoWriter, values: &[FieldValue], depth: u8) {
    let mut i = 0;
    while i < values.len() {
        let index = values[i].path.index_at(depth);
        let mut j = i + 1;
        while j < values.len() && values[j].path.index_at(depth) == index {
            j += 1;
        }
        let group = &values[i..j];
        let field_number = u32::from(index & INDEX_MASK).max(1);
        let is_leaf = depth + 1 >= MAX_DEPTH || group[0].path.index_at(depth + 1) == 0;
        w.message(fields::DIMENSIONS_TUPLE_VALUE, |dv| {
            dv.varint(fields::DIMENSIONS_VALUE_FIELD, u64::from(field_number));
            if is_leaf {
                write_dimension_scalar(dv, &group[0].value);
            } else {
                dv.message(fields::DIMENSIONS_VALUE_TUPLE, |tuple| {
                    write_dimension_level(tuple, group, depth + 1);
                });
            }
        });
        i = j;
    }
}

fn write_dimension_scalar(w: &mut ProtoWriter, value: &Value) {
    match value {
        Value::Int(v) => w.int32(fields::DIMENSIONS_VALUE_INT, *v),
        Value::Long(v) => w.int64(fields::DIMENSIONS_VALUE_LONG, *v),
        Value::Float(v) => w.float(fields::DIMENSIONS_VALUE_FLOAT, *v),
        Value::Double(v) => w.double(fields::DIMENSIONS_VALUE_FLOAT, *v),
        Value::Str(v) => w.string(fields::DIMENSIONS_VALUE_STR, v),
        Value::Bool(v) => w.bool(fields::DIMENSIONS_VALUE_BOOL, *v),
        Value::Bytes(v) => w.bytes_field(fields::DIMENSIONS_VALUE_STR, v),
        Value::AttributionNode => {}
    }
}

/// Writes a dimension key as repeated leaf DimensionsValue records,
/// the flat form used when the dimension path is carried separately.
pub fn write_dimension_leaves(w: &mut ProtoWriter, field: u32, key: &DimensionKey) {
    for fv in key.values() {
        w.message(field, |dv| {
            let leaf_depth = fv.path.depth().saturating_sub(1);
            dv.varint(
                fields::DIMENSIONS_VALUE_FIELD,
                u64::from(fv.path.child_index_at(leaf_depth)).max(1),
            );
            write_dimension_scalar(dv, &fv.value);
        });
    }
}

/// Writes the dimension path (field numbers only) for a dimension spec.
pub fn write_dimension_path(
    w: &mut ProtoWriter,
    field: u32,
    spec: &crate::event::field::DimensionSpec,
) {
    w.message(field, |root| {
        root.varint(
            fields::DIMENSIONS_VALUE_FIELD,
            spec.atom_id as u32 as u64 & 0xff,
        );
        root.message(fields::DIMENSIONS_VALUE_TUPLE, |tuple| {
            write_path_nodes(tuple, &spec.fields);
        });
    });
}

fn write_path_nodes(w: &mut ProtoWriter, nodes: &[crate::event::field::FieldMatcherNode]) {
    for node in nodes {
        w.message(fields::DIMENSIONS_TUPLE_VALUE, |dv| {
            dv.varint(fields::DIMENSIONS_VALUE_FIELD, u64::from(node.field));
            if !node.children.is_empty() {
                dv.message(fields::DIMENSIONS_VALUE_TUPLE, |tuple| {
                    write_path_nodes(tuple, &node.children);
                });
            }
        });
    }
}

/// Writes an atom's field-value tree as a nested message under `field`,
/// with the atom id as the inner field number.
pub fn write_atom(w: &mut ProtoWriter, field: u32, atom_id: i32, values: &[FieldValue]) {
    w.message(field, |outer| {
        outer.message(atom_id as u32, |inner| {
            write_atom_level(inner, values, 0);
        });
    });
}

/// Writes one field level. Depth 0 is the atom's field level, depth 2 a
/// sub-message's field level; the depth in between is always an element
/// level (single-element groups model non-repeated sub-messages).
fn write_atom_level(w: &mut ProtoWriter, values: &[FieldValue], depth: u8) {
    let mut i = 0;
    while i < values.len() {
        let field_index = values[i].path.child_index_at(depth);
        let mut j = i + 1;
        while j < values.len() && values[j].path.child_index_at(depth) == field_index {
            j += 1;
        }
        let group = &values[i..j];
        let field_number = u32::from(field_index).max(1);

        if depth + 1 >= MAX_DEPTH || group[0].path.index_at(depth + 1) == 0 {
            // Plain scalar field(s) at this level.
            for fv in group {
                write_atom_scalar(w, field_number, &fv.value);
            }
        } else {
            // Element level: leaf elements are repeated scalars under the
            // field number; deeper elements are repeated sub-messages.
            let mut e = 0;
            while e < group.len() {
                let element = group[e].path.index_at(depth + 1);
                let mut f = e + 1;
                while f < group.len() && group[f].path.index_at(depth + 1) == element {
                    f += 1;
                }
                let element_group = &group[e..f];
                let deeper =
                    depth + 2 < MAX_DEPTH && element_group[0].path.index_at(depth + 2) != 0;
                if deeper {
                    w.message(field_number, |nested| {
                        write_atom_level(nested, element_group, depth + 2);
                    });
                } else {
                    write_atom_scalar(w, field_number, &element_group[0].value);
                }
                e = f;
            }
        }
        i = j;
    }
}

fn write_atom_scalar(w: &mut ProtoWriter, field: u32, value: &Value) {
    match value {
        Value::Int(v) => w.int32(field, *v),
        Value::Long(v) => w.int64(field, *v),
        Value::Float(v) => w.float(field, *v),
        Value::Double(v) => w.double(field, *v),
        Value::Str(v) => w.string(field, v),
        Value::Bool(v) => w.bool(field, *v),
        Value::Bytes(v) => w.bytes_field(field, v),
        // Chain markers delimit structure; they carry no scalar.
        Value::AttributionNode => {}
    }
}

/// Decoded wire value.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtoValue<'a> {
    Varint(u64),
    Fixed64(u64),
    Fixed32(u32),
    Bytes(&'a [u8]),
}

impl<'a> ProtoValue<'a> {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ProtoValue::Varint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_u64().map(|v| v as i64)
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            ProtoValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// Minimal field scanner over writer output.
pub struct ProtoReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ProtoReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_varint(&mut self) -> Option<u64> {
        let mut out = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self.buf.get(self.pos)?;
            self.pos += 1;
            out |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Some(out);
            }
            shift += 7;
            if shift >= 64 {
                return None;
            }
        }
    }

    /// All fields with the given number, in order.
    pub fn all(buf: &'a [u8], field: u32) -> Vec<ProtoValue<'a>> {
        ProtoReader::new(buf)
            .filter(|(f, _)| *f == field)
            .map(|(_, v)| v)
            .collect()
    }

    /// First field with the given number.
    pub fn first(buf: &'a [u8], field: u32) -> Option<ProtoValue<'a>> {
        ProtoReader::new(buf)
            .find(|(f, _)| *f == field)
            .map(|(_, v)| v)
    }

    /// Decode a length-delimited record stream into individual records.
    pub fn records(mut buf: &'a [u8]) -> Vec<&'a [u8]> {
        let mut out = Vec::new();
        while !buf.is_empty() {
            let mut r = ProtoReader::new(buf);
            let Some(len) = r.read_varint() else { break };
            let start = r.pos;
            let end = start + len as usize;
            if end > buf.len() {
                break;
            }
            out.push(&buf[start..end]);
            buf = &buf[end..];
        }
        out
    }
}

impl<'a> Iterator for ProtoReader<'a> {
    type Item = (u32, ProtoValue<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let key = self.read_varint()?;
        let field = (key >> 3) as u32;
        let value = match (key & 0x7) as u32 {
            WIRE_VARINT => ProtoValue::Varint(self.read_varint()?),
            WIRE_FIXED64 => {
                let end = self.pos + 8;
                let bytes = self.buf.get(self.pos..end)?;
                self.pos = end;
                let mut arr = [0u8; 8];
                arr.copy_from_slice(bytes);
                ProtoValue::Fixed64(u64::from_le_bytes(arr))
            }
            WIRE_FIXED32 => {
                let end = self.pos + 4;
                let bytes = self.buf.get(self.pos..end)?;
                self.pos = end;
                let mut arr = [0u8; 4];
                arr.copy_from_slice(bytes);
                ProtoValue::Fixed32(u32::from_le_bytes(arr))
            }
            WIRE_LEN => {
                let len = self.read_varint()? as usize;
                let end = self.pos + len;
                let bytes = self.buf.get(self.pos..end)?;
                self.pos = end;
                ProtoValue::Bytes(bytes)
            }
            _ => return None,
        };
        Some((field, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::field::FieldPath;

    #[test]
    fn test_varint_roundtrip() {
        let mut w = ProtoWriter::new();
        w.varint(1, 0);
        w.varint(2, 300);
        w.int64(3, -1);

        let fields: Vec<_> = ProtoReader::new(w.bytes()).collect();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0], (1, ProtoValue::Varint(0)));
        assert_eq!(fields[1], (2, ProtoValue::Varint(300)));
        assert_eq!(fields[2].1.as_i64(), Some(-1));
    }

    #[test]
    fn test_nested_message() {
        let mut w = ProtoWriter::new();
        w.message(5, |inner| {
            inner.varint(1, 42);
            inner.string(2, "abc");
        });

        let outer = ProtoReader::first(w.bytes(), 5).expect("field 5");
        let inner = outer.as_bytes().expect("nested bytes");
        assert_eq!(ProtoReader::first(inner, 1).and_then(|v| v.as_u64()), Some(42));
        assert_eq!(
            ProtoReader::first(inner, 2).and_then(|v| v.as_bytes()),
            Some(&b"abc"[..])
        );
    }

    #[test]
    fn test_length_delimited_stream() {
        let mut stream = Vec::new();
        write_length_delimited(&mut stream, b"first");
        write_length_delimited(&mut stream, b"second-record");

        let records = ProtoReader::records(&stream);
        assert_eq!(records, vec![&b"first"[..], &b"second-record"[..]]);
    }

    #[test]
    fn test_write_dimension_key_tree() {
        let path = FieldPath::for_atom(10).with_index_at(0, 1);
        let key = DimensionKey::new(vec![FieldValue::new(path, Value::Int(1000))]);

        let mut w = ProtoWriter::new();
        write_dimension_key(&mut w, fields::DATA_DIMENSION_IN_WHAT, &key);

        let root = ProtoReader::first(w.bytes(), fields::DATA_DIMENSION_IN_WHAT)
            .and_then(|v| v.as_bytes().map(|b| b.to_vec()))
            .expect("dimension root");
        assert_eq!(
            ProtoReader::first(&root, fields::DIMENSIONS_VALUE_FIELD).and_then(|v| v.as_u64()),
            Some(10)
        );
        let tuple = ProtoReader::first(&root, fields::DIMENSIONS_VALUE_TUPLE)
            .and_then(|v| v.as_bytes().map(|b| b.to_vec()))
            .expect("tuple");
        let leaf = ProtoReader::first(&tuple, fields::DIMENSIONS_TUPLE_VALUE)
            .and_then(|v| v.as_bytes().map(|b| b.to_vec()))
            .expect("leaf");
        assert_eq!(
            ProtoReader::first(&leaf, fields::DIMENSIONS_VALUE_INT).and_then(|v| v.as_i64()),
            Some(1000)
        );
    }

    #[test]
    fn test_write_atom_nested_elements() {
        // Repeated sub-message field 1 with two elements, each with a leaf.
        let base = FieldPath::for_atom(10).with_index_at(0, 1);
        let values = vec![
            FieldValue::new(base.with_index_at(1, 1).with_index_at(2, 1), Value::Int(4)),
            FieldValue::new(
                base.with_index_at(1, 2).mark_last_at(1).with_index_at(2, 1),
                Value::Int(5),
            ),
        ];

        let mut w = ProtoWriter::new();
        write_atom(&mut w, fields::AGGREGATED_ATOM_VALUE, 10, &values);

        let outer = ProtoReader::first(w.bytes(), fields::AGGREGATED_ATOM_VALUE)
            .and_then(|v| v.as_bytes().map(|b| b.to_vec()))
            .expect("atom wrapper");
        let atom = ProtoReader::first(&outer, 10)
            .and_then(|v| v.as_bytes().map(|b| b.to_vec()))
            .expect("atom message");
        // Two repeated field-1 sub-messages.
        let elements = ProtoReader::all(&atom, 1);
        assert_eq!(elements.len(), 2);
    }
}
