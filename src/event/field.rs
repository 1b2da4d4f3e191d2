//! Field paths, typed values, and dimension extraction.
//!
//! A field path packs an atom's nested field position into 32 bits: the
//! low byte carries the atom id (low 8 bits) and each subsequent byte a
//! 1-based child index at that depth. The top bit of an index byte marks
//! the last element of a repeated sub-message, which is what makes the
//! LAST position modifier resolvable without re-scanning the event.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Marks the last element of a repeated sub-message in an index byte.
pub const LAST_BIT: u8 = 0x80;

/// Index bits of a path byte, excluding the last-element marker.
pub const INDEX_MASK: u8 = 0x7f;

/// Maximum nesting depth a packed path can express.
pub const MAX_DEPTH: u8 = 3;

/// Packed 32-bit field path. See the module docs for the layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FieldPath(u32);

impl FieldPath {
    /// Path addressing the atom itself (no field indices yet).
    pub fn for_atom(atom_id: i32) -> Self {
        Self(atom_id as u32 & 0xff)
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Low byte of the atom id this path belongs to.
    pub fn atom_byte(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    /// Raw index byte at `depth` (0-based), including the last-element bit.
    pub fn index_at(self, depth: u8) -> u8 {
        debug_assert!(depth < MAX_DEPTH);
        ((self.0 >> (8 * (u32::from(depth) + 1))) & 0xff) as u8
    }

    /// 1-based child index at `depth`, without the last-element bit.
    pub fn child_index_at(self, depth: u8) -> u8 {
        self.index_at(depth) & INDEX_MASK
    }

    pub fn is_last_at(self, depth: u8) -> bool {
        self.index_at(depth) & LAST_BIT != 0
    }

    /// Returns a copy with the raw index byte at `depth` replaced.
    pub fn with_index_at(self, depth: u8, raw_index: u8) -> Self {
        debug_assert!(depth < MAX_DEPTH);
        let shift = 8 * (u32::from(depth) + 1);
        Self((self.0 & !(0xffu32 << shift)) | (u32::from(raw_index) << shift))
    }

    pub fn mark_last_at(self, depth: u8) -> Self {
        self.with_index_at(depth, self.index_at(depth) | LAST_BIT)
    }

    /// Number of populated depth levels.
    pub fn depth(self) -> u8 {
        for d in 0..MAX_DEPTH {
            if self.index_at(d) == 0 {
                return d;
            }
        }
        MAX_DEPTH
    }
}

impl fmt::Debug for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldPath({:#010x})", self.0)
    }
}

/// A typed scalar carried by one event field.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Bool(bool),
    Bytes(Vec<u8>),
    /// Marks the head of an attribution node; carries no scalar.
    AttributionNode,
}

impl Value {
    /// Numeric projection used by anomaly detection and value aggregation.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(f64::from(*v)),
            Value::Long(v) => Some(*v as f64),
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Appends a stable byte encoding of this value for run-independent
    /// hashing (sampled sharding).
    pub fn write_hash_bytes(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(v) => {
                out.push(1);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Long(v) => {
                out.push(2);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Float(v) => {
                out.push(3);
                out.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Value::Double(v) => {
                out.push(4);
                out.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Value::Str(v) => {
                out.push(5);
                out.extend_from_slice(v.as_bytes());
                out.push(0);
            }
            Value::Bool(v) => {
                out.push(6);
                out.push(u8::from(*v));
            }
            Value::Bytes(v) => {
                out.push(7);
                out.extend_from_slice(v);
                out.push(0);
            }
            Value::AttributionNode => out.push(8),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::AttributionNode, Value::AttributionNode) => true,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Int(v) => v.hash(state),
            Value::Long(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Double(v) => v.to_bits().hash(state),
            Value::Str(v) => v.hash(state),
            Value::Bool(v) => v.hash(state),
            Value::Bytes(v) => v.hash(state),
            Value::AttributionNode => {}
        }
    }
}

/// One positioned, typed value of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldValue {
    pub path: FieldPath,
    pub value: Value,
}

impl FieldValue {
    pub fn new(path: FieldPath, value: Value) -> Self {
        Self { path, value }
    }
}

/// Position modifier for repeated sub-messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    First,
    Last,
    Any,
    All,
}

impl Position {
    /// Strictness rank used by the dimension-subset relation: a matcher
    /// with a higher rank selects a subset of the events/elements an
    /// `Any` matcher selects.
    fn rank(self) -> u8 {
        match self {
            Position::Any => 0,
            Position::All => 1,
            Position::First | Position::Last => 2,
        }
    }
}

/// Config-side description of one field to extract, possibly nested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMatcherNode {
    /// 1-based field number at this level.
    pub field: u8,
    /// Position modifier when the field is repeated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Fields to extract from each selected element.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FieldMatcherNode>,
}

impl FieldMatcherNode {
    pub fn leaf(field: u8) -> Self {
        Self {
            field,
            position: None,
            children: Vec::new(),
        }
    }
}

/// Config-side dimension specification: an atom id plus the fields to
/// extract from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSpec {
    pub atom_id: i32,
    #[serde(default)]
    pub fields: Vec<FieldMatcherNode>,
}

/// How a translated matcher selects among repeated elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectMode {
    /// Match the exact index bits (fixed field or FIRST).
    Exact,
    /// Keep the first matching element only.
    AnyElement,
    /// Keep every matching element.
    AllElements,
    /// Match the last-element marker.
    LastElement,
}

/// A translated field matcher: packed path bits, a comparison mask, and
/// the element-selection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Matcher {
    pub path: FieldPath,
    pub mask: u32,
    pub mode: SelectMode,
    /// Rank of the position that produced this matcher (subset relation).
    position_rank: u8,
}

impl Matcher {
    pub fn matches(&self, path: FieldPath) -> bool {
        path.bits() & self.mask == self.path.bits() & self.mask
    }

    /// True if `self` selects a subset of what `other` selects on the
    /// same field: equal path under the shared mask, equal or stricter
    /// position.
    pub fn subset_of(&self, other: &Matcher) -> bool {
        let shared = self.mask & other.mask;
        self.path.bits() & shared == other.path.bits() & shared
            && self.position_rank >= other.position_rank
    }
}

/// Translates a dimension specification into packed matchers, one per
/// leaf field, in declaration order.
pub fn translate_field_matcher(spec: &DimensionSpec) -> Vec<Matcher> {
    let mut out = Vec::new();
    let base = FieldPath::for_atom(spec.atom_id);
    for node in &spec.fields {
        translate_node(node, base, 0, 0xff, SelectMode::Exact, 0, &mut out);
    }
    out
}

fn translate_node(
    node: &FieldMatcherNode,
    path: FieldPath,
    depth: u8,
    mask: u32,
    mode: SelectMode,
    rank: u8,
    out: &mut Vec<Matcher>,
) {
    if depth >= MAX_DEPTH {
        return;
    }
    let path = path.with_index_at(depth, node.field);
    let mask = mask | (u32::from(INDEX_MASK) << (8 * (u32::from(depth) + 1)));

    match node.position {
        None => {
            if node.children.is_empty() {
                out.push(Matcher {
                    path,
                    mask,
                    mode,
                    position_rank: rank,
                });
            } else {
                for child in &node.children {
                    translate_node(child, path, depth + 1, mask, mode, rank, out);
                }
            }
        }
        Some(position) => {
            let element_depth = depth + 1;
            if element_depth >= MAX_DEPTH {
                return;
            }
            let shift = 8 * (u32::from(element_depth) + 1);
            let (epath, emask, emode) = match position {
                Position::First => (
                    path.with_index_at(element_depth, 1),
                    mask | (u32::from(INDEX_MASK) << shift),
                    SelectMode::Exact,
                ),
                Position::Last => (
                    path.with_index_at(element_depth, LAST_BIT),
                    mask | (u32::from(LAST_BIT) << shift),
                    SelectMode::LastElement,
                ),
                Position::Any => (path, mask, SelectMode::AnyElement),
                Position::All => (path, mask, SelectMode::AllElements),
            };
            let rank = position.rank();
            if node.children.is_empty() {
                out.push(Matcher {
                    path: epath,
                    mask: emask,
                    mode: emode,
                    position_rank: rank,
                });
            } else {
                for child in &node.children {
                    translate_node(child, epath, element_depth + 1, emask, emode, rank, out);
                }
            }
        }
    }
}

/// An ordered subsequence of field values extracted from an event; the
/// hash-map key all sliced state is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DimensionKey {
    values: Vec<FieldValue>,
}

impl DimensionKey {
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True if every value of `other` appears in `self` with an equal
    /// path and value.
    pub fn contains(&self, other: &DimensionKey) -> bool {
        other.values.iter().all(|v| self.values.contains(v))
    }

    /// Stable byte encoding for run-independent hashing.
    pub fn hash_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.values.len() * 10);
        for fv in &self.values {
            out.extend_from_slice(&fv.path.bits().to_le_bytes());
            fv.value.write_hash_bytes(&mut out);
        }
        out
    }
}

/// The key a metric producer slices its buckets by: the what-dimension
/// plus the state-values dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MetricDimensionKey {
    what: DimensionKey,
    state_values: DimensionKey,
}

impl MetricDimensionKey {
    pub fn new(what: DimensionKey, state_values: DimensionKey) -> Self {
        Self { what, state_values }
    }

    pub fn for_what(what: DimensionKey) -> Self {
        Self {
            what,
            state_values: DimensionKey::default(),
        }
    }

    pub fn what(&self) -> &DimensionKey {
        &self.what
    }

    pub fn state_values(&self) -> &DimensionKey {
        &self.state_values
    }
}

/// Extracts the dimension key selected by `matchers` from an event's
/// values, preserving matcher order.
///
/// LAST-position output paths are normalized to the bare last-element
/// marker so keys extracted from events of different lengths compare
/// equal.
pub fn filter_values(matchers: &[Matcher], values: &[FieldValue]) -> DimensionKey {
    let mut out = Vec::new();
    for m in matchers {
        match m.mode {
            SelectMode::Exact | SelectMode::AnyElement => {
                if let Some(v) = values.iter().find(|v| m.matches(v.path)) {
                    out.push(v.clone());
                }
            }
            SelectMode::AllElements => {
                for v in values.iter().filter(|v| m.matches(v.path)) {
                    out.push(v.clone());
                }
            }
            SelectMode::LastElement => {
                if let Some(v) = values.iter().find(|v| m.matches(v.path)) {
                    let depth = last_marked_depth(m);
                    let mut v = v.clone();
                    v.path = v.path.with_index_at(depth, LAST_BIT);
                    out.push(v);
                }
            }
        }
    }
    DimensionKey::new(out)
}

/// Depth of the element level a LAST matcher binds, recovered from its mask.
fn last_marked_depth(m: &Matcher) -> u8 {
    for d in (0..MAX_DEPTH).rev() {
        let byte = ((m.mask >> (8 * (u32::from(d) + 1))) & 0xff) as u8;
        if byte == LAST_BIT {
            return d;
        }
    }
    0
}

/// Dimension subset relation: `a` is a subset of `b` iff every matcher in
/// `a` appears in `b` with equal or stricter position.
pub fn is_subset_dimension(a: &[Matcher], b: &[Matcher]) -> bool {
    a.iter().all(|ma| b.iter().any(|mb| ma.subset_of(mb)))
}

/// Rewrites a what-space dimension key into condition space using
/// parallel matcher lists from a metric-to-condition link.
pub fn translate_dimension(
    key: &DimensionKey,
    fields_in_what: &[Matcher],
    fields_in_condition: &[Matcher],
) -> DimensionKey {
    let mut out = Vec::new();
    for (what_m, cond_m) in fields_in_what.iter().zip(fields_in_condition) {
        if let Some(v) = key.values().iter().find(|v| what_m.matches(v.path)) {
            out.push(FieldValue::new(cond_m.path, v.value.clone()));
        }
    }
    DimensionKey::new(out)
}
