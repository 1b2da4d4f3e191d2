//! Wire decoding for the on-wire event buffer.
//!
//! The buffer is a fixed header followed by tag-length-value field
//! records. Length checks happen once per record; fixed-width reads then
//! use infallible slicing helpers.

use thiserror::Error;

use super::field::{FieldPath, FieldValue, Value};
use super::Event;

/// Fixed header size: atom id, elapsed ns, wall-clock ns, uid, pid.
const HEADER_SIZE: usize = 28;

/// Type tags on the wire.
const TAG_INT: u8 = 1;
const TAG_LONG: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_DOUBLE: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_BOOL: u8 = 6;
const TAG_BYTES: u8 = 7;
const TAG_ATTRIBUTION: u8 = 8;

/// Errors produced while decoding an event buffer.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("event buffer too short: {size} bytes")]
    Truncated { size: usize },

    #[error("field record at offset {offset}: unexpected end of data")]
    FieldTruncated { offset: usize },

    #[error("field record at offset {offset}: unknown type tag {tag}")]
    UnknownTypeTag { offset: usize, tag: u8 },

    #[error("field record at offset {offset}: string is not valid utf-8")]
    InvalidUtf8 { offset: usize },
}

/// Decode a raw event buffer into an [`Event`].
pub fn parse_event(data: &[u8]) -> Result<Event, ParseError> {
    if data.len() < HEADER_SIZE {
        return Err(ParseError::Truncated { size: data.len() });
    }

    let atom_id = i32::from_le_bytes(fixed::<4>(data, 0));
    let elapsed_ns = i64::from_le_bytes(fixed::<8>(data, 4));
    let wall_raw = i64::from_le_bytes(fixed::<8>(data, 12));
    let uid = i32::from_le_bytes(fixed::<4>(data, 20));
    let pid = i32::from_le_bytes(fixed::<4>(data, 24));
    let wall_clock_ns = (wall_raw != 0).then_some(wall_raw);

    let mut values = Vec::new();
    let mut offset = HEADER_SIZE;
    while offset < data.len() {
        let (fv, next) = parse_field(data, offset)?;
        values.push(fv);
        offset = next;
    }

    Ok(Event::new(atom_id, elapsed_ns, wall_clock_ns, uid, pid, values))
}

fn parse_field(data: &[u8], offset: usize) -> Result<(FieldValue, usize), ParseError> {
    let need = |n: usize| {
        if offset + n > data.len() {
            Err(ParseError::FieldTruncated { offset })
        } else {
            Ok(())
        }
    };

    need(5)?;
    let path = FieldPath::from_bits(u32::from_le_bytes(fixed::<4>(data, offset)));
    let tag = data[offset + 4];
    let body = offset + 5;

    let (value, next) = match tag {
        TAG_INT => {
            need(5 + 4)?;
            (Value::Int(i32::from_le_bytes(fixed::<4>(data, body))), body + 4)
        }
        TAG_LONG => {
            need(5 + 8)?;
            (Value::Long(i64::from_le_bytes(fixed::<8>(data, body))), body + 8)
        }
        TAG_FLOAT => {
            need(5 + 4)?;
            (Value::Float(f32::from_le_bytes(fixed::<4>(data, body))), body + 4)
        }
        TAG_DOUBLE => {
            need(5 + 8)?;
            (Value::Double(f64::from_le_bytes(fixed::<8>(data, body))), body + 8)
        }
        TAG_STRING => {
            need(5 + 2)?;
            let len = u16::from_le_bytes(fixed::<2>(data, body)) as usize;
            need(5 + 2 + len)?;
            let bytes = &data[body + 2..body + 2 + len];
            let s = std::str::from_utf8(bytes)
                .map_err(|_| ParseError::InvalidUtf8 { offset })?
                .to_owned();
            (Value::Str(s), body + 2 + len)
        }
        TAG_BOOL => {
            need(5 + 1)?;
            (Value::Bool(data[body] != 0), body + 1)
        }
        TAG_BYTES => {
            need(5 + 2)?;
            let len = u16::from_le_bytes(fixed::<2>(data, body)) as usize;
            need(5 + 2 + len)?;
            (Value::Bytes(data[body + 2..body + 2 + len].to_vec()), body + 2 + len)
        }
        TAG_ATTRIBUTION => (Value::AttributionNode, body),
        tag => return Err(ParseError::UnknownTypeTag { offset, tag }),
    };

    Ok((FieldValue::new(path, value), next))
}

/// Encode an event back into the wire layout [`parse_event`] accepts.
/// Round-trips exactly, including position bits.
pub fn serialize_event(event: &Event) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + event.values().len() * 12);
    out.extend_from_slice(&event.atom_id().to_le_bytes());
    out.extend_from_slice(&event.elapsed_ns().to_le_bytes());
    out.extend_from_slice(&event.wall_clock_ns().unwrap_or(0).to_le_bytes());
    out.extend_from_slice(&event.uid().to_le_bytes());
    out.extend_from_slice(&event.pid().to_le_bytes());

    for fv in event.values() {
        out.extend_from_slice(&fv.path.bits().to_le_bytes());
        match &fv.value {
            Value::Int(v) => {
                out.push(TAG_INT);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Long(v) => {
                out.push(TAG_LONG);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Float(v) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Double(v) => {
                out.push(TAG_DOUBLE);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Str(v) => {
                out.push(TAG_STRING);
                out.extend_from_slice(&(v.len() as u16).to_le_bytes());
                out.extend_from_slice(v.as_bytes());
            }
            Value::Bool(v) => {
                out.push(TAG_BOOL);
                out.push(u8::from(*v));
            }
            Value::Bytes(v) => {
                out.push(TAG_BYTES);
                out.extend_from_slice(&(v.len() as u16).to_le_bytes());
                out.extend_from_slice(v);
            }
            Value::AttributionNode => out.push(TAG_ATTRIBUTION),
        }
    }
    out
}

#[inline(always)]
fn fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&data[offset..offset + N]);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBuilder;

    #[test]
    fn test_roundtrip_all_value_types() {
        let event = EventBuilder::new(42, 1_234_567)
            .uid(1000)
            .pid(99)
            .wall_clock_ns(987_654)
            .field(Value::Int(-5))
            .field(Value::Long(1 << 40))
            .field(Value::Float(2.5))
            .field(Value::Double(-0.125))
            .field(Value::Str("radio".into()))
            .field(Value::Bool(true))
            .field(Value::Bytes(vec![1, 2, 3]))
            .field(Value::AttributionNode)
            .build();

        let parsed = parse_event(&serialize_event(&event)).expect("roundtrip parse");
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_roundtrip_preserves_position_bits() {
        let event = EventBuilder::new(7, 10)
            .repeated_field(vec![Value::Int(1), Value::Int(2)])
            .build();
        let parsed = parse_event(&serialize_event(&event)).expect("roundtrip parse");
        assert_eq!(parsed.values(), event.values());
        assert!(parsed.values()[1].path.is_last_at(1));
    }

    #[test]
    fn test_truncated_header() {
        let err = parse_event(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, ParseError::Truncated { size: 10 }));
    }

    #[test]
    fn test_truncated_field_payload() {
        let event = EventBuilder::new(7, 10).field(Value::Long(5)).build();
        let mut bytes = serialize_event(&event);
        bytes.truncate(bytes.len() - 2);
        let err = parse_event(&bytes).unwrap_err();
        assert!(matches!(err, ParseError::FieldTruncated { .. }));
    }

    #[test]
    fn test_unknown_type_tag() {
        let event = EventBuilder::new(7, 10).field(Value::Bool(true)).build();
        let mut bytes = serialize_event(&event);
        let tag_offset = bytes.len() - 2;
        bytes[tag_offset] = 0xee;
        let err = parse_event(&bytes).unwrap_err();
        assert!(matches!(err, ParseError::UnknownTypeTag { tag: 0xee, .. }));
    }

    #[test]
    fn test_zero_wall_clock_is_absent() {
        let event = EventBuilder::new(7, 10).build();
        let parsed = parse_event(&serialize_event(&event)).expect("parse");
        assert_eq!(parsed.wall_clock_ns(), None);
    }
}
