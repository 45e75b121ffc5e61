#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aeon-codec** – Deterministic binary encoding and decoding of
//! [`Value`](aeon_layout::Value) trees against a [`Layout`](aeon_layout::Layout).
//!
//! Encoding any value twice yields byte-identical output, and decode then
//! re-encode is the identity — the determinism contract commands and events
//! rely on to be content-addressable and diffable in the journal.

use aeon_layout::{Layout, LayoutCache, TypeTag, Value};
use aeon_types::LayoutFingerprint;

mod varint;

use varint::{read_varint, write_varint};

/// Errors raised while encoding or decoding a value against a layout.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CodecError {
    /// The input ran out of bytes before the expected shape was fully read.
    #[error("truncated input: expected at least {needed} more byte(s) at offset {offset}")]
    Truncated {
        /// Byte offset at which the read was attempted.
        offset: usize,
        /// Minimum number of additional bytes required.
        needed: usize,
    },
    /// A `layout<ref>` field named a fingerprint this cache has never seen,
    /// meaning no `EntityLayoutIntroduced` for it has been observed.
    #[error("unknown layout fingerprint: {0}")]
    UnknownFingerprint(LayoutFingerprint),
    /// The decoded bytes violate an invariant of the expected shape (a
    /// presence byte that is neither 0 nor 1, a property missing from a
    /// value being encoded, and so on).
    #[error("invariant violated: {0}")]
    InvariantViolated(String),
}

/// Encode a top-level entity's property values against its own layout. The
/// layout's fingerprint is *not* embedded in the output — callers that
/// journal entities already carry the fingerprint in the entry header
/// (see the store wire format), so embedding it again here would be
/// redundant. Nested `layout<ref>` fields, by contrast, do embed their
/// fingerprint (see [`encode`]) since they have no enclosing header to
/// supply it.
pub fn encode_entity(value: &Value, layout: &Layout, cache: &LayoutCache) -> Result<Vec<u8>, CodecError> {
    let fields = value
        .as_fields()
        .ok_or_else(|| CodecError::InvariantViolated("entity value must be layout-shaped".into()))?;
    let mut out = Vec::new();
    encode_properties(fields, layout, cache, &mut out)?;
    Ok(out)
}

/// Decode a top-level entity's bytes against its layout (the inverse of
/// [`encode_entity`]).
pub fn decode_entity(bytes: &[u8], layout: &Layout, cache: &LayoutCache) -> Result<Value, CodecError> {
    let mut pos = 0usize;
    let fields = decode_properties(bytes, &mut pos, layout, cache)?;
    Ok(Value::Layout(fields))
}

/// Encode a value of the given tag. Used internally for fields of a
/// container, but also usable directly for testing a single scalar/tag.
pub fn encode(value: &Value, tag: &TypeTag, cache: &LayoutCache) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    encode_into(value, tag, cache, &mut out)?;
    Ok(out)
}

/// Decode a value of the given tag from the start of `bytes` (the inverse of
/// [`encode`]). Returns an error if trailing bytes remain unless the caller
/// is decoding a sub-field, in which case use [`decode_into`] directly.
pub fn decode(bytes: &[u8], tag: &TypeTag, cache: &LayoutCache) -> Result<Value, CodecError> {
    let mut pos = 0usize;
    decode_into(bytes, &mut pos, tag, cache)
}

fn encode_properties(
    fields: &[(String, Value)],
    layout: &Layout,
    cache: &LayoutCache,
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    // `layout.properties` is already sorted lexicographically by the layout
    // engine; encoding in that order, rather than the order fields happen
    // to appear in `fields`, is what makes the output deterministic.
    for prop in &layout.properties {
        let value = fields
            .iter()
            .find(|(name, _)| name == &prop.name)
            .map(|(_, v)| v)
            .ok_or_else(|| {
                CodecError::InvariantViolated(format!("missing property {}", prop.name))
            })?;
        encode_into(value, &prop.tag, cache, out)?;
    }
    Ok(())
}

fn decode_properties(
    bytes: &[u8],
    pos: &mut usize,
    layout: &Layout,
    cache: &LayoutCache,
) -> Result<Vec<(String, Value)>, CodecError> {
    let mut fields = Vec::with_capacity(layout.properties.len());
    for prop in &layout.properties {
        let value = decode_into(bytes, pos, &prop.tag, cache)?;
        fields.push((prop.name.clone(), value));
    }
    Ok(fields)
}

fn encode_into(value: &Value, tag: &TypeTag, cache: &LayoutCache, out: &mut Vec<u8>) -> Result<(), CodecError> {
    match (tag, value) {
        (TypeTag::Bool, Value::Bool(b)) => out.push(if *b { 1 } else { 0 }),
        (TypeTag::I8, Value::I8(n)) => out.push(*n as u8),
        (TypeTag::I16, Value::I16(n)) => out.extend_from_slice(&n.to_be_bytes()),
        (TypeTag::I32, Value::I32(n)) => out.extend_from_slice(&n.to_be_bytes()),
        (TypeTag::I64, Value::I64(n)) => out.extend_from_slice(&n.to_be_bytes()),
        (TypeTag::F32, Value::F32(n)) => out.extend_from_slice(&n.to_be_bytes()),
        (TypeTag::F64, Value::F64(n)) => out.extend_from_slice(&n.to_be_bytes()),
        (TypeTag::Str, Value::Str(s)) => {
            write_varint(out, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        (TypeTag::Uuid, Value::Uuid(u)) => out.extend_from_slice(u.as_bytes()),
        (TypeTag::Bytes, Value::Bytes(b)) => {
            write_varint(out, b.len() as u64);
            out.extend_from_slice(b);
        }
        (TypeTag::List(inner_tag), Value::List(items)) => {
            write_varint(out, items.len() as u64);
            for item in items {
                encode_into(item, inner_tag, cache, out)?;
            }
        }
        (TypeTag::Map(key_tag, value_tag), Value::Map(entries)) => {
            let mut encoded_entries = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                let mut key_bytes = Vec::new();
                encode_into(k, key_tag, cache, &mut key_bytes)?;
                encoded_entries.push((key_bytes, v));
            }
            // Sort by the *encoded* key bytes: the determinism contract is
            // about the bytes on the wire, and a lexicographic byte sort is
            // cheap to reproduce for any scalar key type.
            encoded_entries.sort_by(|a, b| a.0.cmp(&b.0));
            write_varint(out, encoded_entries.len() as u64);
            for (key_bytes, v) in encoded_entries {
                out.extend_from_slice(&key_bytes);
                encode_into(v, value_tag, cache, out)?;
            }
        }
        (TypeTag::Optional(inner_tag), Value::Optional(inner)) => match inner {
            Some(v) => {
                out.push(1);
                encode_into(v, inner_tag, cache, out)?;
            }
            None => out.push(0),
        },
        (TypeTag::LayoutRef(fingerprint), Value::Layout(fields)) => {
            let nested_layout = cache
                .get(fingerprint)
                .ok_or(CodecError::UnknownFingerprint(*fingerprint))?;
            out.extend_from_slice(&fingerprint.0);
            encode_properties(fields, &nested_layout, cache, out)?;
        }
        (expected, actual) => {
            return Err(CodecError::InvariantViolated(format!(
                "value {actual:?} does not match tag {expected:?}"
            )))
        }
    }
    Ok(())
}

fn decode_into(
    bytes: &[u8],
    pos: &mut usize,
    tag: &TypeTag,
    cache: &LayoutCache,
) -> Result<Value, CodecError> {
    Ok(match tag {
        TypeTag::Bool => {
            let byte = take_bytes(bytes, pos, 1)?[0];
            match byte {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => {
                    return Err(CodecError::InvariantViolated(format!(
                        "malformed bool byte {other}"
                    )))
                }
            }
        }
        TypeTag::I8 => Value::I8(take_bytes(bytes, pos, 1)?[0] as i8),
        TypeTag::I16 => Value::I16(i16::from_be_bytes(take_bytes(bytes, pos, 2)?.try_into().unwrap())),
        TypeTag::I32 => Value::I32(i32::from_be_bytes(take_bytes(bytes, pos, 4)?.try_into().unwrap())),
        TypeTag::I64 => Value::I64(i64::from_be_bytes(take_bytes(bytes, pos, 8)?.try_into().unwrap())),
        TypeTag::F32 => Value::F32(f32::from_be_bytes(take_bytes(bytes, pos, 4)?.try_into().unwrap())),
        TypeTag::F64 => Value::F64(f64::from_be_bytes(take_bytes(bytes, pos, 8)?.try_into().unwrap())),
        TypeTag::Str => {
            let len = read_varint(bytes, pos)? as usize;
            let raw = take_bytes(bytes, pos, len)?;
            Value::Str(String::from_utf8(raw.to_vec()).map_err(|e| {
                CodecError::InvariantViolated(format!("malformed utf-8 string: {e}"))
            })?)
        }
        TypeTag::Uuid => {
            let raw = take_bytes(bytes, pos, 16)?;
            Value::Uuid(uuid::Uuid::from_slice(raw).expect("slice is exactly 16 bytes"))
        }
        TypeTag::Bytes => {
            let len = read_varint(bytes, pos)? as usize;
            Value::Bytes(take_bytes(bytes, pos, len)?.to_vec())
        }
        TypeTag::List(inner_tag) => {
            let len = read_varint(bytes, pos)? as usize;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(decode_into(bytes, pos, inner_tag, cache)?);
            }
            Value::List(items)
        }
        TypeTag::Map(key_tag, value_tag) => {
            let len = read_varint(bytes, pos)? as usize;
            let mut entries = Vec::with_capacity(len);
            for _ in 0..len {
                let key = decode_into(bytes, pos, key_tag, cache)?;
                let value = decode_into(bytes, pos, value_tag, cache)?;
                entries.push((key, value));
            }
            Value::Map(entries)
        }
        TypeTag::Optional(inner_tag) => {
            let presence = take_bytes(bytes, pos, 1)?[0];
            match presence {
                0 => Value::Optional(None),
                1 => Value::Optional(Some(Box::new(decode_into(bytes, pos, inner_tag, cache)?))),
                other => {
                    return Err(CodecError::InvariantViolated(format!(
                        "malformed presence byte {other}"
                    )))
                }
            }
        }
        TypeTag::LayoutRef(fingerprint) => {
            let raw = take_bytes(bytes, pos, 20)?;
            if raw != fingerprint.0 {
                return Err(CodecError::InvariantViolated(
                    "embedded fingerprint does not match expected tag".into(),
                ));
            }
            let nested_layout = cache
                .get(fingerprint)
                .ok_or(CodecError::UnknownFingerprint(*fingerprint))?;
            let fields = decode_properties(bytes, pos, &nested_layout, cache)?;
            Value::Layout(fields)
        }
    })
}

fn take_bytes<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], CodecError> {
    let end = *pos + len;
    let slice = bytes.get(*pos..end).ok_or(CodecError::Truncated {
        offset: *pos,
        needed: len,
    })?;
    *pos = end;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aeon_layout::{canonicalize, EntityDescriptor, FieldType};

    fn scalar_layout(cache: &LayoutCache) -> Layout {
        let desc = EntityDescriptor::new(
            "Scalar",
            vec![
                ("amount", FieldType::I64),
                ("label", FieldType::Str),
                ("active", FieldType::Bool),
                ("note", FieldType::Optional(Box::new(FieldType::Str))),
            ],
        );
        canonicalize(&desc, cache).unwrap()
    }

    #[test]
    fn scalar_entity_roundtrips() {
        let cache = LayoutCache::new();
        let layout = scalar_layout(&cache);
        let value = Value::Layout(vec![
            ("amount".to_string(), Value::I64(42)),
            ("label".to_string(), Value::Str("hi".to_string())),
            ("active".to_string(), Value::Bool(true)),
            ("note".to_string(), Value::Optional(None)),
        ]);
        let bytes = encode_entity(&value, &layout, &cache).unwrap();
        let decoded = decode_entity(&bytes, &layout, &cache).unwrap();
        assert_eq!(decoded.as_fields().unwrap().len(), 4);
    }

    #[test]
    fn encoding_is_order_independent_in_input_but_deterministic_in_output() {
        let cache = LayoutCache::new();
        let layout = scalar_layout(&cache);
        let v1 = Value::Layout(vec![
            ("label".to_string(), Value::Str("hi".to_string())),
            ("amount".to_string(), Value::I64(42)),
            ("active".to_string(), Value::Bool(true)),
            ("note".to_string(), Value::Optional(None)),
        ]);
        let v2 = Value::Layout(vec![
            ("amount".to_string(), Value::I64(42)),
            ("active".to_string(), Value::Bool(true)),
            ("note".to_string(), Value::Optional(None)),
            ("label".to_string(), Value::Str("hi".to_string())),
        ]);
        let b1 = encode_entity(&v1, &layout, &cache).unwrap();
        let b2 = encode_entity(&v2, &layout, &cache).unwrap();
        assert_eq!(b1, b2);
    }

    #[test]
    fn map_keys_encode_sorted() {
        let cache = LayoutCache::new();
        let tag = TypeTag::Map(Box::new(TypeTag::Str), Box::new(TypeTag::I32));
        let value = Value::Map(vec![
            (Value::Str("zeta".to_string()), Value::I32(1)),
            (Value::Str("alpha".to_string()), Value::I32(2)),
        ]);
        let bytes = encode(&value, &tag, &cache).unwrap();
        let decoded = decode(&bytes, &tag, &cache).unwrap();
        match decoded {
            Value::Map(entries) => {
                assert_eq!(entries[0].0, Value::Str("alpha".to_string()));
                assert_eq!(entries[1].0, Value::Str("zeta".to_string()));
            }
            other => panic!("expected map, got {other:?}"),
        }
    }

    #[test]
    fn truncated_input_is_reported() {
        let cache = LayoutCache::new();
        let err = decode(&[0x00], &TypeTag::I64, &cache).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn unknown_fingerprint_is_reported() {
        let cache = LayoutCache::new();
        let fingerprint = LayoutFingerprint([7u8; 20]);
        let tag = TypeTag::LayoutRef(fingerprint);
        let value = Value::Layout(vec![]);
        let err = encode(&value, &tag, &cache).unwrap_err();
        assert_eq!(err, CodecError::UnknownFingerprint(fingerprint));
    }

    #[test]
    fn nested_layout_ref_roundtrips() {
        let cache = LayoutCache::new();
        let child_desc = EntityDescriptor::new("Child", vec![("v", FieldType::I32)]);
        let child_layout = canonicalize(&child_desc, &cache).unwrap();
        let parent_tag = TypeTag::LayoutRef(child_layout.fingerprint);
        let value = Value::Layout(vec![("v".to_string(), Value::I32(7))]);
        let bytes = encode(&value, &parent_tag, &cache).unwrap();
        assert_eq!(&bytes[0..20], &child_layout.fingerprint.0);
        let decoded = decode(&bytes, &parent_tag, &cache).unwrap();
        assert_eq!(decoded, value);
    }

    proptest::proptest! {
        #[test]
        fn i64_roundtrips(n: i64) {
            let cache = LayoutCache::new();
            let bytes = encode(&Value::I64(n), &TypeTag::I64, &cache).unwrap();
            let decoded = decode(&bytes, &TypeTag::I64, &cache).unwrap();
            prop_assert_eq!(decoded, Value::I64(n));
        }

        #[test]
        fn str_roundtrips(s in ".*") {
            let cache = LayoutCache::new();
            let bytes = encode(&Value::Str(s.clone()), &TypeTag::Str, &cache).unwrap();
            let decoded = decode(&bytes, &TypeTag::Str, &cache).unwrap();
            prop_assert_eq!(decoded, Value::Str(s));
        }

        #[test]
        fn bytes_roundtrip_and_reencode_is_identity(data: Vec<u8>) {
            let cache = LayoutCache::new();
            let tag = TypeTag::Bytes;
            let value = Value::Bytes(data);
            let bytes = encode(&value, &tag, &cache).unwrap();
            let decoded = decode(&bytes, &tag, &cache).unwrap();
            prop_assert_eq!(&decoded, &value);
            let reencoded = encode(&decoded, &tag, &cache).unwrap();
            prop_assert_eq!(reencoded, bytes);
        }

        #[test]
        fn optional_str_roundtrips(present: bool, s in ".*") {
            let cache = LayoutCache::new();
            let tag = TypeTag::Optional(Box::new(TypeTag::Str));
            let value = if present {
                Value::Optional(Some(Box::new(Value::Str(s))))
            } else {
                Value::Optional(None)
            };
            let bytes = encode(&value, &tag, &cache).unwrap();
            let decoded = decode(&bytes, &tag, &cache).unwrap();
            prop_assert_eq!(decoded, value);
        }

        #[test]
        fn list_of_i32_roundtrips(items: Vec<i32>) {
            let cache = LayoutCache::new();
            let tag = TypeTag::List(Box::new(TypeTag::I32));
            let value = Value::List(items.into_iter().map(Value::I32).collect());
            let bytes = encode(&value, &tag, &cache).unwrap();
            let decoded = decode(&bytes, &tag, &cache).unwrap();
            prop_assert_eq!(decoded, value);
        }
    }
}
