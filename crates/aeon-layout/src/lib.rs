#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aeon-layout** – Derives canonical, content-addressed schemas for entity
//! types.
//!
//! A [`Layout`] is the canonicalized schema of an entity type: a sorted list
//! of named, typed properties plus a 160-bit fingerprint that is the
//! schema's identity. Two types with identical schemas share a fingerprint
//! — the fingerprint, not the Rust type name, is what the codec and journal
//! key off of.
//!
//! This crate plays the role a derive macro or reflection layer would play
//! in a managed-runtime sibling: rather than inspecting live objects, a type
//! describes itself once via [`LayoutValue::descriptor`] and this engine
//! canonicalizes that description. See the design notes in `SPEC_FULL.md`
//! for why reflection is out of scope here.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sha1::{Digest, Sha1};
use uuid::Uuid;

use aeon_types::LayoutFingerprint;

pub mod builtin;
mod value;

pub use value::Value;

//─────────────────────────────
//  Descriptors (input)
//─────────────────────────────

/// A field type as declared by a type's [`LayoutValue::descriptor`], before
/// canonicalization.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    /// `bool`
    Bool,
    /// `i8`
    I8,
    /// `i16`
    I16,
    /// `i32`
    I32,
    /// `i64`
    I64,
    /// `f32`
    F32,
    /// `f64`
    F64,
    /// UTF-8 string
    Str,
    /// 128-bit UUID, used as an opaque reference to another entity
    Uuid,
    /// Raw byte string
    Bytes,
    /// Homogeneous list
    List(Box<FieldType>),
    /// Associative map; keys must be scalar (see [`LayoutError::UnsupportedType`])
    Map(Box<FieldType>, Box<FieldType>),
    /// Optional value
    Optional(Box<FieldType>),
    /// A fully-described sub-schema, embedded inline once canonicalized
    /// (becomes [`TypeTag::LayoutRef`]). Using this recursively on the same
    /// type name is a [`LayoutError::CyclicLayout`] — self-referential
    /// schemas must use [`FieldType::Uuid`] indirection instead.
    Nested(EntityDescriptor),
}

/// An entity type's declared shape: a name (used only for cycle detection,
/// not for identity) and an ordered list of fields.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDescriptor {
    /// Declaring type's name; purely diagnostic, not part of the fingerprint.
    pub type_name: String,
    /// Declared fields, in any order — canonicalization sorts them.
    pub fields: Vec<(String, FieldType)>,
}

impl EntityDescriptor {
    /// Convenience constructor.
    pub fn new(type_name: impl Into<String>, fields: Vec<(&str, FieldType)>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: fields.into_iter().map(|(n, t)| (n.to_string(), t)).collect(),
        }
    }
}

//─────────────────────────────
//  Canonical schema (output)
//─────────────────────────────

/// The closed tag set a canonicalized property can carry. Every
/// [`FieldType`] maps onto exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeTag {
    /// `bool`
    Bool,
    /// `i8`
    I8,
    /// `i16`
    I16,
    /// `i32`
    I32,
    /// `i64`
    I64,
    /// `f32` (hashed/compared via bit pattern, see [`TypeTag`] ordering caveat)
    F32,
    /// `f64`
    F64,
    /// UTF-8 string
    Str,
    /// 128-bit UUID reference
    Uuid,
    /// Raw bytes
    Bytes,
    /// Homogeneous list
    List(Box<TypeTag>),
    /// Associative map, keys emitted in sorted order by the codec
    Map(Box<TypeTag>, Box<TypeTag>),
    /// Optional value
    Optional(Box<TypeTag>),
    /// Reference to another layout by fingerprint, values embedded inline
    LayoutRef(LayoutFingerprint),
}

/// A single named, typed property in a canonicalized [`Layout`].
#[derive(Debug, Clone, PartialEq)]
pub struct PropertySchema {
    /// Property name.
    pub name: String,
    /// Canonical type tag.
    pub tag: TypeTag,
}

/// The canonicalized schema of an entity type: sorted properties plus their
/// content-addressed fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    /// Properties, sorted lexicographically by name.
    pub properties: Vec<PropertySchema>,
    /// SHA-1 of the canonical schema encoding; the schema's identity.
    pub fingerprint: LayoutFingerprint,
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors raised while canonicalizing a descriptor or decoding an encoded
/// schema.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum LayoutError {
    /// A descriptor nests itself (directly or transitively) via
    /// [`FieldType::Nested`] rather than [`FieldType::Uuid`] indirection.
    #[error("cyclic layout: type {0:?} references itself without uuid indirection")]
    CyclicLayout(String),
    /// A field type cannot be represented in the closed tag set, e.g. a
    /// non-scalar map key.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),
    /// An encoded schema blob was truncated or malformed.
    #[error("malformed schema encoding: {0}")]
    MalformedSchema(String),
}

//─────────────────────────────
//  Canonicalization
//─────────────────────────────

/// Canonicalize an [`EntityDescriptor`] into a [`Layout`], deriving its
/// fingerprint. Nested descriptors are recursed and cached via `cache` so
/// that a shared sub-schema is canonicalized (and fingerprinted) only once.
pub fn canonicalize(desc: &EntityDescriptor, cache: &LayoutCache) -> Result<Layout, LayoutError> {
    let mut visiting = Vec::new();
    canonicalize_inner(desc, cache, &mut visiting).map(|(layout, _newly_inserted)| layout)
}

/// Canonicalize `desc`, returning the resulting layout alongside whether
/// this call is the one that *first* inserted its fingerprint into `cache`
/// — the check and the insert happen under the same write-lock acquisition
/// so no other caller can observe a half-inserted fingerprint in between.
fn canonicalize_inner(
    desc: &EntityDescriptor,
    cache: &LayoutCache,
    visiting: &mut Vec<String>,
) -> Result<(Layout, bool), LayoutError> {
    if visiting.contains(&desc.type_name) {
        return Err(LayoutError::CyclicLayout(desc.type_name.clone()));
    }
    visiting.push(desc.type_name.clone());

    let mut properties = Vec::with_capacity(desc.fields.len());
    for (name, field_type) in &desc.fields {
        let tag = canonicalize_field(field_type, cache, visiting)?;
        properties.push(PropertySchema { name: name.clone(), tag });
    }
    properties.sort_by(|a, b| a.name.cmp(&b.name));

    visiting.pop();

    let fingerprint = fingerprint_of(&properties);
    let layout = Layout { properties, fingerprint };
    let newly_inserted = cache.insert_if_absent(layout.clone());
    Ok((layout, newly_inserted))
}

fn canonicalize_field(
    field_type: &FieldType,
    cache: &LayoutCache,
    visiting: &mut Vec<String>,
) -> Result<TypeTag, LayoutError> {
    Ok(match field_type {
        FieldType::Bool => TypeTag::Bool,
        FieldType::I8 => TypeTag::I8,
        FieldType::I16 => TypeTag::I16,
        FieldType::I32 => TypeTag::I32,
        FieldType::I64 => TypeTag::I64,
        FieldType::F32 => TypeTag::F32,
        FieldType::F64 => TypeTag::F64,
        FieldType::Str => TypeTag::Str,
        FieldType::Uuid => TypeTag::Uuid,
        FieldType::Bytes => TypeTag::Bytes,
        FieldType::List(inner) => {
            TypeTag::List(Box::new(canonicalize_field(inner, cache, visiting)?))
        }
        FieldType::Map(key, value) => {
            let key_tag = canonicalize_field(key, cache, visiting)?;
            if !is_scalar(&key_tag) {
                return Err(LayoutError::UnsupportedType(format!(
                    "map key must be scalar, got {key_tag:?}"
                )));
            }
            TypeTag::Map(
                Box::new(key_tag),
                Box::new(canonicalize_field(value, cache, visiting)?),
            )
        }
        FieldType::Optional(inner) => {
            TypeTag::Optional(Box::new(canonicalize_field(inner, cache, visiting)?))
        }
        FieldType::Nested(inner) => {
            let (nested, _newly_inserted) = canonicalize_inner(inner, cache, visiting)?;
            TypeTag::LayoutRef(nested.fingerprint)
        }
    })
}

fn is_scalar(tag: &TypeTag) -> bool {
    matches!(
        tag,
        TypeTag::Bool
            | TypeTag::I8
            | TypeTag::I16
            | TypeTag::I32
            | TypeTag::I64
            | TypeTag::F32
            | TypeTag::F64
            | TypeTag::Str
            | TypeTag::Uuid
    )
}

//─────────────────────────────
//  Fingerprinting
//─────────────────────────────

fn fingerprint_of(properties: &[PropertySchema]) -> LayoutFingerprint {
    let bytes = encode_properties(properties);
    let digest = Sha1::digest(&bytes);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    LayoutFingerprint(out)
}

fn encode_properties(properties: &[PropertySchema]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(properties.len() as u32).to_be_bytes());
    for prop in properties {
        encode_str(&mut bytes, &prop.name);
        encode_tag(&mut bytes, &prop.tag);
    }
    bytes
}

fn encode_str(bytes: &mut Vec<u8>, s: &str) {
    bytes.extend_from_slice(&(s.len() as u32).to_be_bytes());
    bytes.extend_from_slice(s.as_bytes());
}

fn encode_tag(bytes: &mut Vec<u8>, tag: &TypeTag) {
    match tag {
        TypeTag::Bool => bytes.push(0),
        TypeTag::I8 => bytes.push(1),
        TypeTag::I16 => bytes.push(2),
        TypeTag::I32 => bytes.push(3),
        TypeTag::I64 => bytes.push(4),
        TypeTag::F32 => bytes.push(5),
        TypeTag::F64 => bytes.push(6),
        TypeTag::Str => bytes.push(7),
        TypeTag::Uuid => bytes.push(8),
        TypeTag::Bytes => bytes.push(9),
        TypeTag::List(inner) => {
            bytes.push(10);
            encode_tag(bytes, inner);
        }
        TypeTag::Map(key, value) => {
            bytes.push(11);
            encode_tag(bytes, key);
            encode_tag(bytes, value);
        }
        TypeTag::Optional(inner) => {
            bytes.push(12);
            encode_tag(bytes, inner);
        }
        TypeTag::LayoutRef(fingerprint) => {
            bytes.push(13);
            bytes.extend_from_slice(&fingerprint.0);
        }
    }
}

fn decode_tag(bytes: &[u8], pos: &mut usize) -> Result<TypeTag, LayoutError> {
    let tag_byte = *bytes
        .get(*pos)
        .ok_or_else(|| LayoutError::MalformedSchema("truncated tag".into()))?;
    *pos += 1;
    Ok(match tag_byte {
        0 => TypeTag::Bool,
        1 => TypeTag::I8,
        2 => TypeTag::I16,
        3 => TypeTag::I32,
        4 => TypeTag::I64,
        5 => TypeTag::F32,
        6 => TypeTag::F64,
        7 => TypeTag::Str,
        8 => TypeTag::Uuid,
        9 => TypeTag::Bytes,
        10 => TypeTag::List(Box::new(decode_tag(bytes, pos)?)),
        11 => {
            let key = decode_tag(bytes, pos)?;
            let value = decode_tag(bytes, pos)?;
            TypeTag::Map(Box::new(key), Box::new(value))
        }
        12 => TypeTag::Optional(Box::new(decode_tag(bytes, pos)?)),
        13 => {
            let slice = bytes
                .get(*pos..*pos + 20)
                .ok_or_else(|| LayoutError::MalformedSchema("truncated fingerprint".into()))?;
            *pos += 20;
            let mut fp = [0u8; 20];
            fp.copy_from_slice(slice);
            TypeTag::LayoutRef(LayoutFingerprint(fp))
        }
        other => return Err(LayoutError::MalformedSchema(format!("unknown tag byte {other}"))),
    })
}

/// Encode a [`Layout`]'s schema into the opaque bytes carried by an
/// `EntityLayoutIntroduced` event. Deterministic: encoding the same layout
/// twice yields identical bytes (the codec determinism contract applies to
/// schemas too, since they are themselves journaled entities).
pub fn encode_schema(layout: &Layout) -> Vec<u8> {
    encode_properties(&layout.properties)
}

/// Decode schema bytes produced by [`encode_schema`] back into a [`Layout`],
/// re-deriving the fingerprint rather than trusting an embedded one so a
/// corrupted blob cannot impersonate a different fingerprint.
pub fn decode_schema(bytes: &[u8]) -> Result<Layout, LayoutError> {
    let mut pos = 0usize;
    let count = u32::from_be_bytes(
        bytes
            .get(0..4)
            .ok_or_else(|| LayoutError::MalformedSchema("truncated property count".into()))?
            .try_into()
            .unwrap(),
    );
    pos += 4;
    let mut properties = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_len = u32::from_be_bytes(
            bytes
                .get(pos..pos + 4)
                .ok_or_else(|| LayoutError::MalformedSchema("truncated name length".into()))?
                .try_into()
                .unwrap(),
        ) as usize;
        pos += 4;
        let name_bytes = bytes
            .get(pos..pos + name_len)
            .ok_or_else(|| LayoutError::MalformedSchema("truncated name".into()))?;
        let name = String::from_utf8(name_bytes.to_vec())
            .map_err(|e| LayoutError::MalformedSchema(e.to_string()))?;
        pos += name_len;
        let tag = decode_tag(bytes, &mut pos)?;
        properties.push(PropertySchema { name, tag });
    }
    let fingerprint = fingerprint_of(&properties);
    Ok(Layout { properties, fingerprint })
}

//─────────────────────────────
//  Process-wide layout cache
//─────────────────────────────

/// Read-mostly, process-wide cache of canonicalized layouts, keyed by
/// fingerprint. Copy-on-write on introduction: readers see a consistent
/// snapshot via cloning out of the map, writers take a single writer lock.
///
/// Mirrors the teacher's `toka-kernel::registry` global `RwLock<HashMap<_>>`
/// pattern, generalized from opcode handlers to layout schemas.
#[derive(Debug, Clone, Default)]
pub struct LayoutCache {
    inner: Arc<RwLock<HashMap<LayoutFingerprint, Layout>>>,
}

impl LayoutCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a previously cached layout by fingerprint.
    pub fn get(&self, fingerprint: &LayoutFingerprint) -> Option<Layout> {
        self.inner.read().expect("layout cache poisoned").get(fingerprint).cloned()
    }

    /// Insert (or overwrite) a layout. Fingerprints are content-addressed so
    /// an overwrite is always a no-op in practice — two layouts with the
    /// same fingerprint are, by the identity invariant, equal.
    pub fn insert(&self, layout: Layout) {
        self.inner
            .write()
            .expect("layout cache poisoned")
            .insert(layout.fingerprint, layout);
    }

    /// Insert `layout` only if its fingerprint isn't already present.
    /// Returns whether the insert actually happened — the check and the
    /// insert happen under one write-lock acquisition, so this is the only
    /// call that can observe "first time this fingerprint was seen".
    fn insert_if_absent(&self, layout: Layout) -> bool {
        let mut guard = self.inner.write().expect("layout cache poisoned");
        if guard.contains_key(&layout.fingerprint) {
            false
        } else {
            guard.insert(layout.fingerprint, layout);
            true
        }
    }

    /// Canonicalize `desc`, returning the resulting layout and whether this
    /// was the first time this fingerprint was observed by this cache — the
    /// signal the command consumer uses to decide whether an
    /// `EntityLayoutIntroduced` event is owed.
    pub fn get_or_derive(&self, desc: &EntityDescriptor) -> Result<(Layout, bool), LayoutError> {
        let mut visiting = Vec::new();
        canonicalize_inner(desc, self, &mut visiting)
    }
}

//─────────────────────────────
//  LayoutValue: bridges Rust types and the Value tree
//─────────────────────────────

/// Implemented by any type that can describe its own schema and convert to
/// and from the codec's [`Value`] tree.
///
/// Stands in for a derive macro (out of scope per the design notes): a real
/// deployment would generate this impl from a `#[derive(LayoutValue)]`
/// rather than writing it by hand, but the trait contract — and therefore
/// the wire format — is identical either way.
pub trait LayoutValue: Sized {
    /// Describe this type's shape. Must be stable across calls for a given
    /// type (the layout engine canonicalizes it once and caches the
    /// result).
    fn descriptor() -> EntityDescriptor;

    /// Convert this value into the generic [`Value`] tree for encoding.
    fn to_value(&self) -> Value;

    /// Reconstruct a value of this type from a decoded [`Value`] tree.
    fn from_value(value: Value) -> Result<Self, LayoutError>;
}

/// Helper used by [`LayoutValue`] implementations to read a required field
/// out of a decoded struct-shaped [`Value`].
pub fn take_field(fields: &mut Vec<(String, Value)>, name: &str) -> Result<Value, LayoutError> {
    let idx = fields
        .iter()
        .position(|(n, _)| n == name)
        .ok_or_else(|| LayoutError::MalformedSchema(format!("missing field {name}")))?;
    Ok(fields.remove(idx).1)
}

/// Parse a UUID out of a [`Value::Uuid`], erroring on any other shape.
pub fn value_as_uuid(value: Value) -> Result<Uuid, LayoutError> {
    match value {
        Value::Uuid(u) => Ok(u),
        other => Err(LayoutError::MalformedSchema(format!("expected uuid, got {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_schemas_share_fingerprint_across_names() {
        let a = EntityDescriptor::new(
            "Foo",
            vec![("amount", FieldType::I64), ("label", FieldType::Str)],
        );
        let b = EntityDescriptor::new(
            "Bar",
            vec![("label", FieldType::Str), ("amount", FieldType::I64)],
        );
        let cache = LayoutCache::new();
        let la = canonicalize(&a, &cache).unwrap();
        let lb = canonicalize(&b, &cache).unwrap();
        assert_eq!(la.fingerprint, lb.fingerprint);
    }

    #[test]
    fn differing_schemas_differ_in_fingerprint() {
        let a = EntityDescriptor::new("Foo", vec![("amount", FieldType::I64)]);
        let b = EntityDescriptor::new("Foo", vec![("amount", FieldType::I32)]);
        let cache = LayoutCache::new();
        let la = canonicalize(&a, &cache).unwrap();
        let lb = canonicalize(&b, &cache).unwrap();
        assert_ne!(la.fingerprint, lb.fingerprint);
    }

    #[test]
    fn direct_self_reference_is_cyclic() {
        let inner = EntityDescriptor::new("Node", vec![]);
        let mut desc = EntityDescriptor::new("Node", vec![("child", FieldType::Nested(inner))]);
        // Make the nested descriptor genuinely self-referential by name.
        desc.fields[0].1 = FieldType::Nested(EntityDescriptor::new("Node", vec![]));
        let cache = LayoutCache::new();
        let err = canonicalize(&desc, &cache).unwrap_err();
        assert_eq!(err, LayoutError::CyclicLayout("Node".to_string()));
    }

    #[test]
    fn self_reference_via_uuid_is_allowed() {
        let desc = EntityDescriptor::new("Node", vec![("parent", FieldType::Uuid)]);
        let cache = LayoutCache::new();
        assert!(canonicalize(&desc, &cache).is_ok());
    }

    #[test]
    fn non_scalar_map_key_is_unsupported() {
        let desc = EntityDescriptor::new(
            "Foo",
            vec![(
                "m",
                FieldType::Map(Box::new(FieldType::List(Box::new(FieldType::I32))), Box::new(FieldType::I32)),
            )],
        );
        let cache = LayoutCache::new();
        assert!(matches!(
            canonicalize(&desc, &cache),
            Err(LayoutError::UnsupportedType(_))
        ));
    }

    #[test]
    fn schema_encode_decode_roundtrips() {
        let desc = EntityDescriptor::new(
            "Foo",
            vec![
                ("amount", FieldType::I64),
                ("tags", FieldType::List(Box::new(FieldType::Str))),
                ("note", FieldType::Optional(Box::new(FieldType::Str))),
            ],
        );
        let cache = LayoutCache::new();
        let layout = canonicalize(&desc, &cache).unwrap();
        let bytes = encode_schema(&layout);
        let decoded = decode_schema(&bytes).unwrap();
        assert_eq!(layout, decoded);
    }

    #[test]
    fn nested_layout_reuses_cached_fingerprint() {
        let child = EntityDescriptor::new("Child", vec![("v", FieldType::I32)]);
        let parent = EntityDescriptor::new("Parent", vec![("child", FieldType::Nested(child.clone()))]);
        let cache = LayoutCache::new();
        let child_layout = canonicalize(&child, &cache).unwrap();
        let parent_layout = canonicalize(&parent, &cache).unwrap();
        match &parent_layout.properties[0].tag {
            TypeTag::LayoutRef(fp) => assert_eq!(*fp, child_layout.fingerprint),
            other => panic!("expected LayoutRef, got {other:?}"),
        }
    }

    proptest::proptest! {
        #[test]
        fn field_order_never_affects_fingerprint(perm in proptest::sample::select(vec![
            vec![0usize, 1, 2], vec![0, 2, 1], vec![1, 0, 2], vec![1, 2, 0], vec![2, 0, 1], vec![2, 1, 0],
        ])) {
            let all_fields = [
                ("amount", FieldType::I64),
                ("label", FieldType::Str),
                ("active", FieldType::Bool),
            ];
            let base = EntityDescriptor::new("Shuffled", all_fields.to_vec());
            let shuffled_fields: Vec<_> = perm.iter().map(|&i| all_fields[i].clone()).collect();
            let shuffled = EntityDescriptor::new("Shuffled", shuffled_fields);
            let cache = LayoutCache::new();
            let a = canonicalize(&base, &cache).unwrap();
            let b = canonicalize(&shuffled, &cache).unwrap();
            prop_assert_eq!(a.fingerprint, b.fingerprint);
        }

        #[test]
        fn distinct_type_names_with_identical_schema_share_fingerprint(
            name_a in "[a-zA-Z][a-zA-Z0-9]{0,15}",
            name_b in "[a-zA-Z][a-zA-Z0-9]{0,15}",
        ) {
            let a = EntityDescriptor::new(name_a, vec![("amount", FieldType::I64), ("label", FieldType::Str)]);
            let b = EntityDescriptor::new(name_b, vec![("label", FieldType::Str), ("amount", FieldType::I64)]);
            let cache = LayoutCache::new();
            let la = canonicalize(&a, &cache).unwrap();
            let lb = canonicalize(&b, &cache).unwrap();
            prop_assert_eq!(la.fingerprint, lb.fingerprint);
        }
    }
}
