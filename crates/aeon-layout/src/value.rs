//! The generic value tree bridged between Rust types (via [`super::LayoutValue`])
//! and the binary codec. One [`Value`] variant per [`super::TypeTag`].

use uuid::Uuid;

/// A dynamically-typed value conforming to some [`super::Layout`].
///
/// `Value::Layout` represents both top-level entities and
/// [`super::TypeTag::LayoutRef`] fields: its fields, in the same order the
/// schema declares them. The schema itself (and therefore the fingerprint)
/// comes from the [`super::Layout`]/[`super::TypeTag`] the value is being
/// encoded or decoded against, not from the value itself — a `Value` alone
/// is not self-describing.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `bool`
    Bool(bool),
    /// `i8`
    I8(i8),
    /// `i16`
    I16(i16),
    /// `i32`
    I32(i32),
    /// `i64`
    I64(i64),
    /// `f32`
    F32(f32),
    /// `f64`
    F64(f64),
    /// UTF-8 string
    Str(String),
    /// 128-bit UUID
    Uuid(Uuid),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Homogeneous list
    List(Vec<Value>),
    /// Associative map; encoded with keys sorted by the codec regardless of
    /// the order they appear here
    Map(Vec<(Value, Value)>),
    /// Present/absent optional value
    Optional(Option<Box<Value>>),
    /// An embedded or top-level struct-shaped value: its fields, in
    /// declaration order
    Layout(Vec<(String, Value)>),
}

impl Value {
    /// Borrow this value's fields if it is [`Value::Layout`]-shaped.
    pub fn as_fields(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Layout(fields) => Some(fields),
            _ => None,
        }
    }

    /// Consume this value into its fields if it is [`Value::Layout`]-shaped.
    pub fn into_fields(self) -> Option<Vec<(String, Value)>> {
        match self {
            Value::Layout(fields) => Some(fields),
            _ => None,
        }
    }
}
