use std::fmt::Debug;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{codec::CodecRef, math, Show};

/// Identifies a [`Symbol`] within its [`crate::Alphabet`]. Identifiers are handed out densely
/// by the alphabet, starting at zero, so they can also be used as indices.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolId(pub u32);

impl SymbolId {
    /// Returns the identifier as an index into a vector.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Debug for SymbolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl Show for SymbolId {
    fn show(&self) -> String {
        format!("s{}", self.0)
    }
}

/// The width of an unsigned integer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntWidth {
    U8,
    U16,
    U32,
    U64,
}

impl IntWidth {
    /// Number of bytes an integer of this width occupies on the wire.
    pub fn bytes(&self) -> usize {
        match self {
            IntWidth::U8 => 1,
            IntWidth::U16 => 2,
            IntWidth::U32 => 4,
            IntWidth::U64 => 8,
        }
    }

    /// Largest value that fits.
    pub fn max(&self) -> u64 {
        match self {
            IntWidth::U64 => u64::MAX,
            _ => (1u64 << (8 * self.bytes())) - 1,
        }
    }
}

/// Byte order of an integer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

/// Determines how a [`Field`] is laid out on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FieldKind {
    /// A fixed sequence of bytes, for example a keyword or a magic number.
    Constant { bytes: Vec<u8> },
    /// An unsigned integer of the given width.
    Integer {
        width: IntWidth,
        #[serde(default)]
        endianness: Endianness,
    },
    /// Raw bytes of a fixed length.
    Raw { length: usize },
    /// Raw bytes that extend until the end of the message. May only be used for the last field.
    Trailing,
}

/// A named, typed part of a [`Symbol`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
}

impl Field {
    pub fn constant<N: Into<String>, B: Into<Vec<u8>>>(name: N, bytes: B) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Constant {
                bytes: bytes.into(),
            },
        }
    }

    pub fn integer<N: Into<String>>(name: N, width: IntWidth, endianness: Endianness) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Integer { width, endianness },
        }
    }

    pub fn raw<N: Into<String>>(name: N, length: usize) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Raw { length },
        }
    }

    pub fn trailing<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Trailing,
        }
    }

    /// Returns the number of bytes this field always occupies, `None` for [`FieldKind::Trailing`].
    pub fn fixed_length(&self) -> Option<usize> {
        match &self.kind {
            FieldKind::Constant { bytes } => Some(bytes.len()),
            FieldKind::Integer { width, .. } => Some(width.bytes()),
            FieldKind::Raw { length } => Some(*length),
            FieldKind::Trailing => None,
        }
    }
}

/// A message template. Two symbols are the same if they agree structurally, that is on their
/// identifier, name, fields and codec; the bytes of some concrete message play no role.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub(crate) id: SymbolId,
    pub(crate) name: String,
    pub(crate) fields: Vec<Field>,
    pub(crate) codec: CodecRef,
}

impl Symbol {
    pub fn id(&self) -> SymbolId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn codec(&self) -> &CodecRef {
        &self.codec
    }

    /// Returns true if the symbol consists of constant fields only, meaning it is realized
    /// by exactly one byte string.
    pub fn is_static(&self) -> bool {
        self.fields
            .iter()
            .all(|f| matches!(f.kind, FieldKind::Constant { .. }))
    }
}

impl Show for Symbol {
    fn show(&self) -> String {
        self.name.clone()
    }
}

/// A concrete value for one field of a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(u64),
    Bytes(Vec<u8>),
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        Self::Integer(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for FieldValue {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Bytes(value.as_bytes().to_vec())
    }
}

/// Assigns values to the fields of a symbol by field name. Fields without an assigned value
/// take a default: zero for integers, zero bytes for raw fields and nothing for trailing fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldValues(math::OrderedMap<String, FieldValue>);

impl FieldValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value of `field` and returns `self`, so assignments can be chained.
    pub fn with<N: Into<String>, V: Into<FieldValue>>(mut self, field: N, value: V) -> Self {
        self.set(field, value);
        self
    }

    pub fn set<N: Into<String>, V: Into<FieldValue>>(&mut self, field: N, value: V) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.keys().map(|k| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl Show for FieldValues {
    fn show(&self) -> String {
        format!(
            "[{}]",
            self.0
                .iter()
                .map(|(name, value)| match value {
                    FieldValue::Integer(i) => format!("{name}={i}"),
                    FieldValue::Bytes(b) => format!("{name}={b:02x?}"),
                })
                .join(", ")
        )
    }
}
