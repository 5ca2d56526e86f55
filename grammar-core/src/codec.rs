use std::{fmt::Debug, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    math,
    symbol::{Endianness, FieldKind, FieldValue, FieldValues, IntWidth, Symbol},
    EncodingError,
};

/// Names the codec that realizes a symbol as bytes. The reference is resolved through a
/// [`CodecRegistry`] when a symbol is encoded or decoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodecRef(pub String);

impl CodecRef {
    /// Name under which the [`FieldCodec`] is registered.
    pub const FIELDS: &'static str = "fields";

    pub fn new<S: Into<String>>(name: S) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CodecRef {
    fn default() -> Self {
        Self(Self::FIELDS.to_string())
    }
}

/// The capability of turning a [`Symbol`] together with [`FieldValues`] into bytes, and of
/// recognizing bytes as an instance of one of several candidate symbols.
pub trait SymbolCodec: Debug + Send + Sync {
    /// Serializes `symbol` with the given values.
    fn encode(&self, symbol: &Symbol, values: &FieldValues) -> Result<Vec<u8>, EncodingError>;

    /// Attempts to parse a prefix of `bytes` as one of the `candidates`, which are tried in order.
    /// On success, the matching candidate is returned together with the number of bytes that
    /// were consumed.
    fn decode<'s>(&self, bytes: &[u8], candidates: &[&'s Symbol]) -> Option<(&'s Symbol, usize)>;
}

/// Codec that lays out the fields of a symbol one after another, without any separators.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldCodec;

impl FieldCodec {
    /// Parses a prefix of `bytes` as `symbol` and returns the parsed values together with
    /// the number of consumed bytes. Values of constant fields are not reported.
    pub fn parse(&self, symbol: &Symbol, bytes: &[u8]) -> Option<(FieldValues, usize)> {
        let mut values = FieldValues::new();
        let mut position = 0;
        for field in &symbol.fields {
            let rest = &bytes[position..];
            match &field.kind {
                FieldKind::Constant { bytes: constant } => {
                    if !rest.starts_with(constant) {
                        return None;
                    }
                    position += constant.len();
                }
                FieldKind::Integer { width, endianness } => {
                    let raw = rest.get(..width.bytes())?;
                    values.set(field.name.clone(), read_integer(raw, *endianness));
                    position += width.bytes();
                }
                FieldKind::Raw { length } => {
                    let raw = rest.get(..*length)?;
                    values.set(field.name.clone(), raw);
                    position += length;
                }
                FieldKind::Trailing => {
                    values.set(field.name.clone(), rest);
                    position = bytes.len();
                }
            }
        }
        Some((values, position))
    }
}

fn read_integer(raw: &[u8], endianness: Endianness) -> u64 {
    let fold = |acc: u64, b: &u8| (acc << 8) | *b as u64;
    match endianness {
        Endianness::Big => raw.iter().fold(0, fold),
        Endianness::Little => raw.iter().rev().fold(0, fold),
    }
}

fn write_integer(out: &mut Vec<u8>, value: u64, width: IntWidth, endianness: Endianness) {
    let be = value.to_be_bytes();
    let significant = &be[be.len() - width.bytes()..];
    match endianness {
        Endianness::Big => out.extend_from_slice(significant),
        Endianness::Little => out.extend(significant.iter().rev()),
    }
}

impl SymbolCodec for FieldCodec {
    fn encode(&self, symbol: &Symbol, values: &FieldValues) -> Result<Vec<u8>, EncodingError> {
        if let Some(unknown) = values.names().find(|n| symbol.field(n).is_none()) {
            return Err(EncodingError::UnknownField {
                symbol: symbol.name.clone(),
                field: unknown.to_string(),
            });
        }

        let mut out = vec![];
        for field in &symbol.fields {
            let value = values.get(&field.name);
            match (&field.kind, value) {
                (FieldKind::Constant { bytes }, None) => out.extend_from_slice(bytes),
                (FieldKind::Constant { bytes }, Some(FieldValue::Bytes(given))) => {
                    if given != bytes {
                        return Err(EncodingError::ConstantMismatch {
                            field: field.name.clone(),
                        });
                    }
                    out.extend_from_slice(bytes)
                }
                (FieldKind::Integer { width, endianness }, value) => {
                    let value = match value {
                        None => 0,
                        Some(FieldValue::Integer(i)) => *i,
                        Some(FieldValue::Bytes(_)) => {
                            return Err(EncodingError::TypeMismatch {
                                field: field.name.clone(),
                                expected: "integer",
                            })
                        }
                    };
                    if value > width.max() {
                        return Err(EncodingError::ValueOutOfRange {
                            field: field.name.clone(),
                            value,
                            width: *width,
                        });
                    }
                    write_integer(&mut out, value, *width, *endianness);
                }
                (FieldKind::Raw { length }, None) => out.extend(std::iter::repeat(0u8).take(*length)),
                (FieldKind::Raw { length }, Some(FieldValue::Bytes(given))) => {
                    if given.len() != *length {
                        return Err(EncodingError::LengthMismatch {
                            field: field.name.clone(),
                            expected: *length,
                            actual: given.len(),
                        });
                    }
                    out.extend_from_slice(given);
                }
                (FieldKind::Trailing, None) => {}
                (FieldKind::Trailing, Some(FieldValue::Bytes(given))) => {
                    out.extend_from_slice(given)
                }
                (_, Some(FieldValue::Integer(_))) => {
                    return Err(EncodingError::TypeMismatch {
                        field: field.name.clone(),
                        expected: "bytes",
                    })
                }
            }
        }
        trace!("encoded {} into {} bytes", symbol.name, out.len());
        Ok(out)
    }

    fn decode<'s>(&self, bytes: &[u8], candidates: &[&'s Symbol]) -> Option<(&'s Symbol, usize)> {
        candidates
            .iter()
            .find_map(|symbol| self.parse(symbol, bytes).map(|(_, used)| (*symbol, used)))
    }
}

/// Resolves [`CodecRef`]s to codec implementations. The default registry knows the
/// [`FieldCodec`] under the name [`CodecRef::FIELDS`].
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    codecs: math::Map<CodecRef, Arc<dyn SymbolCodec>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self {
            codecs: math::Map::default(),
        };
        registry.register(CodecRef::default(), Arc::new(FieldCodec));
        registry
    }
}

impl CodecRegistry {
    /// Registers `codec` under `name`, replacing any codec that was registered before.
    pub fn register(&mut self, name: CodecRef, codec: Arc<dyn SymbolCodec>) {
        self.codecs.insert(name, codec);
    }

    pub fn get(&self, name: &CodecRef) -> Result<&Arc<dyn SymbolCodec>, EncodingError> {
        self.codecs
            .get(name)
            .ok_or_else(|| EncodingError::UnknownCodec(name.0.clone()))
    }

    /// Encodes `symbol` with the codec it refers to.
    pub fn encode(&self, symbol: &Symbol, values: &FieldValues) -> Result<Vec<u8>, EncodingError> {
        self.get(&symbol.codec)?.encode(symbol, values)
    }

    /// Tries the candidates in order, each with its own codec. Candidates whose codec is not
    /// registered are skipped.
    pub fn decode<'s>(&self, bytes: &[u8], candidates: &[&'s Symbol]) -> Option<(&'s Symbol, usize)> {
        candidates.iter().find_map(|symbol| {
            let codec = self.codecs.get(&symbol.codec)?;
            codec.decode(bytes, std::slice::from_ref(symbol))
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{Alphabet, Field};

    fn alphabet() -> Alphabet {
        let mut alphabet = Alphabet::new();
        alphabet
            .add_symbol("HELLO", vec![Field::constant("kw", "HELLO")])
            .unwrap();
        alphabet
            .add_symbol(
                "DATA",
                vec![
                    Field::constant("kw", "DATA"),
                    Field::integer("len", IntWidth::U16, Endianness::Big),
                    Field::raw("tag", 2),
                    Field::trailing("body"),
                ],
            )
            .unwrap();
        alphabet
            .add_symbol(
                "SEQ",
                vec![Field::integer("seq", IntWidth::U32, Endianness::Little)],
            )
            .unwrap();
        alphabet
    }

    #[test_log::test]
    fn encode_with_defaults() {
        let alphabet = alphabet();
        let registry = CodecRegistry::default();
        let data = alphabet.symbol_by_name("DATA").unwrap();
        let bytes = registry.encode(data, &FieldValues::new()).unwrap();
        assert_eq!(bytes, b"DATA\x00\x00\x00\x00");
    }

    #[test_log::test]
    fn encode_integers() {
        let alphabet = alphabet();
        let registry = CodecRegistry::default();
        let seq = alphabet.symbol_by_name("SEQ").unwrap();
        let bytes = registry
            .encode(seq, &FieldValues::new().with("seq", 0x01020304u64))
            .unwrap();
        assert_eq!(bytes, vec![4, 3, 2, 1]);

        let data = alphabet.symbol_by_name("DATA").unwrap();
        let bytes = registry
            .encode(
                data,
                &FieldValues::new()
                    .with("len", 0x0102u64)
                    .with("tag", vec![9, 9])
                    .with("body", "xy"),
            )
            .unwrap();
        assert_eq!(bytes, b"DATA\x01\x02\x09\x09xy");
    }

    #[test_log::test]
    fn encoding_errors() {
        let alphabet = alphabet();
        let registry = CodecRegistry::default();
        let data = alphabet.symbol_by_name("DATA").unwrap();

        assert!(matches!(
            registry.encode(data, &FieldValues::new().with("len", 70000u64)),
            Err(EncodingError::ValueOutOfRange { .. })
        ));
        assert!(matches!(
            registry.encode(data, &FieldValues::new().with("tag", vec![1, 2, 3])),
            Err(EncodingError::LengthMismatch {
                expected: 2,
                actual: 3,
                ..
            })
        ));
        assert!(matches!(
            registry.encode(data, &FieldValues::new().with("len", "oops")),
            Err(EncodingError::TypeMismatch { .. })
        ));
        assert!(matches!(
            registry.encode(data, &FieldValues::new().with("nope", 1u64)),
            Err(EncodingError::UnknownField { .. })
        ));
    }

    #[test_log::test]
    fn decode_picks_first_matching_candidate() {
        let alphabet = alphabet();
        let registry = CodecRegistry::default();
        let candidates = alphabet.symbols().collect::<Vec<_>>();

        let (symbol, used) = registry.decode(b"HELLO", &candidates).unwrap();
        assert_eq!(symbol.name(), "HELLO");
        assert_eq!(used, 5);

        let (symbol, used) = registry.decode(b"DATA\x00\x01ab", &candidates).unwrap();
        assert_eq!(symbol.name(), "DATA");
        assert_eq!(used, 8);

        // four arbitrary bytes always parse as SEQ
        let (symbol, _) = registry.decode(b"NOPE", &candidates).unwrap();
        assert_eq!(symbol.name(), "SEQ");
        assert!(registry.decode(b"NO", &candidates).is_none());
    }

    #[test_log::test]
    fn unknown_codec() {
        let mut alphabet = Alphabet::new();
        let id = alphabet
            .add_symbol_with_codec("X", vec![], CodecRef::new("tlv"))
            .unwrap();
        let registry = CodecRegistry::default();
        assert!(matches!(
            registry.encode(alphabet.symbol(id).unwrap(), &FieldValues::new()),
            Err(EncodingError::UnknownCodec(name)) if name == "tlv"
        ));
    }

    proptest! {
        #[test]
        fn round_trip(len in 0u64..=u16::MAX as u64, seq in any::<u32>(), tag in proptest::collection::vec(any::<u8>(), 2), body in proptest::collection::vec(any::<u8>(), 0..64)) {
            let alphabet = alphabet();
            let registry = CodecRegistry::default();
            for (symbol, values) in [
                ("DATA", FieldValues::new().with("len", len).with("tag", tag.clone()).with("body", body.clone())),
                ("SEQ", FieldValues::new().with("seq", seq as u64)),
                ("HELLO", FieldValues::new()),
            ] {
                let symbol = alphabet.symbol_by_name(symbol).unwrap();
                let bytes = registry.encode(symbol, &values).unwrap();
                let decoded = registry.decode(&bytes, &[symbol]);
                prop_assert_eq!(decoded, Some((symbol, bytes.len())));
                let (parsed, _) = FieldCodec.parse(symbol, &bytes).unwrap();
                prop_assert_eq!(parsed, values);
            }
        }
    }
}
