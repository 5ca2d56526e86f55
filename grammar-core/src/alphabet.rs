use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    math, CodecRef, Field, FieldKind, RecordError, Reply, Show, Symbol, SymbolId,
};

/// The collection of all symbols known for a protocol. Symbols are added once while the
/// alphabet is set up, afterwards the alphabet is only read and can be shared freely (usually
/// behind an `Arc`) between concurrently running sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Alphabet {
    symbols: Vec<Symbol>,
    names: math::Bijection<SymbolId, String>,
}

impl Alphabet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a symbol that is realized through the [`crate::FieldCodec`].
    pub fn add_symbol<N: Into<String>>(
        &mut self,
        name: N,
        fields: Vec<Field>,
    ) -> Result<SymbolId, RecordError> {
        self.add_symbol_with_codec(name, fields, CodecRef::default())
    }

    /// Adds a symbol that is realized through the codec registered under `codec`. Fails if
    /// the name is already taken or if a trailing field is followed by further fields.
    pub fn add_symbol_with_codec<N: Into<String>>(
        &mut self,
        name: N,
        fields: Vec<Field>,
        codec: CodecRef,
    ) -> Result<SymbolId, RecordError> {
        let name = name.into();
        if self.names.contains_right(&name) {
            return Err(RecordError::DuplicateSymbol(name));
        }
        if let Some((position, field)) = fields
            .iter()
            .find_position(|f| matches!(f.kind, FieldKind::Trailing))
        {
            if position + 1 != fields.len() {
                return Err(RecordError::InvalidField {
                    symbol: name,
                    field: field.name.clone(),
                    reason: "a trailing field must be the last field",
                });
            }
        }
        if let Some(duplicate) = fields.iter().map(|f| &f.name).duplicates().next() {
            return Err(RecordError::InvalidField {
                symbol: name.clone(),
                field: duplicate.clone(),
                reason: "field names must be unique",
            });
        }

        let id = SymbolId(self.symbols.len() as u32);
        trace!("adding symbol {name} as {id:?}");
        self.names.insert(id, name.clone());
        self.symbols.push(Symbol {
            id,
            name,
            fields,
            codec,
        });
        Ok(id)
    }

    pub fn symbol(&self, id: SymbolId) -> Option<&Symbol> {
        self.symbols.get(id.index())
    }

    pub fn symbol_by_name(&self, name: &str) -> Option<&Symbol> {
        self.id_of(name).and_then(|id| self.symbol(id))
    }

    pub fn id_of(&self, name: &str) -> Option<SymbolId> {
        self.names.get_by_right(name).copied()
    }

    pub fn name_of(&self, id: SymbolId) -> Option<&str> {
        self.names.get_by_left(&id).map(|n| n.as_str())
    }

    /// Resolves a list of names, failing on the first name that is not known.
    pub fn ids_of<'a, I: IntoIterator<Item = &'a str>>(
        &self,
        names: I,
    ) -> Result<Vec<SymbolId>, RecordError> {
        names
            .into_iter()
            .map(|n| {
                self.id_of(n)
                    .ok_or_else(|| RecordError::UnknownSymbol(n.to_string()))
            })
            .collect()
    }

    pub fn contains(&self, id: SymbolId) -> bool {
        id.index() < self.symbols.len()
    }

    /// Iterates over all symbols in the order in which they were added.
    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> + '_ {
        self.symbols.iter()
    }

    /// Iterates over the identifiers of all symbols in the order in which they were added.
    pub fn universe(&self) -> impl Iterator<Item = SymbolId> + '_ {
        self.symbols.iter().map(|s| s.id)
    }

    pub fn size(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Renders a word with symbol names, e.g. `HELLO.ACK`.
    pub fn show_word(&self, word: &[SymbolId]) -> String {
        if word.is_empty() {
            return "ε".to_string();
        }
        word.iter().map(|s| self.show_symbol(*s)).join(".")
    }

    pub fn show_symbol(&self, id: SymbolId) -> String {
        self.name_of(id)
            .map(|n| n.to_string())
            .unwrap_or_else(|| id.show())
    }

    pub fn show_reply(&self, reply: &Reply) -> String {
        match reply {
            Reply::Symbol(s) => self.show_symbol(*s),
            other => other.show(),
        }
    }

    pub fn to_record(&self) -> AlphabetRecord {
        AlphabetRecord {
            symbols: self
                .symbols
                .iter()
                .map(|s| SymbolRecord {
                    name: s.name.clone(),
                    fields: s.fields.clone(),
                    codec: s.codec.clone(),
                })
                .collect(),
        }
    }

    pub fn from_record(record: AlphabetRecord) -> Result<Self, RecordError> {
        let mut alphabet = Self::new();
        for symbol in record.symbols {
            alphabet.add_symbol_with_codec(symbol.name, symbol.fields, symbol.codec)?;
        }
        Ok(alphabet)
    }

    pub fn to_json(&self) -> Result<String, RecordError> {
        Ok(serde_json::to_string_pretty(&self.to_record())?)
    }

    pub fn from_json(json: &str) -> Result<Self, RecordError> {
        Self::from_record(serde_json::from_str(json)?)
    }
}

/// Neutral, persistable description of an [`Alphabet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlphabetRecord {
    pub symbols: Vec<SymbolRecord>,
}

/// Neutral, persistable description of a [`Symbol`]. The identifier is implied by the position
/// of the record within its [`AlphabetRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub codec: CodecRef,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Endianness, IntWidth};

    fn alphabet() -> Alphabet {
        let mut alphabet = Alphabet::new();
        alphabet
            .add_symbol("HELLO", vec![Field::constant("kw", "HELLO")])
            .unwrap();
        alphabet
            .add_symbol(
                "ACK",
                vec![
                    Field::constant("kw", "ACK"),
                    Field::integer("seq", IntWidth::U8, Endianness::Big),
                ],
            )
            .unwrap();
        alphabet
            .add_symbol("BYE", vec![Field::constant("kw", "BYE")])
            .unwrap();
        alphabet
    }

    #[test_log::test]
    fn lookup() {
        let alphabet = alphabet();
        assert_eq!(alphabet.size(), 3);
        let ack = alphabet.id_of("ACK").unwrap();
        assert_eq!(ack, SymbolId(1));
        assert_eq!(alphabet.name_of(ack), Some("ACK"));
        assert_eq!(alphabet.symbol(ack).unwrap().fields().len(), 2);
        assert_eq!(
            alphabet.ids_of(["BYE", "HELLO"]).unwrap(),
            vec![SymbolId(2), SymbolId(0)]
        );
        assert!(matches!(
            alphabet.ids_of(["NOPE"]),
            Err(RecordError::UnknownSymbol(_))
        ));
        assert_eq!(alphabet.show_word(&[SymbolId(0), SymbolId(1)]), "HELLO.ACK");
        assert_eq!(alphabet.show_word(&[]), "ε");
        assert_eq!(alphabet.show_reply(&Reply::Silence), "_");
    }

    #[test_log::test]
    fn invalid_definitions() {
        let mut alphabet = alphabet();
        assert!(matches!(
            alphabet.add_symbol("HELLO", vec![]),
            Err(RecordError::DuplicateSymbol(_))
        ));
        assert!(matches!(
            alphabet.add_symbol(
                "BAD",
                vec![Field::trailing("rest"), Field::constant("end", "!")]
            ),
            Err(RecordError::InvalidField { .. })
        ));
        assert!(matches!(
            alphabet.add_symbol("TWICE", vec![Field::raw("x", 1), Field::raw("x", 2)]),
            Err(RecordError::InvalidField { .. })
        ));
        assert_eq!(alphabet.size(), 3);
    }

    #[test_log::test]
    fn json_round_trip() {
        let alphabet = alphabet();
        let json = alphabet.to_json().unwrap();
        let restored = Alphabet::from_json(&json).unwrap();
        assert_eq!(restored, alphabet);
    }

    #[test_log::test]
    fn parse_record() {
        let json = r#"{
            "symbols": [
                { "name": "PING", "fields": [ { "name": "kw", "type": "constant", "bytes": [80, 73] } ] },
                { "name": "LEN", "fields": [ { "name": "n", "type": "integer", "width": "u16" } ], "codec": "fields" }
            ]
        }"#;
        let alphabet = Alphabet::from_json(json).unwrap();
        assert_eq!(alphabet.size(), 2);
        let len = alphabet.symbol_by_name("LEN").unwrap();
        assert_eq!(
            len.fields()[0].kind,
            FieldKind::Integer {
                width: IntWidth::U16,
                endianness: Endianness::Big
            }
        );
    }
}
