//! Core vocabulary for grammar inference: message templates ([`Symbol`]s) made of typed
//! [`Field`]s, the [`Alphabet`] of all known symbols, and the [`SymbolCodec`] capability that
//! turns a symbol plus [`FieldValues`] into bytes and back.
//!
//! The crates `grammar` and `grammar-learning` build on these definitions: the former executes
//! automata over live transport channels, the latter infers automata through membership queries.
//! Symbols are referred to by their [`SymbolId`] everywhere outside of this crate, which keeps words,
//! observation tables and transitions cheap to copy and hash.
#![deny(rustdoc::broken_intra_doc_links)]

/// Defines some mathematical objects that are used such as bijections,
/// sets and mappings.
pub mod math;

mod show;
pub use show::{show_duration, Show};

/// Symbols, their typed fields and the values that can be assigned to those fields.
pub mod symbol;
pub use symbol::{Endianness, Field, FieldKind, FieldValue, FieldValues, IntWidth, Symbol, SymbolId};

/// The symbol codec capability together with the built-in field codec.
pub mod codec;
pub use codec::{CodecRef, CodecRegistry, FieldCodec, SymbolCodec};

/// The alphabet, i.e. the collection of all symbols that are known for a protocol.
pub mod alphabet;
pub use alphabet::{Alphabet, AlphabetRecord, SymbolRecord};

mod reply;
pub use reply::Reply;

mod error;
pub use error::{EncodingError, RecordError};

/// A word is a finite sequence of symbols, this is what membership queries are made of.
pub type Word = Vec<SymbolId>;

/// The prelude is supposed to make using this package easier. Including everything, i.e.
/// `use grammar_core::prelude::*;` should be enough to work with symbols and alphabets.
pub mod prelude {
    pub use super::{
        math, Alphabet, AlphabetRecord, CodecRef, CodecRegistry, EncodingError, Endianness,
        Field, FieldCodec, FieldKind, FieldValue, FieldValues, IntWidth, RecordError, Reply,
        Show, Symbol, SymbolCodec, SymbolId, SymbolRecord, Word,
    };
}
