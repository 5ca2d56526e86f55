use thiserror::Error;

use crate::{IntWidth, SymbolId};

/// Raised when a symbol cannot be serialized with the given field values. This always points
/// to a programming or configuration error, so it is never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("value {value} of field `{field}` does not fit into {width:?}")]
    ValueOutOfRange {
        field: String,
        value: u64,
        width: IntWidth,
    },
    #[error("field `{field}` expects {expected} bytes, got {actual}")]
    LengthMismatch {
        field: String,
        expected: usize,
        actual: usize,
    },
    #[error("field `{field}` expects a value of type {expected}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
    },
    #[error("value given for constant field `{field}` differs from its definition")]
    ConstantMismatch { field: String },
    #[error("symbol `{symbol}` has no field `{field}`")]
    UnknownField { symbol: String, field: String },
    #[error("no codec registered under `{0}`")]
    UnknownCodec(String),
    #[error("symbol {0:?} is not part of the alphabet")]
    UnknownSymbol(SymbolId),
}

/// Raised when a persisted record does not describe a valid alphabet or automaton.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("symbol `{0}` is defined more than once")]
    DuplicateSymbol(String),
    #[error("reference to unknown symbol `{0}`")]
    UnknownSymbol(String),
    #[error("field `{field}` of symbol `{symbol}` is invalid: {reason}")]
    InvalidField {
        symbol: String,
        field: String,
        reason: &'static str,
    },
    #[error("could not (de)serialize record: {0}")]
    Json(#[from] serde_json::Error),
}
