use std::{io, time::Duration};

use grammar_core::{EncodingError, RecordError, SymbolId};
use thiserror::Error;

/// A channel could not be opened. This is fatal for the session that attempted it, the
/// caller may retry.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection to {0} was refused")]
    Refused(String),
    #[error("could not establish a connection within {0:?}")]
    Timeout(Duration),
    #[error("could not open channel: {0}")]
    Io(#[from] io::Error),
}

/// An I/O failure in the middle of a session. Terminates the current session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel is not open")]
    NotOpen,
    #[error("channel was closed by the peer")]
    Closed,
    #[error("channel was closed while an operation was in flight")]
    Cancelled,
    #[error("write timed out")]
    Timeout,
    #[error("partial write, {written} of {expected} bytes were sent")]
    Partial { written: usize, expected: usize },
    #[error("write limit of {0} messages reached")]
    WriteLimit(usize),
    #[error("no peer is known to send to")]
    NoPeer,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Failure of [`crate::AbstractionLayer::write_symbol`].
#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Reasons for which a session is aborted. Protocol divergences are not among them.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

impl From<WriteError> for SessionError {
    fn from(value: WriteError) -> Self {
        match value {
            WriteError::Encoding(e) => SessionError::Encoding(e),
            WriteError::Transport(e) => SessionError::Transport(e),
        }
    }
}

/// Raised while an automaton is assembled or restored from a record.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("state `{0}` is defined more than once")]
    DuplicateState(String),
    #[error("reference to unknown state `{0}`")]
    UnknownState(String),
    #[error("automaton has no states")]
    Empty,
    #[error("symbol {0:?} is not part of the alphabet")]
    UnknownSymbol(SymbolId),
    #[error(transparent)]
    Record(#[from] RecordError),
}

impl From<serde_json::Error> for ModelError {
    fn from(value: serde_json::Error) -> Self {
        ModelError::Record(RecordError::Json(value))
    }
}
