use std::{sync::Arc, time::Duration};

use grammar_core::{Alphabet, CodecRegistry, EncodingError, FieldValues, Reply, Show, SymbolId};
use itertools::Itertools;
use tracing::{debug, trace};

use crate::{channel::CloseHandle, Channel, ChannelConfig, ConnectionError, TransportError, WriteError};

/// The result of mapping received bytes back to a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Abstraction {
    /// The bytes decode as one of the expected symbols.
    Matched(SymbolId),
    /// The bytes decode as a symbol of the alphabet that was not expected.
    KnownButUnexpected(SymbolId),
    /// The bytes do not decode as any known symbol, or nothing was received.
    Unknown,
}

impl Abstraction {
    pub fn symbol(&self) -> Option<SymbolId> {
        match self {
            Abstraction::Matched(s) | Abstraction::KnownButUnexpected(s) => Some(*s),
            Abstraction::Unknown => None,
        }
    }

    /// Converts into the reply of a membership query, `bytes` being what was received.
    pub fn reply(&self, bytes: &[u8]) -> Reply {
        match self.symbol() {
            Some(symbol) => Reply::Symbol(symbol),
            None if bytes.is_empty() => Reply::Silence,
            None => Reply::Unknown,
        }
    }

    /// Re-evaluates the abstraction with regard to a different set of expected symbols.
    pub fn relative_to(&self, expected: &[SymbolId]) -> Abstraction {
        match self.symbol() {
            Some(s) if expected.contains(&s) => Abstraction::Matched(s),
            Some(s) => Abstraction::KnownButUnexpected(s),
            None => Abstraction::Unknown,
        }
    }
}

/// Converts between symbols and the bytes that travel over a [`Channel`].
///
/// Writing specializes a symbol with concrete field values and sends the resulting bytes as one
/// message. Reading receives one message and tries to decode it as a symbol of the alphabet.
/// If the whole message does not decode but starts with a symbol, that symbol is returned and
/// the remaining bytes are kept for the next read.
#[derive(Debug)]
pub struct AbstractionLayer<C = Box<dyn Channel>> {
    channel: C,
    alphabet: Arc<Alphabet>,
    codecs: Arc<CodecRegistry>,
    write_limit: Option<usize>,
    writes: usize,
    pending: Vec<u8>,
}

impl AbstractionLayer<Box<dyn Channel>> {
    /// Builds the channel described by `config` and opens it.
    pub fn connect(config: &ChannelConfig, alphabet: Arc<Alphabet>) -> Result<Self, ConnectionError> {
        let mut layer = Self::new(config.build(), alphabet);
        layer.open()?;
        Ok(layer)
    }
}

impl<C: Channel> AbstractionLayer<C> {
    pub fn new(channel: C, alphabet: Arc<Alphabet>) -> Self {
        Self {
            channel,
            alphabet,
            codecs: Arc::new(CodecRegistry::default()),
            write_limit: None,
            writes: 0,
            pending: Vec::new(),
        }
    }

    pub fn with_codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = codecs;
        self
    }

    /// Limits the number of messages written between two calls to
    /// [`AbstractionLayer::reset_write_counter`].
    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }

    pub fn alphabet(&self) -> &Arc<Alphabet> {
        &self.alphabet
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.channel.close_handle()
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn reset_write_counter(&mut self) {
        self.writes = 0;
    }

    pub fn open(&mut self) -> Result<(), ConnectionError> {
        debug!("opening {}", self.channel.describe());
        self.pending.clear();
        self.channel.open()
    }

    /// Encodes `symbol` with `values` and sends it. Returns the number of bytes written.
    pub fn write_symbol(&mut self, symbol: SymbolId, values: &FieldValues) -> Result<usize, WriteError> {
        let definition = self
            .alphabet
            .symbol(symbol)
            .ok_or(EncodingError::UnknownSymbol(symbol))?;
        let bytes = self.codecs.encode(definition, values)?;
        // a closed channel reports its own failure, the limit only applies to open ones
        if let Some(limit) = self.write_limit {
            if self.channel.is_open() && self.writes >= limit {
                return Err(TransportError::WriteLimit(limit).into());
            }
        }
        let written = self.channel.send(&bytes)?;
        if written != bytes.len() {
            return Err(TransportError::Partial {
                written,
                expected: bytes.len(),
            }
            .into());
        }
        self.writes += 1;
        debug!(
            "wrote {} {} ({written} bytes)",
            definition.name(),
            values.show()
        );
        Ok(written)
    }

    /// Receives one message and decodes it against the whole alphabet. A decoded message is
    /// always [`Abstraction::Matched`].
    pub fn read_symbol(&mut self, timeout: Duration) -> Result<(Abstraction, Vec<u8>), TransportError> {
        self.receive_symbol(None, timeout)
    }

    /// Receives one message and decodes it, preferring the `expected` symbols. If nothing is
    /// received within `timeout`, the result is [`Abstraction::Unknown`] with no bytes.
    pub fn read_symbol_expecting(
        &mut self,
        expected: &[SymbolId],
        timeout: Duration,
    ) -> Result<(Abstraction, Vec<u8>), TransportError> {
        self.receive_symbol(Some(expected), timeout)
    }

    /// Bytes that arrived behind a decoded symbol and are handed out by the next read.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    fn receive_symbol(
        &mut self,
        expected: Option<&[SymbolId]>,
        timeout: Duration,
    ) -> Result<(Abstraction, Vec<u8>), TransportError> {
        let mut bytes = if self.pending.is_empty() {
            self.channel.receive(timeout)?
        } else {
            trace!("reading {} buffered bytes", self.pending.len());
            std::mem::take(&mut self.pending)
        };
        let (abstraction, consumed) = self.split_message(&bytes, expected);
        if consumed < bytes.len() {
            self.pending = bytes.split_off(consumed);
            trace!("{} bytes left for the next read", self.pending.len());
        }
        self.log_reception(&abstraction, &bytes);
        Ok((abstraction, bytes))
    }

    /// Maps `bytes` to a symbol. Expected symbols are tried first, so they win if several
    /// symbols of the alphabet decode the same bytes. Only decodings that consume the complete
    /// message count.
    pub fn abstract_bytes(&self, bytes: &[u8], expected: Option<&[SymbolId]>) -> Abstraction {
        if bytes.is_empty() {
            return Abstraction::Unknown;
        }
        if let Some(expected) = expected {
            if let Some(symbol) = self.decode_exact(bytes, expected.iter().copied()) {
                return Abstraction::Matched(symbol);
            }
        }
        match self.decode_exact(bytes, self.alphabet.universe()) {
            Some(symbol) if expected.is_some() => Abstraction::KnownButUnexpected(symbol),
            Some(symbol) => Abstraction::Matched(symbol),
            None => Abstraction::Unknown,
        }
    }

    /// Like [`AbstractionLayer::abstract_bytes`], but if the complete message does not decode,
    /// a leading symbol is split off, as a stream transport may deliver several messages in one
    /// read. Returns the abstraction of the first message and its length.
    fn split_message(&self, bytes: &[u8], expected: Option<&[SymbolId]>) -> (Abstraction, usize) {
        let whole = self.abstract_bytes(bytes, expected);
        if whole != Abstraction::Unknown || bytes.is_empty() {
            return (whole, bytes.len());
        }
        let first = expected
            .into_iter()
            .flatten()
            .copied()
            .find_map(|id| self.decode_prefix(bytes, id).map(|used| (Abstraction::Matched(id), used)))
            .or_else(|| {
                self.alphabet.universe().find_map(|id| {
                    let abstraction = match expected {
                        Some(_) => Abstraction::KnownButUnexpected(id),
                        None => Abstraction::Matched(id),
                    };
                    self.decode_prefix(bytes, id).map(|used| (abstraction, used))
                })
            });
        first.unwrap_or((Abstraction::Unknown, bytes.len()))
    }

    /// Length of the proper, non-empty prefix of `bytes` that decodes as `id`.
    fn decode_prefix(&self, bytes: &[u8], id: SymbolId) -> Option<usize> {
        let symbol = self.alphabet.symbol(id)?;
        self.codecs
            .decode(bytes, std::slice::from_ref(&symbol))
            .map(|(_, consumed)| consumed)
            .filter(|consumed| (1..bytes.len()).contains(consumed))
    }

    fn decode_exact<I: IntoIterator<Item = SymbolId>>(&self, bytes: &[u8], candidates: I) -> Option<SymbolId> {
        candidates.into_iter().find(|id| {
            self.alphabet.symbol(*id).is_some_and(|symbol| {
                self.codecs
                    .decode(bytes, std::slice::from_ref(&symbol))
                    .is_some_and(|(_, consumed)| consumed == bytes.len())
            })
        })
    }

    fn log_reception(&self, abstraction: &Abstraction, bytes: &[u8]) {
        match abstraction.symbol() {
            Some(symbol) => debug!(
                "received {} ({} bytes)",
                self.alphabet.show_symbol(symbol),
                bytes.len()
            ),
            None if bytes.is_empty() => trace!("nothing received"),
            None => debug!(
                "received {} bytes that do not decode: {:02x}",
                bytes.len(),
                bytes.iter().take(32).format("")
            ),
        }
    }

    /// Closes the underlying channel, closing twice is harmless.
    pub fn close(&mut self) {
        if self.channel.is_open() {
            debug!("closing {}", self.channel.describe());
        }
        self.pending.clear();
        self.channel.close();
    }
}
