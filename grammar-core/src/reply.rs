use serde::{Deserialize, Serialize};

use crate::{Show, SymbolId};

/// What a peer answered to a single input symbol. This is the output type of the Mealy
/// machines that are learned and simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reply {
    /// Nothing was received before the reception timeout expired.
    Silence,
    /// Bytes were received that do not decode as any known symbol.
    Unknown,
    /// The received bytes decode as the given symbol.
    Symbol(SymbolId),
}

impl Reply {
    pub fn symbol(&self) -> Option<SymbolId> {
        match self {
            Reply::Symbol(s) => Some(*s),
            _ => None,
        }
    }

    pub fn is_silence(&self) -> bool {
        matches!(self, Reply::Silence)
    }
}

impl From<SymbolId> for Reply {
    fn from(value: SymbolId) -> Self {
        Reply::Symbol(value)
    }
}

impl Show for Reply {
    fn show(&self) -> String {
        match self {
            Reply::Silence => "_".to_string(),
            Reply::Unknown => "?".to_string(),
            Reply::Symbol(s) => s.show(),
        }
    }
}
