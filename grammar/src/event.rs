use grammar_core::SymbolId;

use crate::{Role, StateId, TransitionId};

/// A received message that does not fit the transition that was executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Divergence {
    /// A symbol of the alphabet arrived that the transition does not accept.
    Unexpected { expected: Vec<SymbolId>, received: SymbolId },
    /// The message did not decode as any symbol. `bytes` is empty if nothing arrived at all.
    Unknown { bytes: Vec<u8> },
}

impl Divergence {
    pub fn is_silence(&self) -> bool {
        matches!(self, Divergence::Unknown { bytes } if bytes.is_empty())
    }
}

/// Progress notifications of a running session, see [`crate::SessionRunner::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    SessionStarted { automaton: String, role: Role },
    /// Emitted before any I/O of the transition. When several transitions wait for the same
    /// message, each of them is started and only the one that is taken finishes.
    TransitionStarted { transition: TransitionId, name: String },
    TransitionFinished { transition: TransitionId, target: StateId },
    Diverged { transition: TransitionId, divergence: Divergence },
    SessionEnded { steps: usize },
}
