//! Execution of protocol grammars against live peers.
//!
//! A grammar is an [`Automaton`]: a directed multigraph of [`State`]s connected by [`Transition`]s,
//! where every transition names the symbols that may be exchanged when it is taken, and carries a
//! [`Role`] that determines which side of the conversation speaks. Executing a transition moves
//! bytes over a [`Channel`] through the [`AbstractionLayer`], which turns symbols into bytes and
//! received bytes back into symbols.
//!
//! The [`SessionRunner`] walks an automaton over one channel connection, either impersonating the
//! client or the server, and records the names of all visited states. Protocol mismatches are
//! never fatal: they are logged and reported as [`Divergence`]s while the session carries on. Only
//! transport failures end a session early.
//!
//! Learned grammars are represented as [`MealyMachine`]s, which can be converted into an
//! executable automaton and played by the [`PeerSimulator`].
#![deny(rustdoc::broken_intra_doc_links)]

pub use grammar_core as core;

mod error;
pub use error::{ConnectionError, ModelError, SessionError, TransportError, WriteError};

mod config;
pub use config::{millis, DivergencePolicy, ExecutionConfig};

/// Transport channels: the open/send/receive/close capability the abstraction layer builds on.
pub mod channel;
pub use channel::{Channel, ChannelConfig, CloseHandle};

mod abstraction;
pub use abstraction::{Abstraction, AbstractionLayer};

/// States, transitions and the automata made of them.
pub mod automaton;
pub use automaton::{
    Automaton, AutomatonBuilder, AutomatonRecord, MealyMachine, Role, Snapshot, State, StateId,
    StateKind, Transition, TransitionId,
};

/// Strategies for picking the symbol that is emitted on a transition.
pub mod select;
pub use select::{ScriptedSelector, SymbolSelector, UniformSelector, WeightedSelector};

mod event;
pub use event::{Divergence, ExecutionEvent};

mod execution;
pub use execution::{Exchange, Execution, Step};

mod session;
pub use session::{
    run_session, run_sessions, Session, SessionEnd, SessionRunner, SessionTrace, Steps,
};

mod simulator;
pub use simulator::{PeerSimulator, SimulatorHandle};

/// The prelude is supposed to make using this package easier. Including everything, i.e.
/// `use grammar::prelude::*;` should be enough to build and run automata.
pub mod prelude {
    pub use super::{
        channel::memory, Abstraction, AbstractionLayer, Automaton, AutomatonBuilder, Channel,
        ChannelConfig, CloseHandle, ConnectionError, Divergence, DivergencePolicy, Exchange,
        ExecutionConfig, ExecutionEvent, MealyMachine, ModelError, Role, ScriptedSelector,
        SessionEnd, SessionError, SessionRunner, SessionTrace, Snapshot, State, StateId,
        StateKind, Step, SymbolSelector, Transition, TransitionId, TransportError,
        UniformSelector, WeightedSelector, WriteError,
    };
    pub use grammar_core::prelude::*;
}
