use std::{fmt::Debug, sync::Arc};

use grammar_core::{math, Alphabet, FieldValues, Show, SymbolId};
use serde::{Deserialize, Serialize};

use crate::ModelError;

mod builder;
pub use builder::{AutomatonBuilder, TransitionBuilder};

mod dot;

/// Learned Mealy machines and their expansion into executable automata.
pub mod mealy;
pub use mealy::MealyMachine;

mod records;
pub use records::{AutomatonRecord, StateRecord, TransitionRecord};

/// Automata are shared between sessions as immutable snapshots. Extending a model produces a
/// new snapshot, sessions that are running keep the one they started with.
pub type Snapshot = Arc<Automaton>;

/// Index of a state within its [`Automaton`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub u32);

impl StateId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Debug for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Index of a transition within its [`Automaton`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransitionId(pub u32);

impl TransitionId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Debug for TransitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// The side of a conversation. On a transition it names the side that speaks; for a session it
/// names the side that is impersonated locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn opposite(self) -> Self {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

impl Show for Role {
    fn show(&self) -> String {
        match self {
            Role::Client => "client".to_string(),
            Role::Server => "server".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    #[default]
    Normal,
    /// A pseudo state in front of the conversation. Leaving it does not exchange anything.
    Start,
    /// Once reached, the session ends.
    Sink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub(crate) id: StateId,
    pub(crate) name: String,
    pub(crate) role: Role,
    pub(crate) kind: StateKind,
    pub(crate) transitions: Vec<TransitionId>,
}

impl State {
    pub fn id(&self) -> StateId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn kind(&self) -> StateKind {
        self.kind
    }

    /// Outgoing transitions in the order in which they were added.
    pub fn transitions(&self) -> &[TransitionId] {
        &self.transitions
    }
}

/// A labelled edge between two states. The role of a transition is the role of its source
/// state, it is fixed when the transition is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub(crate) id: TransitionId,
    pub(crate) name: String,
    pub(crate) source: StateId,
    pub(crate) target: StateId,
    pub(crate) input: Option<SymbolId>,
    pub(crate) outputs: Vec<SymbolId>,
    pub(crate) presets: math::OrderedMap<SymbolId, FieldValues>,
    pub(crate) unknown_output: bool,
    pub(crate) role: Role,
}

impl Transition {
    pub fn id(&self) -> TransitionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> StateId {
        self.source
    }

    pub fn target(&self) -> StateId {
        self.target
    }

    /// The symbol that triggers the transition, only informative during execution.
    pub fn input(&self) -> Option<SymbolId> {
        self.input
    }

    /// The symbols that may be exchanged on this transition, without duplicates.
    pub fn outputs(&self) -> &[SymbolId] {
        &self.outputs
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether a message that decodes as no symbol of the alphabet is a regular exchange on this
    /// transition rather than a divergence.
    pub fn expects_unknown(&self) -> bool {
        self.unknown_output
    }

    pub fn accepts(&self, symbol: SymbolId) -> bool {
        self.outputs.contains(&symbol)
    }

    /// Field values used when `symbol` is emitted on this transition.
    pub fn preset(&self, symbol: SymbolId) -> FieldValues {
        self.presets.get(&symbol).cloned().unwrap_or_default()
    }
}

/// A protocol grammar: states, the transitions between them and a designated initial state.
/// Automata are immutable, they are extended by going through [`Automaton::to_builder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Automaton {
    pub(crate) name: String,
    pub(crate) states: Vec<State>,
    pub(crate) transitions: Vec<Transition>,
    pub(crate) initial: StateId,
}

impl Automaton {
    pub fn builder<N: Into<String>>(name: N) -> AutomatonBuilder {
        AutomatonBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial(&self) -> StateId {
        self.initial
    }

    pub fn state(&self, id: StateId) -> Option<&State> {
        self.states.get(id.index())
    }

    pub fn state_by_name(&self, name: &str) -> Option<&State> {
        self.states.iter().find(|s| s.name == name)
    }

    pub fn states(&self) -> impl Iterator<Item = &State> + '_ {
        self.states.iter()
    }

    pub fn transition(&self, id: TransitionId) -> Option<&Transition> {
        self.transitions.get(id.index())
    }

    pub fn transitions(&self) -> impl Iterator<Item = &Transition> + '_ {
        self.transitions.iter()
    }

    pub fn transitions_from(&self, state: StateId) -> impl Iterator<Item = &Transition> + '_ {
        self.state(state)
            .into_iter()
            .flat_map(|s| s.transitions.iter())
            .filter_map(|t| self.transition(*t))
    }

    /// A state is terminal if it is a sink or has no outgoing transitions.
    pub fn is_terminal(&self, state: StateId) -> bool {
        self.state(state)
            .map_or(true, |s| s.kind == StateKind::Sink || s.transitions.is_empty())
    }

    pub fn size(&self) -> usize {
        self.states.len()
    }

    /// Checks that every symbol that is referenced exists in `alphabet`.
    pub fn validate(&self, alphabet: &Alphabet) -> Result<(), ModelError> {
        self.transitions
            .iter()
            .flat_map(|t| t.input.iter().chain(t.outputs.iter()))
            .find(|s| !alphabet.contains(**s))
            .map_or(Ok(()), |s| Err(ModelError::UnknownSymbol(*s)))
    }

    /// Starts a builder that contains everything this automaton contains. States and
    /// transitions can only be added, so identifiers remain valid in the extended automaton.
    pub fn to_builder(&self) -> AutomatonBuilder {
        AutomatonBuilder::from_automaton(self)
    }

    pub fn into_snapshot(self) -> Snapshot {
        Arc::new(self)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use grammar_core::Field;

    use super::*;

    /// HELLO, ACK and BYE, every symbol is a plain keyword.
    pub fn keywords() -> Alphabet {
        let mut alphabet = Alphabet::new();
        for name in ["HELLO", "ACK", "BYE"] {
            alphabet
                .add_symbol(name, vec![Field::constant("kw", name)])
                .unwrap();
        }
        alphabet
    }

    /// START -HELLO-> S1 -ACK-> S2 -BYE-> S1, all transitions spoken by the client.
    pub fn client_chain(alphabet: &Alphabet) -> Automaton {
        let [hello, ack, bye] = ["HELLO", "ACK", "BYE"].map(|n| alphabet.id_of(n).unwrap());
        let mut builder = AutomatonBuilder::new("chain");
        let start = builder.add_state("START", Role::Client).unwrap();
        let s1 = builder.add_state("S1", Role::Client).unwrap();
        let s2 = builder.add_state("S2", Role::Client).unwrap();
        builder.transition(start, s1).outputs([hello]).add().unwrap();
        builder.transition(s1, s2).outputs([ack]).add().unwrap();
        builder.transition(s2, s1).outputs([bye]).add().unwrap();
        builder.build().unwrap()
    }

    #[test_log::test]
    fn structure() {
        let alphabet = keywords();
        let automaton = client_chain(&alphabet);
        assert_eq!(automaton.size(), 3);
        assert_eq!(automaton.initial(), StateId(0));
        let s1 = automaton.state_by_name("S1").unwrap();
        let outgoing: Vec<_> = automaton.transitions_from(s1.id()).collect();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].outputs(), &[alphabet.id_of("ACK").unwrap()]);
        assert_eq!(outgoing[0].role(), Role::Client);
        assert!(!automaton.is_terminal(s1.id()));
        assert!(automaton.validate(&alphabet).is_ok());

        let mut small = Alphabet::new();
        small.add_symbol("HELLO", vec![]).unwrap();
        assert!(matches!(
            automaton.validate(&small),
            Err(ModelError::UnknownSymbol(_))
        ));
    }

    #[test_log::test]
    fn extension_keeps_snapshots() {
        let alphabet = keywords();
        let snapshot = client_chain(&alphabet).into_snapshot();
        let mut builder = snapshot.to_builder();
        let end = builder.add_sink_state("END", Role::Client).unwrap();
        let s2 = builder.state_id("S2").unwrap();
        builder
            .transition(s2, end)
            .outputs([alphabet.id_of("BYE").unwrap()])
            .add()
            .unwrap();
        let extended = builder.build().unwrap();

        assert_eq!(snapshot.size(), 3);
        assert_eq!(extended.size(), 4);
        assert!(extended.is_terminal(end));
        for state in snapshot.states() {
            assert_eq!(extended.state(state.id()).unwrap().name(), state.name());
        }
    }
}
