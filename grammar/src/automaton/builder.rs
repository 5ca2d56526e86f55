use grammar_core::{math, FieldValues, SymbolId};
use itertools::Itertools;
use tracing::trace;

use super::{Automaton, Role, State, StateId, StateKind, Transition, TransitionId};
use crate::ModelError;

/// Assembles an [`Automaton`]. States and transitions can only be added, never removed.
#[derive(Debug, Clone, Default)]
pub struct AutomatonBuilder {
    name: String,
    states: Vec<State>,
    transitions: Vec<Transition>,
    initial: Option<StateId>,
}

impl AutomatonBuilder {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub(crate) fn from_automaton(automaton: &Automaton) -> Self {
        Self {
            name: automaton.name.clone(),
            states: automaton.states.clone(),
            transitions: automaton.transitions.clone(),
            initial: Some(automaton.initial),
        }
    }

    pub fn add_state<N: Into<String>>(&mut self, name: N, role: Role) -> Result<StateId, ModelError> {
        self.push_state(name.into(), role, StateKind::Normal)
    }

    /// Adds a pseudo state, leaving it does not exchange any message.
    pub fn add_start_state<N: Into<String>>(&mut self, name: N) -> Result<StateId, ModelError> {
        self.push_state(name.into(), Role::Client, StateKind::Start)
    }

    /// Adds a state in which every session ends.
    pub fn add_sink_state<N: Into<String>>(&mut self, name: N, role: Role) -> Result<StateId, ModelError> {
        self.push_state(name.into(), role, StateKind::Sink)
    }

    fn push_state(&mut self, name: String, role: Role, kind: StateKind) -> Result<StateId, ModelError> {
        if self.state_id(&name).is_some() {
            return Err(ModelError::DuplicateState(name));
        }
        let id = StateId(self.states.len() as u32);
        trace!("adding {kind:?} state {name} as {id:?}");
        self.states.push(State {
            id,
            name,
            role,
            kind,
            transitions: vec![],
        });
        Ok(id)
    }

    pub fn state_id(&self, name: &str) -> Option<StateId> {
        self.states.iter().find(|s| s.name == name).map(|s| s.id)
    }

    /// Sets the state in which sessions begin. Without a call to this, it is the first state.
    pub fn set_initial(&mut self, state: StateId) -> Result<(), ModelError> {
        self.check(state)?;
        self.initial = Some(state);
        Ok(())
    }

    /// Starts a transition from `source` to `target`, finish it with [`TransitionBuilder::add`].
    pub fn transition(&mut self, source: StateId, target: StateId) -> TransitionBuilder<'_> {
        TransitionBuilder {
            builder: self,
            source,
            target,
            name: None,
            input: None,
            outputs: vec![],
            presets: math::OrderedMap::default(),
            unknown_output: false,
        }
    }

    fn check(&self, state: StateId) -> Result<&State, ModelError> {
        self.states
            .get(state.index())
            .ok_or_else(|| ModelError::UnknownState(format!("{state:?}")))
    }

    pub fn build(self) -> Result<Automaton, ModelError> {
        let initial = match self.initial {
            Some(initial) => initial,
            None if self.states.is_empty() => return Err(ModelError::Empty),
            None => StateId(0),
        };
        Ok(Automaton {
            name: self.name,
            states: self.states,
            transitions: self.transitions,
            initial,
        })
    }

    /// Builds and wraps the result in a shareable snapshot.
    pub fn publish(self) -> Result<super::Snapshot, ModelError> {
        self.build().map(Automaton::into_snapshot)
    }
}

/// Collects the properties of one transition.
#[derive(Debug)]
pub struct TransitionBuilder<'a> {
    builder: &'a mut AutomatonBuilder,
    source: StateId,
    target: StateId,
    name: Option<String>,
    input: Option<SymbolId>,
    outputs: Vec<SymbolId>,
    presets: math::OrderedMap<SymbolId, FieldValues>,
    unknown_output: bool,
}

impl<'a> TransitionBuilder<'a> {
    pub fn name<N: Into<String>>(mut self, name: N) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn input(mut self, symbol: SymbolId) -> Self {
        self.input = Some(symbol);
        self
    }

    /// Adds symbols that may be exchanged, duplicates are ignored.
    pub fn outputs<I: IntoIterator<Item = SymbolId>>(mut self, symbols: I) -> Self {
        self.outputs.extend(symbols);
        self
    }

    /// Marks a message that does not decode as a regular output of this transition.
    pub fn expecting_unknown(mut self) -> Self {
        self.unknown_output = true;
        self
    }

    /// Field values that are used when `symbol` is emitted on this transition.
    pub fn preset(mut self, symbol: SymbolId, values: FieldValues) -> Self {
        self.presets.insert(symbol, values);
        self
    }

    pub fn add(self) -> Result<TransitionId, ModelError> {
        let role = self.builder.check(self.source)?.role;
        self.builder.check(self.target)?;

        let id = TransitionId(self.builder.transitions.len() as u32);
        let name = self.name.unwrap_or_else(|| format!("t{}", id.0));
        trace!("adding transition {name} {:?} -> {:?}", self.source, self.target);
        self.builder.states[self.source.index()].transitions.push(id);
        self.builder.transitions.push(Transition {
            id,
            name,
            source: self.source,
            target: self.target,
            input: self.input,
            outputs: self.outputs.into_iter().unique().collect(),
            presets: self.presets,
            unknown_output: self.unknown_output,
            role,
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_and_unknown_states() {
        let mut builder = AutomatonBuilder::new("test");
        let a = builder.add_state("A", Role::Server).unwrap();
        assert!(matches!(
            builder.add_sink_state("A", Role::Client),
            Err(ModelError::DuplicateState(_))
        ));
        assert!(matches!(
            builder.transition(a, StateId(7)).add(),
            Err(ModelError::UnknownState(_))
        ));
        let t = builder
            .transition(a, a)
            .outputs([SymbolId(1), SymbolId(0), SymbolId(1)])
            .add()
            .unwrap();
        let automaton = builder.build().unwrap();
        let transition = automaton.transition(t).unwrap();
        assert_eq!(transition.outputs(), &[SymbolId(1), SymbolId(0)]);
        assert_eq!(transition.role(), Role::Server);
        assert_eq!(transition.name(), "t0");
    }

    #[test]
    fn empty() {
        assert!(matches!(
            AutomatonBuilder::new("nothing").build(),
            Err(ModelError::Empty)
        ));
    }
}
