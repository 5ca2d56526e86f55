use grammar_core::{math, Alphabet, FieldValues, RecordError, SymbolId};
use serde::{Deserialize, Serialize};

use super::{Automaton, AutomatonBuilder, Role, StateKind};
use crate::ModelError;

/// Neutral, persistable description of an [`Automaton`]. Symbols and states are referred to
/// by name, so a record can be read back against any alphabet that defines those names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomatonRecord {
    pub name: String,
    pub initial: String,
    pub states: Vec<StateRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub kind: StateKind,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Messages that decode as no symbol are expected as well.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unknown: bool,
    #[serde(default, skip_serializing_if = "math::OrderedMap::is_empty")]
    pub presets: math::OrderedMap<String, FieldValues>,
}

fn symbol_name(alphabet: &Alphabet, symbol: SymbolId) -> Result<String, ModelError> {
    alphabet
        .name_of(symbol)
        .map(str::to_string)
        .ok_or(ModelError::UnknownSymbol(symbol))
}

fn symbol_id(alphabet: &Alphabet, name: &str) -> Result<SymbolId, ModelError> {
    alphabet
        .id_of(name)
        .ok_or_else(|| RecordError::UnknownSymbol(name.to_string()).into())
}

impl Automaton {
    pub fn to_record(&self, alphabet: &Alphabet) -> Result<AutomatonRecord, ModelError> {
        let states = self
            .states
            .iter()
            .map(|state| -> Result<StateRecord, ModelError> {
                let transitions = self
                    .transitions_from(state.id)
                    .map(|t| -> Result<TransitionRecord, ModelError> {
                        Ok(TransitionRecord {
                            name: Some(t.name.clone()),
                            target: self.states[t.target.index()].name.clone(),
                            input: t.input.map(|s| symbol_name(alphabet, s)).transpose()?,
                            outputs: t
                                .outputs
                                .iter()
                                .map(|s| symbol_name(alphabet, *s))
                                .collect::<Result<_, _>>()?,
                            unknown: t.unknown_output,
                            presets: t
                                .presets
                                .iter()
                                .map(|(s, v)| Ok::<_, ModelError>((symbol_name(alphabet, *s)?, v.clone())))
                                .collect::<Result<_, ModelError>>()?,
                        })
                    })
                    .collect::<Result<_, ModelError>>()?;
                Ok(StateRecord {
                    name: state.name.clone(),
                    role: state.role,
                    kind: state.kind,
                    transitions,
                })
            })
            .collect::<Result<_, ModelError>>()?;
        Ok(AutomatonRecord {
            name: self.name.clone(),
            initial: self.states[self.initial.index()].name.clone(),
            states,
        })
    }

    /// Restores an automaton. All states are created before any transition, so transitions
    /// may refer to states that are listed later.
    pub fn from_record(record: &AutomatonRecord, alphabet: &Alphabet) -> Result<Self, ModelError> {
        let mut builder = AutomatonBuilder::new(record.name.clone());
        for state in &record.states {
            match state.kind {
                StateKind::Normal => builder.add_state(state.name.clone(), state.role)?,
                StateKind::Start => builder.add_start_state(state.name.clone())?,
                StateKind::Sink => builder.add_sink_state(state.name.clone(), state.role)?,
            };
        }
        let lookup = |builder: &AutomatonBuilder, name: &str| {
            builder
                .state_id(name)
                .ok_or_else(|| ModelError::UnknownState(name.to_string()))
        };
        for state in &record.states {
            let source = lookup(&builder, &state.name)?;
            for transition in &state.transitions {
                let target = lookup(&builder, &transition.target)?;
                let mut edge = builder.transition(source, target);
                if let Some(name) = &transition.name {
                    edge = edge.name(name.clone());
                }
                if let Some(input) = &transition.input {
                    edge = edge.input(symbol_id(alphabet, input)?);
                }
                for output in &transition.outputs {
                    edge = edge.outputs([symbol_id(alphabet, output)?]);
                }
                for (symbol, values) in &transition.presets {
                    edge = edge.preset(symbol_id(alphabet, symbol)?, values.clone());
                }
                if transition.unknown {
                    edge = edge.expecting_unknown();
                }
                edge.add()?;
            }
        }
        let initial = lookup(&builder, &record.initial)?;
        builder.set_initial(initial)?;
        builder.build()
    }

    pub fn to_json(&self, alphabet: &Alphabet) -> Result<String, ModelError> {
        Ok(serde_json::to_string_pretty(&self.to_record(alphabet)?)?)
    }

    pub fn from_json(json: &str, alphabet: &Alphabet) -> Result<Self, ModelError> {
        Self::from_record(&serde_json::from_str(json)?, alphabet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automaton::tests::{client_chain, keywords};

    #[test_log::test]
    fn json_round_trip() {
        let alphabet = keywords();
        let automaton = client_chain(&alphabet);
        let json = automaton.to_json(&alphabet).unwrap();
        assert_eq!(Automaton::from_json(&json, &alphabet).unwrap(), automaton);
    }

    #[test_log::test]
    fn parse_record() {
        let alphabet = keywords();
        let json = r#"{
            "name": "server",
            "initial": "IDLE",
            "states": [
                { "name": "IDLE", "role": "client", "transitions": [
                    { "target": "BUSY", "outputs": ["HELLO"] }
                ] },
                { "name": "BUSY", "role": "server", "transitions": [
                    { "name": "answer", "target": "DONE", "outputs": ["ACK", "BYE"] }
                ] },
                { "name": "DONE", "role": "server", "kind": "sink" }
            ]
        }"#;
        let automaton = Automaton::from_json(json, &alphabet).unwrap();
        assert_eq!(automaton.size(), 3);
        let busy = automaton.state_by_name("BUSY").unwrap();
        let answer = automaton.transitions_from(busy.id()).next().unwrap();
        assert_eq!(answer.name(), "answer");
        assert_eq!(answer.role(), Role::Server);
        assert_eq!(answer.outputs().len(), 2);
        assert!(automaton.is_terminal(automaton.state_by_name("DONE").unwrap().id()));
    }

    #[test_log::test]
    fn unresolved_references() {
        let alphabet = keywords();
        let unknown_state = r#"{ "name": "x", "initial": "A", "states": [
            { "name": "A", "role": "client", "transitions": [ { "target": "B", "outputs": [] } ] }
        ] }"#;
        assert!(matches!(
            Automaton::from_json(unknown_state, &alphabet),
            Err(ModelError::UnknownState(_))
        ));
        let unknown_symbol = r#"{ "name": "x", "initial": "A", "states": [
            { "name": "A", "role": "client", "transitions": [ { "target": "A", "outputs": ["PING"] } ] }
        ] }"#;
        assert!(matches!(
            Automaton::from_json(unknown_symbol, &alphabet),
            Err(ModelError::Record(RecordError::UnknownSymbol(_)))
        ));
    }
}
