use std::collections::VecDeque;

use grammar_core::{math, Alphabet, Reply, Show, SymbolId, Word};
use itertools::Itertools;
use tracing::trace;

use super::{Automaton, AutomatonBuilder, Role};
use crate::ModelError;

/// A deterministic Mealy machine over symbols, producing one [`Reply`] for every input symbol.
/// This is what learning produces and what the peer simulator plays.
///
/// Missing edges are not an error: an input for which no edge exists is answered with
/// [`Reply::Silence`] and leaves the state unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MealyMachine {
    inputs: Vec<SymbolId>,
    states: usize,
    initial: usize,
    edges: math::Map<(usize, SymbolId), (Reply, usize)>,
}

impl MealyMachine {
    /// Creates a machine with a single (initial) state and no edges.
    pub fn new<I: IntoIterator<Item = SymbolId>>(inputs: I) -> Self {
        Self {
            inputs: inputs.into_iter().unique().collect(),
            states: 1,
            initial: 0,
            edges: math::Map::default(),
        }
    }

    pub fn add_state(&mut self) -> usize {
        self.states += 1;
        self.states - 1
    }

    /// Adds or replaces the edge for `input` in `source`. Returns the replaced edge.
    pub fn add_edge(
        &mut self,
        source: usize,
        input: SymbolId,
        reply: Reply,
        target: usize,
    ) -> Option<(Reply, usize)> {
        assert!(source < self.states && target < self.states, "state does not exist");
        if !self.inputs.contains(&input) {
            self.inputs.push(input);
        }
        self.edges.insert((source, input), (reply, target))
    }

    pub fn set_initial(&mut self, state: usize) {
        assert!(state < self.states, "state does not exist");
        self.initial = state;
    }

    pub fn initial(&self) -> usize {
        self.initial
    }

    pub fn size(&self) -> usize {
        self.states
    }

    pub fn inputs(&self) -> &[SymbolId] {
        &self.inputs
    }

    pub fn edge(&self, state: usize, input: SymbolId) -> Option<(Reply, usize)> {
        self.edges.get(&(state, input)).copied()
    }

    /// Iterates over all edges, ordered by source state and input.
    pub fn edges(&self) -> impl Iterator<Item = (usize, SymbolId, Reply, usize)> + '_ {
        self.edges
            .iter()
            .map(|((q, a), (o, p))| (*q, *a, *o, *p))
            .sorted()
    }

    /// Every state has an edge for every input.
    pub fn is_complete(&self) -> bool {
        (0..self.states)
            .cartesian_product(self.inputs.iter())
            .all(|(q, a)| self.edges.contains_key(&(q, *a)))
    }

    pub fn step(&self, state: usize, input: SymbolId) -> (Reply, usize) {
        self.edge(state, input).unwrap_or((Reply::Silence, state))
    }

    /// Runs `word` from `state` and returns the replies together with the reached state.
    pub fn run_from(&self, state: usize, word: &[SymbolId]) -> (Vec<Reply>, usize) {
        word.iter()
            .fold((Vec::with_capacity(word.len()), state), |(mut out, q), a| {
                let (reply, p) = self.step(q, *a);
                out.push(reply);
                (out, p)
            })
    }

    /// The replies produced when `word` is read from the initial state.
    pub fn output_trace(&self, word: &[SymbolId]) -> Vec<Reply> {
        self.run_from(self.initial, word).0
    }

    /// The reply to the last symbol of `word`, `None` for the empty word.
    pub fn transform(&self, word: &[SymbolId]) -> Option<Reply> {
        self.output_trace(word).pop()
    }

    /// Attempts to construct a word that separates the two machines, meaning it produces
    /// different outputs when run in both. Explores the product breadth first, so the witness
    /// is a shortest one. If no such word exists, returns `None`.
    pub fn witness_inequivalence(&self, other: &MealyMachine) -> Option<Word> {
        let inputs = self
            .inputs
            .iter()
            .chain(other.inputs.iter())
            .copied()
            .unique()
            .collect_vec();
        let mut seen = math::Set::default();
        let mut queue = VecDeque::from([(vec![], self.initial, other.initial)]);
        seen.insert((self.initial, other.initial));

        while let Some((access, l, r)) = queue.pop_front() {
            for a in &inputs {
                let (left, p) = self.step(l, *a);
                let (right, s) = other.step(r, *a);
                let mut word: Word = access.clone();
                word.push(*a);
                if left != right {
                    trace!("separated by {}, {} vs {}", word.show(), left.show(), right.show());
                    return Some(word);
                }
                if seen.insert((p, s)) {
                    queue.push_back((word, p, s));
                }
            }
        }
        None
    }

    pub fn equivalent(&self, other: &MealyMachine) -> bool {
        self.witness_inequivalence(other).is_none()
    }

    /// Expands the machine into an executable automaton for sessions in which the local side
    /// is the client. Every edge `q --a/b--> p` becomes a client transition from `q` sending
    /// `a` into an intermediate server state, followed by a server transition to `p` that
    /// expects `b`. If `b` is unknown, the second transition expects a message that does not
    /// decode. If `b` is silence, it exchanges nothing.
    pub fn to_automaton<N: Into<String>>(&self, name: N, alphabet: &Alphabet) -> Result<Automaton, ModelError> {
        let mut builder = AutomatonBuilder::new(name);
        for q in 0..self.states {
            builder.add_state(format!("q{q}"), Role::Client)?;
        }
        builder.set_initial(super::StateId(self.initial as u32))?;

        for (q, a, reply, p) in self.edges() {
            if !alphabet.contains(a) {
                return Err(ModelError::UnknownSymbol(a));
            }
            let label = alphabet.show_symbol(a);
            let source = super::StateId(q as u32);
            let target = super::StateId(p as u32);
            let middle = builder.add_state(format!("q{q}.{label}"), Role::Server)?;
            builder
                .transition(source, middle)
                .name(format!("q{q}:{label}"))
                .input(a)
                .outputs([a])
                .add()?;
            let answer = builder
                .transition(middle, target)
                .name(format!("q{q}:{label}/{}", alphabet.show_reply(&reply)))
                .input(a)
                .outputs(reply.symbol());
            match reply {
                Reply::Unknown => answer.expecting_unknown().add()?,
                Reply::Symbol(_) | Reply::Silence => answer.add()?,
            };
        }
        builder.build()
    }
}

impl Show for MealyMachine {
    fn show(&self) -> String {
        self.edges()
            .map(|(q, a, o, p)| format!("{q} -{}|{}-> {p}", a.show(), o.show()))
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{automaton::tests::keywords, StateKind};

    fn toggle(a: SymbolId, b: SymbolId) -> MealyMachine {
        let mut mm = MealyMachine::new([a, b]);
        let q1 = mm.add_state();
        mm.add_edge(0, a, Reply::Symbol(b), q1);
        mm.add_edge(0, b, Reply::Silence, 0);
        mm.add_edge(q1, a, Reply::Symbol(a), 0);
        mm.add_edge(q1, b, Reply::Unknown, q1);
        mm
    }

    #[test_log::test]
    fn traces() {
        let (a, b) = (SymbolId(0), SymbolId(1));
        let mm = toggle(a, b);
        assert!(mm.is_complete());
        assert_eq!(
            mm.output_trace(&[a, a, b]),
            vec![Reply::Symbol(b), Reply::Symbol(a), Reply::Silence]
        );
        assert_eq!(mm.transform(&[a, b]), Some(Reply::Unknown));
        assert_eq!(mm.transform(&[]), None);
        // unknown inputs are answered with silence
        assert_eq!(mm.output_trace(&[SymbolId(9)]), vec![Reply::Silence]);
    }

    #[test_log::test]
    fn mealy_equivalence() {
        let (a, b) = (SymbolId(0), SymbolId(1));
        let mm1 = toggle(a, b);
        let mut mm2 = toggle(a, b);
        assert!(mm1.equivalent(&mm2));

        mm2.add_edge(1, b, Reply::Silence, 1);
        let witness = mm1.witness_inequivalence(&mm2).unwrap();
        assert_eq!(witness, vec![a, b]);
        assert_ne!(mm1.output_trace(&witness), mm2.output_trace(&witness));
        assert_eq!(mm2.witness_inequivalence(&mm1), Some(vec![a, b]));
    }

    #[test_log::test]
    fn equivalence_ignores_unreachable_differences() {
        let (a, b) = (SymbolId(0), SymbolId(1));
        let mut mm1 = toggle(a, b);
        let mut mm2 = toggle(a, b);
        let u1 = mm1.add_state();
        mm1.add_edge(u1, a, Reply::Symbol(a), u1);
        let u2 = mm2.add_state();
        mm2.add_edge(u2, a, Reply::Symbol(b), u2);
        assert!(mm1.equivalent(&mm2));
    }

    #[test_log::test]
    fn expansion() {
        let alphabet = keywords();
        let [hello, ack, bye] = ["HELLO", "ACK", "BYE"].map(|n| alphabet.id_of(n).unwrap());
        let mut mm = MealyMachine::new([hello, bye]);
        let q1 = mm.add_state();
        mm.add_edge(0, hello, Reply::Symbol(ack), q1);
        mm.add_edge(q1, bye, Reply::Silence, 0);

        let automaton = mm.to_automaton("expanded", &alphabet).unwrap();
        assert_eq!(automaton.size(), 4);
        let q0 = automaton.state_by_name("q0").unwrap();
        assert_eq!(q0.kind(), StateKind::Normal);
        let send = automaton.transitions_from(q0.id()).next().unwrap();
        assert_eq!(send.outputs(), &[hello]);
        assert_eq!(send.role(), Role::Client);
        let answer = automaton.transitions_from(send.target()).next().unwrap();
        assert_eq!(answer.outputs(), &[ack]);
        assert_eq!(answer.role(), Role::Server);
        assert_eq!(answer.target(), super::super::StateId(1));

        let silent = automaton
            .transitions()
            .find(|t| t.role() == Role::Server && t.input() == Some(bye))
            .unwrap();
        assert!(silent.outputs().is_empty());
        assert!(!silent.expects_unknown());
        assert!(silent.is_inert(&automaton));
        assert!(!answer.expects_unknown());
        assert!(automaton.validate(&alphabet).is_ok());
    }

    #[test_log::test]
    fn unknown_replies_are_read() {
        let alphabet = keywords();
        let [hello, ack] = ["HELLO", "ACK"].map(|n| alphabet.id_of(n).unwrap());
        let mut mm = MealyMachine::new([hello, ack]);
        mm.add_edge(0, ack, Reply::Unknown, 0);
        mm.add_edge(0, hello, Reply::Symbol(ack), 0);

        let automaton = mm.to_automaton("garbled", &alphabet).unwrap();
        let garbled = automaton
            .transitions()
            .find(|t| t.role() == Role::Server && t.input() == Some(ack))
            .unwrap();
        assert!(garbled.outputs().is_empty());
        assert!(garbled.expects_unknown());
        assert!(!garbled.is_inert(&automaton));
        assert!(automaton.to_dot(&alphabet).contains("{?}"));

        let restored = Automaton::from_json(&automaton.to_json(&alphabet).unwrap(), &alphabet).unwrap();
        assert!(restored
            .transitions()
            .filter(|t| t.role() == Role::Server)
            .all(|t| t.expects_unknown() == (t.input() == Some(ack))));
    }
}
