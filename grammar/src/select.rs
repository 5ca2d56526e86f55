use std::collections::VecDeque;

use grammar_core::{math, SymbolId};
use rand::{
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
    seq::SliceRandom,
    SeedableRng,
};
use tracing::trace;

use crate::Transition;

/// Decides what is emitted when the local side speaks.
///
/// [`SymbolSelector::select_symbol`] picks one of the symbols of a transition, returning `None`
/// ends the session. [`SymbolSelector::select_transition`] picks among the outgoing transitions
/// of a state if there is more than one.
pub trait SymbolSelector: Send {
    fn select_symbol(&mut self, transition: &Transition) -> Option<SymbolId>;

    fn select_transition<'a>(&mut self, candidates: &[&'a Transition]) -> Option<&'a Transition> {
        candidates.first().copied()
    }
}

impl<S: SymbolSelector + ?Sized> SymbolSelector for Box<S> {
    fn select_symbol(&mut self, transition: &Transition) -> Option<SymbolId> {
        (**self).select_symbol(transition)
    }

    fn select_transition<'a>(&mut self, candidates: &[&'a Transition]) -> Option<&'a Transition> {
        (**self).select_transition(candidates)
    }
}

/// Picks uniformly at random.
#[derive(Debug, Clone)]
pub struct UniformSelector {
    rng: StdRng,
}

impl Default for UniformSelector {
    fn default() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl UniformSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A selector that makes the same choices on every run.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl SymbolSelector for UniformSelector {
    fn select_symbol(&mut self, transition: &Transition) -> Option<SymbolId> {
        transition.outputs().choose(&mut self.rng).copied()
    }

    fn select_transition<'a>(&mut self, candidates: &[&'a Transition]) -> Option<&'a Transition> {
        candidates.choose(&mut self.rng).copied()
    }
}

/// Replays a fixed sequence of symbols. Each symbol is consumed by the transition that is able
/// to emit it; once the script is exhausted or does not fit the automaton, nothing more is
/// selected.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSelector {
    script: VecDeque<SymbolId>,
}

impl ScriptedSelector {
    pub fn new<I: IntoIterator<Item = SymbolId>>(script: I) -> Self {
        Self {
            script: script.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl SymbolSelector for ScriptedSelector {
    fn select_symbol(&mut self, transition: &Transition) -> Option<SymbolId> {
        let next = *self.script.front()?;
        if !transition.accepts(next) {
            trace!("scripted {next:?} cannot be emitted on {}", transition.name());
            return None;
        }
        self.script.pop_front()
    }

    fn select_transition<'a>(&mut self, candidates: &[&'a Transition]) -> Option<&'a Transition> {
        let next = *self.script.front()?;
        candidates.iter().find(|t| t.accepts(next)).copied()
    }
}

/// Picks at random, proportionally to per-symbol weights. Symbols without an explicit weight
/// weigh [`WeightedSelector::DEFAULT_WEIGHT`].
#[derive(Debug, Clone)]
pub struct WeightedSelector {
    weights: math::Map<SymbolId, f64>,
    rng: StdRng,
}

impl Default for WeightedSelector {
    fn default() -> Self {
        Self {
            weights: math::Map::default(),
            rng: StdRng::from_entropy(),
        }
    }
}

impl WeightedSelector {
    pub const DEFAULT_WEIGHT: f64 = 10.0;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            weights: math::Map::default(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Sets the weight of `symbol`, negative weights are treated as zero.
    pub fn with_weight(mut self, symbol: SymbolId, weight: f64) -> Self {
        self.weights.insert(symbol, weight.max(0.0));
        self
    }

    pub fn weight(&self, symbol: SymbolId) -> f64 {
        self.weights
            .get(&symbol)
            .copied()
            .unwrap_or(Self::DEFAULT_WEIGHT)
    }
}

impl SymbolSelector for WeightedSelector {
    fn select_symbol(&mut self, transition: &Transition) -> Option<SymbolId> {
        let outputs = transition.outputs();
        let weights = outputs.iter().map(|s| self.weight(*s)).collect::<Vec<_>>();
        let distribution = WeightedIndex::new(&weights).ok()?;
        Some(outputs[distribution.sample(&mut self.rng)])
    }

    /// Transitions weigh as much as their heaviest symbol.
    fn select_transition<'a>(&mut self, candidates: &[&'a Transition]) -> Option<&'a Transition> {
        let weights = candidates
            .iter()
            .map(|t| {
                t.outputs()
                    .iter()
                    .map(|s| self.weight(*s))
                    .fold(0.0, f64::max)
            })
            .collect::<Vec<_>>();
        let distribution = WeightedIndex::new(&weights).ok()?;
        Some(candidates[distribution.sample(&mut self.rng)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AutomatonBuilder, Role};

    fn automaton() -> crate::Automaton {
        let mut builder = AutomatonBuilder::new("selection");
        let q = builder.add_state("Q", Role::Client).unwrap();
        builder
            .transition(q, q)
            .outputs([SymbolId(0), SymbolId(1)])
            .add()
            .unwrap();
        builder.transition(q, q).outputs([SymbolId(2)]).add().unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn uniform_stays_within_outputs() {
        let automaton = automaton();
        let transitions: Vec<_> = automaton.transitions().collect();
        let mut selector = UniformSelector::seeded(7);
        for _ in 0..100 {
            let symbol = selector.select_symbol(transitions[0]).unwrap();
            assert!(transitions[0].accepts(symbol));
        }
    }

    #[test]
    fn scripted() {
        let automaton = automaton();
        let transitions: Vec<_> = automaton.transitions().collect();
        let mut selector = ScriptedSelector::new([SymbolId(2), SymbolId(1), SymbolId(2)]);
        let chosen = selector.select_transition(&transitions).unwrap();
        assert_eq!(chosen.id(), transitions[1].id());
        assert_eq!(selector.select_symbol(chosen), Some(SymbolId(2)));
        // the next scripted symbol does not fit, nothing is consumed
        assert_eq!(selector.select_symbol(transitions[1]), None);
        assert_eq!(selector.select_symbol(transitions[0]), Some(SymbolId(1)));
        assert_eq!(selector.select_symbol(transitions[1]), Some(SymbolId(2)));
        assert_eq!(selector.remaining(), 0);
        assert!(selector.select_transition(&transitions).is_none());
    }

    #[test]
    fn weighted() {
        let automaton = automaton();
        let transitions: Vec<_> = automaton.transitions().collect();
        let mut selector = WeightedSelector::seeded(3).with_weight(SymbolId(0), 0.0);
        assert_eq!(selector.weight(SymbolId(1)), WeightedSelector::DEFAULT_WEIGHT);
        for _ in 0..100 {
            assert_eq!(selector.select_symbol(transitions[0]), Some(SymbolId(1)));
        }

        let mut silent = WeightedSelector::seeded(3).with_weight(SymbolId(2), 0.0);
        for _ in 0..100 {
            let chosen = silent.select_transition(&transitions).unwrap();
            assert_eq!(chosen.id(), transitions[0].id());
        }
    }
}
