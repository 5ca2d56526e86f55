use std::collections::VecDeque;

use grammar::MealyMachine;
use grammar_core::{math, Show, SymbolId, Word};
use itertools::Itertools;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use tracing::{debug, info, trace};

use crate::{Oracle, QueryCache, QueryError};

/// Checks a hypothesis against the system that is learned.
pub trait EquivalenceOracle<O: Oracle> {
    /// Returns a word on which `hypothesis` and the system disagree, or `None` if no such word
    /// was found. The word ends with the first input whose reply differs. Membership queries
    /// needed for the check are posed through `queries`.
    fn find_counterexample(
        &mut self,
        hypothesis: &MealyMachine,
        queries: &mut QueryCache<O>,
    ) -> Result<Option<Word>, QueryError>;
}

impl<O: Oracle, E: EquivalenceOracle<O> + ?Sized> EquivalenceOracle<O> for Box<E> {
    fn find_counterexample(
        &mut self,
        hypothesis: &MealyMachine,
        queries: &mut QueryCache<O>,
    ) -> Result<Option<Word>, QueryError> {
        (**self).find_counterexample(hypothesis, queries)
    }
}

/// Poses `word` and compares the answer with the prediction of `hypothesis`.
pub fn disagreement<O: Oracle>(
    hypothesis: &MealyMachine,
    queries: &mut QueryCache<O>,
    word: &[SymbolId],
) -> Result<Option<Word>, QueryError> {
    let observed = queries.query(word)?;
    let predicted = hypothesis.output_trace(word);
    Ok(observed
        .iter()
        .zip(&predicted)
        .position(|(o, p)| o != p)
        .map(|i| word[..=i].to_vec()))
}

/// Compares hypotheses with a known reference machine, no queries are posed.
#[derive(Debug, Clone)]
pub struct ExactEquivalence {
    reference: MealyMachine,
}

impl ExactEquivalence {
    pub fn new(reference: MealyMachine) -> Self {
        Self { reference }
    }
}

impl<O: Oracle> EquivalenceOracle<O> for ExactEquivalence {
    fn find_counterexample(
        &mut self,
        hypothesis: &MealyMachine,
        _queries: &mut QueryCache<O>,
    ) -> Result<Option<Word>, QueryError> {
        Ok(self.reference.witness_inequivalence(hypothesis))
    }
}

/// Conformance testing with the W-method. Given an upper bound `m` on the number of states of
/// the system, a hypothesis with `n` states is tested with every word `p·x·w`, where `p` is
/// from the transition cover of the hypothesis, `x` is any word of at most `m - n` inputs and
/// `w` is from its characterisation set. If the bound holds, a hypothesis that passes all
/// tests is equivalent to the system.
#[derive(Debug, Clone)]
pub struct WMethod {
    max_states: usize,
}

impl WMethod {
    pub fn new(max_states: usize) -> Self {
        Self { max_states }
    }

    pub fn max_states(&self) -> usize {
        self.max_states
    }

    /// All test words for `hypothesis`, shortest transition cover prefixes first.
    pub fn test_suite(&self, hypothesis: &MealyMachine) -> Vec<Word> {
        let inputs = hypothesis.inputs();
        let cover = transition_cover(hypothesis);
        let characterisation = characterisation_set(hypothesis);

        let extra = self.max_states.saturating_sub(hypothesis.size());
        let mut middle = vec![vec![]];
        let mut layer: Vec<Word> = vec![vec![]];
        for _ in 0..extra {
            layer = layer
                .iter()
                .flat_map(|w| inputs.iter().map(move |a| extend(w, *a)))
                .collect();
            middle.extend(layer.iter().cloned());
        }

        let tests = cover
            .iter()
            .cartesian_product(&middle)
            .cartesian_product(&characterisation)
            .map(|((p, x), w)| p.iter().chain(x).chain(w).copied().collect_vec())
            .filter(|t| !t.is_empty())
            .unique()
            .collect_vec();
        debug!(
            "W-method suite of {} tests from {} cover words, {} middle words and {} separating words",
            tests.len(),
            cover.len(),
            middle.len(),
            characterisation.len()
        );
        tests
    }
}

impl<O: Oracle> EquivalenceOracle<O> for WMethod {
    fn find_counterexample(
        &mut self,
        hypothesis: &MealyMachine,
        queries: &mut QueryCache<O>,
    ) -> Result<Option<Word>, QueryError> {
        let tests = self.test_suite(hypothesis);
        for test in &tests {
            if let Some(counterexample) = disagreement(hypothesis, queries, test)? {
                return Ok(Some(counterexample));
            }
        }
        info!("hypothesis passed {} W-method tests", tests.len());
        Ok(None)
    }
}

/// Access words of all reachable states together with all their one letter extensions.
pub fn transition_cover(mm: &MealyMachine) -> Vec<Word> {
    let mut access = math::Map::default();
    let mut queue = VecDeque::from([(mm.initial(), vec![])]);
    access.insert(mm.initial(), vec![]);
    let mut cover = vec![vec![]];

    while let Some((q, word)) = queue.pop_front() {
        for a in mm.inputs() {
            let (_, p) = mm.step(q, *a);
            let extended = extend(&word, *a);
            cover.push(extended.clone());
            if !access.contains_key(&p) {
                access.insert(p, extended.clone());
                queue.push_back((p, extended));
            }
        }
    }
    cover
}

/// Separating words for every pair of states that can be told apart, plus the empty word.
pub fn characterisation_set(mm: &MealyMachine) -> Vec<Word> {
    let mut set = vec![vec![]];
    for (p, q) in (0..mm.size()).tuple_combinations() {
        match separating_word(mm, p, q) {
            Some(word) if !set.contains(&word) => set.push(word),
            Some(_) => {}
            None => trace!("states {p} and {q} are equivalent"),
        }
    }
    set
}

/// A shortest word on which the states `p` and `q` reply differently.
pub fn separating_word(mm: &MealyMachine, p: usize, q: usize) -> Option<Word> {
    let mut seen = math::Set::default();
    let mut queue = VecDeque::from([(p, q, vec![])]);
    seen.insert((p, q));
    while let Some((l, r, word)) = queue.pop_front() {
        for a in mm.inputs() {
            let (left, l2) = mm.step(l, *a);
            let (right, r2) = mm.step(r, *a);
            let extended = extend(&word, *a);
            if left != right {
                return Some(extended);
            }
            if seen.insert((l2, r2)) {
                queue.push_back((l2, r2, extended));
            }
        }
    }
    None
}

/// Tests hypotheses with random words. Finds counterexamples quickly for large systems, but
/// passing the tests proves nothing.
#[derive(Debug, Clone)]
pub struct RandomWords {
    tests: usize,
    min_length: usize,
    max_length: usize,
    rng: StdRng,
}

impl RandomWords {
    pub fn new(tests: usize, max_length: usize) -> Self {
        Self {
            tests,
            min_length: 1,
            max_length: max_length.max(1),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_min_length(mut self, min_length: usize) -> Self {
        self.min_length = min_length.clamp(1, self.max_length);
        self
    }
}

impl<O: Oracle> EquivalenceOracle<O> for RandomWords {
    fn find_counterexample(
        &mut self,
        hypothesis: &MealyMachine,
        queries: &mut QueryCache<O>,
    ) -> Result<Option<Word>, QueryError> {
        let inputs = hypothesis.inputs();
        if inputs.is_empty() {
            return Ok(None);
        }
        for _ in 0..self.tests {
            let length = self.rng.gen_range(self.min_length..=self.max_length);
            let word = (0..length)
                .filter_map(|_| inputs.choose(&mut self.rng).copied())
                .collect_vec();
            if let Some(counterexample) = disagreement(hypothesis, queries, &word)? {
                debug!("random word {} is a counterexample", word.show());
                return Ok(Some(counterexample));
            }
        }
        info!("hypothesis passed {} random tests", self.tests);
        Ok(None)
    }
}

fn extend(word: &[SymbolId], symbol: SymbolId) -> Word {
    let mut out = word.to_vec();
    out.push(symbol);
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use grammar_core::Reply;

    use super::*;
    use crate::{
        oracle::tests::{greeter, keywords},
        MealyOracle,
    };

    /// Answers the third `a` in a row and stays silent otherwise.
    pub(crate) fn counter(a: SymbolId, b: SymbolId) -> MealyMachine {
        let mut mm = MealyMachine::new([a, b]);
        let (q1, q2) = (mm.add_state(), mm.add_state());
        mm.add_edge(0, a, Reply::Silence, q1);
        mm.add_edge(q1, a, Reply::Silence, q2);
        mm.add_edge(q2, a, Reply::Symbol(b), 0);
        for q in [0, q1, q2] {
            mm.add_edge(q, b, Reply::Silence, 0);
        }
        mm
    }

    fn silent(a: SymbolId, b: SymbolId) -> MealyMachine {
        let mut mm = MealyMachine::new([a, b]);
        mm.add_edge(0, a, Reply::Silence, 0);
        mm.add_edge(0, b, Reply::Silence, 0);
        mm
    }

    #[test_log::test]
    fn cover_and_characterisation() {
        let (a, b) = (SymbolId(0), SymbolId(1));
        let mm = counter(a, b);
        assert_eq!(
            transition_cover(&mm),
            vec![vec![], vec![a], vec![b], vec![a, a], vec![a, b], vec![a, a, a], vec![a, a, b]]
        );
        assert_eq!(separating_word(&mm, 0, 2), Some(vec![a]));
        assert_eq!(separating_word(&mm, 0, 1), Some(vec![a, a]));
        assert_eq!(
            characterisation_set(&mm),
            vec![vec![], vec![a, a], vec![a]]
        );
    }

    #[test_log::test]
    fn w_method_finds_missing_states() {
        let (a, b) = (SymbolId(0), SymbolId(1));
        let mut queries = QueryCache::new(MealyOracle::new(counter(a, b)));
        let hypothesis = silent(a, b);

        // with one extra state the third `a` is never reached
        let mut shallow = WMethod::new(2);
        assert_eq!(shallow.find_counterexample(&hypothesis, &mut queries).unwrap(), None);

        let mut deep = WMethod::new(3);
        let counterexample = deep.find_counterexample(&hypothesis, &mut queries).unwrap();
        assert_eq!(counterexample, Some(vec![a, a, a]));

        let mut exact = ExactEquivalence::new(counter(a, b));
        assert!(exact.find_counterexample(&counter(a, b), &mut queries).unwrap().is_none());
    }

    #[test_log::test]
    fn random_words() {
        let alphabet = keywords();
        let reference = greeter(&alphabet);
        let mut queries = QueryCache::new(MealyOracle::new(reference.clone()));

        let mut random = RandomWords::new(50, 4).seeded(7);
        assert_eq!(random.find_counterexample(&reference, &mut queries).unwrap(), None);

        let wrong = silent(reference.inputs()[0], reference.inputs()[1]);
        let counterexample = random
            .find_counterexample(&wrong, &mut queries)
            .unwrap()
            .unwrap();
        assert_ne!(
            queries.query(&counterexample).unwrap(),
            wrong.output_trace(&counterexample)
        );
    }
}
