use std::time::Instant;

use grammar::{Automaton, MealyMachine};
use grammar_core::{show_duration, Reply, Show};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::{EquivalenceOracle, LearningError, ObservationTable, Oracle, QueryCache, QueryError};

const QUERY_BUDGET: usize = 10_000;
const MAX_ROUNDS: usize = 64;

/// Limits of a learning run. Exceeding either ends learning as
/// [`LearningError::Inconclusive`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Membership queries that may be posed to the oracle, cached answers are free. The default
    /// can be overridden through the `GRAMMAR_QUERY_BUDGET` environment variable.
    pub query_budget: usize,
    /// Hypotheses that may be submitted to the equivalence oracle.
    pub max_rounds: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        let query_budget = std::env::var("GRAMMAR_QUERY_BUDGET")
            .ok()
            .and_then(|budget| budget.parse().ok())
            .unwrap_or(QUERY_BUDGET);
        Self {
            query_budget,
            max_rounds: MAX_ROUNDS,
        }
    }
}

impl LearningConfig {
    pub fn with_query_budget(mut self, budget: usize) -> Self {
        self.query_budget = budget;
        self
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds;
        self
    }
}

/// An implementation of the L* algorithm for Mealy machines.
///
/// Each round fills the [`ObservationTable`], makes it closed and consistent, and hands the
/// resulting hypothesis to the equivalence oracle. All suffixes of a counterexample become new
/// experiments. Every hypothesis reproduces the answers of all queries in the table.
pub struct LStar<O: Oracle, E: EquivalenceOracle<O>> {
    table: ObservationTable,
    // all membership queries go through here
    queries: QueryCache<O>,
    equivalence: E,
    config: LearningConfig,
    seed: Option<Automaton>,
    rounds: usize,
}

impl<O: Oracle, E: EquivalenceOracle<O>> LStar<O, E> {
    pub fn new(oracle: O, equivalence: E) -> Self {
        let config = LearningConfig::default();
        let table = ObservationTable::new(oracle.inputs().iter().copied());
        Self {
            table,
            queries: QueryCache::new(oracle).with_budget(config.query_budget),
            equivalence,
            config,
            seed: None,
            rounds: 0,
        }
    }

    pub fn with_config(mut self, config: LearningConfig) -> Self {
        self.queries.set_budget(Some(config.query_budget));
        self.config = config;
        self
    }

    /// The seed is handed to [`Oracle::start`].
    pub fn with_seed(mut self, seed: Automaton) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn table(&self) -> &ObservationTable {
        &self.table
    }

    pub fn queries(&self) -> &QueryCache<O> {
        &self.queries
    }

    /// Number of hypotheses built so far.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn into_oracle(self) -> O {
        self.queries.into_oracle()
    }

    /// Learns until the equivalence oracle finds no counterexample. The oracle is started
    /// before and stopped after learning, also if learning fails.
    pub fn infer(&mut self) -> Result<MealyMachine, LearningError> {
        if self.table.inputs().is_empty() {
            return Err(LearningError::NoInputs);
        }
        self.queries.oracle_mut().start(self.seed.as_ref())?;
        let learned = self.learn();
        let stopped = self.queries.oracle_mut().stop();
        let hypothesis = learned?;
        stopped?;
        Ok(hypothesis)
    }

    fn learn(&mut self) -> Result<MealyMachine, LearningError> {
        let start = Instant::now();

        while self.rounds < self.config.max_rounds {
            self.rounds += 1;
            self.close()?;
            let hypothesis = self.table.hypothesis()?;
            debug!(
                "round {} yields a hypothesis with {} states from\n{:?}",
                self.rounds,
                hypothesis.size(),
                self.table
            );

            let counterexample = self
                .equivalence
                .find_counterexample(&hypothesis, &mut self.queries)
                .map_err(|e| self.failed(e))?;
            let Some(counterexample) = counterexample else {
                info!(
                    "learned {} states in {} rounds with {} queries ({} answered from cache), took {}",
                    hypothesis.size(),
                    self.rounds,
                    self.queries.posed(),
                    self.queries.hits(),
                    show_duration(start.elapsed())
                );
                return Ok(hypothesis);
            };

            info!(
                "round {}: counterexample {}",
                self.rounds,
                counterexample.show()
            );
            if self.table.add_counterexample(&counterexample) == 0 {
                warn!(
                    "counterexample {} does not add any experiment",
                    counterexample.show()
                );
            }
        }

        Err(self.inconclusive())
    }

    /// Fills the table and extends it until it is closed and consistent.
    fn close(&mut self) -> Result<(), LearningError> {
        loop {
            self.update_table()?;

            let todo = self.table.rows_to_promote();
            if !todo.is_empty() {
                trace!(
                    "have to promote rows: {}",
                    todo.iter().map(|w| w.show()).join(", ")
                );
                for word in todo {
                    self.table.promote(word);
                }
                continue;
            }

            let Some(experiment) = self.table.inconsistency() else {
                return Ok(());
            };
            debug!("table is inconsistent, adding {}", experiment.symbols().show());
            if !self.table.add_experiment(experiment) {
                warn!("separating experiment is already present");
                return Ok(());
            }
        }
    }

    fn update_table(&mut self) -> Result<(), LearningError> {
        for (row, i) in self.table.missing_cells() {
            let query = self.table.query(&row, i);
            let replies = self.queries.query(&query).map_err(|e| self.failed(e))?;
            let reply = replies.last().copied().unwrap_or(Reply::Silence);
            trace!("{} maps to {}", query.show(), reply.show());
            self.table.record(&row, i, reply);
        }
        trace!("after update the table is\n{:?}", self.table);
        Ok(())
    }

    fn failed(&self, error: QueryError) -> LearningError {
        match error {
            QueryError::BudgetExhausted(_) => self.inconclusive(),
            other => LearningError::Query(other),
        }
    }

    fn inconclusive(&self) -> LearningError {
        LearningError::Inconclusive {
            rounds: self.rounds,
            queries: self.queries.posed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use grammar::{channel::memory, AbstractionLayer, PeerSimulator};
    use grammar_core::SymbolId;

    use super::*;
    use crate::{
        equivalence::tests::counter,
        oracle::tests::{greeter, keywords, quick},
        ExactEquivalence, MealyOracle, NetworkOracle, RandomWords, WMethod,
    };

    #[test_log::test]
    fn mealy_al() {
        let (a, b, c) = (SymbolId(0), SymbolId(1), SymbolId(2));
        let (zero, one) = (Reply::Silence, Reply::Symbol(SymbolId(1)));
        let mut target = MealyMachine::new([a, b, c]);
        let q1 = target.add_state();
        target.add_edge(0, a, one, q1);
        target.add_edge(0, b, one, 0);
        target.add_edge(0, c, one, 0);
        target.add_edge(q1, a, zero, 0);
        target.add_edge(q1, b, one, 0);
        target.add_edge(q1, c, one, 0);

        let oracle = MealyOracle::new(target.clone());
        let exact = oracle.exact();
        let mut learner = LStar::new(oracle, exact);
        let mm = learner.infer().unwrap();
        assert_eq!(mm.size(), 2);
        assert!(mm.equivalent(&target));
    }

    #[test_log::test]
    fn counterexample_reveals_hidden_states() {
        let (a, b) = (SymbolId(0), SymbolId(1));
        let target = counter(a, b);
        let oracle = MealyOracle::new(target.clone());
        let mut learner = LStar::new(oracle, ExactEquivalence::new(target.clone()));
        let mm = learner.infer().unwrap();
        assert_eq!(mm.size(), 3);
        assert_eq!(learner.rounds(), 2);
        assert_eq!(
            mm.output_trace(&[a, a, a, a, a, a]),
            target.output_trace(&[a, a, a, a, a, a])
        );
    }

    #[test_log::test]
    fn learning_is_idempotent() {
        let alphabet = keywords();
        let reference = greeter(&alphabet);

        let runs = (0..2)
            .map(|_| {
                let mut learner = LStar::new(MealyOracle::new(reference.clone()), WMethod::new(3));
                let learned = learner.infer().unwrap();
                for query in learner.table().queries() {
                    assert_eq!(
                        learned.output_trace(&query),
                        reference.output_trace(&query),
                        "learned machine disagrees on {}",
                        alphabet.show_word(&query)
                    );
                }
                learned
            })
            .collect_vec();

        assert!(runs[0].equivalent(&reference));
        assert_eq!(runs[0], runs[1]);
    }

    #[test_log::test]
    fn budget_makes_learning_inconclusive() {
        let (a, b) = (SymbolId(0), SymbolId(1));
        let target = counter(a, b);
        let oracle = MealyOracle::new(target.clone());
        let mut learner = LStar::new(oracle, ExactEquivalence::new(target.clone()))
            .with_config(LearningConfig::default().with_query_budget(3));
        match learner.infer() {
            Err(LearningError::Inconclusive { rounds, queries }) => {
                assert_eq!(rounds, 1);
                assert_eq!(queries, 3);
            }
            other => panic!("expected inconclusive learning, got {other:?}"),
        }

        let mut learner = LStar::new(MealyOracle::new(target.clone()), ExactEquivalence::new(target))
            .with_config(LearningConfig::default().with_max_rounds(1));
        assert!(matches!(
            learner.infer(),
            Err(LearningError::Inconclusive { rounds: 1, .. })
        ));
    }

    #[test_log::test]
    fn nothing_to_learn() {
        let oracle = MealyOracle::new(MealyMachine::new([]));
        let mut learner = LStar::new(oracle, RandomWords::new(10, 3));
        assert!(matches!(learner.infer(), Err(LearningError::NoInputs)));
    }

    #[test_log::test]
    fn learn_from_simulated_peer() {
        let alphabet = Arc::new(keywords());
        let reference = greeter(&alphabet);
        let listener = memory::listener();
        let simulator =
            PeerSimulator::new(reference.clone(), Arc::clone(&alphabet)).spawn(listener.clone());

        let layer = AbstractionLayer::new(listener.connector(), Arc::clone(&alphabet));
        let oracle = NetworkOracle::new(layer, reference.inputs().to_vec())
            .with_config(quick());
        let mut learner = LStar::new(oracle, WMethod::new(2));
        let learned = learner.infer().unwrap();
        simulator.stop();

        assert!(learned.equivalent(&reference));
        assert_eq!(learned.size(), 2);
        let oracle = learner.into_oracle();
        assert!(oracle.posed() > 0);
        assert!(!oracle.layer().is_open());

        let automaton = learned.to_automaton("greeter", &alphabet).unwrap();
        assert!(automaton.validate(&alphabet).is_ok());
    }
}
