use std::fmt::Debug;

use grammar::MealyMachine;
use grammar_core::{math, Alphabet, Reply, Show, SymbolId, Word};
use itertools::Itertools;
use tracing::trace;

use crate::LearningError;

/// A column of the observation table. The cell of row `w` holds the reply to the last symbol of
/// `w` followed by the experiment, so experiments are never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Experiment(pub(crate) Word);

impl Experiment {
    pub fn symbols(&self) -> &[SymbolId] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct OutputRow(pub(crate) Vec<Reply>);

impl OutputRow {
    pub fn replies(&self) -> &[Reply] {
        &self.0
    }
}

/// Observations of L*: rows are indexed by words, columns by [`Experiment`]s. The base rows
/// are the access words of the states discovered so far, every base row extended by one input
/// is a row as well.
///
/// The first experiments are the single inputs in order, so the first columns of a base row
/// are the replies of the corresponding state.
#[derive(Clone)]
pub struct ObservationTable {
    inputs: Vec<SymbolId>,
    base: Vec<Word>,
    experiments: Vec<Experiment>,
    rows: math::Map<Word, OutputRow>,
}

impl ObservationTable {
    /// Creates a table with the empty word as its only base row.
    pub fn new<I: IntoIterator<Item = SymbolId>>(inputs: I) -> Self {
        let inputs = inputs.into_iter().unique().collect_vec();
        Self {
            experiments: inputs.iter().map(|a| Experiment(vec![*a])).collect(),
            inputs,
            base: vec![vec![]],
            rows: math::Map::default(),
        }
    }

    pub fn inputs(&self) -> &[SymbolId] {
        &self.inputs
    }

    pub fn base(&self) -> &[Word] {
        &self.base
    }

    pub fn experiments(&self) -> &[Experiment] {
        &self.experiments
    }

    pub fn row(&self, word: &[SymbolId]) -> Option<&OutputRow> {
        self.rows.get(word)
    }

    /// The base rows followed by all their one letter extensions that are not base rows.
    pub fn one_letter_extensions(&self) -> impl Iterator<Item = Word> + '_ {
        self.base
            .iter()
            .flat_map(|w| {
                std::iter::once(w.clone()).chain(self.inputs.iter().filter_map(|a| {
                    let mut x = w.clone();
                    x.push(*a);
                    (!self.base.contains(&x)).then_some(x)
                }))
            })
            .unique()
    }

    /// Cells without an observation, as pairs of row and experiment index. The cells of a row
    /// are listed from left to right.
    pub fn missing_cells(&self) -> Vec<(Word, usize)> {
        let count = self.experiments.len();
        self.one_letter_extensions()
            .flat_map(|w| {
                let stored = self.rows.get(&w).map(|r| r.0.len()).unwrap_or(0);
                (stored..count).map(move |i| (w.clone(), i))
            })
            .collect()
    }

    /// The query that fills the cell of `row` and experiment `index`.
    pub fn query(&self, row: &[SymbolId], index: usize) -> Word {
        row.iter()
            .chain(self.experiments[index].0.iter())
            .copied()
            .collect()
    }

    /// Records the reply for the next missing cell of `row`, which must be the cell of
    /// experiment `index`.
    pub fn record(&mut self, row: &[SymbolId], index: usize, reply: Reply) {
        let entry = self.rows.entry(row.to_vec()).or_default();
        debug_assert_eq!(entry.0.len(), index, "cells must be filled in order");
        entry.0.push(reply);
    }

    /// Every query that the table is made of.
    pub fn queries(&self) -> impl Iterator<Item = Word> + '_ {
        self.rows
            .iter()
            .flat_map(move |(w, row)| (0..row.0.len()).map(move |i| self.query(w, i)))
    }

    /// One letter extensions whose rows match no base row. Each distinct row is listed once.
    pub fn rows_to_promote(&self) -> Vec<Word> {
        let known: math::Set<_> = self.base.iter().filter_map(|b| self.rows.get(b)).collect();
        let mut seen = math::Set::default();
        self.one_letter_extensions()
            .filter(|w| {
                self.rows
                    .get(w)
                    .is_some_and(|row| !known.contains(row) && seen.insert(row))
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.rows_to_promote().is_empty()
    }

    pub fn promote(&mut self, word: Word) {
        if !self.base.contains(&word) {
            trace!("promoting {}", word.show());
            self.base.push(word);
        }
    }

    /// Looks for two base rows that agree on all experiments, but whose extensions by some input
    /// `a` are told apart by an experiment `e`. If found, returns the experiment `a·e` that
    /// separates the two base rows.
    pub fn inconsistency(&self) -> Option<Experiment> {
        for (i, left) in self.base.iter().enumerate() {
            for right in &self.base[i + 1..] {
                if self.rows.get(left) != self.rows.get(right) {
                    continue;
                }
                for a in &self.inputs {
                    let l = self.rows.get(&extend(left, *a))?;
                    let r = self.rows.get(&extend(right, *a))?;
                    if let Some((j, _)) = l.0.iter().zip(&r.0).find_position(|(x, y)| x != y) {
                        let experiment = std::iter::once(*a)
                            .chain(self.experiments[j].0.iter().copied())
                            .collect();
                        return Some(Experiment(experiment));
                    }
                }
            }
        }
        None
    }

    pub fn is_consistent(&self) -> bool {
        self.inconsistency().is_none()
    }

    /// Adds a column, returns false if it already exists.
    pub fn add_experiment(&mut self, experiment: Experiment) -> bool {
        if experiment.0.is_empty() || self.experiments.contains(&experiment) {
            return false;
        }
        trace!("adding experiment {}", experiment.0.show());
        self.experiments.push(experiment);
        true
    }

    /// Adds every suffix of `counterexample` as an experiment. Returns how many were new.
    pub fn add_counterexample(&mut self, counterexample: &[SymbolId]) -> usize {
        (0..counterexample.len())
            .filter(|i| self.add_experiment(Experiment(counterexample[*i..].to_vec())))
            .count()
    }

    /// Builds the hypothesis of a closed table: one state per distinct base row, the reply of an
    /// edge is read from the column of its input and its target is the state whose row equals
    /// the row of the extension.
    pub fn hypothesis(&self) -> Result<MealyMachine, LearningError> {
        let mut mm = MealyMachine::new(self.inputs.iter().copied());
        let mut classes: math::Map<&OutputRow, usize> = math::Map::default();
        let mut representatives = vec![];

        for mr in &self.base {
            let row = self
                .rows
                .get(mr)
                .ok_or_else(|| LearningError::NotClosed(mr.show()))?;
            if classes.contains_key(row) {
                continue;
            }
            let state = if classes.is_empty() {
                mm.initial()
            } else {
                mm.add_state()
            };
            classes.insert(row, state);
            representatives.push((mr, row, state));
        }

        for (mr, row, state) in representatives {
            for (i, a) in self.inputs.iter().enumerate() {
                let extension = extend(mr, *a);
                let target = self
                    .rows
                    .get(&extension)
                    .and_then(|r| classes.get(r))
                    .ok_or_else(|| LearningError::NotClosed(extension.show()))?;
                let reply = row
                    .0
                    .get(i)
                    .copied()
                    .ok_or_else(|| LearningError::NotClosed(mr.show()))?;
                mm.add_edge(state, *a, reply, *target);
            }
        }
        Ok(mm)
    }

    /// Renders the table, naming symbols through `alphabet` if given.
    pub fn render(&self, alphabet: Option<&Alphabet>) -> String {
        let word = |w: &[SymbolId]| match alphabet {
            Some(alphabet) => alphabet.show_word(w),
            None => w.show(),
        };
        let reply = |r: &Reply| match alphabet {
            Some(alphabet) => alphabet.show_reply(r),
            None => r.show(),
        };

        let mut builder = tabled::builder::Builder::default();
        let mut header = vec!["MR".to_string()];
        header.extend(self.experiments.iter().map(|e| word(e.symbols())));
        builder.push_record(header);

        for w in self.one_letter_extensions() {
            let mut record = if self.base.contains(&w) {
                vec![owo_colors::OwoColorize::blue(&word(w.as_slice())).to_string()]
            } else {
                vec![word(w.as_slice())]
            };
            if let Some(row) = self.rows.get(&w) {
                record.extend(row.0.iter().map(&reply));
            }
            builder.push_record(record);
        }
        builder.build().to_string()
    }
}

impl Debug for ObservationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render(None))
    }
}

fn extend(word: &[SymbolId], symbol: SymbolId) -> Word {
    let mut out = word.to_vec();
    out.push(symbol);
    out
}
