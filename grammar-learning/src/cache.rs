use grammar_core::{math, Reply, Show, SymbolId, Word};
use tracing::{trace, warn};

use crate::{Oracle, QueryError};

/// Remembers the answers of an [`Oracle`]. The answer to a word also answers every prefix of
/// it, so a word is only posed if neither it nor any extension of it has been posed before.
///
/// The cache can be given a budget, the number of queries that may be posed to the oracle.
/// Queries that are answered from the cache do not count.
pub struct QueryCache<O: Oracle> {
    oracle: O,
    // reply to the last symbol of every word that is a prefix of some posed query
    answers: math::Map<Word, Reply>,
    budget: Option<usize>,
    posed: usize,
    hits: usize,
}

impl<O: Oracle> QueryCache<O> {
    pub fn new(oracle: O) -> Self {
        Self {
            oracle,
            answers: math::Map::default(),
            budget: None,
            posed: 0,
            hits: 0,
        }
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn set_budget(&mut self, budget: Option<usize>) {
        self.budget = budget;
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn oracle_mut(&mut self) -> &mut O {
        &mut self.oracle
    }

    pub fn into_oracle(self) -> O {
        self.oracle
    }

    pub fn inputs(&self) -> &[SymbolId] {
        self.oracle.inputs()
    }

    /// Number of queries that were posed to the oracle.
    pub fn posed(&self) -> usize {
        self.posed
    }

    /// Number of queries that were answered from the cache.
    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn contains(&self, word: &[SymbolId]) -> bool {
        word.is_empty() || self.answers.contains_key(word)
    }

    /// Returns the cached answer for `word` without posing it.
    pub fn lookup(&self, word: &[SymbolId]) -> Option<Vec<Reply>> {
        (1..=word.len())
            .map(|i| self.answers.get(&word[..i]).copied())
            .collect()
    }

    /// Answers `word`, posing it to the oracle if it is not cached.
    pub fn query(&mut self, word: &[SymbolId]) -> Result<Vec<Reply>, QueryError> {
        if let Some(replies) = self.lookup(word) {
            self.hits += 1;
            return Ok(replies);
        }
        if let Some(budget) = self.budget {
            if self.posed >= budget {
                return Err(QueryError::BudgetExhausted(budget));
            }
        }
        let replies = self.oracle.submit_query(word)?;
        self.posed += 1;
        if replies.len() != word.len() {
            warn!(
                "oracle gave {} replies to {} inputs of {}",
                replies.len(),
                word.len(),
                word.show()
            );
        }
        self.insert(word, &replies);
        // the cache is authoritative, earlier answers win over contradicting new ones
        Ok(self.lookup(word).unwrap_or(replies))
    }

    /// Records the replies to `word`, e.g. from an earlier run.
    pub fn insert(&mut self, word: &[SymbolId], replies: &[Reply]) {
        for (i, reply) in replies.iter().enumerate().take(word.len()) {
            let prefix = &word[..=i];
            match self.answers.get(prefix) {
                Some(known) if known != reply => warn!(
                    "oracle is not deterministic, {} was answered with {} and now with {}",
                    prefix.show(),
                    known.show(),
                    reply.show()
                ),
                Some(_) => {}
                None => {
                    trace!("{} -> {}", prefix.show(), reply.show());
                    self.answers.insert(prefix.to_vec(), *reply);
                }
            }
        }
    }

    /// Number of distinct words with a known answer.
    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        oracle::tests::{greeter, keywords},
        MealyOracle,
    };

    #[test_log::test]
    fn prefixes_are_answered() {
        let alphabet = keywords();
        let [hello, ack, bye] = ["HELLO", "ACK", "BYE"].map(|n| alphabet.id_of(n).unwrap());
        let mut cache = QueryCache::new(MealyOracle::new(greeter(&alphabet)));

        let long = cache.query(&[hello, hello, bye]).unwrap();
        assert_eq!(cache.posed(), 1);
        assert_eq!(cache.query(&[hello, hello]).unwrap(), long[..2].to_vec());
        assert_eq!(cache.query(&[]).unwrap(), vec![]);
        assert_eq!(cache.hits(), 2);
        assert_eq!(cache.posed(), 1);

        cache.query(&[hello, ack]).unwrap();
        assert_eq!(cache.posed(), 2);
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.oracle().posed(), 2);
    }

    #[test_log::test]
    fn budget() {
        let alphabet = keywords();
        let [hello, ack, _] = ["HELLO", "ACK", "BYE"].map(|n| alphabet.id_of(n).unwrap());
        let mut cache = QueryCache::new(MealyOracle::new(greeter(&alphabet))).with_budget(1);
        cache.query(&[hello, ack]).unwrap();
        assert!(cache.query(&[hello]).is_ok());
        assert!(matches!(
            cache.query(&[ack]),
            Err(QueryError::BudgetExhausted(1))
        ));
    }

    #[test_log::test]
    fn earlier_answers_win() {
        let alphabet = keywords();
        let [hello, ack, _] = ["HELLO", "ACK", "BYE"].map(|n| alphabet.id_of(n).unwrap());
        let mut cache = QueryCache::new(MealyOracle::new(greeter(&alphabet)));
        cache.insert(&[hello], &[Reply::Silence]);
        assert!(cache.contains(&[hello]));
        assert!(!cache.contains(&[hello, ack]));
        assert_eq!(
            cache.query(&[hello, ack]).unwrap(),
            vec![Reply::Silence, Reply::Silence]
        );
    }
}
