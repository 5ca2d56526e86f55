use grammar::{ConnectionError, ModelError, SessionError};
use thiserror::Error;

/// A membership query could not be answered.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Every attempt failed on the transport, the last failure is the source.
    #[error("query {query} failed after {attempts} attempt(s)")]
    Failed {
        query: String,
        attempts: usize,
        #[source]
        source: SessionError,
    },
    /// Posing the query would exceed the number of queries that may be posed.
    #[error("query budget of {0} membership queries is exhausted")]
    BudgetExhausted(usize),
}

/// Bringing an oracle up or down failed. This is a configuration problem of the oracle, it is
/// not retried.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle does not support {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("seed automaton cannot be used: {0}")]
    Seed(#[from] ModelError),
}

#[derive(Debug, Error)]
pub enum LearningError {
    /// The table did not settle within the configured budget. Nothing went wrong, but the
    /// result would not be trustworthy.
    #[error("learning is inconclusive after {rounds} round(s) and {queries} membership queries")]
    Inconclusive { rounds: usize, queries: usize },
    #[error("cannot learn over an empty set of inputs")]
    NoInputs,
    #[error("observation table is not closed, no row matches {0}")]
    NotClosed(String),
    #[error(transparent)]
    Query(QueryError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
}
