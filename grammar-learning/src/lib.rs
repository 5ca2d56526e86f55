//! Active inference of protocol grammars.
//!
//! An [`Oracle`] answers membership queries: it feeds a word of input symbols to the system
//! under learning and reports the [`Reply`](grammar_core::Reply) observed for every symbol.
//! [`LStar`] organises these answers in an [`ObservationTable`] and produces a
//! [`MealyMachine`](grammar::MealyMachine) hypothesis once the table is closed and consistent.
//! Hypotheses are checked by an [`EquivalenceOracle`], whose counterexamples are folded back into
//! the table until none is found.
//!
//! Membership queries go through a [`QueryCache`], so every word is posed at most once and the
//! answer to a word also answers all of its prefixes.
#![deny(rustdoc::broken_intra_doc_links)]

mod error;
pub use error::{LearningError, OracleError, QueryError};

/// Membership oracles, i.e. the systems that are learned from.
pub mod oracle;
pub use oracle::{MealyOracle, NetworkOracle, NetworkOracleConfig, Oracle};

mod cache;
pub use cache::QueryCache;

/// Ways of checking a hypothesis for equivalence.
pub mod equivalence;
pub use equivalence::{EquivalenceOracle, ExactEquivalence, RandomWords, WMethod};

mod observation;
pub use observation::{Experiment, ObservationTable, OutputRow};

mod lstar;
pub use lstar::{LStar, LearningConfig};

pub mod prelude {
    pub use super::{
        EquivalenceOracle, ExactEquivalence, LStar, LearningConfig, LearningError, MealyOracle,
        NetworkOracle, NetworkOracleConfig, ObservationTable, Oracle, OracleError, QueryCache,
        QueryError, RandomWords, WMethod,
    };
}
