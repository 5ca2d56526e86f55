use std::{sync::Arc, time::Duration};

use grammar::{
    AbstractionLayer, Automaton, Channel, ChannelConfig, ExecutionConfig, MealyMachine, Role,
    SessionEnd, SessionError, SessionRunner, Snapshot,
};
use grammar_core::{Alphabet, FieldValues, Reply, SymbolId};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::{ExactEquivalence, OracleError, QueryError};

/// Answers membership queries for the system that is learned. A query is a word of input
/// symbols, the answer holds one [`Reply`] per input symbol.
///
/// Bringing the oracle up and down is specific to each implementation, an oracle that does not
/// support it reports [`OracleError::Unsupported`].
pub trait Oracle {
    /// The symbols that queries are made of.
    fn inputs(&self) -> &[SymbolId];

    /// Prepares the oracle for a series of queries. The `seed` automaton, if any, describes a
    /// conversation that precedes every query.
    fn start(&mut self, seed: Option<&Automaton>) -> Result<(), OracleError> {
        let _ = seed;
        Err(OracleError::Unsupported("start"))
    }

    fn stop(&mut self) -> Result<(), OracleError> {
        Err(OracleError::Unsupported("stop"))
    }

    /// Runs `word` from the initial state of the system and returns the observed replies.
    fn submit_query(&mut self, word: &[SymbolId]) -> Result<Vec<Reply>, QueryError>;
}

impl<O: Oracle + ?Sized> Oracle for &mut O {
    fn inputs(&self) -> &[SymbolId] {
        (**self).inputs()
    }

    fn start(&mut self, seed: Option<&Automaton>) -> Result<(), OracleError> {
        (**self).start(seed)
    }

    fn stop(&mut self) -> Result<(), OracleError> {
        (**self).stop()
    }

    fn submit_query(&mut self, word: &[SymbolId]) -> Result<Vec<Reply>, QueryError> {
        (**self).submit_query(word)
    }
}

/// An oracle based on a [`MealyMachine`]. Queries never fail and [`MealyOracle::exact`] gives an
/// equivalence oracle that compares hypotheses with the machine itself.
#[derive(Debug, Clone)]
pub struct MealyOracle {
    machine: MealyMachine,
    posed: usize,
}

impl MealyOracle {
    /// Creates a new [`MealyOracle`] that queries over all inputs of `machine`.
    pub fn new(machine: MealyMachine) -> Self {
        Self { machine, posed: 0 }
    }

    pub fn machine(&self) -> &MealyMachine {
        &self.machine
    }

    /// Number of queries answered so far.
    pub fn posed(&self) -> usize {
        self.posed
    }

    pub fn exact(&self) -> ExactEquivalence {
        ExactEquivalence::new(self.machine.clone())
    }
}

impl Oracle for MealyOracle {
    fn inputs(&self) -> &[SymbolId] {
        self.machine.inputs()
    }

    fn start(&mut self, seed: Option<&Automaton>) -> Result<(), OracleError> {
        if let Some(seed) = seed {
            debug!("simulated oracle ignores seed {}", seed.name());
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), OracleError> {
        Ok(())
    }

    fn submit_query(&mut self, word: &[SymbolId]) -> Result<Vec<Reply>, QueryError> {
        self.posed += 1;
        Ok(self.machine.output_trace(word))
    }
}

fn default_retries() -> usize {
    1
}

/// Parameters of a [`NetworkOracle`]. Durations are given in milliseconds when read from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkOracleConfig {
    /// How long to wait for the reply to a single input symbol before it counts as silence.
    #[serde(with = "grammar::millis")]
    pub receive_timeout: Duration,
    /// Delay after every reply before the next symbol is sent.
    #[serde(with = "grammar::millis")]
    pub pacing: Duration,
    /// How often a query that failed on the transport is posed again.
    #[serde(default = "default_retries")]
    pub retries: usize,
    /// Pose all queries over one connection instead of a fresh one per query. Only sensible if
    /// the peer returns to its initial state by itself.
    pub reuse_connection: bool,
}

impl Default for NetworkOracleConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(1),
            pacing: Duration::from_millis(10),
            retries: default_retries(),
            reuse_connection: false,
        }
    }
}

impl NetworkOracleConfig {
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    pub fn reusing_connection(mut self) -> Self {
        self.reuse_connection = true;
        self
    }
}

/// An oracle that poses queries to a live peer through an [`AbstractionLayer`]. Every input
/// symbol is written with default field values, and the next message that arrives within the
/// receive timeout is its reply.
///
/// A query that fails on the transport is retried on a fresh connection, see
/// [`NetworkOracleConfig::retries`]. After that it fails for good and the learner only learns
/// that the query failed.
pub struct NetworkOracle<C: Channel = Box<dyn Channel>> {
    layer: AbstractionLayer<C>,
    inputs: Vec<SymbolId>,
    config: NetworkOracleConfig,
    seed: Option<Snapshot>,
    started: bool,
    posed: usize,
}

impl NetworkOracle {
    /// Creates an oracle on the channel described by `channel`.
    pub fn connect<I: IntoIterator<Item = SymbolId>>(
        channel: &ChannelConfig,
        alphabet: Arc<Alphabet>,
        inputs: I,
    ) -> Self {
        Self::new(AbstractionLayer::new(channel.build(), alphabet), inputs)
    }
}

impl<C: Channel> NetworkOracle<C> {
    pub fn new<I: IntoIterator<Item = SymbolId>>(layer: AbstractionLayer<C>, inputs: I) -> Self {
        Self {
            layer,
            inputs: inputs.into_iter().unique().collect(),
            config: NetworkOracleConfig::default(),
            seed: None,
            started: false,
            posed: 0,
        }
    }

    pub fn with_config(mut self, config: NetworkOracleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &NetworkOracleConfig {
        &self.config
    }

    pub fn layer(&self) -> &AbstractionLayer<C> {
        &self.layer
    }

    /// Number of queries that were answered by the peer.
    pub fn posed(&self) -> usize {
        self.posed
    }

    fn attempt(&mut self, word: &[SymbolId]) -> Result<Vec<Reply>, SessionError> {
        if !self.config.reuse_connection || !self.layer.is_open() {
            self.layer.close();
            self.layer.open()?;
            self.run_seed()?;
        }
        let mut replies = Vec::with_capacity(word.len());
        for symbol in word {
            self.layer.write_symbol(*symbol, &FieldValues::new())?;
            let (abstraction, bytes) = self.layer.read_symbol(self.config.receive_timeout)?;
            replies.push(abstraction.reply(&bytes));
            if !self.config.pacing.is_zero() {
                std::thread::sleep(self.config.pacing);
            }
        }
        if !self.config.reuse_connection {
            self.layer.close();
        }
        Ok(replies)
    }

    /// Plays the seed as the client on the freshly opened connection.
    fn run_seed(&mut self) -> Result<(), SessionError> {
        let Some(seed) = &self.seed else {
            return Ok(());
        };
        let alphabet = Arc::clone(self.layer.alphabet());
        let execution = ExecutionConfig::default()
            .with_pacing(self.config.pacing)
            .with_receive_timeout(self.config.receive_timeout);
        let layer = AbstractionLayer::new(self.layer.channel_mut(), alphabet);
        let mut runner =
            SessionRunner::new(Arc::clone(seed), layer, Role::Client).with_config(execution);
        let steps = runner.steps().count();
        match runner.take_end() {
            Some(SessionEnd::Aborted(e)) => Err(e),
            end => {
                trace!("seed took {steps} steps and ended with {end:?}");
                Ok(())
            }
        }
    }
}

impl<C: Channel> Oracle for NetworkOracle<C> {
    fn inputs(&self) -> &[SymbolId] {
        &self.inputs
    }

    fn start(&mut self, seed: Option<&Automaton>) -> Result<(), OracleError> {
        if self.started {
            return Ok(());
        }
        if let Some(seed) = seed {
            seed.validate(self.layer.alphabet())?;
            self.seed = Some(seed.clone().into_snapshot());
        }
        if self.config.reuse_connection {
            self.layer.open()?;
        }
        self.started = true;
        info!(
            "network oracle started on {} with {} inputs",
            self.layer.channel().describe(),
            self.inputs.len()
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<(), OracleError> {
        self.layer.close();
        self.started = false;
        info!("network oracle stopped after {} queries", self.posed);
        Ok(())
    }

    fn submit_query(&mut self, word: &[SymbolId]) -> Result<Vec<Reply>, QueryError> {
        let attempts = self.config.retries + 1;
        let mut attempt = 1;
        loop {
            match self.attempt(word) {
                Ok(replies) => {
                    self.posed += 1;
                    trace!(
                        "{} answered with {}",
                        self.layer.alphabet().show_word(word),
                        replies.iter().map(|r| self.layer.alphabet().show_reply(r)).join(".")
                    );
                    return Ok(replies);
                }
                Err(e) if attempt < attempts && !matches!(e, SessionError::Encoding(_)) => {
                    warn!(
                        "query {} failed in attempt {attempt}: {e}",
                        self.layer.alphabet().show_word(word)
                    );
                    self.layer.close();
                    attempt += 1;
                }
                Err(source) => {
                    self.layer.close();
                    return Err(QueryError::Failed {
                        query: self.layer.alphabet().show_word(word),
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use grammar::{
        channel::memory::{self, MemoryConnector},
        AutomatonBuilder, CloseHandle, ConnectionError, PeerSimulator, TransportError,
    };
    use grammar_core::Field;

    use super::*;

    pub fn keywords() -> Alphabet {
        let mut alphabet = Alphabet::new();
        for name in ["HELLO", "ACK", "BYE"] {
            alphabet
                .add_symbol(name, vec![Field::constant("kw", name)])
                .unwrap();
        }
        alphabet
    }

    /// Answers HELLO with ACK and moves to a greeted state, where everything is echoed except
    /// ACK, which is ignored. BYE goes back to the start.
    pub fn greeter(alphabet: &Alphabet) -> MealyMachine {
        let [hello, ack, bye] = ["HELLO", "ACK", "BYE"].map(|n| alphabet.id_of(n).unwrap());
        let mut mm = MealyMachine::new([hello, ack, bye]);
        let greeted = mm.add_state();
        mm.add_edge(0, hello, Reply::Symbol(ack), greeted);
        mm.add_edge(0, ack, Reply::Unknown, 0);
        mm.add_edge(0, bye, Reply::Silence, 0);
        mm.add_edge(greeted, hello, Reply::Symbol(hello), greeted);
        mm.add_edge(greeted, ack, Reply::Silence, greeted);
        mm.add_edge(greeted, bye, Reply::Symbol(bye), 0);
        mm
    }

    pub fn quick() -> NetworkOracleConfig {
        NetworkOracleConfig::default()
            .with_receive_timeout(Duration::from_millis(100))
            .with_pacing(Duration::ZERO)
    }

    /// Fails the first `failures` sends.
    struct Flaky {
        inner: MemoryConnector,
        failures: usize,
    }

    impl Channel for Flaky {
        fn open(&mut self) -> Result<(), ConnectionError> {
            self.inner.open()
        }

        fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(TransportError::Closed);
            }
            self.inner.send(bytes)
        }

        fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
            self.inner.receive(timeout)
        }

        fn close(&mut self) {
            self.inner.close()
        }

        fn is_open(&self) -> bool {
            self.inner.is_open()
        }

        fn close_handle(&self) -> CloseHandle {
            self.inner.close_handle()
        }
    }

    struct Unmanaged;

    impl Oracle for Unmanaged {
        fn inputs(&self) -> &[SymbolId] {
            &[]
        }

        fn submit_query(&mut self, word: &[SymbolId]) -> Result<Vec<Reply>, QueryError> {
            Ok(vec![Reply::Silence; word.len()])
        }
    }

    #[test_log::test]
    fn start_and_stop_are_unsupported_by_default() {
        let mut oracle = Unmanaged;
        assert!(matches!(
            oracle.start(None),
            Err(OracleError::Unsupported("start"))
        ));
        assert!(matches!(oracle.stop(), Err(OracleError::Unsupported("stop"))));
        assert_eq!(oracle.submit_query(&[SymbolId(0)]).unwrap(), vec![Reply::Silence]);
    }

    #[test_log::test]
    fn mealy_oracle_answers() {
        let alphabet = keywords();
        let [hello, ack, bye] = ["HELLO", "ACK", "BYE"].map(|n| alphabet.id_of(n).unwrap());
        let mut oracle = MealyOracle::new(greeter(&alphabet));
        assert_eq!(oracle.inputs(), &[hello, ack, bye]);
        oracle.start(None).unwrap();
        assert_eq!(
            oracle.submit_query(&[hello, ack, bye, bye]).unwrap(),
            vec![
                Reply::Symbol(ack),
                Reply::Silence,
                Reply::Symbol(bye),
                Reply::Silence
            ]
        );
        assert_eq!(oracle.posed(), 1);
    }

    #[test_log::test]
    fn network_oracle_against_simulator() {
        let alphabet = Arc::new(keywords());
        let [hello, ack, bye] = ["HELLO", "ACK", "BYE"].map(|n| alphabet.id_of(n).unwrap());
        let listener = memory::listener();
        let simulator =
            PeerSimulator::new(greeter(&alphabet), Arc::clone(&alphabet)).spawn(listener.clone());

        let layer = AbstractionLayer::new(listener.connector(), Arc::clone(&alphabet));
        let mut oracle = NetworkOracle::new(layer, [hello, ack, bye]).with_config(quick());
        oracle.start(None).unwrap();
        assert_eq!(
            oracle.submit_query(&[hello, hello, bye]).unwrap(),
            vec![Reply::Symbol(ack), Reply::Symbol(hello), Reply::Symbol(bye)]
        );
        // a fresh connection starts from the initial state again
        assert_eq!(
            oracle.submit_query(&[ack, bye]).unwrap(),
            vec![Reply::Unknown, Reply::Silence]
        );
        oracle.stop().unwrap();
        assert_eq!(oracle.posed(), 2);
        simulator.stop();
    }

    #[test_log::test]
    fn seed_precedes_every_query() {
        let alphabet = Arc::new(keywords());
        let [hello, ack, bye] = ["HELLO", "ACK", "BYE"].map(|n| alphabet.id_of(n).unwrap());
        let listener = memory::listener();
        let simulator =
            PeerSimulator::new(greeter(&alphabet), Arc::clone(&alphabet)).spawn(listener.clone());

        let mut builder = AutomatonBuilder::new("greeting");
        let start = builder.add_state("start", Role::Client).unwrap();
        let sent = builder.add_state("sent", Role::Server).unwrap();
        let greeted = builder.add_state("greeted", Role::Client).unwrap();
        builder.transition(start, sent).outputs([hello]).add().unwrap();
        builder.transition(sent, greeted).outputs([ack]).add().unwrap();
        let seed = builder.build().unwrap();

        let layer = AbstractionLayer::new(listener.connector(), Arc::clone(&alphabet));
        let mut oracle = NetworkOracle::new(layer, [hello, bye]).with_config(quick());
        oracle.start(Some(&seed)).unwrap();
        for _ in 0..2 {
            assert_eq!(
                oracle.submit_query(&[hello, bye]).unwrap(),
                vec![Reply::Symbol(hello), Reply::Symbol(bye)]
            );
        }
        oracle.stop().unwrap();
        simulator.stop();
    }

    #[test_log::test]
    fn transport_failures_are_retried_once() {
        let alphabet = Arc::new(keywords());
        let hello = alphabet.id_of("HELLO").unwrap();
        let listener = memory::listener();
        let simulator =
            PeerSimulator::new(greeter(&alphabet), Arc::clone(&alphabet)).spawn(listener.clone());

        let flaky = Flaky {
            inner: listener.connector(),
            failures: 1,
        };
        let layer = AbstractionLayer::new(flaky, Arc::clone(&alphabet));
        let mut oracle = NetworkOracle::new(layer, [hello]).with_config(quick());
        oracle.start(None).unwrap();
        let ack = alphabet.id_of("ACK").unwrap();
        assert_eq!(oracle.submit_query(&[hello]).unwrap(), vec![Reply::Symbol(ack)]);

        let flaky = Flaky {
            inner: listener.connector(),
            failures: 2,
        };
        let layer = AbstractionLayer::new(flaky, Arc::clone(&alphabet));
        let mut oracle = NetworkOracle::new(layer, [hello]).with_config(quick());
        oracle.start(None).unwrap();
        match oracle.submit_query(&[hello]) {
            Err(QueryError::Failed {
                attempts,
                source: SessionError::Transport(TransportError::Closed),
                ..
            }) => assert_eq!(attempts, 2),
            other => panic!("expected a failed query, got {other:?}"),
        }
        assert_eq!(oracle.posed(), 0);
        simulator.stop();
    }

    #[test]
    fn config_from_json() {
        let config: NetworkOracleConfig =
            serde_json::from_str(r#"{ "receive_timeout": 250, "reuse_connection": true }"#)
                .unwrap();
        assert_eq!(config.receive_timeout, Duration::from_millis(250));
        assert_eq!(config.retries, 1);
        assert!(config.reuse_connection);
    }
}
