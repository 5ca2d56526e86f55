use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use grammar_core::{Alphabet, Show};
use itertools::Itertools;
use rayon::prelude::*;
use tracing::{debug, error, info};

use crate::{
    AbstractionLayer, Automaton, Channel, ChannelConfig, CloseHandle, ConnectionError,
    Divergence, DivergencePolicy, Execution, ExecutionConfig, ExecutionEvent, Role,
    SessionError, Snapshot, State, StateId, Step, SymbolSelector, Transition, UniformSelector,
};

/// The state of one run through an automaton: where it currently is and the names of all
/// states that were entered so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    current: StateId,
    history: Vec<String>,
}

impl Session {
    pub fn new(automaton: &Automaton) -> Self {
        Self {
            current: automaton.initial(),
            history: vec![],
        }
    }

    pub fn current(&self) -> StateId {
        self.current
    }

    /// Names of the entered states, the initial state is not included.
    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub(crate) fn enter(&mut self, state: &State) {
        self.current = state.id();
        self.history.push(state.name().to_string());
    }
}

/// Why a session stopped.
#[derive(Debug)]
pub enum SessionEnd {
    /// A sink or a state without outgoing transitions was reached.
    Terminal(StateId),
    /// The selector did not provide anything to emit.
    SelectorExhausted,
    StepLimit,
    /// A reception timed out and the session is configured to end on silence.
    Silence,
    /// A divergence occurred for which the policy is to end the session.
    Diverged(Divergence),
    Aborted(SessionError),
}

impl SessionEnd {
    pub fn is_aborted(&self) -> bool {
        matches!(self, SessionEnd::Aborted(_))
    }
}

/// The complete record of a finished session.
#[derive(Debug)]
pub struct SessionTrace {
    pub history: Vec<String>,
    pub steps: Vec<Step>,
    pub end: SessionEnd,
}

enum Choice<'a> {
    One(&'a Transition),
    Dispatch(Vec<&'a Transition>),
    Exhausted,
}

/// Drives an automaton over one channel, impersonating `role`.
///
/// Progress is pulled through [`SessionRunner::steps`], which lazily executes one transition per
/// item. The sequence is finite: it ends in a terminal state, when the selector has nothing left
/// to emit, after [`ExecutionConfig::max_steps`] or on a transport failure. The reason is
/// available through [`SessionRunner::end`]. A runner can be restarted, which closes the channel
/// and begins a fresh session from the initial state.
pub struct SessionRunner<C: Channel = Box<dyn Channel>> {
    automaton: Snapshot,
    layer: AbstractionLayer<C>,
    role: Role,
    selector: Box<dyn SymbolSelector>,
    config: ExecutionConfig,
    events: Option<Sender<ExecutionEvent>>,
    session: Session,
    taken: usize,
    started: bool,
    end: Option<SessionEnd>,
}

impl<C: Channel> SessionRunner<C> {
    pub fn new(automaton: Snapshot, layer: AbstractionLayer<C>, role: Role) -> Self {
        let session = Session::new(&automaton);
        Self {
            automaton,
            layer,
            role,
            selector: Box::new(UniformSelector::new()),
            config: ExecutionConfig::default(),
            events: None,
            session,
            taken: 0,
            started: false,
            end: None,
        }
    }

    pub fn with_selector<S: SymbolSelector + 'static>(mut self, selector: S) -> Self {
        self.selector = Box::new(selector);
        self
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns a receiver for the events of this and all following sessions of the runner.
    pub fn subscribe(&mut self) -> Receiver<ExecutionEvent> {
        let (sender, receiver) = unbounded();
        self.events = Some(sender);
        receiver
    }

    pub fn automaton(&self) -> &Snapshot {
        &self.automaton
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn layer(&self) -> &AbstractionLayer<C> {
        &self.layer
    }

    /// Closing the handle aborts the session from another thread.
    pub fn close_handle(&self) -> CloseHandle {
        self.layer.close_handle()
    }

    pub fn end(&self) -> Option<&SessionEnd> {
        self.end.as_ref()
    }

    /// Removes the reason the session ended, e.g. to take ownership of the error that aborted it.
    pub fn take_end(&mut self) -> Option<SessionEnd> {
        self.end.take()
    }

    /// Opens the channel. Called implicitly by the first step if necessary.
    pub fn start(&mut self) -> Result<(), ConnectionError> {
        if self.started {
            return Ok(());
        }
        self.layer.open()?;
        self.started = true;
        info!(
            "starting {} session on {}",
            self.role.show(),
            self.automaton.name()
        );
        self.emit(ExecutionEvent::SessionStarted {
            automaton: self.automaton.name().to_string(),
            role: self.role,
        });
        Ok(())
    }

    pub fn steps(&mut self) -> Steps<'_, C> {
        Steps { runner: self }
    }

    /// Runs a complete session and closes the channel afterwards.
    pub fn run(&mut self) -> Result<SessionTrace, ConnectionError> {
        self.start()?;
        let steps = self.steps().collect_vec();
        self.layer.close();
        Ok(SessionTrace {
            history: self.session.history().to_vec(),
            steps,
            end: self.end.take().unwrap_or(SessionEnd::StepLimit),
        })
    }

    /// Closes the channel and resets the session to the initial state. The channel is opened
    /// again by [`SessionRunner::start`] or the next step.
    pub fn restart(&mut self) {
        self.layer.close();
        self.session = Session::new(&self.automaton);
        self.taken = 0;
        self.started = false;
        self.end = None;
        debug!("session on {} restarted", self.automaton.name());
    }

    /// Like [`SessionRunner::restart`], but continues with a different snapshot.
    pub fn restart_with(&mut self, automaton: Snapshot) {
        self.automaton = automaton;
        self.restart();
    }

    pub fn close(&mut self) {
        self.layer.close();
    }

    fn emit(&self, event: ExecutionEvent) {
        if let Some(events) = &self.events {
            events.send(event).ok();
        }
    }

    fn context<'b>(&'b mut self, automaton: &'b Automaton) -> Execution<'b, C> {
        Execution {
            automaton,
            layer: &mut self.layer,
            session: &mut self.session,
            selector: self.selector.as_mut(),
            config: &self.config,
            role: self.role,
            events: self.events.as_ref(),
        }
    }

    fn finish(&mut self, end: SessionEnd) {
        match &end {
            SessionEnd::Aborted(e) => error!("session aborted after {} steps: {e}", self.taken),
            other => info!("session ended after {} steps: {other:?}", self.taken),
        }
        self.emit(ExecutionEvent::SessionEnded { steps: self.taken });
        self.end = Some(end);
    }

    /// If the local side can speak, it does and the selector decides on which transition.
    /// Otherwise the next message decides.
    fn choose<'a>(&mut self, automaton: &'a Automaton, candidates: Vec<&'a Transition>) -> Choice<'a> {
        if let [single] = candidates.as_slice() {
            return Choice::One(*single);
        }
        let (receiving, speaking): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|t| !t.is_inert(automaton) && !t.is_emitted_by(self.role));
        if speaking.is_empty() {
            return Choice::Dispatch(receiving);
        }
        match self.selector.select_transition(&speaking) {
            Some(transition) => Choice::One(transition),
            None => Choice::Exhausted,
        }
    }

    fn dispatch(&mut self, automaton: &Automaton, candidates: &[&Transition]) -> Result<Step, SessionError> {
        let expected = candidates
            .iter()
            .flat_map(|t| t.outputs().iter().copied())
            .unique()
            .collect_vec();
        for transition in candidates {
            self.emit(ExecutionEvent::TransitionStarted {
                transition: transition.id(),
                name: transition.name().to_string(),
            });
        }
        let (abstraction, bytes) = self
            .layer
            .read_symbol_expecting(&expected, self.config.receive_timeout)?;
        let chosen = match abstraction.symbol() {
            Some(symbol) => candidates.iter().find(|t| t.accepts(symbol)),
            None if !bytes.is_empty() => candidates.iter().find(|t| t.expects_unknown()),
            None => None,
        }
        .unwrap_or(&candidates[0]);
        let abstraction = abstraction.relative_to(chosen.outputs());

        let mut ctx = self.context(automaton);
        ctx.pace();
        Ok(chosen.accept(&mut ctx, abstraction, bytes))
    }

    fn apply_policies(&mut self, step: &Step) {
        let Some(divergence) = &step.divergence else {
            return;
        };
        if self.config.end_on_silence && divergence.is_silence() {
            self.finish(SessionEnd::Silence);
            return;
        }
        let policy = match divergence {
            Divergence::Unexpected { .. } => self.config.on_unexpected,
            Divergence::Unknown { .. } => self.config.on_unknown,
        };
        if policy == DivergencePolicy::EndSession {
            self.finish(SessionEnd::Diverged(divergence.clone()));
        }
    }

    fn advance(&mut self) -> Option<Step> {
        if self.end.is_some() {
            return None;
        }
        if let Err(e) = self.start() {
            self.finish(SessionEnd::Aborted(e.into()));
            return None;
        }
        if self.taken >= self.config.max_steps {
            self.finish(SessionEnd::StepLimit);
            return None;
        }

        let automaton = Arc::clone(&self.automaton);
        let current = self.session.current();
        if automaton.is_terminal(current) {
            self.finish(SessionEnd::Terminal(current));
            return None;
        }

        let candidates = automaton.transitions_from(current).collect_vec();
        let result = match self.choose(&automaton, candidates) {
            Choice::One(transition) => {
                let mut ctx = self.context(&automaton);
                transition.execute(&mut ctx)
            }
            Choice::Dispatch(candidates) => self.dispatch(&automaton, &candidates).map(Some),
            Choice::Exhausted => Ok(None),
        };

        match result {
            Ok(Some(step)) => {
                self.taken += 1;
                self.apply_policies(&step);
                Some(step)
            }
            Ok(None) => {
                self.finish(SessionEnd::SelectorExhausted);
                None
            }
            Err(e) => {
                self.finish(SessionEnd::Aborted(e));
                None
            }
        }
    }
}

/// Lazily executes the transitions of a session, see [`SessionRunner::steps`].
pub struct Steps<'r, C: Channel> {
    runner: &'r mut SessionRunner<C>,
}

impl<C: Channel> Iterator for Steps<'_, C> {
    type Item = Step;

    fn next(&mut self) -> Option<Self::Item> {
        self.runner.advance()
    }
}

/// Opens the channel described by `channel` and runs one session with random symbol selection.
pub fn run_session(
    automaton: Snapshot,
    alphabet: Arc<Alphabet>,
    role: Role,
    channel: &ChannelConfig,
    config: ExecutionConfig,
) -> Result<SessionTrace, ConnectionError> {
    let layer = AbstractionLayer::new(channel.build(), alphabet);
    SessionRunner::new(automaton, layer, role)
        .with_config(config)
        .run()
}

/// Runs independent sessions in parallel. Each runner owns its channel, the automaton snapshots
/// and alphabets are only read.
pub fn run_sessions<C: Channel>(
    runners: Vec<SessionRunner<C>>,
) -> Vec<Result<SessionTrace, ConnectionError>> {
    runners
        .into_par_iter()
        .map(|mut runner| runner.run())
        .collect()
}
