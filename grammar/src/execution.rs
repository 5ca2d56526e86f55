use crossbeam_channel::Sender;
use grammar_core::SymbolId;
use itertools::Itertools;
use tracing::{debug, trace, warn};

use crate::{
    Abstraction, AbstractionLayer, Automaton, Channel, Divergence, ExecutionConfig,
    ExecutionEvent, Role, Session, SessionError, StateId, StateKind, SymbolSelector, Transition,
    TransitionId,
};

/// What happened on the wire while a transition was executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    /// No I/O took place: the transition leaves a pseudo state, has no symbols, or the local side
    /// would have to emit a message that does not decode.
    Nothing,
    Sent { symbol: SymbolId, bytes: usize },
    Received { abstraction: Abstraction, bytes: Vec<u8> },
}

/// One executed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub transition: TransitionId,
    pub source: StateId,
    pub target: StateId,
    pub exchange: Exchange,
    pub divergence: Option<Divergence>,
}

/// Everything a transition needs to be executed within a session.
pub struct Execution<'a, C: Channel> {
    pub(crate) automaton: &'a Automaton,
    pub(crate) layer: &'a mut AbstractionLayer<C>,
    pub(crate) session: &'a mut Session,
    pub(crate) selector: &'a mut dyn SymbolSelector,
    pub(crate) config: &'a ExecutionConfig,
    pub(crate) role: Role,
    pub(crate) events: Option<&'a Sender<ExecutionEvent>>,
}

impl<'a, C: Channel> Execution<'a, C> {
    pub fn new(
        automaton: &'a Automaton,
        layer: &'a mut AbstractionLayer<C>,
        session: &'a mut Session,
        selector: &'a mut dyn SymbolSelector,
        config: &'a ExecutionConfig,
        role: Role,
    ) -> Self {
        Self {
            automaton,
            layer,
            session,
            selector,
            config,
            role,
            events: None,
        }
    }

    pub fn with_events(mut self, events: &'a Sender<ExecutionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub(crate) fn emit(&self, event: ExecutionEvent) {
        if let Some(events) = self.events {
            // nobody listening anymore is fine
            events.send(event).ok();
        }
    }

    pub(crate) fn pace(&self) {
        if !self.config.pacing.is_zero() {
            std::thread::sleep(self.config.pacing);
        }
    }
}

impl Transition {
    /// Whether executing this transition moves no message.
    pub fn is_inert(&self, automaton: &Automaton) -> bool {
        (self.outputs.is_empty() && !self.unknown_output)
            || automaton
                .state(self.source)
                .is_some_and(|s| s.kind == StateKind::Start)
    }

    /// Whether the local side speaks on this transition when it plays `role`.
    pub fn is_emitted_by(&self, role: Role) -> bool {
        self.role == role
    }

    /// Executes the transition and returns the step that was taken, the target of which is the
    /// next state of the session.
    ///
    /// If the local side speaks, a symbol is selected, written and followed by the pacing delay.
    /// If the selector declines, nothing is written and `None` is returned. Otherwise a message
    /// is read and the transition is taken regardless of what arrived: mismatches are logged
    /// and reported as the step's divergence. Only transport and encoding failures are errors.
    pub fn execute<C: Channel>(&self, ctx: &mut Execution<'_, C>) -> Result<Option<Step>, SessionError> {
        if self.is_inert(ctx.automaton) {
            trace!("{} exchanges nothing", self.name);
            return Ok(Some(self.finish(ctx, Exchange::Nothing, None)));
        }
        ctx.emit(ExecutionEvent::TransitionStarted {
            transition: self.id,
            name: self.name.clone(),
        });

        if self.is_emitted_by(ctx.role) {
            if self.outputs.is_empty() {
                debug!("{} only carries unknown messages, nothing to send", self.name);
                return Ok(Some(self.finish(ctx, Exchange::Nothing, None)));
            }
            let Some(symbol) = ctx.selector.select_symbol(self) else {
                debug!("no symbol selected for {}", self.name);
                return Ok(None);
            };
            if !self.accepts(symbol) {
                warn!(
                    "selector picked {} which {} cannot emit",
                    ctx.layer.alphabet().show_symbol(symbol),
                    self.name
                );
                return Ok(None);
            }
            let bytes = ctx.layer.write_symbol(symbol, &self.preset(symbol))?;
            ctx.pace();
            Ok(Some(self.finish(ctx, Exchange::Sent { symbol, bytes }, None)))
        } else {
            let (abstraction, bytes) = ctx
                .layer
                .read_symbol_expecting(&self.outputs, ctx.config.receive_timeout)?;
            ctx.pace();
            Ok(Some(self.accept(ctx, abstraction, bytes)))
        }
    }

    /// Completes a reception on this transition with what was read.
    pub(crate) fn accept<C: Channel>(
        &self,
        ctx: &mut Execution<'_, C>,
        abstraction: Abstraction,
        bytes: Vec<u8>,
    ) -> Step {
        let alphabet = ctx.layer.alphabet();
        let divergence = match abstraction {
            Abstraction::Matched(symbol) => {
                debug!(
                    "{} received expected {}",
                    self.name,
                    alphabet.show_symbol(symbol)
                );
                None
            }
            Abstraction::KnownButUnexpected(received) => {
                warn!(
                    "{} received {} but expected one of {}",
                    self.name,
                    alphabet.show_symbol(received),
                    self.outputs.iter().map(|s| alphabet.show_symbol(*s)).join(", ")
                );
                Some(Divergence::Unexpected {
                    expected: self.outputs.clone(),
                    received,
                })
            }
            Abstraction::Unknown if bytes.is_empty() => {
                warn!(
                    "{} received nothing within {:?}",
                    self.name, ctx.config.receive_timeout
                );
                Some(Divergence::Unknown { bytes: vec![] })
            }
            Abstraction::Unknown if self.unknown_output => {
                debug!(
                    "{} received {} bytes of an unknown message as expected",
                    self.name,
                    bytes.len()
                );
                None
            }
            Abstraction::Unknown => {
                warn!("{} received {} bytes of an unknown message", self.name, bytes.len());
                Some(Divergence::Unknown {
                    bytes: bytes.clone(),
                })
            }
        };
        if let Some(divergence) = &divergence {
            ctx.emit(ExecutionEvent::Diverged {
                transition: self.id,
                divergence: divergence.clone(),
            });
        }
        self.finish(ctx, Exchange::Received { abstraction, bytes }, divergence)
    }

    fn finish<C: Channel>(
        &self,
        ctx: &mut Execution<'_, C>,
        exchange: Exchange,
        divergence: Option<Divergence>,
    ) -> Step {
        if let Some(target) = ctx.automaton.state(self.target) {
            ctx.session.enter(target);
        }
        ctx.emit(ExecutionEvent::TransitionFinished {
            transition: self.id,
            target: self.target,
        });
        Step {
            transition: self.id,
            source: self.source,
            target: self.target,
            exchange,
            divergence,
        }
    }
}
