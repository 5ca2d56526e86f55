use std::{
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use grammar_core::{Alphabet, FieldValues, Reply};
use tracing::{debug, trace, warn};

use crate::{
    channel::{lock, memory::MemoryListener},
    AbstractionLayer, Channel, CloseHandle, MealyMachine,
    SessionError, TransportError,
};

const POLL: Duration = Duration::from_millis(50);

/// Plays a [`MealyMachine`] as the responding peer: every received symbol is fed to the machine
/// and the produced reply is sent back. Silence is answered with nothing, an unknown reply with
/// bytes that do not decode. Every connection starts in the initial state.
#[derive(Debug, Clone)]
pub struct PeerSimulator {
    machine: Arc<MealyMachine>,
    alphabet: Arc<Alphabet>,
    garbage: Vec<u8>,
}

impl PeerSimulator {
    pub fn new(machine: MealyMachine, alphabet: Arc<Alphabet>) -> Self {
        Self {
            machine: Arc::new(machine),
            alphabet,
            garbage: vec![0xff, 0x00, 0xff],
        }
    }

    /// Bytes sent when the machine replies [`Reply::Unknown`].
    pub fn with_garbage(mut self, garbage: Vec<u8>) -> Self {
        self.garbage = garbage;
        self
    }

    pub fn machine(&self) -> &MealyMachine {
        &self.machine
    }

    /// Answers on `channel` until the other side closes it. Returns the number of symbols that
    /// were answered.
    pub fn serve<C: Channel>(&self, channel: C) -> Result<usize, SessionError> {
        let mut layer = AbstractionLayer::new(channel, Arc::clone(&self.alphabet));
        layer.open()?;
        let mut state = self.machine.initial();
        let mut answered = 0;
        loop {
            let (abstraction, bytes) = match layer.read_symbol(POLL) {
                Ok(received) => received,
                Err(TransportError::Closed | TransportError::Cancelled) => {
                    trace!("connection ended after {answered} symbols");
                    return Ok(answered);
                }
                Err(e) => return Err(e.into()),
            };
            let Some(input) = abstraction.symbol() else {
                if !bytes.is_empty() {
                    warn!("ignoring {} bytes that do not decode", bytes.len());
                }
                continue;
            };
            let (reply, next) = self.machine.step(state, input);
            state = next;
            answered += 1;
            match reply {
                Reply::Symbol(output) => {
                    layer.write_symbol(output, &FieldValues::new())?;
                }
                Reply::Unknown => {
                    layer.channel_mut().send(&self.garbage)?;
                }
                Reply::Silence => {}
            }
        }
    }

    /// Serves every connection accepted by `listener` on its own thread until the returned
    /// handle is stopped or dropped.
    pub fn spawn(self, listener: MemoryListener) -> SimulatorHandle {
        let stop = CloseHandle::new();
        let stopped = stop.clone();
        let connections = Arc::new(Mutex::new(Vec::<Served>::new()));
        let served = Arc::clone(&connections);
        let thread = thread::spawn(move || {
            while !stopped.is_closed() {
                prune(&served);
                let Some(connection) = listener.accept(POLL) else {
                    continue;
                };
                debug!("simulator accepted a connection");
                let handle = connection.close_handle();
                let simulator = self.clone();
                let thread = thread::spawn(move || {
                    if let Err(e) = simulator.serve(connection) {
                        warn!("simulated peer failed: {e}");
                    }
                });
                lock(&served).push(Served { handle, thread });
            }
            let remaining = std::mem::take(&mut *lock(&served));
            trace!("stopping {} connections", remaining.len());
            for connection in &remaining {
                connection.handle.close();
            }
            for connection in remaining {
                connection.thread.join().ok();
            }
        });
        SimulatorHandle {
            stop,
            connections,
            thread: Some(thread),
        }
    }
}

/// A connection that is served on its own thread.
#[derive(Debug)]
struct Served {
    handle: CloseHandle,
    thread: JoinHandle<()>,
}

fn prune(connections: &Mutex<Vec<Served>>) -> usize {
    let mut connections = lock(connections);
    connections.retain(|c| !c.thread.is_finished());
    connections.len()
}

/// Stops the simulator when dropped.
#[derive(Debug)]
pub struct SimulatorHandle {
    stop: CloseHandle,
    connections: Arc<Mutex<Vec<Served>>>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatorHandle {
    /// Number of connections that are still being served.
    pub fn live_connections(&self) -> usize {
        prune(&self.connections)
    }

    /// Closes all connections and waits for the simulator to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.close();
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}

impl Drop for SimulatorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
