use std::time::Duration;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use tracing::trace;

use super::{Channel, CloseHandle};
use crate::{ConnectionError, TransportError};

/// One end of an in-memory connection. Every send arrives as exactly one message at the other
/// end. Dropping or closing an end makes receptions on the other end fail with
/// [`TransportError::Closed`].
#[derive(Debug)]
pub struct MemoryChannel {
    outgoing: Option<Sender<Vec<u8>>>,
    incoming: Receiver<Vec<u8>>,
    handle: CloseHandle,
    closing: Receiver<()>,
}

/// Creates two connected in-memory channels.
pub fn pair() -> (MemoryChannel, MemoryChannel) {
    let (left_tx, left_rx) = unbounded();
    let (right_tx, right_rx) = unbounded();
    (
        MemoryChannel::end(left_tx, right_rx),
        MemoryChannel::end(right_tx, left_rx),
    )
}

impl MemoryChannel {
    fn end(outgoing: Sender<Vec<u8>>, incoming: Receiver<Vec<u8>>) -> Self {
        let handle = CloseHandle::new();
        // the sender is never used, dropping it disconnects `closing`
        let (signal, closing) = bounded::<()>(0);
        handle.on_close(move || drop(signal));
        Self {
            outgoing: Some(outgoing),
            incoming,
            handle,
            closing,
        }
    }
}

impl Channel for MemoryChannel {
    fn open(&mut self) -> Result<(), ConnectionError> {
        if self.handle.is_closed() {
            return Err(ConnectionError::Refused(
                "in-memory connection that was closed".to_string(),
            ));
        }
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        if self.handle.is_closed() {
            return Err(TransportError::Cancelled);
        }
        let outgoing = self.outgoing.as_ref().ok_or(TransportError::NotOpen)?;
        outgoing
            .send(bytes.to_vec())
            .map_err(|_| TransportError::Closed)?;
        trace!("sent {} bytes in memory", bytes.len());
        Ok(bytes.len())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.handle.is_closed() {
            return Err(TransportError::Cancelled);
        }
        select! {
            recv(self.incoming) -> message => message.map_err(|_| TransportError::Closed),
            recv(self.closing) -> _ => Err(TransportError::Cancelled),
            default(timeout) => Ok(Vec::new()),
        }
    }

    fn close(&mut self) {
        self.handle.close();
        self.outgoing = None;
    }

    fn is_open(&self) -> bool {
        !self.handle.is_closed()
    }

    fn close_handle(&self) -> CloseHandle {
        self.handle.clone()
    }

    fn describe(&self) -> String {
        "in-memory channel".to_string()
    }
}

/// Accepts the connections that are opened through its [`MemoryConnector`]s.
#[derive(Debug, Clone)]
pub struct MemoryListener {
    incoming: Receiver<MemoryChannel>,
    outgoing: Sender<MemoryChannel>,
}

/// Creates a listener, connectors are obtained through [`MemoryListener::connector`].
pub fn listener() -> MemoryListener {
    let (outgoing, incoming) = unbounded();
    MemoryListener { incoming, outgoing }
}

impl MemoryListener {
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            listener: self.outgoing.clone(),
            current: None,
            handle: CloseHandle::new(),
        }
    }

    /// Waits up to `timeout` for the next connection.
    pub fn accept(&self, timeout: Duration) -> Option<MemoryChannel> {
        self.incoming.recv_timeout(timeout).ok()
    }
}

/// Client side of a [`MemoryListener`]: every call to [`Channel::open`] on a closed connector
/// creates a fresh connection, the other end of which is handed to the listener.
#[derive(Debug)]
pub struct MemoryConnector {
    listener: Sender<MemoryChannel>,
    current: Option<MemoryChannel>,
    handle: CloseHandle,
}

impl MemoryConnector {
    fn connection(&mut self) -> Result<&mut MemoryChannel, TransportError> {
        self.current.as_mut().ok_or(TransportError::NotOpen)
    }
}

impl Channel for MemoryConnector {
    fn open(&mut self) -> Result<(), ConnectionError> {
        if self.is_open() {
            return Ok(());
        }
        if self.handle.is_closed() {
            self.handle = CloseHandle::new();
        }
        let (local, remote) = pair();
        self.listener
            .send(remote)
            .map_err(|_| ConnectionError::Refused("in-memory listener".to_string()))?;
        let connection = local.close_handle();
        self.handle.on_close(move || connection.close());
        self.current = Some(local);
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        self.connection()?.send(bytes)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.connection()?.receive(timeout)
    }

    fn close(&mut self) {
        self.handle.close();
        if let Some(mut connection) = self.current.take() {
            connection.close();
        }
    }

    fn is_open(&self) -> bool {
        self.current.as_ref().is_some_and(|c| c.is_open())
    }

    fn close_handle(&self) -> CloseHandle {
        self.handle.clone()
    }

    fn describe(&self) -> String {
        "in-memory connector".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use super::*;

    #[test_log::test]
    fn message_boundaries() {
        let (mut left, mut right) = pair();
        left.send(b"HELLO").unwrap();
        left.send(b"BYE").unwrap();
        let timeout = Duration::from_millis(50);
        assert_eq!(right.receive(timeout).unwrap(), b"HELLO");
        assert_eq!(right.receive(timeout).unwrap(), b"BYE");
        assert!(right.receive(timeout).unwrap().is_empty());
    }

    #[test_log::test]
    fn peer_closing() {
        let (mut left, mut right) = pair();
        left.close();
        assert!(matches!(
            right.receive(Duration::from_millis(50)),
            Err(TransportError::Closed)
        ));
        assert!(matches!(left.send(b"x"), Err(TransportError::Cancelled)));
        assert!(left.open().is_err());
    }

    #[test_log::test]
    fn close_handle_cancels_pending_receive() {
        let (mut left, _right) = pair();
        let handle = left.close_handle();
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            handle.close();
        });
        let start = Instant::now();
        let result = left.receive(Duration::from_secs(10));
        assert!(matches!(result, Err(TransportError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
        closer.join().unwrap();
    }

    #[test_log::test]
    fn connector_reconnects() {
        let listener = listener();
        let mut connector = listener.connector();
        assert!(matches!(
            connector.send(b"x"),
            Err(TransportError::NotOpen)
        ));

        connector.open().unwrap();
        let mut first = listener.accept(Duration::from_millis(50)).unwrap();
        connector.send(b"one").unwrap();
        assert_eq!(first.receive(Duration::from_millis(50)).unwrap(), b"one");

        connector.close();
        assert!(!connector.is_open());
        assert!(matches!(
            first.receive(Duration::from_millis(50)),
            Err(TransportError::Closed)
        ));

        connector.open().unwrap();
        let mut second = listener.accept(Duration::from_millis(50)).unwrap();
        second.send(b"two").unwrap();
        assert_eq!(connector.receive(Duration::from_millis(50)).unwrap(), b"two");
    }
}
