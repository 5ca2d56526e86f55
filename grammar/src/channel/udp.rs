use std::{
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
    time::{Duration, Instant},
};

use tracing::debug;

use super::{Channel, CloseHandle};
use crate::{ConnectionError, TransportError};

const DATAGRAM: usize = 65_536;
// receptions wake up this often to notice a closed handle
const POLL_SLICE: Duration = Duration::from_millis(25);

fn receive_from(
    socket: &UdpSocket,
    buffer: &mut [u8],
    handle: &CloseHandle,
    timeout: Duration,
) -> Result<Option<(usize, SocketAddr)>, TransportError> {
    let deadline = Instant::now() + timeout;
    loop {
        if handle.is_closed() {
            return Err(TransportError::Cancelled);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        socket.set_read_timeout(Some(remaining.min(POLL_SLICE)))?;
        match socket.recv_from(buffer) {
            Ok(received) => return Ok(Some(received)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                return Err(TransportError::Closed)
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn check_sent(written: usize, expected: usize) -> Result<usize, TransportError> {
    if written < expected {
        Err(TransportError::Partial { written, expected })
    } else {
        Ok(written)
    }
}

/// Sends datagrams to a fixed remote endpoint.
#[derive(Debug)]
pub struct UdpClient {
    remote: SocketAddr,
    socket: Option<UdpSocket>,
    handle: CloseHandle,
    buffer: Vec<u8>,
}

impl UdpClient {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            socket: None,
            handle: CloseHandle::new(),
            buffer: vec![0; DATAGRAM],
        }
    }
}

impl Channel for UdpClient {
    fn open(&mut self) -> Result<(), ConnectionError> {
        if self.is_open() {
            return Ok(());
        }
        if self.handle.is_closed() {
            self.handle = CloseHandle::new();
        }
        let local: SocketAddr = if self.remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(self.remote)?;
        debug!("udp socket {} bound for {}", socket.local_addr()?, self.remote);
        self.socket = Some(socket);
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        if self.handle.is_closed() {
            return Err(TransportError::Cancelled);
        }
        let socket = self.socket.as_ref().ok_or(TransportError::NotOpen)?;
        check_sent(socket.send(bytes)?, bytes.len())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotOpen)?;
        Ok(
            match receive_from(socket, &mut self.buffer, &self.handle, timeout)? {
                Some((n, _)) => self.buffer[..n].to_vec(),
                None => Vec::new(),
            },
        )
    }

    fn close(&mut self) {
        self.handle.close();
        self.socket = None;
    }

    fn is_open(&self) -> bool {
        self.socket.is_some() && !self.handle.is_closed()
    }

    fn close_handle(&self) -> CloseHandle {
        self.handle.clone()
    }

    fn describe(&self) -> String {
        format!("udp client to {}", self.remote)
    }
}

/// Receives datagrams on a local address and answers to whoever sent the last one.
#[derive(Debug)]
pub struct UdpServer {
    local: SocketAddr,
    socket: Option<UdpSocket>,
    peer: Option<SocketAddr>,
    handle: CloseHandle,
    buffer: Vec<u8>,
}

impl UdpServer {
    pub fn new(local: SocketAddr) -> Self {
        Self {
            local,
            socket: None,
            peer: None,
            handle: CloseHandle::new(),
            buffer: vec![0; DATAGRAM],
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl Channel for UdpServer {
    fn open(&mut self) -> Result<(), ConnectionError> {
        if self.is_open() {
            return Ok(());
        }
        if self.handle.is_closed() {
            self.handle = CloseHandle::new();
        }
        let socket = UdpSocket::bind(self.local)?;
        debug!("udp server bound to {}", socket.local_addr()?);
        self.socket = Some(socket);
        self.peer = None;
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        if self.handle.is_closed() {
            return Err(TransportError::Cancelled);
        }
        let socket = self.socket.as_ref().ok_or(TransportError::NotOpen)?;
        let peer = self.peer.ok_or(TransportError::NoPeer)?;
        check_sent(socket.send_to(bytes, peer)?, bytes.len())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotOpen)?;
        match receive_from(socket, &mut self.buffer, &self.handle, timeout)? {
            Some((n, peer)) => {
                self.peer = Some(peer);
                Ok(self.buffer[..n].to_vec())
            }
            None => Ok(Vec::new()),
        }
    }

    fn close(&mut self) {
        self.handle.close();
        self.socket = None;
    }

    fn is_open(&self) -> bool {
        self.socket.is_some() && !self.handle.is_closed()
    }

    fn close_handle(&self) -> CloseHandle {
        self.handle.clone()
    }

    fn describe(&self) -> String {
        format!("udp server on {}", self.local)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test_log::test]
    fn datagram_exchange() {
        let mut server = UdpServer::new("127.0.0.1:0".parse().unwrap());
        server.open().unwrap();
        let address = server.local_addr().unwrap();
        assert!(matches!(server.send(b"x"), Err(TransportError::NoPeer)));

        let mut client = UdpClient::new(address);
        client.open().unwrap();
        client.send(b"HELLO").unwrap();
        assert_eq!(server.receive(Duration::from_secs(2)).unwrap(), b"HELLO");
        assert!(server.peer().is_some());
        server.send(b"ACK").unwrap();
        assert_eq!(client.receive(Duration::from_secs(2)).unwrap(), b"ACK");
        assert!(client.receive(Duration::from_millis(50)).unwrap().is_empty());
    }

    #[test_log::test]
    fn close_handle_cancels_read() {
        let mut server = UdpServer::new("127.0.0.1:0".parse().unwrap());
        server.open().unwrap();
        let handle = server.close_handle();
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            handle.close();
        });
        assert!(matches!(
            server.receive(Duration::from_secs(10)),
            Err(TransportError::Cancelled)
        ));
        closer.join().unwrap();
        assert!(!server.is_open());
        server.open().unwrap();
        assert!(server.is_open());
    }
}
