use std::{
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use super::{Channel, CloseHandle};
use crate::{ConnectionError, TransportError};

const READ_BUFFER: usize = 64 * 1024;
const ACCEPT_POLL: Duration = Duration::from_millis(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// An established stream together with the handle that shuts it down. The stream is in blocking
/// mode between two operations.
#[derive(Debug)]
struct Connection {
    stream: TcpStream,
    handle: CloseHandle,
    buffer: Vec<u8>,
}

impl Connection {
    fn new(stream: TcpStream, handle: CloseHandle, write_timeout: Duration) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(write_timeout))?;
        let shutdown = stream.try_clone()?;
        handle.on_close(move || {
            // unblocks reads that are waiting on the other clone
            let _ = shutdown.shutdown(Shutdown::Both);
        });
        Ok(Self {
            stream,
            handle,
            buffer: vec![0; READ_BUFFER],
        })
    }

    fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        if self.handle.is_closed() {
            return Err(TransportError::Cancelled);
        }
        self.stream
            .write_all(bytes)
            .and_then(|_| self.stream.flush())
            .map_err(|e| self.failure(e))?;
        Ok(bytes.len())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.handle.is_closed() {
            return Err(TransportError::Cancelled);
        }
        let read = if timeout.is_zero() {
            self.stream.set_nonblocking(true)?;
            let read = self.stream.read(&mut self.buffer);
            self.stream.set_nonblocking(false)?;
            read
        } else {
            self.stream.set_read_timeout(Some(timeout))?;
            self.stream.read(&mut self.buffer)
        };
        match read {
            Ok(0) if self.handle.is_closed() => Err(TransportError::Cancelled),
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => Ok(self.buffer[..n].to_vec()),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if self.handle.is_closed() {
                    Err(TransportError::Cancelled)
                } else {
                    Ok(Vec::new())
                }
            }
            Err(e) => Err(self.failure(e)),
        }
    }

    fn failure(&self, error: io::Error) -> TransportError {
        if self.handle.is_closed() {
            return TransportError::Cancelled;
        }
        match error.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => TransportError::Timeout,
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                TransportError::Closed
            }
            _ => TransportError::Io(error),
        }
    }
}

/// Connects to a remote TCP endpoint.
#[derive(Debug)]
pub struct TcpClient {
    remote: SocketAddr,
    connect_timeout: Duration,
    write_timeout: Duration,
    connection: Option<Connection>,
    handle: CloseHandle,
}

impl TcpClient {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            connect_timeout: Duration::from_secs(5),
            write_timeout: WRITE_TIMEOUT,
            connection: None,
            handle: CloseHandle::new(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sends that block longer than `timeout` fail with [`TransportError::Timeout`].
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    fn connection(&mut self) -> Result<&mut Connection, TransportError> {
        self.connection.as_mut().ok_or(TransportError::NotOpen)
    }
}

impl Channel for TcpClient {
    fn open(&mut self) -> Result<(), ConnectionError> {
        if self.is_open() {
            return Ok(());
        }
        if self.handle.is_closed() {
            self.handle = CloseHandle::new();
        }
        let stream = TcpStream::connect_timeout(&self.remote, self.connect_timeout).map_err(
            |e| match e.kind() {
                ErrorKind::ConnectionRefused => ConnectionError::Refused(self.remote.to_string()),
                ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                    ConnectionError::Timeout(self.connect_timeout)
                }
                _ => ConnectionError::Io(e),
            },
        )?;
        debug!("connected to {}", self.remote);
        self.connection = Some(Connection::new(
            stream,
            self.handle.clone(),
            self.write_timeout,
        )?);
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
        self.connection = None;
    }

    fn is_open(&self) -> bool {
        self.connection.is_some() && !self.handle.is_closed()
    }

    fn close_handle(&self) -> CloseHandle {
        self.handle.clone()
    }

    fn describe(&self) -> String {
        format!("tcp client to {}", self.remote)
    }
}

/// Listens on a local address and serves exactly one accepted connection at a time.
#[derive(Debug)]
pub struct TcpServer {
    local: SocketAddr,
    accept_timeout: Duration,
    write_timeout: Duration,
    listener: Option<TcpListener>,
    connection: Option<Connection>,
    handle: CloseHandle,
}

impl TcpServer {
    pub fn new(local: SocketAddr) -> Self {
        Self {
            local,
            accept_timeout: Duration::from_secs(5),
            write_timeout: WRITE_TIMEOUT,
            listener: None,
            connection: None,
            handle: CloseHandle::new(),
        }
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Binds the listening socket without waiting for a connection. Useful to learn the port
    /// when binding to port 0.
    pub fn bind(&mut self) -> Result<SocketAddr, ConnectionError> {
        if let Some(listener) = &self.listener {
            return Ok(listener.local_addr()?);
        }
        let listener = TcpListener::bind(self.local)?;
        listener.set_nonblocking(true)?;
        let address = listener.local_addr()?;
        debug!("listening on {address}");
        self.listener = Some(listener);
        Ok(address)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    fn connection(&mut self) -> Result<&mut Connection, TransportError> {
        self.connection.as_mut().ok_or(TransportError::NotOpen)
    }
}

impl Channel for TcpServer {
    fn open(&mut self) -> Result<(), ConnectionError> {
        if self.is_open() {
            return Ok(());
        }
        if self.handle.is_closed() {
            self.handle = CloseHandle::new();
        }
        self.bind()?;
        let Some(listener) = &self.listener else {
            return Err(ConnectionError::Refused(self.local.to_string()));
        };
        let deadline = Instant::now() + self.accept_timeout;
        let stream = loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {peer}");
                    stream.set_nonblocking(false)?;
                    break stream;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if self.handle.is_closed() {
                        return Err(ConnectionError::Refused(self.local.to_string()));
                    }
                    if Instant::now() >= deadline {
                        return Err(ConnectionError::Timeout(self.accept_timeout));
                    }
                    trace!("waiting for a connection on {}", self.local);
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        };
        self.connection = Some(Connection::new(
            stream,
            self.handle.clone(),
            self.write_timeout,
        )?);
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
        self.connection = None;
    }

    fn is_open(&self) -> bool {
        self.connection.is_some() && !self.handle.is_closed()
    }

    fn close_handle(&self) -> CloseHandle {
        self.handle.clone()
    }

    fn describe(&self) -> String {
        format!("tcp server on {}", self.local)
    }
}
