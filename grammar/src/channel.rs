use std::{
    fmt::Debug,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{ConnectionError, TransportError};

/// In-memory channels, connected in pairs or through a listener.
pub mod memory;
mod tcp;
mod udp;

pub use tcp::{TcpClient, TcpServer};
pub use udp::{UdpClient, UdpServer};

/// A bidirectional byte transport. Message boundaries are whatever the underlying transport
/// provides: a datagram for UDP, a single read for TCP and a single send for in-memory channels.
///
/// A channel is driven by one session at a time. Other threads can only interact with it through
/// its [`CloseHandle`], which makes pending and future operations fail with
/// [`TransportError::Cancelled`].
pub trait Channel: Send {
    /// Establishes the connection. Opening a channel that is already open does nothing.
    fn open(&mut self) -> Result<(), ConnectionError>;

    /// Writes `bytes` as one message and returns the number of bytes that were sent.
    fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Waits up to `timeout` for the next message. An empty vector means that nothing arrived
    /// in time.
    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Closes the channel. Closing twice is harmless.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Returns a handle that closes the current (or the next) connection from any thread.
    fn close_handle(&self) -> CloseHandle;

    /// Short description used in log messages.
    fn describe(&self) -> String {
        "channel".to_string()
    }
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn open(&mut self) -> Result<(), ConnectionError> {
        (**self).open()
    }

    fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        (**self).send(bytes)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).receive(timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn close_handle(&self) -> CloseHandle {
        (**self).close_handle()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

impl<C: Channel + ?Sized> Channel for &mut C {
    fn open(&mut self) -> Result<(), ConnectionError> {
        (**self).open()
    }

    fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        (**self).send(bytes)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).receive(timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn close_handle(&self) -> CloseHandle {
        (**self).close_handle()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CloseState {
    closed: AtomicBool,
    hooks: Mutex<Vec<Hook>>,
}

/// Shared closed flag of a connection. Transports register hooks that unblock their pending
/// operations, these run exactly once on the first call to [`CloseHandle::close`].
#[derive(Clone, Default)]
pub struct CloseHandle {
    inner: Arc<CloseState>,
}

impl CloseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        let hooks = {
            let mut hooks = lock(&self.inner.hooks);
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *hooks)
        };
        for hook in hooks {
            hook();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Registers `hook` to run when the handle is closed. If it already is, the hook runs
    /// immediately.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, hook: F) {
        let mut hooks = lock(&self.inner.hooks);
        if self.is_closed() {
            drop(hooks);
            hook();
        } else {
            hooks.push(Box::new(hook));
        }
    }
}

impl Debug for CloseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseHandle")
            .field("closed", &self.is_closed())
            .field("hooks", &lock(&self.inner.hooks).len())
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn default_connect_timeout() -> u64 {
    5_000
}

/// Serializable description of a network channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChannelConfig {
    TcpClient {
        remote: SocketAddr,
        #[serde(default = "default_connect_timeout")]
        connect_timeout_ms: u64,
    },
    TcpServer {
        local: SocketAddr,
        #[serde(default = "default_connect_timeout")]
        accept_timeout_ms: u64,
    },
    UdpClient {
        remote: SocketAddr,
    },
    UdpServer {
        local: SocketAddr,
    },
}

impl ChannelConfig {
    /// Creates the (still closed) channel described by this configuration.
    pub fn build(&self) -> Box<dyn Channel> {
        match self {
            ChannelConfig::TcpClient {
                remote,
                connect_timeout_ms,
            } => Box::new(
                TcpClient::new(*remote)
                    .with_connect_timeout(Duration::from_millis(*connect_timeout_ms)),
            ),
            ChannelConfig::TcpServer {
                local,
                accept_timeout_ms,
            } => Box::new(
                TcpServer::new(*local)
                    .with_accept_timeout(Duration::from_millis(*accept_timeout_ms)),
            ),
            ChannelConfig::UdpClient { remote } => Box::new(UdpClient::new(*remote)),
            ChannelConfig::UdpServer { local } => Box::new(UdpServer::new(*local)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn hooks_run_once() {
        let handle = CloseHandle::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        handle.on_close(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let copy = handle.clone();
        copy.close();
        handle.close();
        assert!(handle.is_closed());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let c = Arc::clone(&count);
        handle.on_close(move || {
            c.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn config_from_json() {
        let config: ChannelConfig =
            serde_json::from_str(r#"{ "kind": "tcp-client", "remote": "127.0.0.1:4242" }"#)
                .unwrap();
        assert_eq!(
            config,
            ChannelConfig::TcpClient {
                remote: "127.0.0.1:4242".parse().unwrap(),
                connect_timeout_ms: 5_000
            }
        );
        let channel = config.build();
        assert!(!channel.is_open());
        assert!(channel.describe().contains("127.0.0.1:4242"));
    }
}
