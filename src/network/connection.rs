//! Connection handling
//!
//! Wraps one TCP stream with the framing layer and tracks:
//! - A process-unique connection identity
//! - Connection state (a failed write marks it broken)
//! - Message and byte statistics

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::env::EnvError;
use crate::protocol::{self, FramingError};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Connection closed")]
    Closed,

    #[error("No reply within {0:?}")]
    Timeout(Duration),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

impl From<ConnectionError> for EnvError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::ConnectFailed { addr, source } => EnvError::connect_failed(addr, source),
            ConnectionError::Framing(e) => e.into(),
            ConnectionError::Closed => EnvError::EndOfSession,
            ConnectionError::Timeout(d) => EnvError::Timeout(d),
        }
    }
}

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Ready for requests
    Connected,
    /// A write or read failed part-way; no further traffic is possible
    Broken,
    /// Shut down locally
    Closed,
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Bytes sent, including length prefixes
    pub bytes_sent: u64,
    /// Bytes received, including length prefixes
    pub bytes_received: u64,
}

/// A framed connection to a remote peer
pub struct Connection {
    /// Identity, unique within the process
    id: u64,
    /// Remote peer address
    remote_addr: SocketAddr,
    /// The TCP stream
    stream: TcpStream,
    /// How long to wait for a reply, `None` waits forever
    reply_timeout: Option<Duration>,
    /// Connection state
    state: ConnectionState,
    /// Last activity timestamp
    last_activity: Instant,
    /// Statistics
    stats: ConnectionStats,
}

impl Connection {
    /// Create a new connection from an established TCP stream
    pub fn new(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            stream,
            reply_timeout: None,
            state: ConnectionState::Connected,
            last_activity: Instant::now(),
            stats: ConnectionStats::default(),
        }
    }

    /// Open a connection, giving up after `timeout`
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> ConnectionResult<Self> {
        tracing::debug!("Connecting to {}", addr);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ConnectionError::ConnectFailed { addr, source }),
            Err(_) => {
                return Err(ConnectionError::ConnectFailed {
                    addr,
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("connect timed out after {:?}", timeout),
                    ),
                })
            }
        };

        Ok(Self::new(stream, addr))
    }

    /// Set how long [`recv`](Self::recv) waits for a message
    pub fn with_reply_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Check if the connection can still carry requests
    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Get time since last activity
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Send one message
    pub async fn send(&mut self, payload: &[u8]) -> ConnectionResult<()> {
        if !self.is_active() {
            return Err(ConnectionError::Closed);
        }

        if let Err(e) = protocol::send(&mut self.stream, payload).await {
            self.state = ConnectionState::Broken;
            return Err(e.into());
        }

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += (protocol::LENGTH_PREFIX_SIZE + payload.len()) as u64;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Receive one message, `None` if the peer closed cleanly
    pub async fn recv(&mut self) -> ConnectionResult<Option<Vec<u8>>> {
        if !self.is_active() {
            return Err(ConnectionError::Closed);
        }

        let result = match self.reply_timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, protocol::receive(&mut self.stream)).await {
                    Ok(result) => result,
                    Err(_) => {
                        // A late reply would desynchronise request/reply pairing.
                        self.state = ConnectionState::Broken;
                        return Err(ConnectionError::Timeout(timeout));
                    }
                }
            }
            None => protocol::receive(&mut self.stream).await,
        };

        match result {
            Ok(Some(payload)) => {
                self.stats.messages_received += 1;
                self.stats.bytes_received +=
                    (protocol::LENGTH_PREFIX_SIZE + payload.len()) as u64;
                self.last_activity = Instant::now();
                Ok(Some(payload))
            }
            Ok(None) => {
                self.state = ConnectionState::Broken;
                Ok(None)
            }
            Err(e) => {
                self.state = ConnectionState::Broken;
                Err(e.into())
            }
        }
    }

    /// Receive a message that must be present
    pub async fn recv_reply(&mut self) -> ConnectionResult<Vec<u8>> {
        self.recv().await?.ok_or(ConnectionError::Closed)
    }

    /// Send a request and wait for its single reply
    pub async fn request(&mut self, payload: &[u8]) -> ConnectionResult<Vec<u8>> {
        self.send(payload).await?;
        self.recv_reply().await
    }

    /// Shut the stream down. Never fails; errors are only logged.
    pub async fn shutdown(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!("Shutdown of connection {} to {}: {}", self.id, self.remote_addr, e);
        }
        self.state = ConnectionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(
            Connection::connect(addr, Duration::from_secs(1)),
            listener.accept()
        );
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (a, _sa) = pair().await;
        let (b, _sb) = pair().await;
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_request_reply_and_stats() {
        let (mut conn, mut peer) = pair().await;

        let server = tokio::spawn(async move {
            let msg = protocol::receive(&mut peer).await.unwrap().unwrap();
            protocol::send(&mut peer, &msg).await.unwrap();
        });

        let reply = conn.request(b"ping").await.unwrap();
        server.await.unwrap();

        assert_eq!(reply, b"ping");
        assert_eq!(conn.stats().messages_sent, 1);
        assert_eq!(conn.stats().messages_received, 1);
        assert_eq!(conn.stats().bytes_sent, 8);
    }

    #[tokio::test]
    async fn test_peer_close_marks_broken() {
        let (mut conn, peer) = pair().await;
        drop(peer);

        assert!(conn.recv().await.unwrap().is_none());
        assert_eq!(conn.state(), ConnectionState::Broken);
        assert!(matches!(conn.send(b"x").await, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_reply_timeout() {
        let (conn, _peer) = pair().await;
        let mut conn = conn.with_reply_timeout(Some(Duration::from_millis(20)));

        let result = conn.recv().await;
        assert!(matches!(result, Err(ConnectionError::Timeout(_))));
        assert!(!conn.is_active());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = Connection::connect(addr, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ConnectionError::ConnectFailed { .. })));
    }
}
