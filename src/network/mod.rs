//! Network module - TCP plumbing shared by sessions and the proxy bridge
//!
//! Provides:
//! - Framed connections with identity and statistics
//! - Endpoint resolution
//! - Listener probing for externally launched simulations
//! - The echo fixture used to check a framing peer

mod connection;
mod echo;

pub use connection::*;
pub use echo::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::session::{poll_until, ShutdownSignal};

/// A host and port, resolved lazily
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        resolve_host(&self.host, self.port).await
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

/// Check whether something accepts connections at `addr`
pub async fn is_listening(addr: SocketAddr) -> bool {
    TcpStream::connect(addr).await.is_ok()
}

/// Wait until something listens at `addr`, checking every `interval`.
///
/// Returns `false` if the shutdown signal fired first.
pub async fn wait_for_listener(
    addr: SocketAddr,
    interval: Duration,
    shutdown: &mut ShutdownSignal,
) -> bool {
    let found = poll_until(interval, shutdown, || async move {
        Ok::<_, std::convert::Infallible>(is_listening(addr).await.then_some(()))
    })
    .await;
    matches!(found, Ok(Some(())))
}
