//! Echo fixture
//!
//! A framing peer that wraps every message it receives and sends it back.
//! Used to check that both ends agree on message boundaries.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

use super::connection::{Connection, ConnectionResult};
use crate::session::ShutdownSignal;

const ECHO_OPEN: &str = "<Echo>";
const ECHO_CLOSE: &str = "<\\Echo>";

/// The reply the echo server sends for `payload`
pub fn echo_reply(payload: &[u8]) -> Vec<u8> {
    let mut reply = Vec::with_capacity(ECHO_OPEN.len() + payload.len() + ECHO_CLOSE.len());
    reply.extend_from_slice(ECHO_OPEN.as_bytes());
    reply.extend_from_slice(payload);
    reply.extend_from_slice(ECHO_CLOSE.as_bytes());
    reply
}

/// Serve echo connections on `listener` until `shutdown` fires
pub async fn serve_echo(listener: TcpListener, mut shutdown: ShutdownSignal) -> std::io::Result<()> {
    let local_addr = listener.local_addr()?;
    tracing::info!("Echo server listening on {}", local_addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        tracing::debug!("Echo connection from {}", addr);
                        tokio::spawn(async move {
                            if let Err(e) = echo_connection(stream, addr).await {
                                tracing::warn!("Echo connection {} failed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown.triggered() => {
                tracing::info!("Echo server shutdown requested");
                break;
            }
        }
    }

    Ok(())
}

async fn echo_connection(stream: TcpStream, addr: SocketAddr) -> ConnectionResult<()> {
    let mut conn = Connection::new(stream, addr);
    while let Some(payload) = conn.recv().await? {
        conn.send(&echo_reply(&payload)).await?;
    }
    tracing::debug!(
        "Echo connection {} closed after {} messages",
        addr,
        conn.stats().messages_received
    );
    Ok(())
}

/// Send one message to an echo server and return its reply
pub async fn echo(addr: SocketAddr, payload: &[u8], timeout: Duration) -> ConnectionResult<Vec<u8>> {
    let mut conn = Connection::connect(addr, timeout).await?;
    let reply = conn.request(payload).await;
    conn.shutdown().await;
    reply
}
