//! Proxy module - Serves environments to remote clients
//!
//! Provides:
//! - A server that builds one environment per accepted connection
//! - A client that implements [`Environment`](crate::env::Environment)
//!   by forwarding every call

mod client;
mod server;

#[cfg(test)]
pub(crate) mod testing;

pub use client::*;
pub use server::*;

use thiserror::Error;

use crate::env::EnvError;
use crate::network::ConnectionError;

/// Proxy bridge errors
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Environment error: {0}")]
    Env(#[from] EnvError),

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Unexpected {0} request")]
    UnexpectedRequest(&'static str),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Server rejected the environment: {0}")]
    Rejected(String),

    #[error("Remote action space cannot be represented")]
    UnsupportedActionSpace,
}

pub type ProxyResult<T> = Result<T, ProxyError>;
