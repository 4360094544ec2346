//! Protocol module - Defines the wire protocol between agents and simulations
//!
//! Every message is framed the same way:
//! - 4 bytes payload length (big-endian)
//! - Variable length payload
//!
//! Payload meaning is layered on top: simulation commands in [`command`],
//! proxy bridge requests in [`proxy`].

pub mod command;
mod framing;
pub mod proxy;

pub use framing::*;

/// Version string announced in the hello message
pub const PROTOCOL_VERSION: &str = "0.37.0";

/// Default port of the simulation's command service
pub const DEFAULT_PORT: u16 = 9000;

/// Default port for the proxy bridge
pub const DEFAULT_PROXY_PORT: u16 = 50010;

/// Maximum message size (64 MB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
