//! SimBridge - Episode transport for remote simulations
//!
//! Lets a reinforcement-learning agent drive episodes of a long-running
//! simulation over TCP: reset, step, close, one role per task, with a
//! proxy bridge that serves environments to remote clients.

pub mod config;
pub mod coordinator;
pub mod env;
pub mod network;
pub mod protocol;
pub mod proxy;
pub mod session;
