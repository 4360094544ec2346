//! Environment trait definitions
//!
//! Defines the reset/step/close interface shared by the local session driver
//! and the remote proxy client, and the errors both report.

use async_trait::async_trait;
use std::net::SocketAddr;
use thiserror::Error;

use super::spaces::{Action, ActionSpace, ImageShape, Observation, StepResult};
use crate::protocol::command::ReplyError;
use crate::protocol::FramingError;

/// Errors that can occur while driving an environment
#[derive(Error, Debug)]
pub enum EnvError {
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Mission start failed for role {role} at {addr} after {attempts} attempts: {reason}")]
    MissionStartFailed {
        role: u32,
        addr: String,
        attempts: u32,
        reason: String,
    },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Invalid sequence: {0}")]
    InvalidSequence(&'static str),

    #[error("Peer closed the connection")]
    EndOfSession,

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Remote environment error: {0}")]
    Remote(String),

    #[error("No reply within {0:?}")]
    Timeout(std::time::Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EnvResult<T> = Result<T, EnvError>;

impl EnvError {
    /// Build a connect failure for an address
    pub fn connect_failed(addr: SocketAddr, source: std::io::Error) -> Self {
        EnvError::ConnectFailed {
            addr: addr.to_string(),
            source,
        }
    }

    /// Whether the session that produced this error can no longer be used
    pub fn is_fatal_for_session(&self) -> bool {
        !matches!(
            self,
            EnvError::InvalidSequence(_) | EnvError::InvalidAction(_) | EnvError::Remote(_)
        )
    }
}

impl From<FramingError> for EnvError {
    fn from(err: FramingError) -> Self {
        match err {
            FramingError::Io(e) => EnvError::Io(e),
            FramingError::Truncated { .. } => EnvError::EndOfSession,
            other => EnvError::ProtocolViolation(other.to_string()),
        }
    }
}

impl From<ReplyError> for EnvError {
    fn from(err: ReplyError) -> Self {
        EnvError::ProtocolViolation(err.to_string())
    }
}

/// A steppable episode environment
#[async_trait]
pub trait Environment: Send {
    /// Start a new episode and return its first observation
    async fn reset(&mut self) -> EnvResult<Observation>;

    /// Perform one action
    async fn step(&mut self, action: &Action) -> EnvResult<StepResult>;

    /// Release the environment. Must not fail on an already broken connection.
    async fn close(&mut self) -> EnvResult<()>;

    /// The actions this environment accepts
    fn action_space(&self) -> ActionSpace;

    /// The shape of observations this environment produces
    fn observation_shape(&self) -> ImageShape;
}

#[async_trait]
impl<E: Environment + ?Sized> Environment for Box<E> {
    async fn reset(&mut self) -> EnvResult<Observation> {
        (**self).reset().await
    }

    async fn step(&mut self, action: &Action) -> EnvResult<StepResult> {
        (**self).step(action).await
    }

    async fn close(&mut self) -> EnvResult<()> {
        (**self).close().await
    }

    fn action_space(&self) -> ActionSpace {
        (**self).action_space()
    }

    fn observation_shape(&self) -> ImageShape {
        (**self).observation_shape()
    }
}
