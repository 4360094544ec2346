//! Session module - One role's connection to a simulation
//!
//! Provides:
//! - Session descriptors and episode state
//! - The mission-start handshake with bounded retries
//! - The episode driver (reset/step/close)
//! - The resync policy that periodically rebuilds a session

mod driver;
mod handshake;
mod mission;
mod resync;
mod wait;

#[cfg(test)]
pub(crate) mod testing;

pub use driver::*;
pub use handshake::*;
pub use mission::*;
pub use resync::*;
pub use wait::*;

use crate::network::Endpoint;
use crate::protocol::command::Token;

/// Identity and addressing of one role's session.
///
/// Only `episode` changes after creation; it advances on every reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    /// Agent role, 0 for the head role
    pub role: u32,
    /// The head node's command service
    pub server: Endpoint,
    /// This role's own command service, when it differs from the head's
    pub secondary: Option<Endpoint>,
    /// Experiment unique id shared by all roles
    pub experiment_id: String,
    /// Number of resets performed so far
    pub episode: u64,
    /// Rebuild the session every this many episodes, 0 = never
    pub resync: u64,
}

impl SessionDescriptor {
    pub fn new(role: u32, server: Endpoint, experiment_id: impl Into<String>) -> Self {
        Self {
            role,
            server,
            secondary: None,
            experiment_id: experiment_id.into(),
            episode: 0,
            resync: 0,
        }
    }

    pub fn with_secondary(mut self, secondary: Endpoint) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn with_episode(mut self, episode: u64) -> Self {
        self.episode = episode;
        self
    }

    pub fn with_resync(mut self, resync: u64) -> Self {
        self.resync = resync;
        self
    }

    /// Where this role's session connects
    pub fn command_endpoint(&self) -> &Endpoint {
        self.secondary.as_ref().unwrap_or(&self.server)
    }

    /// Current token identifying this role's episode
    pub fn token(&self) -> Token {
        Token::new(self.experiment_id.clone(), self.role, self.episode)
    }
}

/// Lifecycle phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    WaitingToBegin,
    Running,
    Done,
}

/// Progress of the current episode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpisodeState {
    pub has_begun: bool,
    pub is_running: bool,
    pub step_count: u64,
    /// Latches true until the next reset
    pub done: bool,
}

impl EpisodeState {
    /// State of a session that has not started an episode
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) {
        self.has_begun = true;
        self.is_running = true;
        self.step_count = 0;
        self.done = false;
    }

    pub fn finish(&mut self) {
        self.is_running = false;
        self.done = true;
    }
}
