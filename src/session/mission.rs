//! Mission collaborator interface
//!
//! Mission descriptions are built elsewhere; sessions only need the payload
//! to send for a role, the number of roles, and each role's command list.

use super::SessionDescriptor;

/// Supplies mission payloads to sessions
pub trait MissionSource: Send + Sync {
    /// Number of agent roles the mission declares
    fn agent_count(&self) -> usize;

    /// Mission initialisation payload for one role.
    ///
    /// `server_port` is the integrated server port found for companion
    /// roles, `None` for role 0.
    fn mission_init(&self, descriptor: &SessionDescriptor, server_port: Option<u16>) -> Vec<u8>;

    /// Commands available to `role`, indexed by discrete action
    fn commands(&self, role: u32) -> Vec<String>;
}

/// Commands offered when a mission does not restrict them
pub fn default_commands() -> Vec<String> {
    ["move 1", "move -1", "turn 1", "turn -1", "attack 1", "use 1"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

/// A mission given as text with `${...}` placeholders.
///
/// Recognised placeholders: `${role}`, `${experiment_id}`, `${episode}`,
/// `${server_port}` (0 when not yet known).
#[derive(Debug, Clone)]
pub struct MissionTemplate {
    text: String,
    agent_count: usize,
    commands: Vec<String>,
}

impl MissionTemplate {
    pub fn new(text: impl Into<String>, agent_count: usize) -> Self {
        Self {
            text: text.into(),
            agent_count: agent_count.max(1),
            commands: default_commands(),
        }
    }

    pub fn with_commands(mut self, commands: Vec<String>) -> Self {
        self.commands = commands;
        self
    }
}

impl MissionSource for MissionTemplate {
    fn agent_count(&self) -> usize {
        self.agent_count
    }

    fn mission_init(&self, descriptor: &SessionDescriptor, server_port: Option<u16>) -> Vec<u8> {
        self.text
            .replace("${role}", &descriptor.role.to_string())
            .replace("${experiment_id}", &descriptor.experiment_id)
            .replace("${episode}", &descriptor.episode.to_string())
            .replace("${server_port}", &server_port.unwrap_or(0).to_string())
            .into_bytes()
    }

    fn commands(&self, _role: u32) -> Vec<String> {
        self.commands.clone()
    }
}
